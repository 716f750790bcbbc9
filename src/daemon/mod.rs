//! Background daemon tracking assistant sessions from hook events.

pub mod hub;
pub mod notifier;
pub mod registry;
pub mod server;
pub mod tracker;
