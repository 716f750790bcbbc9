//! Wire protocol shared by the daemon and its clients.

pub mod messages;
