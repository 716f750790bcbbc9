//! Fan-out of state snapshots to registered subscribers.

use crate::ipc::messages::StateMessage;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// Why a subscriber could not take a snapshot
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Subscriber is gone; it is removed from the hub
    #[error("subscriber closed")]
    Closed,
    /// Subscriber queue is full; this snapshot is dropped for it
    #[error("subscriber lagging, snapshot dropped")]
    Lagged,
    #[error("{0}")]
    Other(String),
}

/// Callback invoked with every published snapshot
pub type SubscriberFn = dyn Fn(&StateMessage) -> Result<(), DeliveryError> + Send + Sync;

type SubscriberId = u64;

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, Arc<SubscriberFn>)>>,
}

impl HubInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(SubscriberId, Arc<SubscriberFn>)>> {
        // Callbacks never run under this lock, so a poisoned list is still consistent
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }
}

/// Set of subscribers receiving every published snapshot
#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

/// Handle returned by [`BroadcastHub::add`]; unsubscribing is idempotent
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriberId,
    hub: Weak<HubInner>,
}

impl std::fmt::Debug for HubInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubInner")
            .field("subscribers", &self.subscribers().len())
            .finish()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl Subscription {
    /// Remove the subscriber. Returns true only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        match self.hub.upgrade() {
            Some(hub) => {
                let removed = hub.remove(self.id);
                if removed {
                    debug!(subscriber = self.id, "Subscriber removed");
                }
                removed
            }
            None => false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber without delivering anything to it
    pub fn add(&self, subscriber: Arc<SubscriberFn>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push((id, subscriber));
        debug!(subscriber = id, "Subscriber added");
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.inner.subscribers().clear();
    }

    /// Deliver one snapshot to every current subscriber. All subscribers see the
    /// same message; a failing one never stops delivery to the rest. Returns the
    /// number of successful deliveries.
    pub fn publish(&self, message: &StateMessage) -> usize {
        let subscribers: Vec<_> = self.inner.subscribers().clone();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, subscriber) in &subscribers {
            match deliver(subscriber.as_ref(), message) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Closed) => closed.push(*id),
                Err(err) => warn!(subscriber = id, error = %err, "Snapshot delivery failed"),
            }
        }

        for id in closed {
            if self.inner.remove(id) {
                debug!(subscriber = id, "Dropped closed subscriber");
            }
        }
        delivered
    }
}

/// Invoke a single subscriber, turning a panic into an error
pub(crate) fn deliver(
    subscriber: &SubscriberFn,
    message: &StateMessage,
) -> Result<(), DeliveryError> {
    match catch_unwind(AssertUnwindSafe(|| subscriber(message))) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(DeliveryError::Other(format!("subscriber panicked: {}", reason)))
        }
    }
}
