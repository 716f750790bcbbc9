//! Shared session tracker: the registry and hub behind one lock, plus the expiry task.

use crate::config::TrackerConfig;
use crate::daemon::hub::{self, BroadcastHub, DeliveryError, SubscriberFn, Subscription};
use crate::daemon::registry::SessionRegistry;
use crate::ipc::messages::{HookPayload, SessionInfo, StateMessage};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Owned by the daemon entry point and handed to the server by `Arc`.
///
/// Every mutation publishes while the registry lock is held, so subscribers see
/// snapshots in mutation order. Subscriber callbacks must not call back into the tracker.
pub struct SessionTracker {
    registry: Mutex<SessionRegistry>,
    hub: BroadcastHub,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_interval: Duration,
}

impl SessionTracker {
    pub fn new(config: TrackerConfig) -> Arc<Self> {
        let sweep_interval = config.sweep_interval;
        Arc::new(Self {
            registry: Mutex::new(SessionRegistry::new(config)),
            hub: BroadcastHub::new(),
            sweeper: Mutex::new(None),
            sweep_interval,
        })
    }

    fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        // Registry methods never panic midway through a transition
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a hook event and broadcast the result, even if nothing changed
    pub fn handle_event(&self, payload: &HookPayload) {
        self.handle_event_at(payload, Utc::now());
    }

    pub fn handle_event_at(&self, payload: &HookPayload, now: DateTime<Utc>) {
        let mut registry = self.registry();
        registry.handle_event_at(payload, now);
        self.publish_locked(&mut registry);
    }

    fn publish_locked(&self, registry: &mut SessionRegistry) {
        // With nobody listening the finish stays staged for the next subscriber
        let consume = !self.hub.is_empty();
        let message = registry.snapshot(consume);
        let delivered = self.hub.publish(&message);
        debug!(
            working = message.working,
            waiting_for_input = message.waiting_for_input,
            finished = ?message.finished_session_id,
            delivered,
            "State broadcast"
        );
    }

    /// Current snapshot; see [`SessionRegistry::snapshot`] for `consume_finish`
    pub fn snapshot(&self, consume_finish: bool) -> StateMessage {
        self.registry().snapshot(consume_finish)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry().sessions()
    }

    pub fn session_count(&self) -> usize {
        self.registry().session_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.len()
    }

    /// Register a subscriber and immediately hand it the current snapshot,
    /// including any pending finish.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&StateMessage) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let subscriber: Arc<SubscriberFn> = Arc::new(subscriber);
        let mut registry = self.registry();
        let initial = registry.snapshot(true);
        if let Err(err) = hub::deliver(subscriber.as_ref(), &initial) {
            warn!(error = %err, "Initial snapshot delivery failed");
        }
        self.hub.add(subscriber)
    }

    /// Expire stale sessions; broadcasts once if anything was removed
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut registry = self.registry();
        let removed = registry.sweep_expired(now);
        if !removed.is_empty() {
            self.publish_locked(&mut registry);
        }
        removed.len()
    }

    /// Spawn the periodic expiry sweep on the current tokio runtime
    pub fn start_expiry(self: &Arc<Self>) {
        let tracker = Arc::downgrade(self);
        let period = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                let removed = tracker.sweep_expired_at(Utc::now());
                if removed > 0 {
                    debug!(removed, "Expiry sweep removed sessions");
                }
            }
        });

        if let Some(previous) = self.sweeper().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = period.as_millis() as u64, "Expiry sweep started");
    }

    /// Stop the expiry task and drop all sessions and subscribers
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper().take() {
            handle.abort();
        }
        self.registry().clear();
        self.hub.clear();
        info!("Session tracker shut down");
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper().take() {
            handle.abort();
        }
    }
}
