//! Platform-native notifications driven by state snapshots.

use crate::common::truncate;
use crate::daemon::hub::DeliveryError;
use crate::ipc::messages::StateMessage;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const TITLE: &str = "claude-blocker";
const PROMPT_PREVIEW_LEN: usize = 80;
const QUEUE_CAPACITY: usize = 16;

/// A desktop notification derived from a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A session went from working to idle
    Finished { prompt: Option<String> },
    /// More sessions are waiting for input than before
    NeedsInput { waiting: usize },
}

impl Notification {
    pub fn message(&self) -> String {
        match self {
            Notification::Finished { prompt: Some(prompt) } => {
                format!("Claude finished: {}", truncate(prompt, PROMPT_PREVIEW_LEN))
            }
            Notification::Finished { prompt: None } => "Claude finished".to_string(),
            Notification::NeedsInput { waiting: 1 } => "Claude needs your input".to_string(),
            Notification::NeedsInput { waiting } => {
                format!("Claude needs your input ({} sessions waiting)", waiting)
            }
        }
    }
}

/// Notifications for `message`, given the waiting count of the previous snapshot
pub fn notifications_for(previous_waiting: usize, message: &StateMessage) -> Vec<Notification> {
    let mut notifications = Vec::new();
    if message.finished_session_id.is_some() {
        notifications.push(Notification::Finished {
            prompt: message.finished_prompt.clone(),
        });
    }
    if message.waiting_for_input > previous_waiting {
        notifications.push(Notification::NeedsInput {
            waiting: message.waiting_for_input,
        });
    }
    notifications
}

/// Build a hub subscriber that queues notifications for [`run_notifier`]
pub fn subscriber(
    tx: mpsc::Sender<Notification>,
) -> impl Fn(&StateMessage) -> Result<(), DeliveryError> + Send + Sync + 'static {
    let previous_waiting = AtomicUsize::new(0);
    move |message: &StateMessage| -> Result<(), DeliveryError> {
        let previous = previous_waiting.load(Ordering::SeqCst);
        let mut result = Ok(());
        let mut input_edge_queued = true;

        for notification in notifications_for(previous, message) {
            let needs_input = matches!(notification, Notification::NeedsInput { .. });
            if let Err(err) = tx.try_send(notification) {
                input_edge_queued &= !needs_input;
                result = Err(match err {
                    mpsc::error::TrySendError::Full(_) => DeliveryError::Lagged,
                    mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
                });
            }
        }

        // A dropped needs-input edge is retried on the next snapshot
        if input_edge_queued {
            previous_waiting.store(message.waiting_for_input, Ordering::SeqCst);
        }
        result
    }
}

/// Create the notification queue
pub fn channel() -> (mpsc::Sender<Notification>, mpsc::Receiver<Notification>) {
    mpsc::channel(QUEUE_CAPACITY)
}

/// Deliver queued notifications; platform commands run on the blocking pool
pub async fn run_notifier(mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let message = notification.message();
        debug!(%message, "Sending notification");
        let sent = tokio::task::spawn_blocking(move || notify(TITLE, &message)).await;
        if let Err(err) = sent {
            warn!(error = %err, "Notification task failed");
        }
    }
}

/// Send a notification, trying the platform notifier first
pub fn notify(title: &str, message: &str) {
    #[cfg(target_os = "macos")]
    {
        if notify_macos(title, message) {
            return;
        }
    }

    #[cfg(target_os = "linux")]
    {
        if notify_linux(title, message) {
            return;
        }
    }

    // Fallback: tmux display-message
    notify_tmux(&format!("{}: {}", title, message));
}

/// macOS notification using terminal-notifier or osascript
#[cfg(target_os = "macos")]
fn notify_macos(title: &str, message: &str) -> bool {
    if Command::new("terminal-notifier")
        .args(["-title", title, "-message", message, "-sound", "default"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
    {
        return true;
    }

    let script = format!(
        "display notification \"{}\" with title \"{}\"",
        message.replace('"', "\\\""),
        title.replace('"', "\\\"")
    );
    Command::new("osascript")
        .args(["-e", &script])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Linux notification using notify-send
#[cfg(target_os = "linux")]
fn notify_linux(title: &str, message: &str) -> bool {
    Command::new("notify-send")
        .args([title, message])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn notify_tmux(message: &str) {
    if let Err(err) = Command::new("tmux")
        .args(["display-message", "-d", "3000", message])
        .output()
    {
        debug!(error = %err, "tmux display-message unavailable");
    }
}
