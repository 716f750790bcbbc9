//! IPC message types for hook ingestion and state subscribers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle events emitted by the assistant runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEventKind {
    /// New session opened
    SessionStart,
    /// Session closed
    SessionEnd,
    /// User submitted a prompt
    UserPromptSubmit,
    /// Tool is about to run
    PreToolUse,
    /// Assistant turn ended
    Stop,
    /// Any event name this daemon does not track
    #[serde(other)]
    Unknown,
}

/// Hook event payload, as delivered by the assistant plus the fields our hook command adds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookPayload {
    pub session_id: String,
    pub hook_event_name: HookEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Git repo name (injected by `claude-blocker hook`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    /// User's message (available on UserPromptSubmit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[cfg(test)]
impl HookPayload {
    pub fn new(session_id: impl Into<String>, hook_event_name: HookEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            hook_event_name,
            tool_name: None,
            cwd: None,
            git_repo: None,
            prompt: None,
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Session status as tracked by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Working,
    WaitingForInput,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Working => "working",
            SessionStatus::WaitingForInput => "waiting_for_input",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of a tracked session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
}

/// Aggregate snapshot pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMessage {
    /// True when no session is working
    pub blocked: bool,
    pub sessions: Vec<SessionInfo>,
    pub working: usize,
    pub waiting_for_input: usize,
    /// Session that just finished (present at most once per finish)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_session_id: Option<String>,
    /// Last prompt of the finished session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_prompt: Option<String>,
}

/// Commands sent to the daemon, one JSON object per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonCommand {
    /// Hook event forwarded by `claude-blocker hook`
    Hook(HookPayload),
    /// Current snapshot without consuming a pending finish
    GetState,
    /// All tracked sessions
    GetSessions,
    /// Stream snapshots until disconnect
    Subscribe,
    /// Stop streaming
    Unsubscribe,
    /// Daemon status
    Status,
    /// Graceful shutdown
    Shutdown,
    /// Health check
    Ping,
}

/// Responses and pushed messages from the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DaemonResponse {
    /// Aggregate snapshot (reply to get_state, and every pushed update)
    State(StateMessage),
    /// Reply to get_sessions
    Sessions { sessions: Vec<SessionInfo> },
    /// Daemon status info
    Status {
        running: bool,
        session_count: usize,
        subscriber_count: usize,
        uptime_secs: u64,
    },
    /// Operation completed successfully
    Ok,
    /// Error response
    Error { message: String },
    /// Pong response for health check
    Pong,
}

/// Directory holding the socket, pid file and debug log
pub fn get_runtime_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("claude-blocker")
}

/// Default socket path for daemon communication
pub fn get_socket_path() -> PathBuf {
    get_runtime_dir().join("daemon.sock")
}

/// PID file lives next to the socket
pub fn get_pid_file_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// Debug log file path
pub fn get_debug_log_path() -> PathBuf {
    get_runtime_dir().join("debug.log")
}
