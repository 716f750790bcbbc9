//! Session registry: the per-session state machine and aggregate snapshot.
//!
//! ```text
//! SessionStart                       → idle (record created or overwritten)
//! SessionEnd                         → record removed
//! UserPromptSubmit                   → working
//! PreToolUse (input tool)            → waiting_for_input
//! PreToolUse (other tool)            → working, unless waiting_for_input for < debounce
//! Stop                               → idle, unless waiting_for_input for < debounce
//!                                      (working → idle stages a finish notification)
//! ```

use crate::config::TrackerConfig;
use crate::ipc::messages::{HookEventKind, HookPayload, SessionInfo, SessionStatus, StateMessage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Internal status; the waiting timestamp only exists while waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Working,
    WaitingForInput { since: DateTime<Utc> },
}

impl Phase {
    fn status(&self) -> SessionStatus {
        match self {
            Phase::Idle => SessionStatus::Idle,
            Phase::Working => SessionStatus::Working,
            Phase::WaitingForInput { .. } => SessionStatus::WaitingForInput,
        }
    }
}

/// One tracked assistant session
#[derive(Debug, Clone)]
struct Session {
    id: String,
    phase: Phase,
    last_activity: DateTime<Utc>,
    cwd: Option<String>,
    git_repo: Option<String>,
    last_prompt: Option<String>,
}

impl Session {
    fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            phase: Phase::Idle,
            last_activity: now,
            cwd: None,
            git_repo: None,
            last_prompt: None,
        }
    }

    fn status(&self) -> SessionStatus {
        self.phase.status()
    }

    /// Record metadata carried by an event; absent fields never clear stored values
    fn absorb_metadata(&mut self, payload: &HookPayload) {
        if let Some(cwd) = &payload.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(repo) = &payload.git_repo {
            self.git_repo = Some(repo.clone());
        }
    }

    /// Still inside the debounce window that follows an input request
    fn in_input_grace(&self, now: DateTime<Utc>, debounce: Duration) -> bool {
        match self.phase {
            Phase::WaitingForInput { since } => elapsed(since, now) < debounce,
            _ => false,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            status: self.status(),
            cwd: self.cwd.clone(),
            git_repo: self.git_repo.clone(),
            last_prompt: self.last_prompt.clone(),
        }
    }
}

/// Finish notification waiting to be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFinish {
    session_id: String,
    prompt: Option<String>,
}

/// Owns the session map and derives aggregate snapshots from it
#[derive(Debug)]
pub struct SessionRegistry {
    config: TrackerConfig,
    sessions: BTreeMap<String, Session>,
    pending_finish: Option<PendingFinish>,
}

impl SessionRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            sessions: BTreeMap::new(),
            pending_finish: None,
        }
    }

    /// Apply a hook event observed at `now`. Never fails; unknown kinds are ignored.
    pub fn handle_event_at(&mut self, payload: &HookPayload, now: DateTime<Utc>) {
        let session_id = payload.session_id.as_str();

        match payload.hook_event_name {
            HookEventKind::SessionStart => {
                let mut session = Session::new(session_id, now);
                session.absorb_metadata(payload);
                self.sessions.insert(session_id.to_string(), session);
                info!(session_id, "Session started");
            }

            HookEventKind::SessionEnd => {
                if self.sessions.remove(session_id).is_some() {
                    info!(session_id, "Session ended");
                }
            }

            HookEventKind::UserPromptSubmit => {
                let session = self.ensure_session(payload, now);
                session.phase = Phase::Working;
                if let Some(prompt) = payload.prompt.as_deref().filter(|p| !p.is_empty()) {
                    session.last_prompt = Some(prompt.to_string());
                }
                debug!(session_id, "Session working (prompt submitted)");
            }

            HookEventKind::PreToolUse => {
                let debounce = self.config.debounce;
                let tool = payload.tool_name.as_deref().unwrap_or_default();
                let wants_input = self.config.is_input_tool(tool);
                let session = self.ensure_session(payload, now);

                if wants_input {
                    session.phase = Phase::WaitingForInput { since: now };
                    debug!(session_id, tool, "Session waiting for input");
                } else if session.in_input_grace(now, debounce) {
                    debug!(session_id, tool, "Ignoring tool call inside input grace window");
                } else {
                    session.phase = Phase::Working;
                    debug!(session_id, tool, "Session working (tool use)");
                }
            }

            HookEventKind::Stop => {
                let debounce = self.config.debounce;
                let session = self.ensure_session(payload, now);

                let finished_prompt = if session.in_input_grace(now, debounce) {
                    debug!(session_id, "Ignoring stop inside input grace window");
                    None
                } else {
                    let was_working = session.phase == Phase::Working;
                    session.phase = Phase::Idle;
                    debug!(session_id, was_working, "Session idle");
                    was_working.then(|| session.last_prompt.clone())
                };

                // Only working → idle counts as finished
                if let Some(prompt) = finished_prompt {
                    self.pending_finish = Some(PendingFinish {
                        session_id: session_id.to_string(),
                        prompt,
                    });
                }
            }

            HookEventKind::Unknown => {
                debug!(session_id, "Ignoring unknown hook event");
            }
        }
    }

    /// Look up a session, registering an idle one if this id is new
    fn ensure_session(&mut self, payload: &HookPayload, now: DateTime<Utc>) -> &mut Session {
        let session = self
            .sessions
            .entry(payload.session_id.clone())
            .or_insert_with(|| {
                info!(session_id = %payload.session_id, "Session auto-registered");
                Session::new(&payload.session_id, now)
            });
        session.last_activity = now;
        session.absorb_metadata(payload);
        session
    }

    /// Current aggregate view. With `consume_finish`, a pending finish is
    /// included and cleared; without it, the finish is neither shown nor cleared.
    pub fn snapshot(&mut self, consume_finish: bool) -> StateMessage {
        let finish = if consume_finish {
            self.pending_finish.take()
        } else {
            None
        };

        let sessions = self.sessions();
        let working = self.count(SessionStatus::Working);
        let waiting_for_input = self.count(SessionStatus::WaitingForInput);
        let (finished_session_id, finished_prompt) = match finish {
            Some(PendingFinish { session_id, prompt }) => (Some(session_id), prompt),
            None => (None, None),
        };

        StateMessage {
            blocked: working == 0,
            sessions,
            working,
            waiting_for_input,
            finished_session_id,
            finished_prompt,
        }
    }

    /// All tracked sessions, ordered by id
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(Session::info).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn count(&self, status: SessionStatus) -> usize {
        self.sessions
            .values()
            .filter(|s| s.status() == status)
            .count()
    }

    /// Remove sessions idle for longer than the session timeout; returns removed ids
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.config.session_timeout;
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| elapsed(s.last_activity, now) > timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            self.sessions.remove(id);
            info!(session_id = %id, "Session timed out");
        }
        expired
    }

    /// Drop all sessions and any pending finish
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.pending_finish = None;
    }
}

/// Time from `earlier` to `now`, clamped at zero when the clock went backwards
fn elapsed(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(TrackerConfig::default())
    }

    fn event(id: &str, kind: HookEventKind) -> HookPayload {
        HookPayload::new(id, kind)
    }

    fn ms(n: i64) -> TimeDelta {
        TimeDelta::milliseconds(n)
    }

    fn status_of(reg: &SessionRegistry, id: &str) -> Option<SessionStatus> {
        reg.sessions()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.status)
    }

    #[test]
    fn test_scenario_prompt_makes_working() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0);
        reg.handle_event_at(
            &event("s1", HookEventKind::UserPromptSubmit).with_prompt("fix bug"),
            t0 + ms(10),
        );

        let snap = reg.snapshot(true);
        assert_eq!(snap.working, 1);
        assert!(!snap.blocked);
        assert_eq!(snap.sessions[0].last_prompt.as_deref(), Some("fix bug"));
        assert!(snap.finished_session_id.is_none());
    }

    #[test]
    fn test_scenario_stop_delivers_finish_once() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0);
        reg.handle_event_at(
            &event("s1", HookEventKind::UserPromptSubmit).with_prompt("fix bug"),
            t0 + ms(10),
        );
        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(2_000));

        let first = reg.snapshot(true);
        assert_eq!(first.working, 0);
        assert!(first.blocked);
        assert_eq!(first.finished_session_id.as_deref(), Some("s1"));
        assert_eq!(first.finished_prompt.as_deref(), Some("fix bug"));

        let second = reg.snapshot(true);
        assert!(second.finished_session_id.is_none());
        assert!(second.finished_prompt.is_none());
    }

    #[test]
    fn test_non_consuming_snapshot_leaves_finish_pending() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0);
        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(100));

        let peek = reg.snapshot(false);
        assert!(peek.finished_session_id.is_none());

        let taken = reg.snapshot(true);
        assert_eq!(taken.finished_session_id.as_deref(), Some("s1"));
        assert!(taken.finished_prompt.is_none());
        assert!(reg.snapshot(true).finished_session_id.is_none());
    }

    #[test]
    fn test_scenario_stop_inside_grace_keeps_waiting() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0);
        reg.handle_event_at(
            &event("s1", HookEventKind::PreToolUse).with_tool("AskUserQuestion"),
            t0 + ms(10),
        );
        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(110));

        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::WaitingForInput));
        let snap = reg.snapshot(true);
        assert_eq!(snap.waiting_for_input, 1);
        assert!(snap.blocked);
        assert!(snap.finished_session_id.is_none());
    }

    #[test]
    fn test_stop_after_grace_goes_idle_without_finish() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(
            &event("s1", HookEventKind::PreToolUse).with_tool("ask_user"),
            t0,
        );
        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(800));

        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::Idle));
        assert!(reg.snapshot(true).finished_session_id.is_none());
    }

    #[test]
    fn test_tool_use_debounce_boundary() {
        let mut reg = registry();
        let t0 = Utc::now();
        let ask = event("s1", HookEventKind::PreToolUse).with_tool("AskUserQuestion");
        let edit = event("s1", HookEventKind::PreToolUse).with_tool("Edit");

        reg.handle_event_at(&ask, t0);
        reg.handle_event_at(&edit, t0 + ms(499));
        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::WaitingForInput));

        reg.handle_event_at(&edit, t0 + ms(500));
        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::Working));
    }

    #[test]
    fn test_repeated_input_tool_restarts_grace_window() {
        let mut reg = registry();
        let t0 = Utc::now();
        let ask = event("s1", HookEventKind::PreToolUse).with_tool("AskUserQuestion");
        reg.handle_event_at(&ask, t0);
        reg.handle_event_at(&ask, t0 + ms(400));
        reg.handle_event_at(
            &event("s1", HookEventKind::PreToolUse).with_tool("Bash"),
            t0 + ms(700),
        );
        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::WaitingForInput));
    }

    #[test]
    fn test_prompt_answers_input_request_immediately() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(
            &event("s1", HookEventKind::PreToolUse).with_tool("AskUserQuestion"),
            t0,
        );
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0 + ms(5));
        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::Working));
    }

    #[test]
    fn test_scenario_two_sessions() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0);
        reg.handle_event_at(&event("s2", HookEventKind::SessionStart), t0);
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0 + ms(1));

        let snap = reg.snapshot(true);
        assert_eq!(snap.working, 1);
        assert_eq!(snap.waiting_for_input, 0);
        assert!(!snap.blocked);
        assert_eq!(snap.sessions.len(), 2);

        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(2));
        let snap = reg.snapshot(true);
        assert!(snap.blocked);
        assert_eq!(snap.finished_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_auto_registers_on_out_of_order_event() {
        let mut reg = registry();
        let payload = event("late", HookEventKind::PreToolUse)
            .with_tool("Read")
            .with_cwd("/repo");
        reg.handle_event_at(&payload, Utc::now());

        let sessions = reg.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Working);
        assert_eq!(sessions[0].cwd.as_deref(), Some("/repo"));
    }

    #[test]
    fn test_duplicate_session_start_keeps_single_record() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0);
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0 + ms(1));
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0 + ms(2));

        assert_eq!(reg.session_count(), 1);
        assert_eq!(status_of(&reg, "s1"), Some(SessionStatus::Idle));
    }

    #[test]
    fn test_session_end_removes_record() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0);
        reg.handle_event_at(&event("s1", HookEventKind::SessionEnd), t0);
        reg.handle_event_at(&event("never-seen", HookEventKind::SessionEnd), t0);

        assert_eq!(reg.session_count(), 0);
        assert!(reg.snapshot(true).blocked);
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let mut reg = registry();
        reg.handle_event_at(&event("s1", HookEventKind::Unknown), Utc::now());
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn test_metadata_is_never_cleared() {
        let mut reg = registry();
        let t0 = Utc::now();
        let mut start = event("s1", HookEventKind::SessionStart).with_cwd("/a");
        start.git_repo = Some("repo-a".to_string());
        reg.handle_event_at(&start, t0);
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0 + ms(1));
        reg.handle_event_at(
            &event("s1", HookEventKind::UserPromptSubmit).with_prompt(""),
            t0 + ms(2),
        );

        let info = &reg.sessions()[0];
        assert_eq!(info.cwd.as_deref(), Some("/a"));
        assert_eq!(info.git_repo.as_deref(), Some("repo-a"));
        assert!(info.last_prompt.is_none());
    }

    #[test]
    fn test_latest_finish_replaces_unconsumed_one() {
        let mut reg = registry();
        let t0 = Utc::now();
        for id in ["s1", "s2"] {
            reg.handle_event_at(&event(id, HookEventKind::UserPromptSubmit).with_prompt(id), t0);
            reg.handle_event_at(&event(id, HookEventKind::Stop), t0 + ms(1));
        }
        let snap = reg.snapshot(true);
        assert_eq!(snap.finished_session_id.as_deref(), Some("s2"));
        assert_eq!(snap.finished_prompt.as_deref(), Some("s2"));
    }

    #[test]
    fn test_stop_while_idle_does_not_finish() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0);
        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(1));
        assert!(reg.snapshot(true).finished_session_id.is_none());
    }

    #[test]
    fn test_sweep_removes_only_stale_sessions() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("old", HookEventKind::UserPromptSubmit), t0);
        reg.handle_event_at(&event("fresh", HookEventKind::SessionStart), t0 + ms(200_000));

        assert!(reg.sweep_expired(t0 + ms(300_000)).is_empty());

        let removed = reg.sweep_expired(t0 + ms(300_001));
        assert_eq!(removed, vec!["old".to_string()]);
        let snap = reg.snapshot(true);
        assert_eq!(snap.sessions.len(), 1);
        assert_eq!(snap.sessions[0].id, "fresh");
        assert!(snap.blocked);
    }

    #[test]
    fn test_activity_refreshes_expiry() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::SessionStart), t0);
        reg.handle_event_at(
            &event("s1", HookEventKind::PreToolUse).with_tool("Bash"),
            t0 + ms(250_000),
        );
        assert!(reg.sweep_expired(t0 + ms(400_000)).is_empty());
        // Timeout now counts from the tool call, not from the start
        assert!(reg.sweep_expired(t0 + ms(550_000)).is_empty());
        assert_eq!(reg.sweep_expired(t0 + ms(550_001)), vec!["s1".to_string()]);
    }

    #[test]
    fn test_blocked_iff_no_working_session() {
        let mut reg = registry();
        let t0 = Utc::now();
        let steps = [
            event("a", HookEventKind::SessionStart),
            event("a", HookEventKind::UserPromptSubmit),
            event("b", HookEventKind::PreToolUse).with_tool("ask_human"),
            event("a", HookEventKind::PreToolUse).with_tool("Grep"),
            event("a", HookEventKind::Stop),
            event("b", HookEventKind::SessionEnd),
            event("c", HookEventKind::PreToolUse).with_tool("Write"),
            event("c", HookEventKind::SessionEnd),
        ];
        for (i, step) in steps.iter().enumerate() {
            reg.handle_event_at(step, t0 + ms(i as i64 * 1_000));
            let snap = reg.snapshot(true);
            let working = snap
                .sessions
                .iter()
                .filter(|s| s.status == SessionStatus::Working)
                .count();
            assert_eq!(snap.working, working);
            assert_eq!(snap.blocked, working == 0);
        }
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut reg = registry();
        let t0 = Utc::now();
        reg.handle_event_at(&event("s1", HookEventKind::UserPromptSubmit), t0);
        reg.handle_event_at(&event("s1", HookEventKind::Stop), t0 + ms(1));
        reg.clear();
        assert_eq!(reg.session_count(), 0);
        assert!(reg.snapshot(true).finished_session_id.is_none());
    }
}
