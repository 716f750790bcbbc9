//! Tracker configuration and validation.

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Sessions with no activity for this long are expired
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Grace window after entering `waiting_for_input` during which follow-up events are ignored
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
/// How often the expiry sweep runs
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Tools that indicate the assistant is waiting for user input
pub const DEFAULT_INPUT_TOOLS: [&str; 3] = ["AskUserQuestion", "ask_user", "ask_human"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("session timeout must be greater than zero")]
    ZeroSessionTimeout,
    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,
    #[error("at least one user-input tool name is required")]
    NoInputTools,
    #[error("user-input tool names must not be blank")]
    BlankInputTool,
}

/// Thresholds and tool names the session registry depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub session_timeout: Duration,
    pub debounce: Duration,
    pub sweep_interval: Duration,
    pub input_tools: BTreeSet<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            debounce: DEFAULT_DEBOUNCE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            input_tools: DEFAULT_INPUT_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TrackerConfig {
    /// Build a config from millisecond values, as supplied on the command line.
    /// An empty tool list keeps the default set.
    pub fn from_millis(
        session_timeout_ms: u64,
        debounce_ms: u64,
        sweep_interval_ms: u64,
        input_tools: &[String],
    ) -> Result<Self, ConfigError> {
        let mut config = Self {
            session_timeout: Duration::from_millis(session_timeout_ms),
            debounce: Duration::from_millis(debounce_ms),
            sweep_interval: Duration::from_millis(sweep_interval_ms),
            ..Self::default()
        };
        if !input_tools.is_empty() {
            config.input_tools = input_tools.iter().map(|s| s.trim().to_string()).collect();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout.is_zero() {
            return Err(ConfigError::ZeroSessionTimeout);
        }
        // tokio::time::interval panics on a zero period
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.input_tools.is_empty() {
            return Err(ConfigError::NoInputTools);
        }
        if self.input_tools.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::BlankInputTool);
        }
        Ok(())
    }

    /// Whether a tool marks the session as waiting for user input
    pub fn is_input_tool(&self, tool_name: &str) -> bool {
        self.input_tools.contains(tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_timeout, Duration::from_millis(300_000));
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert!(config.is_input_tool("AskUserQuestion"));
        assert!(!config.is_input_tool("Edit"));
    }

    #[test]
    fn test_from_millis_custom_tools() {
        let tools = vec!["ask_me".to_string(), " prompt_user ".to_string()];
        let config = TrackerConfig::from_millis(1_000, 0, 10, &tools).unwrap();
        assert!(config.is_input_tool("ask_me"));
        assert!(config.is_input_tool("prompt_user"));
        assert!(!config.is_input_tool("AskUserQuestion"));
        assert!(config.debounce.is_zero());
    }

    #[test]
    fn test_from_millis_empty_tools_keeps_defaults() {
        let config = TrackerConfig::from_millis(1_000, 500, 10, &[]).unwrap();
        assert!(config.is_input_tool("ask_human"));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        assert_eq!(
            TrackerConfig::from_millis(0, 500, 10, &[]),
            Err(ConfigError::ZeroSessionTimeout)
        );
        assert_eq!(
            TrackerConfig::from_millis(1_000, 500, 0, &[]),
            Err(ConfigError::ZeroSweepInterval)
        );
    }

    #[test]
    fn test_rejects_blank_tool_name() {
        let tools = vec!["ask_user".to_string(), "  ".to_string()];
        assert_eq!(
            TrackerConfig::from_millis(1_000, 500, 10, &tools),
            Err(ConfigError::BlankInputTool)
        );
    }
}
