use crate::retry::RetryPolicy;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};

/// Tunables for the orchestrator. Every field has a default, so an empty
/// `[orchestrator]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retry budget and backoff for TRANSIENT failures.
    pub retry: RetryPolicy,
    /// How many levels of delegated child tasks one message may spawn.
    pub max_delegation_depth: u32,
    /// Error log entries kept per agent.
    pub max_error_log_entries: usize,
    /// Failed requests kept by the performance monitor.
    pub max_recent_failures: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_delegation_depth: 8,
            max_error_log_entries: 100,
            max_recent_failures: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Parse an `[orchestrator]` table. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        toml::from_str(raw).map_err(|e| ConductorError::Config(e.to_string()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.max_delegation_depth, 8);
        assert_eq!(config.max_error_log_entries, 100);
        assert_eq!(config.max_recent_failures, 50);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let raw = r#"
max_delegation_depth = 2

[retry]
max_retries = 5
"#;
        let config = OrchestratorConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.max_delegation_depth, 2);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_base_ms, 500);
        assert_eq!(config.max_recent_failures, 50);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OrchestratorConfig::from_toml_str("max_delegation_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, ConductorError::Config(_)));
    }
}
