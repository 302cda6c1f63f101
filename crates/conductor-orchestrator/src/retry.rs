use crate::types::{ErrorType, RetryStrategy};
use conductor_core::ConductorError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;

/// Configures how transient task failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of re-dispatches for a TRANSIENT failure.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests and latency-sensitive callers.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Decide whether a task that has already been retried `current_retry_count`
    /// times should be retried again after failing with `error_type`.
    ///
    /// Only TRANSIENT failures are retried. The other kinds report
    /// `max_retries = 0`.
    pub fn decide(&self, error_type: ErrorType, current_retry_count: u32) -> RetryStrategy {
        match error_type {
            ErrorType::Transient => RetryStrategy {
                should_retry: current_retry_count < self.max_retries,
                max_retries: self.max_retries,
            },
            ErrorType::Validation | ErrorType::BusinessLogic | ErrorType::System => {
                RetryStrategy {
                    should_retry: false,
                    max_retries: 0,
                }
            }
        }
    }

    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Maps a failure raised during dispatch to an [`ErrorType`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a dispatch failure.
    pub fn classify(&self, err: &ConductorError) -> ErrorType {
        match err {
            ConductorError::Transient(_) => ErrorType::Transient,
            ConductorError::Validation(_) | ConductorError::Json(_) => ErrorType::Validation,
            ConductorError::BusinessLogic(_) => ErrorType::BusinessLogic,
            ConductorError::Io(e) => classify_io(e.kind()),
            ConductorError::Agent(msg) => classify_message(msg),
            ConductorError::AgentNotFound(_)
            | ConductorError::WorkflowNotFound(_)
            | ConductorError::TaskNotFound(_)
            | ConductorError::InvalidTransition(_)
            | ConductorError::Internal(_)
            | ConductorError::NotReady
            | ConductorError::Config(_) => ErrorType::System,
        }
    }
}

fn classify_io(kind: ErrorKind) -> ErrorType {
    match kind {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::UnexpectedEof => ErrorType::Transient,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorType::Validation,
        _ => ErrorType::System,
    }
}

/// Heuristic for free-form handler errors.
fn classify_message(msg: &str) -> ErrorType {
    let lower = msg.to_lowercase();

    let transient = [
        "timeout",
        "timed out",
        "network",
        "connection",
        "unavailable",
        "econnreset",
        "429",
        "502",
        "503",
        "504",
    ];
    if transient.iter().any(|p| lower.contains(p)) {
        return ErrorType::Transient;
    }

    let validation = ["missing", "invalid", "required", "malformed"];
    if validation.iter().any(|p| lower.contains(p)) {
        return ErrorType::Validation;
    }

    ErrorType::BusinessLogic
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_base_ms, 500);
        assert_eq!(policy.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_transient_retried_until_max() {
        let policy = RetryPolicy::default();
        for count in 0..3 {
            let decision = policy.decide(ErrorType::Transient, count);
            assert!(decision.should_retry, "attempt {count} should retry");
            assert_eq!(decision.max_retries, 3);
        }
        assert!(!policy.decide(ErrorType::Transient, 3).should_retry);
        assert!(!policy.decide(ErrorType::Transient, 10).should_retry);
    }

    #[test]
    fn test_non_transient_never_retried() {
        let policy = RetryPolicy::default();
        for kind in [
            ErrorType::Validation,
            ErrorType::BusinessLogic,
            ErrorType::System,
        ] {
            let decision = policy.decide(kind, 0);
            assert!(!decision.should_retry);
            assert_eq!(decision.max_retries, 0);
        }
    }

    #[test]
    fn test_backoff_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(63), Duration::from_millis(1_000));
    }

    #[test]
    fn test_immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.backoff(5), Duration::ZERO);
        assert!(policy.decide(ErrorType::Transient, 1).should_retry);
        assert!(!policy.decide(ErrorType::Transient, 2).should_retry);
    }

    #[test]
    fn test_classify_typed_variants() {
        let c = ErrorClassifier::new();
        assert_eq!(
            c.classify(&ConductorError::Transient("blip".into())),
            ErrorType::Transient
        );
        assert_eq!(
            c.classify(&ConductorError::Validation("no q".into())),
            ErrorType::Validation
        );
        assert_eq!(
            c.classify(&ConductorError::BusinessLogic("no intent matched".into())),
            ErrorType::BusinessLogic
        );
        assert_eq!(
            c.classify(&ConductorError::Internal("registry corrupted".into())),
            ErrorType::System
        );
        assert_eq!(
            c.classify(&ConductorError::AgentNotFound("x".into())),
            ErrorType::System
        );
    }

    #[test]
    fn test_classify_io_errors() {
        let c = ErrorClassifier::new();
        let timeout = std::io::Error::new(ErrorKind::TimedOut, "slow");
        assert_eq!(c.classify(&timeout.into()), ErrorType::Transient);
        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "down");
        assert_eq!(c.classify(&refused.into()), ErrorType::Transient);
        let denied = std::io::Error::new(ErrorKind::PermissionDenied, "nope");
        assert_eq!(c.classify(&denied.into()), ErrorType::System);
    }

    #[test]
    fn test_classify_json_as_validation() {
        let c = ErrorClassifier::new();
        let err: ConductorError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(c.classify(&err), ErrorType::Validation);
    }

    #[test]
    fn test_classify_free_form_messages() {
        let c = ErrorClassifier::new();
        assert_eq!(
            c.classify(&ConductorError::Agent("upstream request timed out".into())),
            ErrorType::Transient
        );
        assert_eq!(
            c.classify(&ConductorError::Agent("HTTP 503 from search index".into())),
            ErrorType::Transient
        );
        assert_eq!(
            c.classify(&ConductorError::Agent("missing field `query`".into())),
            ErrorType::Validation
        );
        assert_eq!(
            c.classify(&ConductorError::Agent("no intent matched".into())),
            ErrorType::BusinessLogic
        );
    }
}
