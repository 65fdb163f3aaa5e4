//! Typed error hierarchy for the conductor engine.
//!
//! Errors are split by how far they are allowed to travel:
//! - `StageError`: one failed attempt of one stage
//! - `RetryExhausted` / `RunFailure`: fatal to a run, recorded on the `StateDocument`
//! - `RouterPredicateError`: a routing predicate failed, downgraded to a warning
//! - `DeliveryChannelError`: one channel failed, isolated to its `DeliveryResult`
//! - `StateError`: an invariant of the state document was violated
//! - `ConfigError`: the engine was wired incorrectly; returned before any stage runs

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by a single stage attempt.
///
/// The variant decides retry eligibility under the default policy:
/// everything except `Fatal` and `Cancelled` may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("attempt timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("attempt cancelled")]
    Cancelled,

    #[error("stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Short machine-readable label, used by declarative `retry_on` lists.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}

/// A stage failed on every attempt its policy allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("stage '{stage}' failed after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
    pub stage: String,
    pub attempts: u32,
    #[source]
    pub last: StageError,
}

/// The reason a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunFailure {
    #[error(transparent)]
    RetryExhausted(RetryExhausted),

    #[error("routing exceeded the step ceiling of {max_steps} (last stage '{stage}')")]
    RoutingLoop { max_steps: u32, stage: String },

    #[error("run deadline of {deadline_ms}ms exceeded while in stage '{stage}'")]
    DeadlineExceeded { stage: String, deadline_ms: u64 },
}

/// A routing predicate could not be evaluated. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("routing predicate for {from} -> {to} failed: {message}")]
pub struct RouterPredicateError {
    pub from: String,
    pub to: String,
    pub message: String,
}

impl RouterPredicateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            message: message.into(),
        }
    }
}

/// Failure of a single delivery channel. Isolated to that channel's result.
#[derive(Debug, Error)]
pub enum DeliveryChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("channel rejected artifact: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Violations of `StateDocument` invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("output for stage '{stage}' is already recorded and cannot be overwritten")]
    OutputAlreadyRecorded { stage: String },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: crate::engine::RunStatus,
        to: crate::engine::RunStatus,
    },
}

/// Engine wiring errors, surfaced by `EngineBuilder::build` before any stage executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no entry stage configured")]
    MissingEntryStage,

    #[error("entry stage '{0}' is not registered")]
    UnknownEntryStage(String),

    #[error("stage '{0}' is registered twice")]
    DuplicateStage(String),

    #[error("stage name '{0}' must not contain '#'")]
    InvalidStageName(String),

    #[error("route from unknown stage '{0}'")]
    UnknownRouteSource(String),

    #[error("route {from} -> {to} targets an unregistered stage")]
    UnknownRouteTarget { from: String, to: String },

    #[error("configuration names unknown stage '{0}'")]
    UnknownStage(String),

    #[error("retry policy configured for unknown stage '{0}'")]
    UnknownRetryStage(String),

    #[error("delivery channel '{0}' is not registered")]
    UnknownChannel(String),

    #[error("max_steps must be at least 1")]
    ZeroMaxSteps,

    #[error("retry policy for '{stage}' must allow at least one attempt")]
    ZeroAttempts { stage: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_kind_labels() {
        assert_eq!(StageError::failed("x").kind(), "failed");
        assert_eq!(StageError::transient("x").kind(), "transient");
        assert_eq!(StageError::fatal("x").kind(), "fatal");
        assert_eq!(StageError::Timeout { timeout_ms: 5 }.kind(), "timeout");
        assert_eq!(StageError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn stage_error_from_anyhow_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("fetching forecast");
        let stage_err: StageError = err.into();
        match &stage_err {
            StageError::Failed(msg) => {
                assert!(msg.contains("fetching forecast"));
                assert!(msg.contains("connection refused"));
            }
            _ => panic!("Expected Failed variant"),
        }
    }

    #[test]
    fn retry_exhausted_carries_last_error_as_source() {
        use std::error::Error as _;
        let err = RetryExhausted {
            stage: "forecast".to_string(),
            attempts: 3,
            last: StageError::transient("upstream 503"),
        };
        assert!(err.to_string().contains("3 attempt"));
        let source = err.source().expect("last error is the source");
        assert!(source.to_string().contains("upstream 503"));
    }

    #[test]
    fn run_failure_is_transparent_over_retry_exhausted() {
        let inner = RetryExhausted {
            stage: "s".to_string(),
            attempts: 1,
            last: StageError::fatal("boom"),
        };
        let failure = RunFailure::RetryExhausted(inner.clone());
        assert_eq!(failure.to_string(), inner.to_string());
    }

    #[test]
    fn run_failure_serializes_with_type_tag() {
        let failure = RunFailure::RoutingLoop {
            max_steps: 32,
            stage: "a".to_string(),
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"type\":\"routing_loop\""));
        let back: RunFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn config_error_messages_name_the_offender() {
        let err = ConfigError::UnknownRouteTarget {
            from: "a".to_string(),
            to: "ghost".to_string(),
        };
        assert!(err.to_string().contains("ghost"));
        assert!(ConfigError::UnknownEntryStage("start".into())
            .to_string()
            .contains("start"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StageError::Cancelled);
        assert_std_error(&RouterPredicateError::new("x"));
        assert_std_error(&DeliveryChannelError::Unavailable("sms".into()));
        assert_std_error(&ConfigError::ZeroMaxSteps);
        assert_std_error(&StateError::OutputAlreadyRecorded { stage: "a".into() });
    }
}
