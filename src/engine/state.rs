//! Per-run state tracking.
//!
//! A `StateDocument` is created once per run and threaded through every stage.
//! Stage outputs are append-only, the error log and execution trace only grow,
//! and the run status only moves forward.

use crate::errors::{RunFailure, StateError};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of one engine invocation.
pub type RunId = Uuid;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not started
    #[default]
    Pending,
    /// A stage is executing or about to execute
    Running,
    /// Routing reached a terminal decision without a fatal failure
    Succeeded,
    /// Stopped by a fatal failure
    Failed,
}

impl RunStatus {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects Pending → Running → {Succeeded | Failed}.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    /// The run deadline expired while this attempt was in flight
    Abandoned,
}

/// One execution attempt of one stage. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stage: String,
    /// 1-based attempt number within the stage's retry sequence
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceEntry {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }

    /// Wall-clock duration of the attempt.
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// A failure recorded against a stage (or against the router).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: String,
    pub attempt: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(stage: impl Into<String>, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            attempt,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The mutable record threaded through a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    run_id: RunId,
    input: Value,
    #[serde(default)]
    outputs: IndexMap<String, Value>,
    #[serde(default)]
    errors: Vec<ErrorRecord>,
    #[serde(default)]
    trace: Vec<TraceEntry>,
    #[serde(default)]
    status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    terminal_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<RunFailure>,
    created_at: DateTime<Utc>,
}

impl StateDocument {
    /// Create a pending document for a fresh run.
    pub fn new(input: Value) -> Self {
        Self::with_run_id(Uuid::new_v4(), input)
    }

    pub fn with_run_id(run_id: RunId, input: Value) -> Self {
        Self {
            run_id,
            input,
            outputs: IndexMap::new(),
            errors: Vec::new(),
            trace: Vec::new(),
            status: RunStatus::Pending,
            terminal_stage: None,
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Output recorded by `stage`, if it has run successfully.
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.outputs.get(stage)
    }

    /// Look up a value inside a stage's output with a JSON pointer (e.g. `/forecast/high`).
    pub fn output_at(&self, stage: &str, pointer: &str) -> Option<&Value> {
        self.output(stage).and_then(|v| v.pointer(pointer))
    }

    pub fn has_output(&self, stage: &str) -> bool {
        self.outputs.contains_key(stage)
    }

    /// All outputs in the order they were recorded.
    pub fn outputs(&self) -> &IndexMap<String, Value> {
        &self.outputs
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn terminal_stage(&self) -> Option<&str> {
        self.terminal_stage.as_deref()
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    /// Number of attempts made for `stage` across the whole run.
    pub fn attempts_for(&self, stage: &str) -> usize {
        self.trace.iter().filter(|e| e.stage == stage).count()
    }

    /// Record `stage`'s output. Rejected if the stage already has one.
    pub fn record_output(&mut self, stage: &str, output: Value) -> Result<(), StateError> {
        if self.outputs.contains_key(stage) {
            return Err(StateError::OutputAlreadyRecorded {
                stage: stage.to_string(),
            });
        }
        self.outputs.insert(stage.to_string(), output);
        Ok(())
    }

    /// Record the output of another visit to `stage`.
    ///
    /// The first visit is stored under the stage name; later visits go under
    /// `stage#2`, `stage#3`, ... Returns the key used.
    pub fn record_visit_output(
        &mut self,
        stage: &str,
        output: Value,
    ) -> Result<String, StateError> {
        let key = match self.visits(stage) {
            0 => stage.to_string(),
            n => format!("{}#{}", stage, n + 1),
        };
        self.record_output(&key, output)?;
        Ok(key)
    }

    /// Number of successful visits recorded for `stage`.
    pub fn visits(&self, stage: &str) -> usize {
        if !self.outputs.contains_key(stage) {
            return 0;
        }
        let prefix = format!("{}#", stage);
        1 + self
            .outputs
            .keys()
            .filter(|k| {
                k.strip_prefix(&prefix)
                    .is_some_and(|n| n.parse::<u32>().is_ok())
            })
            .count()
    }

    /// Output of the most recent visit to `stage`.
    pub fn latest_output(&self, stage: &str) -> Option<&Value> {
        match self.visits(stage) {
            0 => None,
            1 => self.output(stage),
            n => self.outputs.get(&format!("{}#{}", stage, n)),
        }
    }

    pub fn push_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    /// Append a trace entry; the entry's stage becomes the terminal stage.
    pub fn push_trace(&mut self, entry: TraceEntry) {
        self.terminal_stage = Some(entry.stage.clone());
        self.trace.push(entry);
    }

    /// Move to `next`, enforcing monotonic status transitions.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the run failed with `failure`. The first recorded failure wins.
    pub fn fail(&mut self, failure: RunFailure) -> Result<(), StateError> {
        self.transition(RunStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }
}

/// Read-only, concurrently readable view of a run's execution trace.
///
/// The engine appends to it in execution order while the run is in flight;
/// observers only ever get owned snapshots.
#[derive(Debug, Clone, Default)]
pub struct TraceReader {
    entries: Arc<RwLock<Vec<TraceEntry>>>,
}

impl TraceReader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, entry: TraceEntry) {
        // A poisoned lock only means a reader panicked mid-clone; the data is intact.
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard.push(entry);
    }

    /// Copy of every entry appended so far.
    pub fn snapshot(&self) -> Vec<TraceEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
