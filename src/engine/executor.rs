//! The run loop.

use crate::delivery::{DeliveryFanOut, DeliveryReport};
use crate::engine::state::duration_ms;
use crate::engine::{
    AttemptOutcome, Engine, ErrorRecord, RunId, RunStatus, StateDocument, TraceReader,
};
use crate::errors::{RetryExhausted, RunFailure, StageError};
use crate::retry::{Deadline, ExecutionEnv, execute_with_retry};
use crate::router::RoutingDecision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Stage name recorded on errors raised by routing predicates.
pub(crate) const ROUTER_ERROR_STAGE: &str = "router";

/// Final state of one run, plus delivery results when delivery happened.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub state: StateDocument,
    /// `None` when the run failed or no channels are configured
    pub delivery: Option<DeliveryReport>,
    pub duration: Duration,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.state.status() == RunStatus::Succeeded
    }

    pub fn attempts_for(&self, stage: &str) -> usize {
        self.state.attempts_for(stage)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_result(self)
    }
}

/// Per-stage line of a [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub attempts: usize,
    pub succeeded: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Compact, serializable account of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_stage: Option<String>,
    /// Stages in first-execution order
    pub stages: Vec<StageSummary>,
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryReport>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl RunSummary {
    fn from_result(result: &RunResult) -> Self {
        let mut stages: Vec<StageSummary> = Vec::new();
        for entry in result.state.trace() {
            let index = match stages.iter().position(|s| s.stage == entry.stage) {
                Some(index) => index,
                None => {
                    stages.push(StageSummary {
                        stage: entry.stage.clone(),
                        attempts: 0,
                        succeeded: false,
                        duration: Duration::ZERO,
                    });
                    stages.len() - 1
                }
            };
            let line = &mut stages[index];
            line.attempts += 1;
            line.duration += entry.duration();
            line.succeeded = entry.outcome == AttemptOutcome::Succeeded;
        }

        Self {
            run_id: result.state.run_id(),
            status: result.state.status(),
            terminal_stage: result.state.terminal_stage().map(str::to_string),
            stages,
            error_count: result.state.errors().len(),
            failure: result.state.failure().map(|f| f.to_string()),
            delivery: result.delivery.clone(),
            duration: result.duration,
        }
    }

    pub fn total_attempts(&self) -> usize {
        self.stages.iter().map(|s| s.attempts).sum()
    }
}

/// A run executing on its own task.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    trace: TraceReader,
    task: JoinHandle<RunResult>,
}

impl RunHandle {
    pub(crate) fn new(run_id: RunId, trace: TraceReader, task: JoinHandle<RunResult>) -> Self {
        Self {
            run_id,
            trace,
            task,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Live, read-only view of the run's trace.
    pub fn trace(&self) -> TraceReader {
        self.trace.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<RunResult, JoinError> {
        self.task.await
    }
}

impl Engine {
    pub(crate) async fn drive(&self, state: StateDocument, trace: TraceReader) -> RunResult {
        let span = tracing::info_span!("run", run_id = %state.run_id());
        self.drive_inner(state, trace).instrument(span).await
    }

    async fn drive_inner(&self, mut state: StateDocument, trace: TraceReader) -> RunResult {
        let started = Instant::now();
        let inner = &self.inner;
        let run_id = state.run_id();

        set_status(&mut state, RunStatus::Running);
        tracing::info!(run_id = %run_id, entry = %inner.entry, "run started");

        let deadline = inner.run_deadline.map(Deadline::after);
        let env = ExecutionEnv::new(inner.sink.as_ref())
            .with_deadline(deadline)
            .with_drain_grace(inner.drain_grace)
            .with_trace(&trace);

        let mut current = inner.entry.clone();
        let mut steps = 0u32;

        loop {
            if let Some(deadline) = deadline {
                if deadline.is_expired() {
                    fail(
                        &mut state,
                        RunFailure::DeadlineExceeded {
                            stage: current.clone(),
                            deadline_ms: deadline.budget_ms(),
                        },
                    );
                    break;
                }
            }

            let Some(stage) = inner.registry.get(&current) else {
                fail(
                    &mut state,
                    RunFailure::RetryExhausted(RetryExhausted {
                        stage: current.clone(),
                        attempts: 0,
                        last: StageError::fatal("stage is not registered"),
                    }),
                );
                break;
            };

            steps += 1;
            let policy = self.policy_for(&current);
            let output = match execute_with_retry(&stage, &mut state, policy, &env).await {
                Ok(output) => output,
                Err(failure) => {
                    fail(&mut state, failure);
                    break;
                }
            };
            if let Err(e) = state.record_visit_output(&current, output) {
                tracing::error!(
                    run_id = %run_id,
                    stage = %current,
                    error = %e,
                    "could not record stage output"
                );
            }

            let evaluation = inner.router.next(&current, &state);
            for warning in evaluation.warnings {
                tracing::warn!(
                    run_id = %run_id,
                    from = %warning.from,
                    to = %warning.to,
                    error = %warning.message,
                    "routing predicate failed"
                );
                state.push_error(ErrorRecord::new(ROUTER_ERROR_STAGE, 0, warning.to_string()));
            }

            match evaluation.decision {
                RoutingDecision::Terminal => {
                    set_status(&mut state, RunStatus::Succeeded);
                    break;
                }
                RoutingDecision::Continue(next) => {
                    if steps >= inner.max_steps {
                        fail(
                            &mut state,
                            RunFailure::RoutingLoop {
                                max_steps: inner.max_steps,
                                stage: current,
                            },
                        );
                        break;
                    }
                    tracing::debug!(run_id = %run_id, from = %current, to = %next, "routing");
                    current = next;
                }
            }
        }

        let delivery = if state.status() == RunStatus::Succeeded && !inner.channels.is_empty() {
            let artifact = state
                .terminal_stage()
                .and_then(|stage| state.latest_output(stage))
                .cloned()
                .unwrap_or(Value::Null);
            let fanout = DeliveryFanOut::new(inner.delivery.clone());
            Some(fanout.dispatch(&artifact, &inner.channels).await)
        } else {
            None
        };

        let duration = started.elapsed();
        match state.failure() {
            Some(failure) => tracing::warn!(
                run_id = %run_id,
                steps,
                duration_ms = duration.as_millis() as u64,
                failure = %failure,
                "run failed"
            ),
            None => tracing::info!(
                run_id = %run_id,
                steps,
                duration_ms = duration.as_millis() as u64,
                "run succeeded"
            ),
        }

        RunResult {
            state,
            delivery,
            duration,
        }
    }
}

fn set_status(state: &mut StateDocument, status: RunStatus) {
    if let Err(e) = state.transition(status) {
        tracing::error!(run_id = %state.run_id(), error = %e, "status transition rejected");
    }
}

fn fail(state: &mut StateDocument, failure: RunFailure) {
    if let Err(e) = state.fail(failure) {
        tracing::error!(run_id = %state.run_id(), error = %e, "could not mark run failed");
    }
}
