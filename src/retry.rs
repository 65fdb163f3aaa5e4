//! Retry policies and the per-stage attempt loop.

use crate::engine::{AttemptOutcome, ErrorRecord, StateDocument, TraceEntry, TraceReader};
use crate::errors::{RetryExhausted, RunFailure, StageError, panic_message};
use crate::progress::{ProgressEvent, ProgressKind, ProgressSink};
use crate::stage::{Stage, StageContext};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    /// `base_ms * 2^(attempt-1)`, capped at `max_ms`, plus up to `jitter_ms` of random delay
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            jitter_ms: 0,
        }
    }

    pub fn with_jitter(self, jitter: Duration) -> Self {
        match self {
            Self::Exponential { base_ms, max_ms, .. } => Self::Exponential {
                base_ms,
                max_ms,
                jitter_ms: jitter.as_millis() as u64,
            },
            other => other,
        }
    }

    /// Delay after failed attempt number `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential { base_ms, max_ms, .. } => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }

    /// Delay after failed attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self {
            Backoff::Exponential { jitter_ms, .. } if *jitter_ms > 0 => {
                base + Duration::from_millis(rand::thread_rng().gen_range(0..=*jitter_ms))
            }
            _ => base,
        }
    }
}

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&StageError) -> bool + Send + Sync>;

/// Per-stage retry configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1
    pub max_attempts: u32,
    pub backoff: Backoff,
    retryable: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            retryable: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retryable<F>(mut self, f: F) -> Self
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(f));
        self
    }

    /// Retry only errors whose [`StageError::kind`] is listed.
    pub fn retry_on_kinds(self, kinds: Vec<String>) -> Self {
        self.with_retryable(move |err| kinds.iter().any(|k| k == err.kind()))
    }

    /// Without a custom predicate, everything but `Fatal` and `Cancelled` is retryable.
    pub fn is_retryable(&self, err: &StageError) -> bool {
        match &self.retryable {
            Some(f) => f(err),
            None => !matches!(err, StageError::Fatal(_) | StageError::Cancelled),
        }
    }

    /// The policy actually applied to a stage: non-idempotent stages get one attempt.
    pub fn effective_for(&self, idempotent: bool) -> RetryPolicy {
        let mut policy = self.clone();
        if !idempotent {
            policy.max_attempts = 1;
        }
        policy
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("custom_retryable", &self.retryable.is_some())
            .finish()
    }
}

/// Wall-clock budget for a whole run.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }
}

/// Run-level context for executing one stage.
pub struct ExecutionEnv<'a> {
    pub sink: &'a dyn ProgressSink,
    pub deadline: Option<Deadline>,
    /// How long an abandoned attempt gets to observe cancellation before it is left to drain
    pub drain_grace: Duration,
    pub trace: Option<&'a TraceReader>,
}

impl<'a> ExecutionEnv<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            deadline: None,
            drain_grace: Duration::from_millis(50),
            trace: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_trace(mut self, trace: &'a TraceReader) -> Self {
        self.trace = Some(trace);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        self.sink.on_event(&event);
    }

    fn record(&self, state: &mut StateDocument, entry: TraceEntry) {
        if let Some(reader) = self.trace {
            reader.append(entry.clone());
        }
        state.push_trace(entry);
    }
}

/// Execute `stage` under `policy`, recording every attempt on `state`.
///
/// Returns the output of the first successful attempt. The output is not
/// recorded here; the caller decides the key it is stored under.
pub async fn execute_with_retry(
    stage: &Arc<dyn Stage>,
    state: &mut StateDocument,
    policy: &RetryPolicy,
    env: &ExecutionEnv<'_>,
) -> Result<Value, RunFailure> {
    let policy = policy.effective_for(stage.idempotent());
    let name = stage.name().to_string();
    let run_id = state.run_id();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let ctx = StageContext::new(run_id, &name, attempt);
        let token = ctx.cancellation_token().clone();
        let started_at = Utc::now();
        env.emit(ProgressEvent::new(run_id, &name, attempt, ProgressKind::Started));
        tracing::debug!(run_id = %run_id, stage = %name, attempt, "starting attempt");

        let mut handle = spawn_attempt(Arc::clone(stage), state.clone(), ctx);

        let joined = match env.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline.at, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    token.cancel();
                    abandon(handle, env.drain_grace, &name, attempt).await;
                    let message = "run deadline exceeded".to_string();
                    state.push_error(ErrorRecord::new(&name, attempt, &message));
                    env.record(
                        state,
                        TraceEntry {
                            stage: name.clone(),
                            attempt,
                            started_at,
                            ended_at: Utc::now(),
                            outcome: AttemptOutcome::Abandoned,
                            error: Some(message),
                        },
                    );
                    env.emit(
                        ProgressEvent::new(run_id, &name, attempt, ProgressKind::Failed)
                            .with_detail("deadline exceeded"),
                    );
                    return Err(RunFailure::DeadlineExceeded {
                        stage: name,
                        deadline_ms: deadline.budget_ms(),
                    });
                }
            },
            None => (&mut handle).await,
        };

        let outcome = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(StageError::Panicked(panic_message(
                e.into_panic().as_ref(),
            ))),
            Err(_) => Err(StageError::Cancelled),
        };

        match outcome {
            Ok(output) => {
                env.record(
                    state,
                    TraceEntry {
                        stage: name.clone(),
                        attempt,
                        started_at,
                        ended_at: Utc::now(),
                        outcome: AttemptOutcome::Succeeded,
                        error: None,
                    },
                );
                env.emit(ProgressEvent::new(
                    run_id,
                    &name,
                    attempt,
                    ProgressKind::Succeeded,
                ));
                return Ok(output);
            }
            Err(err) => {
                let message = err.to_string();
                state.push_error(ErrorRecord::new(&name, attempt, &message));
                env.record(
                    state,
                    TraceEntry {
                        stage: name.clone(),
                        attempt,
                        started_at,
                        ended_at: Utc::now(),
                        outcome: AttemptOutcome::Failed,
                        error: Some(message.clone()),
                    },
                );

                let will_retry = attempt < policy.max_attempts && policy.is_retryable(&err);
                if !will_retry {
                    tracing::warn!(
                        run_id = %run_id,
                        stage = %name,
                        attempt,
                        error = %message,
                        "stage failed"
                    );
                    env.emit(
                        ProgressEvent::new(run_id, &name, attempt, ProgressKind::Failed)
                            .with_detail(&message),
                    );
                    return Err(RunFailure::RetryExhausted(RetryExhausted {
                        stage: name,
                        attempts: attempt,
                        last: err,
                    }));
                }

                let delay = policy.backoff.delay(attempt);
                if let Some(deadline) = env.deadline {
                    if Instant::now() + delay >= deadline.at {
                        tokio::time::sleep_until(deadline.at).await;
                        env.emit(
                            ProgressEvent::new(run_id, &name, attempt, ProgressKind::Failed)
                                .with_detail("deadline exceeded during backoff"),
                        );
                        return Err(RunFailure::DeadlineExceeded {
                            stage: name,
                            deadline_ms: deadline.budget_ms(),
                        });
                    }
                }

                tracing::info!(
                    run_id = %run_id,
                    stage = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "retrying stage"
                );
                env.emit(
                    ProgressEvent::new(run_id, &name, attempt, ProgressKind::Retrying)
                        .with_detail(&message),
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Run one attempt on its own task, applying the stage's attempt timeout.
fn spawn_attempt(
    stage: Arc<dyn Stage>,
    snapshot: StateDocument,
    ctx: StageContext,
) -> JoinHandle<Result<Value, StageError>> {
    tokio::spawn(async move {
        match stage.timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, stage.execute(&snapshot, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    }),
                }
            }
            None => stage.execute(&snapshot, &ctx).await,
        }
    })
}

/// Give a cancelled attempt `grace` to stop, then hand it to a background drainer.
///
/// The attempt's result is never applied to the run either way.
async fn abandon(
    mut handle: JoinHandle<Result<Value, StageError>>,
    grace: Duration,
    stage: &str,
    attempt: u32,
) {
    if tokio::time::timeout(grace, &mut handle).await.is_ok() {
        return;
    }
    let stage = stage.to_string();
    tracing::warn!(stage = %stage, attempt, "attempt ignored cancellation; draining in background");
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(_)) => {
                tracing::debug!(stage = %stage, attempt, "abandoned attempt finished")
            }
            Ok(Err(e)) => {
                tracing::debug!(stage = %stage, attempt, error = %e, "abandoned attempt failed")
            }
            Err(e) => {
                tracing::debug!(stage = %stage, attempt, error = %e, "abandoned attempt aborted")
            }
        }
    });
}
