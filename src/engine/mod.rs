//! The orchestration engine.
//!
//! A run starts at the entry stage and walks the routing graph one stage at a
//! time. Each stage executes under its retry policy; its output is merged into
//! the run's `StateDocument` and the router picks what comes next. The first
//! fatal failure stops the run. When the run succeeds, the terminal stage's
//! output is fanned out to every delivery channel.
//!
//! ## Usage
//!
//! ```no_run
//! use conductor::engine::EngineBuilder;
//! use conductor::retry::RetryPolicy;
//! use conductor::stage::FnStage;
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = EngineBuilder::new()
//!     .stage(FnStage::new("fetch", |state, _ctx| async move {
//!         Ok(json!({ "echo": state.input().clone() }))
//!     }))
//!     .stage(FnStage::new("publish", |_state, _ctx| async move { Ok(json!("done")) }))
//!     .entry("fetch")
//!     .route_always("fetch", "publish")
//!     .retry_policy("fetch", RetryPolicy::new(3))
//!     .build()?;
//!
//! let result = engine.run(&json!({ "city": "Oslo" })).await?;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

pub mod builder;
mod executor;
pub mod state;

pub use builder::{DEFAULT_DRAIN_GRACE_MS, DEFAULT_MAX_STEPS, EngineBuilder};
pub use executor::{RunHandle, RunResult, RunSummary, StageSummary};
pub use state::{
    AttemptOutcome, ErrorRecord, RunId, RunStatus, StateDocument, TraceEntry, TraceReader,
};

use crate::delivery::{DeliveryChannel, DeliveryConfig};
use crate::errors::ConfigError;
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::stage::StageRegistry;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct EngineInner {
    pub(crate) registry: StageRegistry,
    pub(crate) router: Router,
    pub(crate) entry: String,
    pub(crate) policies: HashMap<String, RetryPolicy>,
    pub(crate) default_policy: RetryPolicy,
    pub(crate) channels: Vec<Arc<dyn DeliveryChannel>>,
    pub(crate) delivery: DeliveryConfig,
    pub(crate) max_steps: u32,
    pub(crate) run_deadline: Option<Duration>,
    pub(crate) drain_grace: Duration,
    pub(crate) sink: Arc<dyn ProgressSink>,
}

/// A validated, immutable pipeline definition.
///
/// Cloning is cheap and every run owns its own state, so one engine may serve
/// any number of concurrent runs.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Execute one run to completion.
    ///
    /// Only an input that cannot be serialized is reported as `Err`; every
    /// runtime failure is recorded on the returned state.
    pub async fn run<I: Serialize + ?Sized>(&self, input: &I) -> Result<RunResult, ConfigError> {
        let value = serde_json::to_value(input)
            .map_err(|e| ConfigError::Invalid(format!("run input is not serializable: {}", e)))?;
        Ok(self.run_value(value).await)
    }

    pub async fn run_value(&self, input: Value) -> RunResult {
        let state = StateDocument::new(input);
        self.drive(state, TraceReader::new()).await
    }

    /// Start a run on its own task, returning a handle with a live trace view.
    pub fn spawn(&self, input: Value) -> RunHandle {
        let state = StateDocument::new(input);
        let run_id = state.run_id();
        let trace = TraceReader::new();
        let engine = self.clone();
        let reader = trace.clone();
        let task = tokio::spawn(async move { engine.drive(state, reader).await });
        RunHandle::new(run_id, trace, task)
    }

    pub fn entry_stage(&self) -> &str {
        &self.inner.entry
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.inner.registry.names().collect()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn max_steps(&self) -> u32 {
        self.inner.max_steps
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.inner.run_deadline
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.inner.channels.iter().map(|c| c.name()).collect()
    }

    /// Retry policy applied to `stage`, before idempotency is taken into account.
    pub fn policy_for(&self, stage: &str) -> &RetryPolicy {
        self.inner
            .policies
            .get(stage)
            .unwrap_or(&self.inner.default_policy)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("entry", &self.inner.entry)
            .field("stages", &self.inner.registry)
            .field("max_steps", &self.inner.max_steps)
            .field("channels", &self.channel_names())
            .finish()
    }
}
