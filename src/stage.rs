//! Stages: the named units of work a run is made of.
//!
//! A stage reads the whole `StateDocument` and returns only its own output.
//! The engine records that output under the stage's name, so a stage has no
//! way to rewrite what an earlier stage produced.

use crate::engine::{RunId, StateDocument};
use crate::errors::{ConfigError, StageError};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-attempt information handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub stage: String,
    pub attempt: u32,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn new(run_id: RunId, stage: &str, attempt: u32) -> Self {
        Self {
            run_id,
            stage: stage.to_string(),
            attempt,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the engine has asked this attempt to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the engine cancels the attempt (run deadline expired).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A named unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique name; also the namespace the output is recorded under.
    fn name(&self) -> &str;

    /// Non-idempotent stages are never retried, whatever their policy says.
    fn idempotent(&self) -> bool {
        true
    }

    /// Upper bound for a single attempt.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, state: &StateDocument, ctx: &StageContext) -> Result<Value, StageError>;
}

/// Adapts an async closure into a [`Stage`].
///
/// ```no_run
/// use conductor::stage::FnStage;
/// use serde_json::json;
///
/// let stage = FnStage::new("locate", |state, _ctx| async move {
///     let location = state.input()["location"].clone();
///     Ok(json!({ "resolved": location }))
/// })
/// .with_timeout(std::time::Duration::from_secs(5));
/// ```
pub struct FnStage<F> {
    name: String,
    idempotent: bool,
    timeout: Option<Duration>,
    f: F,
}

impl<F> FnStage<F> {
    pub fn new<Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StateDocument, StageContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, StageError>> + Send,
    {
        Self {
            name: name.into(),
            idempotent: true,
            timeout: None,
            f,
        }
    }

    /// Mark the stage as having external side effects that must not be duplicated.
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StateDocument, StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StageError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        state: &StateDocument,
        ctx: &StageContext,
    ) -> Result<Value, StageError> {
        (self.f)(state.clone(), ctx.clone()).await
    }
}

/// Wraps a stage and overrides its idempotency flag and timeout.
///
/// Used when a configuration file tightens what the stage declares in code.
pub struct ConfiguredStage {
    inner: Arc<dyn Stage>,
    idempotent: Option<bool>,
    timeout: Option<Duration>,
}

impl ConfiguredStage {
    pub fn new(inner: Arc<dyn Stage>) -> Self {
        Self {
            inner,
            idempotent: None,
            timeout: None,
        }
    }

    pub fn with_idempotent(mut self, idempotent: Option<bool>) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Stage for ConfiguredStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn idempotent(&self) -> bool {
        self.idempotent.unwrap_or_else(|| self.inner.idempotent())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout.or_else(|| self.inner.timeout())
    }

    async fn execute(
        &self,
        state: &StateDocument,
        ctx: &StageContext,
    ) -> Result<Value, StageError> {
        self.inner.execute(state, ctx).await
    }
}

/// Stages by name, in registration order.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: IndexMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `stage` under its name.
    ///
    /// `#` is reserved for revisit keys in the state document (`poll#2`).
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<(), ConfigError> {
        let name = stage.name().to_string();
        if name.contains('#') {
            return Err(ConfigError::InvalidStageName(name));
        }
        if self.stages.contains_key(&name) {
            return Err(ConfigError::DuplicateStage(name));
        }
        self.stages.insert(name, stage);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}
