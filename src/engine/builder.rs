//! Engine wiring and build-time validation.

use crate::delivery::{DeliveryChannel, DeliveryConfig};
use crate::engine::{Engine, EngineInner, StateDocument};
use crate::errors::{ConfigError, RouterPredicateError};
use crate::progress::{NoopSink, ProgressSink};
use crate::retry::RetryPolicy;
use crate::router::{Condition, Router, RoutingRule};
use crate::stage::{Stage, StageRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Default ceiling on stage executions per run.
pub const DEFAULT_MAX_STEPS: u32 = 32;

/// Default time an abandoned attempt gets to honour cancellation.
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 50;

/// Collects everything an [`Engine`] needs; nothing is validated until [`build`](Self::build).
pub struct EngineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    entry: Option<String>,
    rules: Vec<RoutingRule>,
    defaults: Vec<(String, String)>,
    policies: Vec<(String, RetryPolicy)>,
    default_policy: RetryPolicy,
    channels: Vec<Arc<dyn DeliveryChannel>>,
    delivery: DeliveryConfig,
    max_steps: u32,
    run_deadline: Option<Duration>,
    drain_grace: Duration,
    sink: Arc<dyn ProgressSink>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            entry: None,
            rules: Vec::new(),
            defaults: Vec::new(),
            policies: Vec::new(),
            default_policy: RetryPolicy::default(),
            channels: Vec::new(),
            delivery: DeliveryConfig::default(),
            max_steps: DEFAULT_MAX_STEPS,
            run_deadline: None,
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
            sink: Arc::new(NoopSink),
        }
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("entry", &self.entry)
            .field("rules", &self.rules)
            .field("defaults", &self.defaults)
            .field("max_steps", &self.max_steps)
            .field("run_deadline", &self.run_deadline)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage.
    pub fn stage<S: Stage + 'static>(self, stage: S) -> Self {
        self.stage_arc(Arc::new(stage))
    }

    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage the run starts at.
    pub fn entry(mut self, stage: impl Into<String>) -> Self {
        self.entry = Some(stage.into());
        self
    }

    pub fn route(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn route_always(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.route(RoutingRule::always(from, to))
    }

    pub fn route_on(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Condition,
    ) -> Self {
        self.route(RoutingRule::on(from, to, condition))
    }

    pub fn route_when<F>(self, from: impl Into<String>, to: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StateDocument) -> bool + Send + Sync + 'static,
    {
        self.route(RoutingRule::when(from, to, f))
    }

    pub fn try_route_when<F>(self, from: impl Into<String>, to: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StateDocument) -> Result<bool, RouterPredicateError> + Send + Sync + 'static,
    {
        self.route(RoutingRule::try_when(from, to, f))
    }

    /// Target used when no rule for `from` matches.
    pub fn default_route(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.defaults.push((from.into(), to.into()));
        self
    }

    pub fn retry_policy(mut self, stage: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.push((stage.into(), policy));
        self
    }

    /// Policy for stages without one of their own.
    pub fn default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn channel<C: DeliveryChannel + 'static>(self, channel: C) -> Self {
        self.channel_arc(Arc::new(channel))
    }

    pub fn channel_arc(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery.timeout = timeout;
        self
    }

    pub fn delivery_max_concurrency(mut self, max: Option<usize>) -> Self {
        self.delivery.max_concurrency = max;
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Wall-clock budget for a whole run.
    pub fn run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the wiring and produce an engine.
    pub fn build(self) -> Result<Engine, ConfigError> {
        let mut registry = StageRegistry::new();
        for stage in self.stages {
            registry.register(stage)?;
        }

        let entry = self.entry.ok_or(ConfigError::MissingEntryStage)?;
        if !registry.contains(&entry) {
            return Err(ConfigError::UnknownEntryStage(entry));
        }

        if self.max_steps == 0 {
            return Err(ConfigError::ZeroMaxSteps);
        }

        let mut router = Router::new();
        let edges = self
            .rules
            .iter()
            .map(|r| (r.from.as_str(), r.to.as_str()))
            .chain(self.defaults.iter().map(|(f, t)| (f.as_str(), t.as_str())));
        for (from, to) in edges {
            if !registry.contains(from) {
                return Err(ConfigError::UnknownRouteSource(from.to_string()));
            }
            if !registry.contains(to) {
                return Err(ConfigError::UnknownRouteTarget {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        for rule in self.rules {
            router.add_rule(rule);
        }
        for (from, to) in self.defaults {
            if let Some(previous) = router.default_for(&from) {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' has two default routes ('{}' and '{}')",
                    from, previous, to
                )));
            }
            router.set_default(from, to);
        }
        for (from, to) in router.shadowed_rules() {
            tracing::warn!(
                from = %from,
                to = %to,
                "routing rule can never match; an earlier unconditional rule always wins"
            );
        }

        if self.default_policy.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts {
                stage: "*".to_string(),
            });
        }
        let mut policies = HashMap::new();
        for (stage, policy) in self.policies {
            if !registry.contains(&stage) {
                return Err(ConfigError::UnknownRetryStage(stage));
            }
            if policy.max_attempts == 0 {
                return Err(ConfigError::ZeroAttempts { stage });
            }
            policies.insert(stage, policy);
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.name().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "delivery channel '{}' is registered twice",
                    channel.name()
                )));
            }
        }

        tracing::debug!(
            entry = %entry,
            stages = registry.len(),
            channels = self.channels.len(),
            max_steps = self.max_steps,
            "engine built"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                registry,
                router,
                entry,
                policies,
                default_policy: self.default_policy,
                channels: self.channels,
                delivery: self.delivery,
                max_steps: self.max_steps,
                run_deadline: self.run_deadline,
                drain_grace: self.drain_grace,
                sink: self.sink,
            }),
        })
    }
}
