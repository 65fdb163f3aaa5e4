//! File-based pipeline configuration.
//!
//! Reads `conductor.toml` and binds it to stages and channels registered in
//! code. Settings are layered file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! entry_stage = "locate"
//! max_steps = 32
//! run_deadline_ms = 30000
//!
//! [stages.locate]
//! timeout_ms = 5000
//!
//! [stages.locate.retry]
//! max_attempts = 3
//! backoff = "exponential"
//! base_ms = 100
//! max_ms = 2000
//! jitter_ms = 50
//! retry_on = ["transient", "timeout"]
//!
//! [stages."compose_*"]
//! idempotent = false
//!
//! [[routes]]
//! from = "assess"
//! to = "alert"
//! when = { kind = "output_equals", stage = "assess", pointer = "/severity", equals = "high" }
//!
//! [[routes]]
//! from = "assess"
//! to = "digest"
//! default = true
//!
//! [delivery]
//! timeout_ms = 10000
//! max_concurrency = 4
//! channels = ["console", "webhook"]
//! ```

use crate::delivery::DeliveryChannel;
use crate::engine::{DEFAULT_DRAIN_GRACE_MS, DEFAULT_MAX_STEPS, EngineBuilder};
use crate::errors::ConfigError;
use crate::retry::{Backoff, RetryPolicy};
use crate::router::{Condition, Router, RoutingRule};
use crate::stage::{ConfiguredStage, Stage};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "conductor.toml";

/// Error kinds accepted in `retry_on`.
pub const RETRY_KINDS: &[&str] = &[
    "failed",
    "transient",
    "fatal",
    "timeout",
    "cancelled",
    "panicked",
];

fn default_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}

fn default_drain_grace_ms() -> u64 {
    DEFAULT_DRAIN_GRACE_MS
}

fn default_max_attempts() -> u32 {
    1
}

fn default_base_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    5000
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

/// `[engine]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_stage: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_deadline_ms: Option<u64>,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            entry_stage: None,
            max_steps: default_max_steps(),
            run_deadline_ms: None,
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// Backoff strategy names accepted in a `[stages.*.retry]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    None,
    Fixed,
    Exponential,
}

/// `[stages.<name>.retry]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Fixed delay, or the first exponential delay
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    /// Retry only these error kinds; empty means the default predicate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::None,
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            jitter_ms: 0,
            retry_on: Vec::new(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        let backoff = match self.backoff {
            BackoffKind::None => Backoff::None,
            BackoffKind::Fixed => Backoff::Fixed {
                delay_ms: self.base_ms,
            },
            BackoffKind::Exponential => Backoff::Exponential {
                base_ms: self.base_ms,
                max_ms: self.max_ms,
                jitter_ms: self.jitter_ms,
            },
        };
        let policy = RetryPolicy::new(self.max_attempts).with_backoff(backoff);
        if self.retry_on.is_empty() {
            policy
        } else {
            policy.retry_on_kinds(self.retry_on.clone())
        }
    }
}

/// `[stages.<name>]` table. The key may be a glob pattern (`compose_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StageSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,
}

/// One `[[routes]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSection {
    pub from: String,
    pub to: String,
    /// Guard; absent means unconditional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    /// Use as the fallback route for `from`
    #[serde(default)]
    pub default: bool,
}

/// `[delivery]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySection {
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Channels to enable, by name; empty enables every registered channel
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            timeout_ms: default_delivery_timeout_ms(),
            max_concurrency: None,
            channels: Vec::new(),
        }
    }
}

/// Resolved settings for one stage after applying every matching section.
#[derive(Debug, Clone, Default)]
pub struct StageSettings {
    pub idempotent: Option<bool>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

/// The complete `conductor.toml` structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub stages: IndexMap<String, StageSection>,
    #[serde(default)]
    pub routes: Vec<RouteSection>,
    #[serde(default)]
    pub delivery: DeliverySection,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `conductor.toml` from `dir`, or defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize conductor.toml")
    }

    /// Apply `CONDUCTOR_*` environment variables on top of the file settings.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup` (an environment in tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CONDUCTOR_MAX_STEPS") {
            self.engine.max_steps = value
                .trim()
                .parse()
                .with_context(|| format!("CONDUCTOR_MAX_STEPS is not a number: {}", value))?;
        }
        if let Some(value) = lookup("CONDUCTOR_RUN_DEADLINE_MS") {
            self.engine.run_deadline_ms = Some(value.trim().parse().with_context(|| {
                format!("CONDUCTOR_RUN_DEADLINE_MS is not a number: {}", value)
            })?);
        }
        if let Some(value) = lookup("CONDUCTOR_DELIVERY_TIMEOUT_MS") {
            self.delivery.timeout_ms = value.trim().parse().with_context(|| {
                format!("CONDUCTOR_DELIVERY_TIMEOUT_MS is not a number: {}", value)
            })?;
        }
        Ok(())
    }

    /// Effective settings for `stage`, applying matching sections in file order.
    pub fn stage_settings(&self, stage: &str) -> StageSettings {
        let mut settings = StageSettings::default();
        for (key, section) in &self.stages {
            let matches = if is_pattern(key) {
                pattern_matches(key, stage)
            } else {
                key == stage
            };
            if !matches {
                continue;
            }
            if let Some(idempotent) = section.idempotent {
                settings.idempotent = Some(idempotent);
            }
            if let Some(ms) = section.timeout_ms {
                settings.timeout = Some(Duration::from_millis(ms));
            }
            if let Some(ref retry) = section.retry {
                settings.retry = Some(retry.to_policy());
            }
        }
        settings
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.engine.entry_stage.as_deref() {
            None => problems.push("engine.entry_stage is not set".to_string()),
            Some("") => problems.push("engine.entry_stage is empty".to_string()),
            Some(_) => {}
        }
        if self.engine.max_steps == 0 {
            problems.push("engine.max_steps must be at least 1".to_string());
        }
        if self.engine.run_deadline_ms == Some(0) {
            problems.push("engine.run_deadline_ms must be greater than 0".to_string());
        }

        for (key, section) in &self.stages {
            if section.timeout_ms == Some(0) {
                problems.push(format!("stages.{}.timeout_ms must be greater than 0", key));
            }
            if let Some(ref retry) = section.retry {
                if retry.max_attempts == 0 {
                    problems.push(format!("stages.{}.retry.max_attempts must be at least 1", key));
                }
                if retry.backoff == BackoffKind::Exponential && retry.base_ms > retry.max_ms {
                    problems.push(format!(
                        "stages.{}.retry: base_ms ({}) exceeds max_ms ({})",
                        key, retry.base_ms, retry.max_ms
                    ));
                }
                for kind in &retry.retry_on {
                    if !RETRY_KINDS.contains(&kind.as_str()) {
                        problems.push(format!(
                            "stages.{}.retry.retry_on: unknown error kind '{}' (expected one of: {})",
                            key,
                            kind,
                            RETRY_KINDS.join(", ")
                        ));
                    }
                }
                if retry.max_attempts > 1 && section.idempotent == Some(false) {
                    problems.push(format!(
                        "stages.{} is not idempotent; its retry policy will be limited to one attempt",
                        key
                    ));
                }
            }
        }

        let mut defaults = HashSet::new();
        for (i, route) in self.routes.iter().enumerate() {
            if route.from.is_empty() || route.to.is_empty() {
                problems.push(format!("routes[{}]: 'from' and 'to' must be non-empty", i));
            }
            if route.default {
                if route.when.is_some() {
                    problems.push(format!(
                        "routes[{}]: a default route cannot have a 'when' condition",
                        i
                    ));
                }
                if !defaults.insert(route.from.as_str()) {
                    problems.push(format!(
                        "routes[{}]: stage '{}' already has a default route",
                        i, route.from
                    ));
                }
            }
        }

        if self.delivery.timeout_ms == 0 {
            problems.push("delivery.timeout_ms must be greater than 0".to_string());
        }
        if self.delivery.max_concurrency == Some(0) {
            problems.push("delivery.max_concurrency must be at least 1".to_string());
        }

        problems
    }

    /// Every stage name the file refers to explicitly (routes and non-pattern sections).
    pub fn referenced_stages(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        let candidates = self
            .engine
            .entry_stage
            .as_deref()
            .into_iter()
            .chain(self.stages.keys().map(String::as_str).filter(|k| !is_pattern(k)))
            .chain(
                self.routes
                    .iter()
                    .flat_map(|r| [r.from.as_str(), r.to.as_str()]),
            );
        for name in candidates {
            if seen.insert(name) {
                names.push(name);
            }
        }
        names
    }

    /// Bind this configuration to code-registered stages and channels.
    ///
    /// Every stage and channel named by the file must be provided. An empty
    /// `delivery.channels` list enables every provided channel.
    pub fn apply_to(
        &self,
        mut builder: EngineBuilder,
        stages: Vec<Arc<dyn Stage>>,
        channels: Vec<Arc<dyn DeliveryChannel>>,
    ) -> Result<EngineBuilder, ConfigError> {
        let entry = self
            .engine
            .entry_stage
            .clone()
            .ok_or(ConfigError::MissingEntryStage)?;

        let known: HashSet<String> = stages.iter().map(|s| s.name().to_string()).collect();
        for key in self.stages.keys().filter(|k| !is_pattern(k)) {
            if !known.contains(key) {
                return Err(ConfigError::UnknownStage(key.clone()));
            }
        }

        for stage in stages {
            let name = stage.name().to_string();
            let settings = self.stage_settings(&name);
            let configured = settings.idempotent.is_some() || settings.timeout.is_some();
            let stage: Arc<dyn Stage> = if configured {
                Arc::new(
                    ConfiguredStage::new(stage)
                        .with_idempotent(settings.idempotent)
                        .with_timeout(settings.timeout),
                )
            } else {
                stage
            };
            builder = builder.stage_arc(stage);
            if let Some(policy) = settings.retry {
                builder = builder.retry_policy(name, policy);
            }
        }

        for route in &self.routes {
            builder = if route.default {
                builder.default_route(&route.from, &route.to)
            } else {
                match &route.when {
                    Some(condition) => builder.route_on(&route.from, &route.to, condition.clone()),
                    None => builder.route_always(&route.from, &route.to),
                }
            };
        }

        if self.delivery.channels.is_empty() {
            for channel in channels {
                builder = builder.channel_arc(channel);
            }
        } else {
            for wanted in &self.delivery.channels {
                let channel = channels
                    .iter()
                    .find(|c| c.name() == wanted)
                    .ok_or_else(|| ConfigError::UnknownChannel(wanted.clone()))?;
                builder = builder.channel_arc(Arc::clone(channel));
            }
        }

        Ok(builder
            .entry(entry)
            .max_steps(self.engine.max_steps)
            .run_deadline(self.engine.run_deadline_ms.map(Duration::from_millis))
            .drain_grace(Duration::from_millis(self.engine.drain_grace_ms))
            .delivery_timeout(Duration::from_millis(self.delivery.timeout_ms))
            .delivery_max_concurrency(self.delivery.max_concurrency))
    }

    /// The routing graph described by `[[routes]]`, without checking stage names.
    pub fn to_router(&self) -> Router {
        let mut router = Router::new();
        for route in &self.routes {
            if route.default {
                router.set_default(&route.from, &route.to);
            } else {
                let condition = route.when.clone().unwrap_or(Condition::Always);
                router.add_rule(RoutingRule::on(&route.from, &route.to, condition));
            }
        }
        router
    }
}

fn is_pattern(key: &str) -> bool {
    key.contains('*') || key.contains('?')
}

/// Check if a pattern matches a stage name.
/// Supports simple glob patterns:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
///
/// Matching is case-sensitive, like exact stage keys.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::FnChannel;
    use crate::errors::StageError;
    use crate::stage::FnStage;
    use serde_json::{Value, json};
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[engine]
entry_stage = "assess"
max_steps = 8
run_deadline_ms = 2000

[stages.assess]
timeout_ms = 500

[stages.assess.retry]
max_attempts = 3
backoff = "exponential"
base_ms = 10
max_ms = 40
retry_on = ["transient"]

[stages."compose_*"]
idempotent = false

[[routes]]
from = "assess"
to = "compose_alert"
when = { kind = "output_equals", stage = "assess", pointer = "/severity", equals = "high" }

[[routes]]
from = "assess"
to = "compose_digest"
default = true

[delivery]
timeout_ms = 250
channels = ["console"]
"#;

    fn stage(name: &str) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name.to_string(), |_s, _c| async { Ok(Value::Null) }))
    }

    fn channel(name: &str) -> Arc<dyn DeliveryChannel> {
        Arc::new(FnChannel::new(name.to_string(), |_a| async { Ok(String::new()) }))
    }

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.engine.entry_stage.as_deref(), Some("assess"));
        assert_eq!(config.engine.max_steps, 8);
        assert_eq!(config.engine.drain_grace_ms, 50);
        assert_eq!(config.routes.len(), 2);
        assert!(config.routes[1].default);
        assert_eq!(config.delivery.timeout_ms, 250);
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.engine.max_steps, 32);
        assert_eq!(config.delivery.timeout_ms, 10_000);
        assert!(config.stages.is_empty());
        assert_eq!(config.validate(), vec!["engine.entry_stage is not set".to_string()]);
    }

    #[test]
    fn test_parse_rejects_unknown_backoff() {
        let err = EngineConfig::parse("[stages.a.retry]\nbackoff = \"sometimes\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("conductor.toml"));
    }

    #[test]
    fn test_stage_settings_merge_patterns() {
        let config = EngineConfig::parse(SAMPLE).unwrap();

        let assess = config.stage_settings("assess");
        assert_eq!(assess.timeout, Some(Duration::from_millis(500)));
        assert_eq!(assess.idempotent, None);
        let policy = assess.retry.unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.is_retryable(&StageError::transient("x")));
        assert!(!policy.is_retryable(&StageError::failed("x")));
        assert_eq!(policy.backoff.base_delay(3), Duration::from_millis(40));

        let alert = config.stage_settings("compose_alert");
        assert_eq!(alert.idempotent, Some(false));
        assert!(alert.retry.is_none());
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("compose_*", "compose_alert"));
        assert!(pattern_matches("*_alert", "compose_alert"));
        assert!(pattern_matches("comp?se", "compose"));
        assert!(!pattern_matches("comp?se", "COMPOSE"));
        assert!(!pattern_matches("Compose_*", "compose_alert"));
        assert!(!pattern_matches("compose_?", "compose_alert"));
        assert!(pattern_matches("*", ""));
    }

    #[test]
    fn test_pattern_sections_are_case_sensitive() {
        let config = EngineConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.stage_settings("compose_alert").idempotent, Some(false));
        assert_eq!(config.stage_settings("Compose_Alert").idempotent, None);
        assert_eq!(config.stage_settings("ASSESS").timeout, None);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::parse(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("CONDUCTOR_MAX_STEPS", "4"),
            ("CONDUCTOR_RUN_DEADLINE_MS", " 750 "),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.engine.max_steps, 4);
        assert_eq!(config.engine.run_deadline_ms, Some(750));
        assert_eq!(config.delivery.timeout_ms, 250);

        let bad = config.apply_overrides_from(|k| {
            (k == "CONDUCTOR_DELIVERY_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let config = EngineConfig::parse(
            r#"
[engine]
entry_stage = "a"
max_steps = 0

[stages.a.retry]
max_attempts = 0
backoff = "exponential"
base_ms = 500
max_ms = 100
retry_on = ["flaky"]

[[routes]]
from = "a"
to = "b"
default = true

[[routes]]
from = "a"
to = "c"
default = true

[delivery]
max_concurrency = 0
"#,
        )
        .unwrap();

        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("max_steps")));
        assert!(problems.iter().any(|p| p.contains("max_attempts")));
        assert!(problems.iter().any(|p| p.contains("exceeds max_ms")));
        assert!(problems.iter().any(|p| p.contains("'flaky'")));
        assert!(problems.iter().any(|p| p.contains("already has a default route")));
        assert!(problems.iter().any(|p| p.contains("max_concurrency")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = EngineConfig::parse(SAMPLE).unwrap();

        config.save(&path).unwrap();
        let loaded = EngineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(EngineConfig::load_or_default(empty.path()).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_referenced_stages() {
        let config = EngineConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config.referenced_stages(),
            vec!["assess", "compose_alert", "compose_digest"]
        );
    }

    #[test]
    fn test_to_router_reflects_routes() {
        let config = EngineConfig::parse(SAMPLE).unwrap();
        let router = config.to_router();
        assert_eq!(router.rules_for("assess").len(), 1);
        assert_eq!(router.default_for("assess"), Some("compose_digest"));
        assert!(router.shadowed_rules().is_empty());
    }

    #[test]
    fn test_apply_to_builds_engine() {
        let config = EngineConfig::parse(SAMPLE).unwrap();
        let builder = config
            .apply_to(
                EngineBuilder::new(),
                vec![stage("assess"), stage("compose_alert"), stage("compose_digest")],
                vec![channel("console"), channel("sms")],
            )
            .unwrap();
        let engine = builder.build().unwrap();

        assert_eq!(engine.entry_stage(), "assess");
        assert_eq!(engine.max_steps(), 8);
        assert_eq!(engine.run_deadline(), Some(Duration::from_millis(2000)));
        assert_eq!(engine.channel_names(), vec!["console"]);
        assert_eq!(engine.policy_for("assess").max_attempts, 3);
        assert_eq!(engine.router().default_for("assess"), Some("compose_digest"));
    }

    #[test]
    fn test_apply_to_rejects_unknown_names() {
        let config = EngineConfig::parse(SAMPLE).unwrap();
        let err = config
            .apply_to(
                EngineBuilder::new(),
                vec![stage("compose_alert"), stage("compose_digest")],
                vec![channel("console")],
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStage(s) if s == "assess"));

        let err = config
            .apply_to(
                EngineBuilder::new(),
                vec![stage("assess"), stage("compose_alert"), stage("compose_digest")],
                vec![channel("sms")],
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownChannel(c) if c == "console"));
    }
}
