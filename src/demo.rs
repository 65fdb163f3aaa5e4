//! A self-contained weather alert pipeline used by `conductor demo`.
//!
//! `locate → forecast → compose_alert | compose_digest`, then fan-out to
//! simulated channels. The forecast stage fails transiently a configurable
//! number of times so retries are visible.

use crate::config::EngineConfig;
use crate::delivery::DeliveryChannel;
use crate::engine::StateDocument;
use crate::errors::{DeliveryChannelError, StageError};
use crate::stage::{FnStage, Stage, StageContext};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Configuration used when no `conductor.toml` is given.
pub const DEFAULT_CONFIG_TOML: &str = r#"[engine]
entry_stage = "locate"
max_steps = 16
run_deadline_ms = 30000

[stages.locate]
timeout_ms = 2000

[stages.forecast]
timeout_ms = 2000

[stages.forecast.retry]
max_attempts = 4
backoff = "exponential"
base_ms = 50
max_ms = 400
jitter_ms = 25
retry_on = ["transient", "timeout"]

[stages."compose_*"]
idempotent = true

[[routes]]
from = "locate"
to = "forecast"

[[routes]]
from = "forecast"
to = "compose_alert"
when = { kind = "output_equals", stage = "forecast", pointer = "/severity", equals = "high" }

[[routes]]
from = "forecast"
to = "compose_digest"
default = true

[delivery]
timeout_ms = 2000
max_concurrency = 2
channels = ["console", "email", "sms"]
"#;

pub const CHANNEL_NAMES: &[&str] = &["console", "email", "sms"];

/// Knobs for the simulated pipeline.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Transient failures the forecast stage reports before succeeding
    pub forecast_failures: u32,
    /// Channel that simulates an outage
    pub fail_channel: Option<String>,
    /// Simulated work per stage and per channel send
    pub latency: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            forecast_failures: 1,
            fail_channel: None,
            latency: Duration::from_millis(120),
        }
    }
}

pub fn default_config() -> anyhow::Result<EngineConfig> {
    EngineConfig::parse(DEFAULT_CONFIG_TOML)
}

pub fn default_input() -> Value {
    json!({ "location": "Tromsø", "days": 3 })
}

struct Place {
    name: &'static str,
    lat: f64,
    lon: f64,
    base_temp_c: i64,
}

const PLACES: &[Place] = &[
    Place {
        name: "Oslo",
        lat: 59.91,
        lon: 10.75,
        base_temp_c: -4,
    },
    Place {
        name: "Tromsø",
        lat: 69.65,
        lon: 18.96,
        base_temp_c: -12,
    },
    Place {
        name: "Lisbon",
        lat: 38.72,
        lon: -9.14,
        base_temp_c: 12,
    },
];

const DAY_OFFSETS: &[i64] = &[0, -3, 2, -1, 4, -2, 1];

fn locate(state: &StateDocument) -> Result<Value, StageError> {
    let wanted = state
        .input()
        .get("location")
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::fatal("input has no 'location'"))?;
    let place = PLACES
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| StageError::fatal(format!("unknown location '{}'", wanted)))?;
    Ok(json!({
        "name": place.name,
        "lat": place.lat,
        "lon": place.lon,
        "base_temp_c": place.base_temp_c,
    }))
}

fn forecast(state: &StateDocument) -> Result<Value, StageError> {
    let base = state
        .output_at("locate", "/base_temp_c")
        .and_then(Value::as_i64)
        .ok_or_else(|| StageError::failed("locate output has no base temperature"))?;
    let days = state
        .input()
        .get("days")
        .and_then(Value::as_u64)
        .unwrap_or(3)
        .clamp(1, DAY_OFFSETS.len() as u64) as usize;
    let temps: Vec<i64> = DAY_OFFSETS[..days].iter().map(|o| base + o).collect();
    let low = temps.iter().copied().min().unwrap_or(base);
    let severity = if low <= -10 { "high" } else { "normal" };
    Ok(json!({ "temps_c": temps, "low_c": low, "severity": severity }))
}

fn compose(state: &StateDocument, kind: &str) -> Value {
    let place = state
        .output_at("locate", "/name")
        .and_then(Value::as_str)
        .unwrap_or("?");
    match kind {
        "alert" => {
            let low = state.output_at("forecast", "/low_c").cloned().unwrap_or(Value::Null);
            json!({
                "kind": "alert",
                "title": format!("Severe cold warning for {}", place),
                "body": format!("Temperatures down to {}°C expected.", low),
            })
        }
        _ => {
            let temps = state.output_at("forecast", "/temps_c").cloned().unwrap_or(Value::Null);
            json!({
                "kind": "digest",
                "title": format!("Weather for {}", place),
                "body": format!("Daily temperatures: {}", temps),
            })
        }
    }
}

/// Stages of the demo pipeline, in execution order.
pub fn demo_stages(options: &DemoOptions) -> Vec<Arc<dyn Stage>> {
    let latency = options.latency;
    let failures_left = Arc::new(AtomicU32::new(options.forecast_failures));

    let locate_stage = FnStage::new("locate", move |state: StateDocument, _ctx: StageContext| {
        async move {
            tokio::time::sleep(latency).await;
            locate(&state)
        }
    });

    let forecast_stage = FnStage::new("forecast", move |state: StateDocument, ctx: StageContext| {
        let failures_left = failures_left.clone();
        async move {
            tokio::time::sleep(latency).await;
            let remaining = failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(StageError::transient(format!(
                    "forecast service returned 503 (attempt {})",
                    ctx.attempt
                )));
            }
            forecast(&state)
        }
    });

    let alert_stage = FnStage::new(
        "compose_alert",
        move |state: StateDocument, _ctx: StageContext| async move {
            tokio::time::sleep(latency).await;
            Ok(compose(&state, "alert"))
        },
    );

    let digest_stage = FnStage::new(
        "compose_digest",
        move |state: StateDocument, _ctx: StageContext| async move {
            tokio::time::sleep(latency).await;
            Ok(compose(&state, "digest"))
        },
    );

    vec![
        Arc::new(locate_stage) as Arc<dyn Stage>,
        Arc::new(forecast_stage) as Arc<dyn Stage>,
        Arc::new(alert_stage) as Arc<dyn Stage>,
        Arc::new(digest_stage) as Arc<dyn Stage>,
    ]
}

/// Simulated delivery channels; `options.fail_channel` reports an outage.
pub fn demo_channels(options: &DemoOptions) -> Vec<Arc<dyn DeliveryChannel>> {
    CHANNEL_NAMES
        .iter()
        .map(|name| {
            let fail = options.fail_channel.as_deref() == Some(*name);
            Arc::new(SimulatedChannel::new(name, options.latency, fail)) as Arc<dyn DeliveryChannel>
        })
        .collect()
}

/// A channel that waits `latency` and then succeeds or reports an outage.
#[derive(Debug, Clone)]
pub struct SimulatedChannel {
    name: String,
    latency: Duration,
    fail: bool,
}

impl SimulatedChannel {
    pub fn new(name: &str, latency: Duration, fail: bool) -> Self {
        Self {
            name: name.to_string(),
            latency,
            fail,
        }
    }
}

#[async_trait]
impl DeliveryChannel for SimulatedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, artifact: &Value) -> Result<String, DeliveryChannelError> {
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(DeliveryChannelError::Unavailable(format!(
                "{} gateway is down",
                self.name
            )));
        }
        let title = artifact.get("title").and_then(Value::as_str).unwrap_or("(untitled)");
        Ok(format!("{} delivered '{}'", self.name, title))
    }
}
