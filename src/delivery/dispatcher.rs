//! Bulkhead fan-out across delivery channels.

use crate::delivery::DeliveryChannel;
use crate::engine::state::duration_ms;
use crate::errors::panic_message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Default per-channel send timeout.
const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 10;

/// Configuration for a delivery fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Upper bound for a single channel send
    pub timeout: Duration,
    /// Maximum channels sending at once; `None` sends to all at once
    pub max_concurrency: Option<usize>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_DELIVERY_TIMEOUT_SECS),
            max_concurrency: None,
        }
    }
}

impl DeliveryConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: Option<usize>) -> Self {
        self.max_concurrency = max;
        self
    }
}

/// Outcome of one channel send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub channel: String,
    pub success: bool,
    /// Receipt on success, error text (or `"timeout"`) on failure
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl DeliveryResult {
    fn new(channel: &str, success: bool, detail: impl Into<String>, duration: Duration) -> Self {
        Self {
            channel: channel.to_string(),
            success,
            detail: detail.into(),
            timestamp: Utc::now(),
            duration,
        }
    }
}

/// Aggregate of every channel result, in channel configuration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub results: Vec<DeliveryResult>,
    /// `successes / total`; 1.0 when there are no channels
    pub overall_success_ratio: f64,
    pub any_failed: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl DeliveryReport {
    pub fn from_results(results: Vec<DeliveryResult>, duration: Duration) -> Self {
        let successes = results.iter().filter(|r| r.success).count();
        let overall_success_ratio = if results.is_empty() {
            1.0
        } else {
            successes as f64 / results.len() as f64
        };
        Self {
            any_failed: successes < results.len(),
            overall_success_ratio,
            results,
            duration,
        }
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_channels(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.channel.as_str())
            .collect()
    }

    pub fn result_for(&self, channel: &str) -> Option<&DeliveryResult> {
        self.results.iter().find(|r| r.channel == channel)
    }
}

/// Sends one artifact to many channels concurrently.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFanOut {
    config: DeliveryConfig,
}

impl DeliveryFanOut {
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Deliver `artifact` to every channel. Never fails and never retries.
    pub async fn dispatch(
        &self,
        artifact: &Value,
        channels: &[Arc<dyn DeliveryChannel>],
    ) -> DeliveryReport {
        use futures::future::join_all;

        let start = Instant::now();
        if channels.is_empty() {
            return DeliveryReport::from_results(Vec::new(), start.elapsed());
        }

        let limiter = self
            .config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let artifact = Arc::new(artifact.clone());

        let handles: Vec<_> = channels
            .iter()
            .map(|channel| {
                let channel = Arc::clone(channel);
                let artifact = Arc::clone(&artifact);
                let limiter = limiter.clone();
                let timeout = self.config.timeout;
                tokio::spawn(async move {
                    // Held until the send finishes; the timeout starts once a slot is free.
                    let _permit = match limiter {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    let started = Instant::now();
                    match tokio::time::timeout(timeout, channel.send(&artifact)).await {
                        Ok(Ok(receipt)) => {
                            DeliveryResult::new(channel.name(), true, receipt, started.elapsed())
                        }
                        Ok(Err(e)) => DeliveryResult::new(
                            channel.name(),
                            false,
                            e.to_string(),
                            started.elapsed(),
                        ),
                        Err(_) => {
                            DeliveryResult::new(channel.name(), false, "timeout", started.elapsed())
                        }
                    }
                })
            })
            .collect();

        let joined = join_all(handles).await;

        let results: Vec<DeliveryResult> = joined
            .into_iter()
            .zip(channels)
            .map(|(outcome, channel)| match outcome {
                Ok(result) => result,
                Err(e) => {
                    let detail = if e.is_panic() {
                        format!("panicked: {}", panic_message(e.into_panic().as_ref()))
                    } else {
                        "cancelled".to_string()
                    };
                    DeliveryResult::new(channel.name(), false, detail, Duration::ZERO)
                }
            })
            .collect();

        for result in results.iter().filter(|r| !r.success) {
            tracing::warn!(channel = %result.channel, detail = %result.detail, "delivery failed");
        }

        let report = DeliveryReport::from_results(results, start.elapsed());
        tracing::info!(
            channels = report.results.len(),
            succeeded = report.success_count(),
            ratio = report.overall_success_ratio,
            "delivery complete"
        );
        report
    }
}
