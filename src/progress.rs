//! Push-based progress stream.
//!
//! The engine emits exactly one `Started` and one ending event (`Succeeded`,
//! `Failed` or `Retrying`) per stage attempt. Sinks receive events by shared
//! reference and must not block: they are called inline on the run's task.

use crate::engine::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// What happened to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Started,
    Succeeded,
    /// The attempt failed and the stage will not be retried
    Failed,
    /// The attempt failed and another attempt is scheduled
    Retrying,
}

impl ProgressKind {
    /// Whether this kind closes an attempt.
    pub fn is_end(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub stage: String,
    pub attempt: u32,
    pub event: ProgressKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(run_id: RunId, stage: &str, attempt: u32, event: ProgressKind) -> Self {
        Self {
            run_id,
            stage: stage.to_string(),
            attempt,
            event,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Observer of progress events.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<T: ProgressSink + ?Sized> ProgressSink for Arc<T> {
    fn on_event(&self, event: &ProgressEvent) {
        (**self).on_event(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Forwards events to `tracing` as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_event(&self, event: &ProgressEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.event {
            ProgressKind::Started | ProgressKind::Succeeded => tracing::info!(
                run_id = %event.run_id,
                stage = %event.stage,
                attempt = event.attempt,
                event = ?event.event,
                detail,
                "stage progress"
            ),
            ProgressKind::Retrying | ProgressKind::Failed => tracing::warn!(
                run_id = %event.run_id,
                stage = %event.stage,
                attempt = event.attempt,
                event = ?event.event,
                detail,
                "stage progress"
            ),
        }
    }
}

/// Publishes events on a tokio broadcast channel.
///
/// Any number of read-only subscribers (a dashboard, a log shipper) may attach
/// with [`BroadcastSink::subscribe`]. Publishing never blocks; slow subscribers
/// observe `RecvError::Lagged` instead of stalling the run.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ProgressSink for BroadcastSink {
    fn on_event(&self, event: &ProgressEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events received so far, in arrival order.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// `(attempt, kind)` pairs for one stage.
    pub fn kinds_for(&self, stage: &str) -> Vec<(u32, ProgressKind)> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .map(|e| (e.attempt, e.event))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressSink for CollectingSink {
    fn on_event(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Delivers each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ProgressSink for FanoutSink {
    fn on_event(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(stage: &str, attempt: u32, kind: ProgressKind) -> ProgressEvent {
        ProgressEvent::new(Uuid::nil(), stage, attempt, kind)
    }

    #[test]
    fn test_progress_event_serialization() {
        let e = event("forecast", 2, ProgressKind::Retrying).with_detail("upstream 503");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"event\":\"retrying\""));
        assert!(json.contains("\"attempt\":2"));
        assert!(json.contains("upstream 503"));

        let plain = serde_json::to_string(&event("a", 1, ProgressKind::Started)).unwrap();
        assert!(!plain.contains("detail"));
    }

    #[test]
    fn test_progress_kind_is_end() {
        assert!(!ProgressKind::Started.is_end());
        assert!(ProgressKind::Succeeded.is_end());
        assert!(ProgressKind::Failed.is_end());
        assert!(ProgressKind::Retrying.is_end());
    }

    #[test]
    fn test_collecting_sink_filters_by_stage() {
        let sink = CollectingSink::new();
        sink.on_event(&event("a", 1, ProgressKind::Started));
        sink.on_event(&event("b", 1, ProgressKind::Started));
        sink.on_event(&event("a", 1, ProgressKind::Succeeded));

        assert_eq!(sink.len(), 3);
        assert_eq!(
            sink.kinds_for("a"),
            vec![(1, ProgressKind::Started), (1, ProgressKind::Succeeded)]
        );
    }

    #[test]
    fn test_fanout_sink_reaches_every_sink() {
        let first = Arc::new(CollectingSink::new());
        let second = Arc::new(CollectingSink::new());
        let fanout = FanoutSink::new()
            .with(first.clone())
            .with(second.clone());

        fanout.on_event(&event("a", 1, ProgressKind::Started));
        assert_eq!(fanout.len(), 2);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 2);

        sink.on_event(&event("a", 1, ProgressKind::Started));

        assert_eq!(rx1.recv().await.unwrap().stage, "a");
        assert_eq!(rx2.recv().await.unwrap().event, ProgressKind::Started);
    }

    #[test]
    fn test_broadcast_sink_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(1);
        sink.on_event(&event("a", 1, ProgressKind::Started));
        assert_eq!(sink.subscriber_count(), 0);
    }
}
