//! Telemetry sink interface.
//!
//! The engine emits counters, gauges, and histograms tagged with
//! `"table:<name>"`. The actual transport (statsd, OTLP, ...) lives outside
//! this crate; callers hand the table an implementation of [`TelemetrySink`].

use std::sync::Mutex;

/// Receiver for the engine's metrics.
pub trait TelemetrySink: Send + Sync {
    fn count(&self, metric: &str, value: i64, tags: &[String]);
    fn gauge(&self, metric: &str, value: f64, tags: &[String]);
    fn histogram(&self, metric: &str, value: f64, tags: &[String]);
}

/// Drops every metric.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn count(&self, _metric: &str, _value: i64, _tags: &[String]) {}
    fn gauge(&self, _metric: &str, _value: f64, _tags: &[String]) {}
    fn histogram(&self, _metric: &str, _value: f64, _tags: &[String]) {}
}

/// Emits metrics as structured `tracing` debug events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn count(&self, metric: &str, value: i64, tags: &[String]) {
        tracing::debug!(metric, value, ?tags, "counter");
    }

    fn gauge(&self, metric: &str, value: f64, tags: &[String]) {
        tracing::debug!(metric, value, ?tags, "gauge");
    }

    fn histogram(&self, metric: &str, value: f64, tags: &[String]) {
        tracing::debug!(metric, value, ?tags, "histogram");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Count,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub kind: MetricKind,
    pub metric: String,
    pub value: f64,
    pub tags: Vec<String>,
}

/// Captures every emission in memory. Exposed for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().expect("recording sink poisoned").clone()
    }

    /// Sum of all counter emissions for a metric name.
    pub fn counter_total(&self, metric: &str) -> i64 {
        self.events()
            .iter()
            .filter(|e| e.kind == MetricKind::Count && e.metric == metric)
            .map(|e| e.value as i64)
            .sum()
    }

    fn push(&self, kind: MetricKind, metric: &str, value: f64, tags: &[String]) {
        self.events
            .lock()
            .expect("recording sink poisoned")
            .push(MetricEvent {
                kind,
                metric: metric.to_string(),
                value,
                tags: tags.to_vec(),
            });
    }
}

impl TelemetrySink for RecordingSink {
    fn count(&self, metric: &str, value: i64, tags: &[String]) {
        self.push(MetricKind::Count, metric, value as f64, tags);
    }

    fn gauge(&self, metric: &str, value: f64, tags: &[String]) {
        self.push(MetricKind::Gauge, metric, value, tags);
    }

    fn histogram(&self, metric: &str, value: f64, tags: &[String]) {
        self.push(MetricKind::Histogram, metric, value, tags);
    }
}
