/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Per-session telemetry events.
//!
//! Each control component can describe itself as a [`DiagEvent`]; the
//! session publishes those onto its own [`DiagnosticsBus`] for health
//! reporting. Publishing is best-effort and never blocks a control loop.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagEvent {
    /// Component that produced this event ("jitter_buffer", "qos", "bitrate").
    pub subsystem: String,
    /// Optional stream identifier (peer or media stream).
    pub stream_id: Option<String>,
    /// Unix time in milliseconds when the metrics were captured.
    pub ts_ms: u64,
    pub metrics: Vec<Metric>,
}

impl DiagEvent {
    pub fn new(subsystem: &str, metrics: Vec<Metric>) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            stream_id: None,
            ts_ms: now_ms(),
            metrics,
        }
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Look up a metric by name.
    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.value)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum MetricValue {
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
}

/// Shorthand for constructing a [`Metric`].
#[macro_export]
macro_rules! metric {
    ($name:expr, $value:expr) => {
        $crate::diagnostics::Metric {
            name: ($name).to_string(),
            value: $crate::diagnostics::MetricValue::from($value),
        }
    };
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::I64(v)
    }
}
impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::U64(v)
    }
}
impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::U64(v as u64)
    }
}
impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::U64(v as u64)
    }
}
impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::F64(v)
    }
}
impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}
impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// Multi-producer, multi-consumer event channel owned by one session.
///
/// Consumers compete for events: each event is delivered to exactly one
/// receiver clone.
#[derive(Clone, Debug)]
pub struct DiagnosticsBus {
    sender: Sender<DiagEvent>,
    receiver: Receiver<DiagEvent>,
}

impl Default for DiagnosticsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsBus {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }

    /// Bounded bus; events are dropped instead of queued once `capacity`
    /// events are pending.
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self { sender, receiver }
    }

    /// Best-effort publish. Returns `false` if the event was dropped.
    pub fn publish(&self, event: DiagEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                log::trace!("Dropping diagnostics event: {e}");
                false
            }
        }
    }

    pub fn sender(&self) -> Sender<DiagEvent> {
        self.sender.clone()
    }

    pub fn subscribe(&self) -> Receiver<DiagEvent> {
        self.receiver.clone()
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_macro_converts_common_types() {
        let m = metric!("frames", 3u64);
        assert_eq!(m.value, MetricValue::U64(3));
        let m = metric!("delay_ms", 50.0);
        assert_eq!(m.value, MetricValue::F64(50.0));
        let m = metric!("mode", "normal");
        assert_eq!(m.value, MetricValue::Text("normal".into()));
    }

    #[test]
    fn bus_delivers_published_events() {
        let bus = DiagnosticsBus::new();
        let rx = bus.subscribe();
        assert!(bus.publish(DiagEvent::new("qos", vec![metric!("rtt_ms", 12.5)])));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.subsystem, "qos");
        assert_eq!(event.metric("rtt_ms"), Some(&MetricValue::F64(12.5)));
    }

    #[test]
    fn bounded_bus_drops_instead_of_blocking() {
        let bus = DiagnosticsBus::bounded(1);
        assert!(bus.publish(DiagEvent::new("bitrate", vec![])));
        assert!(!bus.publish(DiagEvent::new("bitrate", vec![])));
        assert_eq!(bus.pending(), 1);
    }

    #[test]
    fn events_render_as_json() {
        let event = DiagEvent::new("jitter_buffer", vec![metric!("buffered", 2usize)])
            .with_stream_id("alice->bob");
        let json = event.to_json().unwrap();
        assert!(json.contains("\"subsystem\":\"jitter_buffer\""));
        assert!(json.contains("\"stream_id\":\"alice->bob\""));
        assert!(json.contains("{\"t\":\"U64\",\"v\":2}"));
    }
}
