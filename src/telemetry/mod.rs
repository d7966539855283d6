//! Telemetry buffer for low-priority diagnostic records.
//!
//! Records accumulate until the size threshold is reached or the periodic
//! flush fires; each flush hands back one batch. Delivery is fire-and-forget.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Kinds of diagnostic records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    PollFailed,
    RequestExpired,
    RequestRolledBack,
    MutationFailed,
    ReconnectRejected,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::PollFailed => "poll_failed",
            MetricKind::RequestExpired => "request_expired",
            MetricKind::RequestRolledBack => "request_rolled_back",
            MetricKind::MutationFailed => "mutation_failed",
            MetricKind::ReconnectRejected => "reconnect_rejected",
        }
    }
}

/// One diagnostic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub kind: MetricKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl MetricEvent {
    pub fn new(kind: MetricKind, payload: Value, at: DateTime<Utc>) -> Self {
        Self { kind, payload, at }
    }
}

/// Append-only buffer flushed as whole batches
#[derive(Debug)]
pub struct TelemetryBuffer {
    records: Mutex<Vec<MetricEvent>>,
    flush_size: AtomicUsize,
}

impl TelemetryBuffer {
    pub fn new(flush_size: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            flush_size: AtomicUsize::new(flush_size.max(1)),
        }
    }

    pub fn set_flush_size(&self, flush_size: usize) {
        self.flush_size.store(flush_size.max(1), Ordering::Relaxed);
    }

    pub fn flush_size(&self) -> usize {
        self.flush_size.load(Ordering::Relaxed)
    }

    /// Append a record; returns the batch when the size threshold is reached
    pub fn record(&self, event: MetricEvent) -> Option<Vec<MetricEvent>> {
        let mut records = self.records.lock();
        records.push(event);
        if records.len() >= self.flush_size() {
            Some(std::mem::take(&mut *records))
        } else {
            None
        }
    }

    /// Take everything buffered; `None` when empty
    pub fn flush(&self) -> Option<Vec<MetricEvent>> {
        let mut records = self.records.lock();
        if records.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *records))
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: MetricKind) -> MetricEvent {
        MetricEvent::new(kind, json!({ "reason": "test" }), Utc::now())
    }

    #[test]
    fn test_flush_on_size_threshold() {
        let buffer = TelemetryBuffer::new(3);

        assert!(buffer.record(record(MetricKind::PollFailed)).is_none());
        assert!(buffer.record(record(MetricKind::MutationFailed)).is_none());
        let batch = buffer.record(record(MetricKind::RequestExpired)).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].kind, MetricKind::PollFailed);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_manual_flush() {
        let buffer = TelemetryBuffer::new(10);
        assert!(buffer.flush().is_none());

        buffer.record(record(MetricKind::ReconnectRejected));
        assert_eq!(buffer.flush().map(|b| b.len()), Some(1));
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_flush_size_floor() {
        let buffer = TelemetryBuffer::new(0);
        assert_eq!(buffer.flush_size(), 1);
        assert!(buffer.record(record(MetricKind::RequestRolledBack)).is_some());

        buffer.set_flush_size(5);
        assert_eq!(buffer.flush_size(), 5);
    }

    #[test]
    fn test_record_serialization() {
        let value = serde_json::to_value(record(MetricKind::RequestRolledBack)).unwrap();
        assert_eq!(value["kind"], "request_rolled_back");
        assert_eq!(value["payload"]["reason"], "test");
    }
}
