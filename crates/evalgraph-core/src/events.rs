//! Buffered diagnostic events and the sinks they are replayed to.
//!
//! A computation attempt buffers its diagnostics in its environment; the
//! scheduler replays them to the configured [`EventSink`] exactly once, when
//! the attempt that concludes the key commits. Events buffered by a
//! discarded (restarted or cancelled) attempt are dropped, never replayed.
//! Replay order is FIFO per key; cross-key ordering is unspecified.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::NodeKey;

/// Severity of a buffered diagnostic.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// One diagnostic emitted during a computation, tagged with the key whose
/// attempt produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Key whose computation emitted this event.
    pub key: NodeKey,
    pub severity: EventSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(key: NodeKey, severity: EventSeverity, message: impl Into<String>) -> Self {
        Self {
            key,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Caller-visible destination for replayed diagnostics.
pub trait EventSink: Send + Sync {
    /// Deliver the buffered events of one committed attempt, in emission
    /// order. Called at most once per key per generation.
    fn replay(&self, events: &[EventRecord]);
}

/// Collects replayed events in memory. Intended for tests and reporting.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything replayed so far.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.events.lock().expect("event sink lock poisoned").clone()
    }

    /// Drain and return everything replayed so far.
    pub fn take(&self) -> Vec<EventRecord> {
        std::mem::take(&mut *self.events.lock().expect("event sink lock poisoned"))
    }
}

impl EventSink for MemorySink {
    fn replay(&self, events: &[EventRecord]) {
        self.events
            .lock()
            .expect("event sink lock poisoned")
            .extend_from_slice(events);
    }
}

/// Forwards replayed events to `tracing`, mapped by severity. This is the
/// default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn replay(&self, events: &[EventRecord]) {
        for ev in events {
            match ev.severity {
                EventSeverity::Info => {
                    tracing::info!(event = "node.diagnostic", key = %ev.key, message = %ev.message)
                }
                EventSeverity::Warning => {
                    tracing::warn!(event = "node.diagnostic", key = %ev.key, message = %ev.message)
                }
                EventSeverity::Error => {
                    tracing::error!(event = "node.diagnostic", key = %ev.key, message = %ev.message)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(msg: &str) -> EventRecord {
        EventRecord::new(NodeKey::of("ast", "lib.ext"), EventSeverity::Info, msg)
    }

    #[test]
    fn test_memory_sink_preserves_replay_order() {
        let sink = MemorySink::new();
        sink.replay(&[record("first"), record("second")]);
        sink.replay(&[record("third")]);
        let messages: Vec<String> = sink.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_memory_sink_take_drains() {
        let sink = MemorySink::new();
        sink.replay(&[record("only")]);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn test_event_record_serializes() {
        let ev = record("diagnostic text");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("diagnostic text"));
    }
}
