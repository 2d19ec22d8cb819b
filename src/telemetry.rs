//! Outward event sink and the emitter shared by the engine and the tracker.
//!
//! Final delivery is somebody else's job: the core only hands finished
//! [`TelemetryEvent`]s to an [`EventSink`]. The emitter stamps each event
//! with its source and the current enrollment phase.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::models::{EnrollmentPhase, Severity, TelemetryEvent};

/// Receives finished telemetry events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Forwards events into an unbounded channel the host drains.
impl EventSink for mpsc::UnboundedSender<TelemetryEvent> {
    fn emit(&self, event: TelemetryEvent) {
        if self.send(event).is_err() {
            debug!("Event channel closed, dropping telemetry event");
        }
    }
}

/// Writes every event as a JSON line through the `log` facade.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: TelemetryEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => match event.severity {
                Severity::Warning | Severity::Error | Severity::Critical => warn!("{}", json),
                _ => info!("{}", json),
            },
            Err(e) => warn!("Failed to serialize telemetry event {}: {}", event.event_type, e),
        }
    }
}

/// Keeps every event in memory. Used by tests and diagnostics.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count_of_type(&self, event_type: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event_type == event_type).count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

/// Builds events and pushes them to the sink.
///
/// Clones share the sink and the current phase, so a phase change reported
/// to the engine is visible on events the tracker emits afterwards.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    phase: Arc<RwLock<EnrollmentPhase>>,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            phase: Arc::new(RwLock::new(EnrollmentPhase::default())),
        }
    }

    pub fn phase(&self) -> EnrollmentPhase {
        *self.phase.read()
    }

    pub fn set_phase(&self, phase: EnrollmentPhase) {
        *self.phase.write() = phase;
    }

    pub fn emit(
        &self,
        source: &str,
        event_type: &str,
        severity: Severity,
        message: impl Into<String>,
        data: Map<String, Value>,
    ) {
        let event = TelemetryEvent::new(event_type, severity, source, self.phase(), message, data);
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitter_stamps_current_phase() {
        let sink = MemorySink::new();
        let emitter = EventEmitter::new(Arc::new(sink.clone()));

        emitter.emit("test", "first", Severity::Info, "one", Map::new());
        emitter.clone().set_phase(EnrollmentPhase::UserSetup);
        emitter.emit("test", "second", Severity::Warning, "two", Map::new());

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, EnrollmentPhase::PreFlight);
        assert_eq!(events[1].phase, EnrollmentPhase::UserSetup);
        assert_eq!(events[1].severity, Severity::Warning);
        assert_eq!(events[1].source, "test");
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(Arc::new(tx));
        emitter.emit("test", "forwarded", Severity::Info, "msg", Map::new());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "forwarded");
    }

    #[test]
    fn test_memory_sink_counts_by_type() {
        let sink = MemorySink::new();
        let emitter = EventEmitter::new(Arc::new(sink.clone()));
        emitter.emit("t", "a", Severity::Info, "", Map::new());
        emitter.emit("t", "a", Severity::Info, "", Map::new());
        emitter.emit("t", "b", Severity::Info, "", Map::new());

        assert_eq!(sink.count_of_type("a"), 2);
        assert_eq!(sink.events_of_type("b").len(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }
}
