//! Lifecycle event bus — components hold an `Arc<dyn EventSink>` and emit
//! tagged [`TrackerEvent`]s instead of inheriting an emitter base.
//!
//! No internal error is ever thrown across this boundary; everything the
//! embedding host may care about surfaces here.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Diagnostic lifecycle events emitted by the core components.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    SessionCreated { session_id: String, visitor_id: String },
    SessionRestored { session_id: String },
    SessionInvalid { reasons: Vec<String> },
    SessionSynchronized { session_id: String },
    ConnectionOpen { url: String },
    ConnectionClosed { url: String },
    ConnectionError { message: String },
    FallbackActivated { url: String },
    QueueFull { dropped_id: String },
    MessageFailed { id: String, attempts: u32 },
    EventsFailed { count: usize },
    CommandReceived { data: serde_json::Value },
}

impl TrackerEvent {
    /// Stable event name for logs and host-facing dispatch.
    pub fn name(&self) -> &'static str {
        match self {
            TrackerEvent::SessionCreated { .. } => "session:created",
            TrackerEvent::SessionRestored { .. } => "session:restored",
            TrackerEvent::SessionInvalid { .. } => "session:invalid",
            TrackerEvent::SessionSynchronized { .. } => "session:synchronized",
            TrackerEvent::ConnectionOpen { .. } => "connection:open",
            TrackerEvent::ConnectionClosed { .. } => "connection:closed",
            TrackerEvent::ConnectionError { .. } => "connection:error",
            TrackerEvent::FallbackActivated { .. } => "fallback:activated",
            TrackerEvent::QueueFull { .. } => "queue:full",
            TrackerEvent::MessageFailed { .. } => "message:failed",
            TrackerEvent::EventsFailed { .. } => "events:failed",
            TrackerEvent::CommandReceived { .. } => "command:received",
        }
    }
}

/// Trait for receiving lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TrackerEvent);
}

/// No-op sink for components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: TrackerEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<TrackerEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TrackerEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_name(&self, name: &str) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: TrackerEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Fans one event out to several listeners, isolating each: a panicking
/// listener is logged and skipped, the rest still receive the event.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: TrackerEvent) {
        for sink in &self.sinks {
            let result = catch_unwind(AssertUnwindSafe(|| sink.emit(event.clone())));
            if result.is_err() {
                tracing::warn!(event = event.name(), "event listener panicked; skipping");
            }
        }
    }
}

/// Convenience: a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
