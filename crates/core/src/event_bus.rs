//! Event sink trait for emitting engine events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` to publish lifecycle events
//! (enrollments, sends, failures, winner selection) to whatever downstream
//! pipeline the host process wires in.

use crate::types::{EngineEvent, EventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and hosts that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating an `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    workflow_id: Uuid,
    execution_id: Option<Uuid>,
    contact_id: Option<String>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        workflow_id,
        execution_id,
        contact_id,
        node_id: None,
        detail: None,
        node: "local".into(),
        timestamp: Utc::now(),
    }
}

impl EngineEvent {
    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
