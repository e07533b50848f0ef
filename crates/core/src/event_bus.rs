//! Journey event bus — trait for emitting enrollment lifecycle events.
//!
//! The executor and operator controls accept an `Arc<dyn EventSink>` so that
//! blocks, sends and completions can be audited independently of the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Kinds of lifecycle events emitted while executing journeys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyEventType {
    StepAdvanced,
    MessageSent,
    MessageFailed,
    EnrollmentBlocked,
    EnrollmentFinished,
    EnrollmentErrored,
    EnrollmentDeferred,
    EnrollmentPaused,
    EnrollmentResumed,
}

/// A single lifecycle event for one enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyEvent {
    pub event_id: Uuid,
    pub event_type: JourneyEventType,
    pub enrollment_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub step_index: Option<u32>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting journey events. Implementations may forward to an
/// analytics pipeline or an audit table.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JourneyEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: JourneyEvent) {}
}

/// Writes every event to the `journey_events` tracing target, one
/// structured line per event. Blocks and errors log at `warn`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: JourneyEvent) {
        match event.event_type {
            JourneyEventType::EnrollmentBlocked
            | JourneyEventType::EnrollmentErrored
            | JourneyEventType::MessageFailed => tracing::warn!(
                target: "journey_events",
                event_id = %event.event_id,
                event_type = ?event.event_type,
                enrollment_id = %event.enrollment_id,
                customer_id = ?event.customer_id,
                step_index = ?event.step_index,
                detail = ?event.detail,
                "journey event"
            ),
            _ => tracing::info!(
                target: "journey_events",
                event_id = %event.event_id,
                event_type = ?event.event_type,
                enrollment_id = %event.enrollment_id,
                customer_id = ?event.customer_id,
                step_index = ?event.step_index,
                detail = ?event.detail,
                "journey event"
            ),
        }
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<JourneyEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<JourneyEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: JourneyEventType) -> usize {
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
    fn emit(&self, event: JourneyEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `JourneyEvent` with minimal boilerplate.
pub fn make_event(
    event_type: JourneyEventType,
    enrollment_id: Uuid,
    customer_id: Option<Uuid>,
    step_index: Option<u32>,
    detail: Option<String>,
    timestamp: DateTime<Utc>,
) -> JourneyEvent {
    JourneyEvent {
        event_id: Uuid::new_v4(),
        event_type,
        enrollment_id,
        customer_id,
        step_index,
        detail,
        timestamp,
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: the sink the service runs with.
pub fn tracing_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
