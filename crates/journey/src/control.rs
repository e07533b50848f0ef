//! Operator controls: pause and resume individual enrollments.
//!
//! Both go through the same conditional commit as the executor, so an
//! operator action and a batch run can never both win on one enrollment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use cadence_core::error::{CadenceError, CadenceResult, StoreError};
use cadence_core::event_bus::{make_event, EventSink, JourneyEventType};
use cadence_core::types::{meta_keys, Enrollment, EnrollmentStatus};

use crate::store::{EnrollmentCommit, EnrollmentPatch, EnrollmentStore};

pub struct EnrollmentControls {
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentControls {
    pub fn new() -> Self {
        Self {
            event_sink: cadence_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Stop an active enrollment from being picked up by the executor.
    /// Fails with a conflict while a batch holds its lease.
    pub async fn pause<S: EnrollmentStore>(
        &self,
        store: &S,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> CadenceResult<Enrollment> {
        let enrollment = load(store, id).await?;
        if enrollment.is_claimed(now) {
            return Err(CadenceError::StoreWrite(StoreError::Conflict { id }));
        }
        let patch = EnrollmentPatch::new()
            .status(EnrollmentStatus::Paused)
            .touched(now);
        let paused = store
            .commit(EnrollmentCommit::new(&enrollment, patch))
            .await
            .map_err(CadenceError::StoreWrite)?;

        info!(enrollment_id = %id, from = enrollment.status.as_str(), "enrollment paused");
        self.emit(JourneyEventType::EnrollmentPaused, &paused, now);
        Ok(paused)
    }

    /// Reactivate a paused or errored enrollment on its current step, due
    /// immediately. Clears the block markers and the send-failure count.
    pub async fn resume<S: EnrollmentStore>(
        &self,
        store: &S,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> CadenceResult<Enrollment> {
        let enrollment = load(store, id).await?;
        if enrollment.status == EnrollmentStatus::Active {
            return Err(CadenceError::StoreWrite(StoreError::InvalidTransition(
                "enrollment is already active".into(),
            )));
        }
        let patch = EnrollmentPatch::new()
            .status(EnrollmentStatus::Active)
            .next_run_at(now)
            .failed_sends(0)
            .touched(now)
            .remove_meta(meta_keys::BLOCK_REASON)
            .remove_meta(meta_keys::BLOCKED_AT);
        let resumed = store
            .commit(EnrollmentCommit::new(&enrollment, patch))
            .await
            .map_err(CadenceError::StoreWrite)?;

        info!(enrollment_id = %id, from = enrollment.status.as_str(), "enrollment resumed");
        self.emit(JourneyEventType::EnrollmentResumed, &resumed, now);
        Ok(resumed)
    }

    fn emit(&self, event_type: JourneyEventType, enrollment: &Enrollment, now: DateTime<Utc>) {
        self.event_sink.emit(make_event(
            event_type,
            enrollment.id,
            Some(enrollment.customer_id),
            Some(enrollment.current_step_index),
            None,
            now,
        ));
    }
}

impl Default for EnrollmentControls {
    fn default() -> Self {
        Self::new()
    }
}

async fn load<S: EnrollmentStore>(store: &S, id: Uuid) -> CadenceResult<Enrollment> {
    store
        .get(id)
        .await
        .map_err(CadenceError::StoreRead)?
        .ok_or(CadenceError::StoreRead(StoreError::NotFound {
            entity: "enrollment",
            id,
        }))
}
