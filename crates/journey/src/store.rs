//! Persistence seams used by the batch executor.
//!
//! The executor never holds a store of its own: it is handed one per
//! invocation. Every enrollment write is conditional on the version the
//! writer last observed, which is what keeps two concurrent invocations from
//! advancing or messaging the same enrollment twice.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use cadence_core::error::StoreError;
use cadence_core::types::{Business, Customer, Enrollment, EnrollmentStatus, Sequence, Step};

/// Field updates applied to an enrollment by a single commit. Unset fields
/// are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrollmentPatch {
    pub status: Option<EnrollmentStatus>,
    pub current_step_index: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub failed_sends: Option<u32>,
    pub meta_set: Map<String, Value>,
    pub meta_remove: Vec<String>,
}

impl EnrollmentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: EnrollmentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn step(mut self, step_index: u32, next_run_at: DateTime<Utc>) -> Self {
        self.current_step_index = Some(step_index);
        self.next_run_at = Some(next_run_at);
        self
    }

    pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.last_event_at = Some(at);
        self
    }

    pub fn failed_sends(mut self, count: u32) -> Self {
        self.failed_sends = Some(count);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta_set.insert(key.to_string(), value.into());
        self
    }

    pub fn remove_meta(mut self, key: &str) -> Self {
        self.meta_remove.push(key.to_string());
        self
    }

    /// Apply the patch to `enrollment` in place. Does not touch the version
    /// or the claim.
    pub fn apply(&self, enrollment: &mut Enrollment) {
        if let Some(status) = self.status {
            enrollment.status = status;
        }
        if let Some(index) = self.current_step_index {
            enrollment.current_step_index = index;
        }
        if let Some(at) = self.next_run_at {
            enrollment.next_run_at = at;
        }
        if let Some(at) = self.last_event_at {
            enrollment.last_event_at = Some(at);
        }
        if let Some(count) = self.failed_sends {
            enrollment.failed_sends = count;
        }
        for key in &self.meta_remove {
            enrollment.meta.remove(key);
        }
        for (key, value) in &self.meta_set {
            enrollment.meta.insert(key.clone(), value.clone());
        }
    }
}

/// Records that a customer was messaged. Written in the same atomic unit as
/// the enrollment advance; the slot itself is taken earlier through
/// [`CustomerDirectory::reserve_contact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactStamp {
    pub customer_id: Uuid,
    pub contacted_at: DateTime<Utc>,
}

/// A conditional enrollment write.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentCommit {
    pub enrollment_id: Uuid,
    /// The commit fails with `StoreError::Conflict` unless the stored
    /// version still equals this value.
    pub expected_version: u64,
    pub patch: EnrollmentPatch,
    pub contact: Option<ContactStamp>,
}

impl EnrollmentCommit {
    pub fn new(enrollment: &Enrollment, patch: EnrollmentPatch) -> Self {
        Self {
            enrollment_id: enrollment.id,
            expected_version: enrollment.version,
            patch,
            contact: None,
        }
    }

    pub fn with_contact(mut self, contact: ContactStamp) -> Self {
        self.contact = Some(contact);
        self
    }
}

/// Enrollment rows and their conditional writes.
pub trait EnrollmentStore: Send + Sync {
    /// Active, unclaimed enrollments with `next_run_at <= now`, at most
    /// `limit` of them, earliest first.
    fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Enrollment>, StoreError>> + Send;

    /// Take a processing lease on an active enrollment. Fails with
    /// `StoreError::Conflict` if the version moved or another lease is live.
    /// The returned enrollment carries the bumped version.
    fn claim(
        &self,
        id: Uuid,
        expected_version: u64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> impl Future<Output = Result<Enrollment, StoreError>> + Send;

    /// Apply a patch (and optional contact stamp) atomically, release any
    /// lease and bump the version.
    fn commit(
        &self,
        commit: EnrollmentCommit,
    ) -> impl Future<Output = Result<Enrollment, StoreError>> + Send;

    /// Record a processing failure in the enrollment's meta and release the
    /// lease. When `expected_version` is given the write is conditional.
    fn record_failure(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        message: String,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<Enrollment>, StoreError>> + Send;
}

/// Read-only sequence definitions.
pub trait StepCatalog: Send + Sync {
    fn sequence(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Sequence>, StoreError>> + Send;

    fn step_at(
        &self,
        sequence_id: Uuid,
        step_index: u32,
    ) -> impl Future<Output = Result<Option<Step>, StoreError>> + Send;

    /// The step with the smallest index strictly greater than `step_index`.
    fn next_step_after(
        &self,
        sequence_id: Uuid,
        step_index: u32,
    ) -> impl Future<Output = Result<Option<Step>, StoreError>> + Send;
}

/// Customers and the businesses that message them.
pub trait CustomerDirectory: Send + Sync {
    fn customer(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Customer>, StoreError>> + Send;

    fn business(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Business>, StoreError>> + Send;

    /// Take the customer's contact slot before a send: set
    /// `last_contacted_at` to `at` only if it still equals `observed`, the
    /// value the safety gate evaluated. Fails with `StoreError::Conflict`
    /// when a concurrent send got there first.
    fn reserve_contact(
        &self,
        customer_id: Uuid,
        observed: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Undo a reservation taken at `at` whose send failed, restoring
    /// `previous`. Leaves the customer alone if the stamp has moved on.
    fn release_contact(
        &self,
        customer_id: Uuid,
        at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Everything the executor reads and writes.
pub trait JourneyStore: EnrollmentStore + StepCatalog + CustomerDirectory {}

impl<T: EnrollmentStore + StepCatalog + CustomerDirectory> JourneyStore for T {}
