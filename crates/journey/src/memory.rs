//! In-memory journey store.
//!
//! Production: replace with a transactional database that supports
//! conditional updates. Sequence definitions live in DashMaps; enrollments
//! and customers share one lock so a commit can advance an enrollment and
//! stamp the customer's `last_contacted_at` as a single atomic unit.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use cadence_core::error::StoreError;
use cadence_core::types::{
    meta_keys, Business, Customer, Enrollment, EnrollmentStatus, Sequence, SequenceStatus, Step,
    StepAction, StepTiming,
};

use crate::state_machine::EnrollmentStateMachine;
use crate::store::{CustomerDirectory, EnrollmentCommit, EnrollmentStore, StepCatalog};

#[derive(Default)]
struct Ledger {
    enrollments: HashMap<Uuid, Enrollment>,
    customers: HashMap<Uuid, Customer>,
}

impl Ledger {
    fn has_other_active(&self, sequence_id: Uuid, customer_id: Uuid, except: Uuid) -> bool {
        self.enrollments.values().any(|e| {
            e.id != except
                && e.sequence_id == sequence_id
                && e.customer_id == customer_id
                && e.status == EnrollmentStatus::Active
        })
    }
}

/// Identifiers created by [`MemoryStore::seed_demo_data`].
#[derive(Debug, Clone)]
pub struct DemoSeed {
    pub business_id: Uuid,
    pub sequence_id: Uuid,
    pub customer_ids: Vec<Uuid>,
    pub enrollment_ids: Vec<Uuid>,
}

/// Thread-safe in-memory store for sequences, steps, customers and
/// enrollments.
pub struct MemoryStore {
    sequences: DashMap<Uuid, Sequence>,
    steps: DashMap<Uuid, BTreeMap<u32, Step>>,
    businesses: DashMap<Uuid, Business>,
    ledger: Mutex<Ledger>,
    lifecycle: EnrollmentStateMachine,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Journey store initialized (in-memory, development mode)");
        Self {
            sequences: DashMap::new(),
            steps: DashMap::new(),
            businesses: DashMap::new(),
            ledger: Mutex::new(Ledger::default()),
            lifecycle: EnrollmentStateMachine::new(),
        }
    }

    // ─── Definitions ───────────────────────────────────────────────────────

    /// Store a sequence with its steps, replacing any previous definition.
    /// Step indices must be unique and every step must belong to `sequence`.
    pub fn insert_sequence(&self, sequence: Sequence, steps: Vec<Step>) -> Result<(), StoreError> {
        let mut by_index = BTreeMap::new();
        for step in steps {
            if step.sequence_id != sequence.id {
                return Err(StoreError::InvalidDefinition(format!(
                    "step {} belongs to sequence {}, not {}",
                    step.id, step.sequence_id, sequence.id
                )));
            }
            let index = step.step_index;
            if by_index.insert(index, step).is_some() {
                return Err(StoreError::InvalidDefinition(format!(
                    "duplicate step_index {index} in sequence {}",
                    sequence.id
                )));
            }
        }
        debug!(sequence_id = %sequence.id, steps = by_index.len(), "sequence stored");
        self.steps.insert(sequence.id, by_index);
        self.sequences.insert(sequence.id, sequence);
        Ok(())
    }

    pub fn set_sequence_status(&self, id: Uuid, status: SequenceStatus) -> Result<(), StoreError> {
        let mut sequence = self.sequences.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "sequence",
            id,
        })?;
        sequence.status = status;
        Ok(())
    }

    pub fn insert_business(&self, business: Business) {
        self.businesses.insert(business.id, business);
    }

    // ─── Customers ─────────────────────────────────────────────────────────

    pub fn upsert_customer(&self, customer: Customer) {
        self.ledger.lock().customers.insert(customer.id, customer);
    }

    pub fn get_customer(&self, id: Uuid) -> Option<Customer> {
        self.ledger.lock().customers.get(&id).cloned()
    }

    // ─── Enrollments ───────────────────────────────────────────────────────

    /// Insert an enrollment as-is. Rejects a second active enrollment for
    /// the same (sequence, customer).
    pub fn insert_enrollment(&self, enrollment: Enrollment) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock();
        if enrollment.status == EnrollmentStatus::Active
            && ledger.has_other_active(enrollment.sequence_id, enrollment.customer_id, enrollment.id)
        {
            return Err(StoreError::DuplicateActive {
                sequence_id: enrollment.sequence_id,
                customer_id: enrollment.customer_id,
            });
        }
        ledger.enrollments.insert(enrollment.id, enrollment);
        Ok(())
    }

    /// Enroll a customer at the first step of a sequence, due after that
    /// step's wait.
    pub fn enroll(
        &self,
        sequence_id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, StoreError> {
        let sequence = self
            .sequences
            .get(&sequence_id)
            .map(|s| s.clone())
            .ok_or(StoreError::NotFound {
                entity: "sequence",
                id: sequence_id,
            })?;
        let first = self
            .steps
            .get(&sequence_id)
            .and_then(|steps| steps.values().next().cloned())
            .ok_or_else(|| {
                StoreError::InvalidDefinition(format!("sequence {sequence_id} has no steps"))
            })?;
        let wait = i64::try_from(first.wait_ms).unwrap_or(i64::MAX);
        let due = now
            .checked_add_signed(Duration::milliseconds(wait))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let enrollment = Enrollment::new(
            sequence.business_id,
            sequence_id,
            customer_id,
            first.step_index,
            due,
        );
        self.insert_enrollment(enrollment.clone())?;
        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %sequence_id,
            customer_id = %customer_id,
            "customer enrolled"
        );
        Ok(enrollment)
    }

    pub fn list_enrollments(&self) -> Vec<Enrollment> {
        let mut enrollments: Vec<Enrollment> =
            self.ledger.lock().enrollments.values().cloned().collect();
        enrollments.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        enrollments
    }

    pub fn enrollment_count(&self) -> usize {
        self.ledger.lock().enrollments.len()
    }

    // ─── Demo Data ─────────────────────────────────────────────────────────

    /// Seed one business, a three-step follow-up sequence and a handful of
    /// customers enrolled and due at `now`.
    pub fn seed_demo_data(&self, now: DateTime<Utc>) -> Result<DemoSeed, StoreError> {
        let business_id = Uuid::new_v4();
        self.insert_business(Business {
            id: business_id,
            name: "Harbor Dental".into(),
            phone: Some("+15550101010".into()),
            links: BTreeMap::from([
                ("review".to_string(), "https://reviews.example/harbor".to_string()),
                ("booking".to_string(), "https://book.example/harbor".to_string()),
            ]),
        });

        let sequence_id = Uuid::new_v4();
        let step = |index: u32, action: StepAction, wait_ms: u64, purpose: &str, timing| Step {
            id: Uuid::new_v4(),
            sequence_id,
            step_index: index,
            action,
            wait_ms,
            purpose: Some(purpose.to_string()),
            timing,
        };
        self.insert_sequence(
            Sequence {
                id: sequence_id,
                business_id,
                name: "Post-visit follow-up".into(),
                status: SequenceStatus::Active,
            },
            vec![
                step(
                    0,
                    StepAction::SendEmail {
                        subject: "Thanks for visiting {{business.name}}".into(),
                        body: "Hi {{customer.first_name}}, how did we do? {{links.review}}".into(),
                    },
                    0,
                    "review_request",
                    StepTiming::Delay,
                ),
                step(1, StepAction::Wait, 2 * 24 * 3_600_000, "pause", StepTiming::Delay),
                step(
                    2,
                    StepAction::SendSms {
                        body: "{{customer.first_name}}, book your next visit: {{links.booking}}".into(),
                    },
                    0,
                    "rebook",
                    StepTiming::Optimal,
                ),
            ],
        )?;

        let customers = [
            ("Ana", "ana@example.com", "+15551230001", false),
            ("Ben", "ben@example.com", "+15551230002", false),
            ("Cleo", "cleo@example.com", "+15551230003", true),
        ];
        let mut customer_ids = Vec::new();
        let mut enrollment_ids = Vec::new();
        for (first_name, email, phone, dnc) in customers {
            let customer_id = Uuid::new_v4();
            self.upsert_customer(Customer {
                id: customer_id,
                business_id,
                email: Some(email.into()),
                phone: Some(phone.into()),
                first_name: Some(first_name.into()),
                last_name: None,
                unsubscribed: false,
                dnc,
                hard_bounced: false,
                last_contacted_at: None,
            });
            let enrollment = self.enroll(sequence_id, customer_id, now)?;
            customer_ids.push(customer_id);
            enrollment_ids.push(enrollment.id);
        }

        info!(
            business_id = %business_id,
            sequence_id = %sequence_id,
            customers = customer_ids.len(),
            "demo journey data seeded"
        );
        Ok(DemoSeed {
            business_id,
            sequence_id,
            customer_ids,
            enrollment_ids,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrollmentStore for MemoryStore {
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>, StoreError> {
        let ledger = self.ledger.lock();
        let mut due: Vec<Enrollment> = ledger
            .enrollments
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_version: u64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Enrollment, StoreError> {
        let mut ledger = self.ledger.lock();
        let enrollment = ledger
            .enrollments
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "enrollment", id })?;
        if enrollment.version != expected_version
            || enrollment.status != EnrollmentStatus::Active
            || enrollment.is_claimed(now)
        {
            return Err(StoreError::Conflict { id });
        }
        enrollment.claimed_until = Some(lease_until);
        enrollment.version += 1;
        Ok(enrollment.clone())
    }

    async fn commit(&self, commit: EnrollmentCommit) -> Result<Enrollment, StoreError> {
        let id = commit.enrollment_id;
        let mut ledger = self.ledger.lock();
        let current = ledger
            .enrollments
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "enrollment", id })?;
        if current.version != commit.expected_version {
            return Err(StoreError::Conflict { id });
        }

        let mut updated = current.clone();
        commit.patch.apply(&mut updated);
        self.lifecycle.check(current.status, updated.status)?;
        if updated.status == EnrollmentStatus::Active
            && current.status != EnrollmentStatus::Active
            && ledger.has_other_active(updated.sequence_id, updated.customer_id, id)
        {
            return Err(StoreError::DuplicateActive {
                sequence_id: updated.sequence_id,
                customer_id: updated.customer_id,
            });
        }

        if let Some(stamp) = commit.contact {
            let customer = ledger
                .customers
                .get_mut(&stamp.customer_id)
                .ok_or(StoreError::NotFound {
                    entity: "customer",
                    id: stamp.customer_id,
                })?;
            if customer.last_contacted_at.map_or(true, |at| at < stamp.contacted_at) {
                customer.last_contacted_at = Some(stamp.contacted_at);
            }
        }

        updated.claimed_until = None;
        updated.version += 1;
        ledger.enrollments.insert(id, updated.clone());
        Ok(updated)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        message: String,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock();
        let enrollment = ledger
            .enrollments
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "enrollment", id })?;
        if expected_version.is_some_and(|v| v != enrollment.version) {
            return Err(StoreError::Conflict { id });
        }
        enrollment
            .meta
            .insert(meta_keys::LAST_ERROR.to_string(), Value::from(message));
        enrollment
            .meta
            .insert(meta_keys::LAST_ERROR_AT.to_string(), Value::from(at.to_rfc3339()));
        enrollment.claimed_until = None;
        enrollment.version += 1;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.ledger.lock().enrollments.get(&id).cloned())
    }
}

impl StepCatalog for MemoryStore {
    async fn sequence(&self, id: Uuid) -> Result<Option<Sequence>, StoreError> {
        Ok(self.sequences.get(&id).map(|s| s.clone()))
    }

    async fn step_at(&self, sequence_id: Uuid, step_index: u32) -> Result<Option<Step>, StoreError> {
        Ok(self
            .steps
            .get(&sequence_id)
            .and_then(|steps| steps.get(&step_index).cloned()))
    }

    async fn next_step_after(
        &self,
        sequence_id: Uuid,
        step_index: u32,
    ) -> Result<Option<Step>, StoreError> {
        Ok(self.steps.get(&sequence_id).and_then(|steps| {
            steps
                .range(step_index.saturating_add(1)..)
                .next()
                .filter(|(index, _)| **index > step_index)
                .map(|(_, step)| step.clone())
        }))
    }
}

impl CustomerDirectory for MemoryStore {
    async fn customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        Ok(self.get_customer(id))
    }

    async fn business(&self, id: Uuid) -> Result<Option<Business>, StoreError> {
        Ok(self.businesses.get(&id).map(|b| b.clone()))
    }

    async fn reserve_contact(
        &self,
        customer_id: Uuid,
        observed: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock();
        let customer = ledger
            .customers
            .get_mut(&customer_id)
            .ok_or(StoreError::NotFound { entity: "customer", id: customer_id })?;
        if customer.last_contacted_at != observed {
            debug!(customer_id = %customer_id, "contact slot already taken");
            return Err(StoreError::Conflict { id: customer_id });
        }
        customer.last_contacted_at = Some(at);
        Ok(())
    }

    async fn release_contact(
        &self,
        customer_id: Uuid,
        at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock();
        let customer = ledger
            .customers
            .get_mut(&customer_id)
            .ok_or(StoreError::NotFound { entity: "customer", id: customer_id })?;
        if customer.last_contacted_at == Some(at) {
            customer.last_contacted_at = previous;
        }
        Ok(())
    }
}
