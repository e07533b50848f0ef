//! End-to-end executor behaviour against the in-memory store and a capturing
//! gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use cadence_channels::gateway::{CaptureGateway, MessageGateway, OutboundMessage, SendReceipt};
use cadence_core::error::{CadenceError, GatewayError, StoreError};
use cadence_core::event_bus::{capture_sink, JourneyEventType};
use cadence_core::types::{
    meta_keys, Business, Customer, Enrollment, EnrollmentStatus, Sequence, SequenceStatus, Step,
    StepAction, StepTiming,
};
use cadence_intelligent_delivery::safety::SafetyGate;
use cadence_journey::{
    BatchExecutor, CustomerDirectory, EnrollmentCommit, EnrollmentStore, MemoryStore,
    SendFailurePolicy, StepCatalog,
};

const HOUR_MS: u64 = 3_600_000;

/// Wednesday, inside every send window.
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 3, 11, 0, 0).unwrap()
}

struct Fixture {
    store: MemoryStore,
    business_id: Uuid,
    sequence_id: Uuid,
}

impl Fixture {
    /// send_email(0) → wait(1h) → send_sms(0)
    fn three_step() -> Self {
        let store = MemoryStore::new();
        let business_id = Uuid::new_v4();
        store.insert_business(Business {
            id: business_id,
            name: "Harbor Dental".into(),
            phone: None,
            links: [("review".to_string(), "https://r.example/h".to_string())].into(),
        });
        let sequence_id = Uuid::new_v4();
        let steps = vec![
            step(
                sequence_id,
                0,
                StepAction::SendEmail {
                    subject: "Thanks from {{business.name}}".into(),
                    body: "Hi {{ customer.first_name }}, review us: {{links.review}}".into(),
                },
                0,
            ),
            step(sequence_id, 1, StepAction::Wait, HOUR_MS),
            step(
                sequence_id,
                2,
                StepAction::SendSms {
                    body: "{{customer.first_name}}, see you soon".into(),
                },
                0,
            ),
        ];
        store
            .insert_sequence(
                Sequence {
                    id: sequence_id,
                    business_id,
                    name: "Follow-up".into(),
                    status: SequenceStatus::Active,
                },
                steps,
            )
            .unwrap();
        Self {
            store,
            business_id,
            sequence_id,
        }
    }

    fn customer(&self, configure: impl FnOnce(&mut Customer)) -> Customer {
        let mut customer = Customer {
            id: Uuid::new_v4(),
            business_id: self.business_id,
            email: Some("ana@example.com".into()),
            phone: Some("+15551230001".into()),
            first_name: Some("Ana".into()),
            last_name: None,
            unsubscribed: false,
            dnc: false,
            hard_bounced: false,
            last_contacted_at: None,
        };
        configure(&mut customer);
        self.store.upsert_customer(customer.clone());
        customer
    }

    fn enroll_at(&self, customer: &Customer, step_index: u32, next_run_at: DateTime<Utc>) -> Uuid {
        let enrollment = Enrollment::new(
            self.business_id,
            self.sequence_id,
            customer.id,
            step_index,
            next_run_at,
        );
        let id = enrollment.id;
        self.store.insert_enrollment(enrollment).unwrap();
        id
    }

    async fn enrollment(&self, id: Uuid) -> Enrollment {
        self.store.get(id).await.unwrap().unwrap()
    }
}

fn step(sequence_id: Uuid, index: u32, action: StepAction, wait_ms: u64) -> Step {
    Step {
        id: Uuid::new_v4(),
        sequence_id,
        step_index: index,
        action,
        wait_ms,
        purpose: None,
        timing: StepTiming::Delay,
    }
}

fn executor(policy: SendFailurePolicy) -> BatchExecutor<Arc<CaptureGateway>> {
    BatchExecutor::new(Arc::new(CaptureGateway::new())).with_failure_policy(policy)
}

#[tokio::test]
async fn test_send_step_advances_to_wait_step() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::default());

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.errors, 0);

    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.current_step_index, 1);
    assert_eq!(enrollment.next_run_at, t0() + Duration::hours(1));
    assert_eq!(enrollment.last_event_at, Some(t0()));
    assert!(enrollment.claimed_until.is_none());

    let sent = exec.gateway().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "ana@example.com");
    assert_eq!(sent[0].subject.as_deref(), Some("Thanks from Harbor Dental"));
    assert_eq!(sent[0].body, "Hi Ana, review us: https://r.example/h");
}

#[tokio::test]
async fn test_full_sequence_runs_to_finished() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::default())
        .with_safety_gate(SafetyGate::new(Duration::zero()));

    exec.execute_batch(&fx.store, t0(), 50).await.unwrap();

    // Wait step not yet due.
    let early = exec.execute_batch(&fx.store, t0() + Duration::minutes(30), 50).await.unwrap();
    assert_eq!(early.processed, 0);

    let t1 = t0() + Duration::hours(1);
    exec.execute_batch(&fx.store, t1, 50).await.unwrap();
    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.current_step_index, 2);
    assert_eq!(enrollment.next_run_at, t1);

    let report = exec.execute_batch(&fx.store, t1, 50).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.finished, 1);
    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.status, EnrollmentStatus::Finished);
    assert_eq!(exec.gateway().sent().len(), 2);
}

#[tokio::test]
async fn test_last_step_finishes() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 2, t0());
    let exec = executor(SendFailurePolicy::default());

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.finished, 1);

    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.status, EnrollmentStatus::Finished);
    assert_eq!(enrollment.last_event_at, Some(t0()));
}

#[tokio::test]
async fn test_missing_step_finishes_without_sending() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 7, t0());
    let exec = executor(SendFailurePolicy::default());

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.finished, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(exec.gateway().attempts(), 0);
    assert_eq!(fx.enrollment(id).await.status, EnrollmentStatus::Finished);

    // A finished enrollment is never picked up again.
    let again = exec.execute_batch(&fx.store, t0() + Duration::days(1), 50).await.unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn test_dnc_customer_is_blocked_without_gateway_call() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|c| c.dnc = true);
    let id = fx.enroll_at(&customer, 0, t0());
    let sink = capture_sink();
    let exec = executor(SendFailurePolicy::default()).with_event_sink(sink.clone());

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.blocked, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(report.errors, 0);
    assert_eq!(exec.gateway().attempts(), 0);

    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.status, EnrollmentStatus::Error);
    assert_eq!(enrollment.meta_str(meta_keys::BLOCK_REASON), Some("dnc"));
    assert!(enrollment.meta_str(meta_keys::BLOCKED_AT).is_some());
    assert_eq!(sink.count_type(JourneyEventType::EnrollmentBlocked), 1);
}

#[tokio::test]
async fn test_cooldown_blocks_recently_contacted_customer() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|c| c.last_contacted_at = Some(t0() - Duration::days(2)));
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::default());

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.blocked, 1);
    assert_eq!(exec.gateway().attempts(), 0);
    assert_eq!(
        fx.enrollment(id).await.meta_str(meta_keys::BLOCK_REASON),
        Some("cooldown")
    );
}

#[tokio::test]
async fn test_gateway_error_advances_under_advance_policy() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::Advance);
    exec.gateway()
        .fail_with(Some(GatewayError::Unavailable("sendgrid down".into())));

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.sent, 0);

    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.current_step_index, 1);
    assert!(enrollment
        .meta_str(meta_keys::LAST_ERROR)
        .is_some_and(|e| e.contains("sendgrid down")));
    assert_eq!(
        fx.store.get_customer(customer.id).unwrap().last_contacted_at,
        None
    );
}

#[tokio::test]
async fn test_retry_policy_escalates_after_max_attempts() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let sink = capture_sink();
    let exec = executor(SendFailurePolicy::Retry { max_attempts: 3 }).with_event_sink(sink.clone());
    exec.gateway().fail_recipient("ana@example.com");

    for attempt in 1..=2u32 {
        let now = t0() + Duration::minutes(i64::from(attempt));
        let report = exec.execute_batch(&fx.store, now, 50).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.retried, 1);

        let enrollment = fx.enrollment(id).await;
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.current_step_index, 0);
        assert_eq!(enrollment.next_run_at, t0());
        assert_eq!(enrollment.failed_sends, attempt);
    }

    let report = exec.execute_batch(&fx.store, t0() + Duration::minutes(3), 50).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.retried, 0);
    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.status, EnrollmentStatus::Error);
    assert_eq!(enrollment.failed_sends, 3);
    assert!(enrollment.meta_str(meta_keys::LAST_ERROR).is_some());
    assert_eq!(sink.count_type(JourneyEventType::EnrollmentErrored), 1);
    assert_eq!(exec.gateway().attempts(), 3);
}

#[tokio::test]
async fn test_retry_success_resets_failure_count() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::Retry { max_attempts: 3 });

    exec.gateway()
        .fail_with(Some(GatewayError::Unavailable("timeout".into())));
    exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(fx.enrollment(id).await.failed_sends, 1);

    exec.gateway().fail_with(None);
    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.sent, 1);
    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.failed_sends, 0);
    assert_eq!(enrollment.current_step_index, 1);
}

#[tokio::test]
async fn test_missing_recipient_counts_as_error() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|c| c.email = None);
    fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::Advance);

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(exec.gateway().attempts(), 0);
}

#[tokio::test]
async fn test_successful_send_stamps_last_contacted_at() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::default());

    exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(
        fx.store.get_customer(customer.id).unwrap().last_contacted_at,
        Some(t0())
    );
    assert!(fx
        .enrollment(id)
        .await
        .meta_str(meta_keys::PROVIDER_MESSAGE_ID)
        .is_some_and(|m| m.starts_with("capture-")));
}

#[tokio::test]
async fn test_batch_limit_and_counter_invariant() {
    let fx = Fixture::three_step();
    let exec = executor(SendFailurePolicy::Advance);
    for i in 0..10 {
        let customer = fx.customer(|c| {
            c.email = Some(format!("c{i}@example.com"));
            c.dnc = i % 4 == 0;
        });
        fx.enroll_at(&customer, i % 3, t0() - Duration::minutes(i64::from(i)));
    }
    exec.gateway().fail_recipient("c1@example.com");
    exec.gateway().fail_recipient("c5@example.com");

    let limit = 6;
    let report = exec.execute_batch(&fx.store, t0(), limit).await.unwrap();
    assert!(report.processed <= limit);
    assert!(report.sent + report.errors <= report.processed);
    assert_eq!(report.processed, 6);

    // Wait steps advanced in the first batch are due again immediately.
    let rest = exec.execute_batch(&fx.store, t0(), limit).await.unwrap();
    assert!(rest.processed <= limit);
    assert!(rest.sent + rest.errors <= rest.processed);
}

#[tokio::test]
async fn test_zero_limit_processes_nothing() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::default());

    let report = exec.execute_batch(&fx.store, t0(), 0).await.unwrap();
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_paused_sequence_defers_enrollment() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    fx.store
        .set_sequence_status(fx.sequence_id, SequenceStatus::Paused)
        .unwrap();
    let exec = executor(SendFailurePolicy::default());

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(exec.gateway().attempts(), 0);

    let enrollment = fx.enrollment(id).await;
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.current_step_index, 0);
    assert_eq!(enrollment.next_run_at, t0() + Duration::hours(1));
}

#[tokio::test]
async fn test_optimal_timing_schedules_next_step_in_preferred_hours() {
    let fx = Fixture::three_step();
    let sequence_id = Uuid::new_v4();
    let mut optimal = step(
        sequence_id,
        1,
        StepAction::SendSms {
            body: "hi".into(),
        },
        HOUR_MS,
    );
    optimal.timing = StepTiming::Optimal;
    fx.store
        .insert_sequence(
            Sequence {
                id: sequence_id,
                business_id: fx.business_id,
                name: "Optimal".into(),
                status: SequenceStatus::Active,
            },
            vec![step(sequence_id, 0, StepAction::Wait, 0), optimal],
        )
        .unwrap();
    let customer = fx.customer(|_| {});
    let enrollment = Enrollment::new(fx.business_id, sequence_id, customer.id, 0, t0());
    let id = enrollment.id;
    fx.store.insert_enrollment(enrollment).unwrap();

    // Wednesday 13:30 + 1h lands after the preferred hours.
    let now = Utc.with_ymd_and_hms(2024, 1, 3, 13, 30, 0).unwrap();
    executor(SendFailurePolicy::default())
        .execute_batch(&fx.store, now, 50)
        .await
        .unwrap();
    assert_eq!(
        fx.enrollment(id).await.next_run_at,
        Utc.with_ymd_and_hms(2024, 1, 4, 10, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_huge_optimal_wait_parks_enrollment_without_aborting_batch() {
    let fx = Fixture::three_step();
    let sequence_id = Uuid::new_v4();
    let mut forever = step(sequence_id, 1, StepAction::Wait, u64::MAX);
    forever.timing = StepTiming::Optimal;
    fx.store
        .insert_sequence(
            Sequence {
                id: sequence_id,
                business_id: fx.business_id,
                name: "Someday".into(),
                status: SequenceStatus::Active,
            },
            vec![step(sequence_id, 0, StepAction::Wait, 0), forever],
        )
        .unwrap();
    let parked = fx.customer(|_| {});
    let enrollment = Enrollment::new(fx.business_id, sequence_id, parked.id, 0, t0());
    let parked_id = enrollment.id;
    fx.store.insert_enrollment(enrollment).unwrap();
    let other = fx.customer(|c| c.email = Some("ben@example.com".into()));
    fx.enroll_at(&other, 0, t0());

    let report = executor(SendFailurePolicy::default())
        .execute_batch(&fx.store, t0(), 50)
        .await
        .unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.failures, 0);

    let enrollment = fx.enrollment(parked_id).await;
    assert_eq!(enrollment.current_step_index, 1);
    assert_eq!(enrollment.next_run_at, DateTime::<Utc>::MAX_UTC);
}

#[tokio::test]
async fn test_claimed_enrollment_is_skipped_by_concurrent_run() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let seen = fx.enrollment(id).await;

    // Another invocation claimed it between our fetch and our claim.
    fx.store
        .claim(id, seen.version, t0(), t0() + Duration::minutes(5))
        .await
        .unwrap();
    let stale = fx.store.claim(id, seen.version, t0(), t0() + Duration::minutes(5)).await;
    assert!(matches!(stale, Err(StoreError::Conflict { .. })));

    let exec = executor(SendFailurePolicy::default());
    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(exec.gateway().attempts(), 0);
}

#[tokio::test]
async fn test_overlapping_invocations_send_once() {
    let fx = Arc::new(Fixture::three_step());
    for i in 0..20 {
        let customer = fx.customer(|c| c.email = Some(format!("c{i}@example.com")));
        fx.enroll_at(&customer, 0, t0());
    }
    let gateway = Arc::new(CaptureGateway::new());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let fx = fx.clone();
        let exec = BatchExecutor::new(gateway.clone());
        handles.push(tokio::spawn(async move {
            exec.execute_batch(&fx.store, t0(), 50).await.unwrap()
        }));
    }
    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().processed;
    }

    assert_eq!(processed, 20);
    assert_eq!(gateway.sent().len(), 20);
}

/// A one-step email sequence for the fixture's business.
fn single_email_sequence(store: &MemoryStore, business_id: Uuid, name: &str) -> Uuid {
    let sequence_id = Uuid::new_v4();
    store
        .insert_sequence(
            Sequence {
                id: sequence_id,
                business_id,
                name: name.into(),
                status: SequenceStatus::Active,
            },
            vec![step(
                sequence_id,
                0,
                StepAction::SendEmail {
                    subject: "Hello".into(),
                    body: "Hi {{customer.first_name}}".into(),
                },
                0,
            )],
        )
        .unwrap();
    sequence_id
}

/// Enrolls one customer in two single-step sequences, both due at `t0`.
fn enroll_in_two_sequences(store: &MemoryStore, business_id: Uuid) -> (Uuid, [Uuid; 2]) {
    let customer_id = Uuid::new_v4();
    store.upsert_customer(Customer {
        id: customer_id,
        business_id,
        email: Some("ana@example.com".into()),
        phone: None,
        first_name: Some("Ana".into()),
        last_name: None,
        unsubscribed: false,
        dnc: false,
        hard_bounced: false,
        last_contacted_at: None,
    });
    let ids = ["Reviews", "Referrals"].map(|name| {
        let sequence_id = single_email_sequence(store, business_id, name);
        let enrollment = Enrollment::new(business_id, sequence_id, customer_id, 0, t0());
        let id = enrollment.id;
        store.insert_enrollment(enrollment).unwrap();
        id
    });
    (customer_id, ids)
}

/// Capture gateway that takes a while to answer.
#[derive(Default)]
struct SlowGateway {
    inner: CaptureGateway,
}

impl MessageGateway for SlowGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.inner.send(message).await
    }
}

#[tokio::test]
async fn test_overlapping_invocations_respect_customer_cooldown() {
    let fx = Fixture::three_step();
    let (customer_id, ids) = enroll_in_two_sequences(&fx.store, fx.business_id);
    let gateway = Arc::new(SlowGateway::default());
    let a = BatchExecutor::new(gateway.clone());
    let b = BatchExecutor::new(gateway.clone());

    let (ra, rb) = tokio::join!(
        a.execute_batch(&fx.store, t0(), 1),
        b.execute_batch(&fx.store, t0(), 1)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.processed + rb.processed, 2);
    assert_eq!(ra.sent + rb.sent, 1);
    assert_eq!(ra.blocked + rb.blocked, 1);
    assert_eq!(gateway.inner.sent().len(), 1);
    assert_eq!(
        fx.store.get_customer(customer_id).unwrap().last_contacted_at,
        Some(t0())
    );

    let mut reasons = Vec::new();
    for id in ids {
        let enrollment = fx.enrollment(id).await;
        if let Some(reason) = enrollment.meta_str(meta_keys::BLOCK_REASON) {
            reasons.push(reason.to_string());
        }
    }
    assert_eq!(reasons, vec!["cooldown".to_string()]);
}

#[tokio::test]
async fn test_stale_customer_snapshot_loses_contact_reservation() {
    let store = FlakyStore::default();
    let business_id = Uuid::new_v4();
    let (customer_id, _) = enroll_in_two_sequences(&store.inner, business_id);
    store.slow_customers.store(true, Ordering::SeqCst);

    // Both invocations read "never contacted" before either reserves.
    let gateway = Arc::new(CaptureGateway::new());
    let a = BatchExecutor::new(gateway.clone());
    let b = BatchExecutor::new(gateway.clone());
    let (ra, rb) = tokio::join!(
        a.execute_batch(&store, t0(), 1),
        b.execute_batch(&store, t0(), 1)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.sent + rb.sent, 1);
    assert_eq!(ra.blocked + rb.blocked, 1);
    assert_eq!(ra.failures + rb.failures, 0);
    assert_eq!(gateway.attempts(), 1);
    assert_eq!(
        store.inner.get_customer(customer_id).unwrap().last_contacted_at,
        Some(t0())
    );
}

#[tokio::test]
async fn test_failed_send_releases_contact_reservation() {
    let fx = Fixture::three_step();
    let customer = fx.customer(|_| {});
    let id = fx.enroll_at(&customer, 0, t0());
    let exec = executor(SendFailurePolicy::default());
    exec.gateway()
        .fail_with(Some(GatewayError::Unavailable("provider down".into())));

    let report = exec.execute_batch(&fx.store, t0(), 50).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(fx.store.get_customer(customer.id).unwrap().last_contacted_at, None);

    // The retry is not mistaken for a cooldown.
    exec.gateway().fail_with(None);
    let later = t0() + Duration::minutes(1);
    let report = exec.execute_batch(&fx.store, later, 50).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.blocked, 0);
    assert_eq!(fx.enrollment(id).await.current_step_index, 1);
    assert_eq!(
        fx.store.get_customer(customer.id).unwrap().last_contacted_at,
        Some(later)
    );
}

/// Wraps the memory store and fails selected operations.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_fetch: AtomicBool,
    fail_customers: AtomicBool,
    /// Customer reads hand back their snapshot only after a pause.
    slow_customers: AtomicBool,
}

impl EnrollmentStore for FlakyStore {
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>, StoreError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.fetch_due(now, limit).await
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_version: u64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Enrollment, StoreError> {
        self.inner.claim(id, expected_version, now, lease_until).await
    }

    async fn commit(&self, commit: EnrollmentCommit) -> Result<Enrollment, StoreError> {
        self.inner.commit(commit).await
    }

    async fn record_failure(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        message: String,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.record_failure(id, expected_version, message, at).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        self.inner.get(id).await
    }
}

impl StepCatalog for FlakyStore {
    async fn sequence(&self, id: Uuid) -> Result<Option<Sequence>, StoreError> {
        self.inner.sequence(id).await
    }

    async fn step_at(&self, sequence_id: Uuid, step_index: u32) -> Result<Option<Step>, StoreError> {
        self.inner.step_at(sequence_id, step_index).await
    }

    async fn next_step_after(
        &self,
        sequence_id: Uuid,
        step_index: u32,
    ) -> Result<Option<Step>, StoreError> {
        self.inner.next_step_after(sequence_id, step_index).await
    }
}

impl CustomerDirectory for FlakyStore {
    async fn customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        if self.fail_customers.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("replica lag".into()));
        }
        let customer = self.inner.customer(id).await;
        if self.slow_customers.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        customer
    }

    async fn business(&self, id: Uuid) -> Result<Option<Business>, StoreError> {
        self.inner.business(id).await
    }

    async fn reserve_contact(
        &self,
        customer_id: Uuid,
        observed: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.reserve_contact(customer_id, observed, at).await
    }

    async fn release_contact(
        &self,
        customer_id: Uuid,
        at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.inner.release_contact(customer_id, at, previous).await
    }
}

#[tokio::test]
async fn test_fetch_failure_fails_the_invocation() {
    let store = FlakyStore::default();
    store.inner.seed_demo_data(t0()).unwrap();
    store.fail_fetch.store(true, Ordering::SeqCst);

    let exec = executor(SendFailurePolicy::default());
    let err = exec.execute_batch(&store, t0(), 50).await.unwrap_err();
    assert!(matches!(err, CadenceError::StoreRead(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_per_enrollment_failure_is_recorded_and_batch_continues() {
    let store = FlakyStore::default();
    let seed = store.inner.seed_demo_data(t0()).unwrap();
    store.fail_customers.store(true, Ordering::SeqCst);

    let exec = executor(SendFailurePolicy::default());
    let report = exec.execute_batch(&store, t0(), 50).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failures, 3);
    assert_eq!(report.sent, 0);

    for id in seed.enrollment_ids {
        let enrollment = store.get(id).await.unwrap().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.current_step_index, 0);
        assert!(enrollment.claimed_until.is_none());
        assert!(enrollment
            .meta_str(meta_keys::LAST_ERROR)
            .is_some_and(|e| e.contains("replica lag")));
    }

    // Once the directory recovers the same enrollments go through.
    store.fail_customers.store(false, Ordering::SeqCst);
    let report = exec.execute_batch(&store, t0(), 50).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.sent, 2);
    assert_eq!(report.blocked, 1);
}
