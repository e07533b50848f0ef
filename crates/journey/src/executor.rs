//! Batch executor: advances due enrollments through their sequences.
//!
//! One invocation fetches up to `batch_limit` due enrollments and processes
//! them sequentially. Each enrollment is claimed (lease plus version bump)
//! before anything is sent, and every write after that is conditional on the
//! claimed version, so overlapping invocations never message the same
//! enrollment twice for one step.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use cadence_channels::gateway::{MessageGateway, OutboundMessage};
use cadence_core::config::{AppConfig, ExecutorConfig, SendFailureMode};
use cadence_core::error::{CadenceError, CadenceResult, GatewayError, StoreError};
use cadence_core::event_bus::{make_event, EventSink, JourneyEventType};
use cadence_core::templates::{self, TemplateVariables};
use cadence_core::types::{
    meta_keys, Channel, Enrollment, EnrollmentStatus, SequenceStatus, Step, StepAction, StepTiming,
};
use cadence_intelligent_delivery::safety::{BlockReason, SafetyDecision, SafetyGate};
use cadence_intelligent_delivery::send_time::SendTimePlanner;

use crate::store::{ContactStamp, EnrollmentCommit, EnrollmentPatch, JourneyStore};

/// What to do when the gateway refuses a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SendFailurePolicy {
    /// Count the error and advance to the next step anyway (fail-open).
    Advance,
    /// Stay on the step and retry on a later invocation; after
    /// `max_attempts` consecutive failures the enrollment moves to `error`.
    Retry { max_attempts: u32 },
}

impl SendFailurePolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        match config.on_send_failure {
            SendFailureMode::Advance => SendFailurePolicy::Advance,
            SendFailureMode::Retry => SendFailurePolicy::Retry {
                max_attempts: config.max_send_attempts.max(1),
            },
        }
    }
}

impl Default for SendFailurePolicy {
    fn default() -> Self {
        SendFailurePolicy::Retry { max_attempts: 3 }
    }
}

/// Counters for one `execute_batch` invocation.
///
/// `sent + errors <= processed <= batch_limit` always holds: each processed
/// enrollment makes at most one send attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Enrollments claimed and worked on by this invocation.
    pub processed: usize,
    pub sent: usize,
    /// Send attempts that failed, including missing recipient addresses.
    pub errors: usize,
    pub finished: usize,
    pub blocked: usize,
    /// Failed sends left on their step for a later attempt.
    pub retried: usize,
    /// Enrollments pushed back because their sequence is not active.
    pub deferred: usize,
    /// Enrollments owned by a concurrent invocation.
    pub skipped: usize,
    /// Enrollments whose processing raised an error (store or otherwise).
    pub failures: usize,
}

enum Outcome {
    Advanced,
    Finished,
    Blocked,
    Retrying,
    Errored,
    Deferred,
}

enum SendOutcome {
    Sent(ContactStamp, String),
    Blocked,
    Failed(GatewayError),
}

/// Advances due enrollments. Generic over the message gateway; the store is
/// handed in per invocation.
pub struct BatchExecutor<G> {
    gateway: G,
    gate: SafetyGate,
    planner: SendTimePlanner,
    policy: SendFailurePolicy,
    lease: Duration,
    paused_recheck: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl<G: MessageGateway> BatchExecutor<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            gate: SafetyGate::default(),
            planner: SendTimePlanner::default(),
            policy: SendFailurePolicy::default(),
            lease: Duration::minutes(5),
            paused_recheck: Duration::hours(1),
            event_sink: cadence_core::event_bus::noop_sink(),
        }
    }

    pub fn from_config(config: &AppConfig, gateway: G) -> CadenceResult<Self> {
        let executor = &config.executor;
        Ok(Self {
            gateway,
            gate: SafetyGate::from_config(&config.safety),
            planner: SendTimePlanner::from_config(&config.send_time)?,
            policy: SendFailurePolicy::from_config(executor),
            lease: seconds(executor.claim_lease_secs),
            paused_recheck: seconds(executor.paused_sequence_recheck_secs),
            event_sink: cadence_core::event_bus::noop_sink(),
        })
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_safety_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_planner(mut self, planner: SendTimePlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_failure_policy(mut self, policy: SendFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Process up to `batch_limit` due enrollments. Only a failure to fetch
    /// the batch fails the call; per-enrollment errors are recorded on the
    /// enrollment and counted in `failures`.
    pub async fn execute_batch<S: JourneyStore>(
        &self,
        store: &S,
        now: DateTime<Utc>,
        batch_limit: usize,
    ) -> CadenceResult<BatchReport> {
        let due = store
            .fetch_due(now, batch_limit)
            .await
            .map_err(CadenceError::StoreRead)?;
        debug!(due = due.len(), batch_limit, "fetched due enrollments");

        let mut report = BatchReport::default();
        let lease_until = now
            .checked_add_signed(self.lease)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        for candidate in due.into_iter().take(batch_limit) {
            let id = candidate.id;
            let enrollment = match store.claim(id, candidate.version, now, lease_until).await {
                Ok(enrollment) => enrollment,
                Err(err) if err.is_conflict() => {
                    debug!(enrollment_id = %id, "enrollment owned by another invocation");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(enrollment_id = %id, error = %err, "failed to claim enrollment");
                    report.processed += 1;
                    report.failures += 1;
                    continue;
                }
            };

            report.processed += 1;
            match self.process(store, &enrollment, now, &mut report).await {
                Ok(Outcome::Advanced) => {}
                Ok(Outcome::Finished) => report.finished += 1,
                Ok(Outcome::Blocked) => report.blocked += 1,
                Ok(Outcome::Retrying) => report.retried += 1,
                Ok(Outcome::Errored) => {}
                Ok(Outcome::Deferred) => report.deferred += 1,
                Err(err) => {
                    report.failures += 1;
                    error!(enrollment_id = %id, error = %err, "enrollment processing failed");
                    if let Err(record_err) = store
                        .record_failure(id, Some(enrollment.version), err.to_string(), now)
                        .await
                    {
                        error!(
                            enrollment_id = %id,
                            error = %record_err,
                            "failed to record enrollment error"
                        );
                    }
                }
            }
        }

        metrics::counter!("journey.executor.processed").increment(report.processed as u64);
        metrics::counter!("journey.executor.sent").increment(report.sent as u64);
        metrics::counter!("journey.executor.errors").increment(report.errors as u64);
        metrics::counter!("journey.executor.blocked").increment(report.blocked as u64);
        metrics::counter!("journey.executor.failures").increment(report.failures as u64);

        info!(
            processed = report.processed,
            sent = report.sent,
            errors = report.errors,
            finished = report.finished,
            blocked = report.blocked,
            skipped = report.skipped,
            failures = report.failures,
            "journey batch complete"
        );
        Ok(report)
    }

    async fn process<S: JourneyStore>(
        &self,
        store: &S,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) -> CadenceResult<Outcome> {
        let step = store
            .step_at(enrollment.sequence_id, enrollment.current_step_index)
            .await
            .map_err(CadenceError::StoreRead)?;
        let Some(step) = step else {
            debug!(
                enrollment_id = %enrollment.id,
                step_index = enrollment.current_step_index,
                "no step at index, finishing enrollment"
            );
            self.commit(store, EnrollmentCommit::new(enrollment, finish_patch(now))).await?;
            self.emit(JourneyEventType::EnrollmentFinished, enrollment, None, now);
            return Ok(Outcome::Finished);
        };

        let sequence = store
            .sequence(enrollment.sequence_id)
            .await
            .map_err(CadenceError::StoreRead)?;
        if let Some(sequence) = sequence.filter(|s| s.status != SequenceStatus::Active) {
            let retry_at = now
                .checked_add_signed(self.paused_recheck)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.commit(
                store,
                EnrollmentCommit::new(enrollment, EnrollmentPatch::new().next_run_at(retry_at)),
            )
            .await?;
            debug!(
                enrollment_id = %enrollment.id,
                sequence_id = %sequence.id,
                status = sequence.status.as_str(),
                "sequence not active, deferring"
            );
            self.emit(
                JourneyEventType::EnrollmentDeferred,
                enrollment,
                Some(format!("sequence {}", sequence.status.as_str())),
                now,
            );
            return Ok(Outcome::Deferred);
        }

        let mut patch = EnrollmentPatch::new();
        let mut contact = None;
        if step.action.channel().is_some() {
            match self.send_step(store, enrollment, &step, now).await? {
                SendOutcome::Sent(stamp, provider_message_id) => {
                    report.sent += 1;
                    contact = Some(stamp);
                    patch = patch.meta(meta_keys::PROVIDER_MESSAGE_ID, provider_message_id);
                }
                SendOutcome::Blocked => return Ok(Outcome::Blocked),
                SendOutcome::Failed(err) => {
                    report.errors += 1;
                    self.emit(
                        JourneyEventType::MessageFailed,
                        enrollment,
                        Some(err.to_string()),
                        now,
                    );
                    match self.policy {
                        SendFailurePolicy::Advance => {
                            warn!(
                                enrollment_id = %enrollment.id,
                                error = %err,
                                "send failed, advancing anyway"
                            );
                            patch = patch
                                .meta(meta_keys::LAST_ERROR, err.to_string())
                                .meta(meta_keys::LAST_ERROR_AT, now.to_rfc3339());
                        }
                        SendFailurePolicy::Retry { max_attempts } => {
                            return self.fail_send(store, enrollment, &err, max_attempts, now).await;
                        }
                    }
                }
            }
        }

        self.advance(store, enrollment, &step, patch, contact, now).await
    }

    /// Render, gate and send the message for a send step.
    async fn send_step<S: JourneyStore>(
        &self,
        store: &S,
        enrollment: &Enrollment,
        step: &Step,
        now: DateTime<Utc>,
    ) -> CadenceResult<SendOutcome> {
        let customer = store
            .customer(enrollment.customer_id)
            .await
            .map_err(CadenceError::StoreRead)?
            .ok_or(CadenceError::StoreRead(StoreError::NotFound {
                entity: "customer",
                id: enrollment.customer_id,
            }))?;
        let business = store
            .business(enrollment.business_id)
            .await
            .map_err(CadenceError::StoreRead)?;

        let (channel, subject, body) = match &step.action {
            StepAction::SendEmail { subject, body } => {
                (Channel::Email, Some(subject.as_str()), body.as_str())
            }
            StepAction::SendSms { body } => (Channel::Sms, None, body.as_str()),
            StepAction::Wait => {
                return Err(CadenceError::Internal(anyhow::anyhow!(
                    "step {} is not a send step",
                    step.step_index
                )))
            }
        };

        let variables = TemplateVariables::for_recipient(&customer, business.as_ref());
        let subject = subject.map(|s| templates::resolve(s, &variables));
        let body = templates::resolve(body, &variables);
        let unresolved = templates::placeholders(&body);
        if !unresolved.is_empty() {
            warn!(
                enrollment_id = %enrollment.id,
                step_index = step.step_index,
                placeholders = ?unresolved,
                "template has unresolved placeholders"
            );
        }

        if let SafetyDecision::Blocked(reason) = self.gate.can_send(&customer, channel, now) {
            return self.block(store, enrollment, reason, now).await;
        }

        let Some(recipient) = customer.address_for(channel) else {
            return Ok(SendOutcome::Failed(GatewayError::MissingRecipient {
                channel: channel.as_str(),
            }));
        };

        // The gate read a snapshot; only one sender may move the stamp on
        // from the value it saw.
        let observed = customer.last_contacted_at;
        let reserved = self.gate.cooldown() > Duration::zero();
        let reserve = if reserved {
            store.reserve_contact(customer.id, observed, now).await
        } else {
            Ok(())
        };
        match reserve {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                debug!(
                    enrollment_id = %enrollment.id,
                    customer_id = %customer.id,
                    "customer contacted by a concurrent send"
                );
                let reason = BlockReason::Cooldown {
                    remaining: self.gate.cooldown(),
                };
                return self.block(store, enrollment, reason, now).await;
            }
            Err(err) => return Err(CadenceError::StoreWrite(err)),
        }

        let message = OutboundMessage {
            channel,
            recipient: recipient.to_string(),
            subject,
            body,
            enrollment_id: enrollment.id,
            customer_id: customer.id,
        };
        match self.gateway.send(&message).await {
            Ok(receipt) => {
                info!(
                    enrollment_id = %enrollment.id,
                    channel = %channel,
                    provider_message_id = %receipt.provider_message_id,
                    "message sent"
                );
                self.emit(
                    JourneyEventType::MessageSent,
                    enrollment,
                    Some(receipt.provider_message_id.clone()),
                    now,
                );
                Ok(SendOutcome::Sent(
                    ContactStamp {
                        customer_id: customer.id,
                        contacted_at: now,
                    },
                    receipt.provider_message_id,
                ))
            }
            Err(err) => {
                if reserved {
                    if let Err(release_err) = store.release_contact(customer.id, now, observed).await
                    {
                        warn!(
                            customer_id = %customer.id,
                            error = %release_err,
                            "failed to release contact slot"
                        );
                    }
                }
                Ok(SendOutcome::Failed(err))
            }
        }
    }

    /// Terminal safety block: the enrollment moves to `error` with the
    /// reason recorded in its meta.
    async fn block<S: JourneyStore>(
        &self,
        store: &S,
        enrollment: &Enrollment,
        reason: BlockReason,
        now: DateTime<Utc>,
    ) -> CadenceResult<SendOutcome> {
        let patch = EnrollmentPatch::new()
            .status(EnrollmentStatus::Error)
            .touched(now)
            .meta(meta_keys::BLOCK_REASON, reason.as_str())
            .meta(meta_keys::BLOCKED_AT, now.to_rfc3339());
        self.commit(store, EnrollmentCommit::new(enrollment, patch)).await?;
        info!(
            enrollment_id = %enrollment.id,
            customer_id = %enrollment.customer_id,
            reason = %reason,
            "send blocked by safety gate"
        );
        metrics::counter!("journey.safety.blocked", "reason" => reason.as_str()).increment(1);
        self.emit(
            JourneyEventType::EnrollmentBlocked,
            enrollment,
            Some(reason.as_str().to_string()),
            now,
        );
        Ok(SendOutcome::Blocked)
    }

    /// Retry bookkeeping after a failed send: stay on the step, or give up
    /// once the attempt budget is spent.
    async fn fail_send<S: JourneyStore>(
        &self,
        store: &S,
        enrollment: &Enrollment,
        err: &GatewayError,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> CadenceResult<Outcome> {
        let attempts = enrollment.failed_sends.saturating_add(1);
        let mut patch = EnrollmentPatch::new()
            .failed_sends(attempts)
            .touched(now)
            .meta(meta_keys::LAST_ERROR, err.to_string())
            .meta(meta_keys::LAST_ERROR_AT, now.to_rfc3339());

        if attempts >= max_attempts {
            patch = patch.status(EnrollmentStatus::Error);
            self.commit(store, EnrollmentCommit::new(enrollment, patch)).await?;
            warn!(
                enrollment_id = %enrollment.id,
                attempts,
                error = %err,
                "send attempts exhausted, enrollment errored"
            );
            self.emit(
                JourneyEventType::EnrollmentErrored,
                enrollment,
                Some(err.to_string()),
                now,
            );
            return Ok(Outcome::Errored);
        }

        self.commit(store, EnrollmentCommit::new(enrollment, patch)).await?;
        warn!(
            enrollment_id = %enrollment.id,
            attempts,
            max_attempts,
            error = %err,
            "send failed, will retry"
        );
        Ok(Outcome::Retrying)
    }

    /// Move to the next step, or finish when there is none. The contact
    /// stamp of a successful send rides on the same commit.
    async fn advance<S: JourneyStore>(
        &self,
        store: &S,
        enrollment: &Enrollment,
        step: &Step,
        patch: EnrollmentPatch,
        contact: Option<ContactStamp>,
        now: DateTime<Utc>,
    ) -> CadenceResult<Outcome> {
        let next = store
            .next_step_after(enrollment.sequence_id, step.step_index)
            .await
            .map_err(CadenceError::StoreRead)?;

        let (patch, outcome) = match &next {
            Some(next) => {
                let run_at = self.schedule(next, now);
                (
                    patch.step(next.step_index, run_at).failed_sends(0).touched(now),
                    Outcome::Advanced,
                )
            }
            None => (
                patch
                    .status(EnrollmentStatus::Finished)
                    .failed_sends(0)
                    .touched(now),
                Outcome::Finished,
            ),
        };

        let mut commit = EnrollmentCommit::new(enrollment, patch);
        if let Some(stamp) = contact {
            commit = commit.with_contact(stamp);
        }
        let committed = self.commit(store, commit).await?;

        match outcome {
            Outcome::Finished => {
                info!(enrollment_id = %enrollment.id, "enrollment finished");
                self.emit(JourneyEventType::EnrollmentFinished, enrollment, None, now);
            }
            _ => {
                debug!(
                    enrollment_id = %enrollment.id,
                    from = step.step_index,
                    to = committed.current_step_index,
                    next_run_at = %committed.next_run_at,
                    "enrollment advanced"
                );
                self.emit(
                    JourneyEventType::StepAdvanced,
                    &committed,
                    Some(format!("{} -> {}", step.step_index, committed.current_step_index)),
                    now,
                );
            }
        }
        Ok(outcome)
    }

    /// When `step` becomes due once the enrollment moves onto it.
    fn schedule(&self, step: &Step, now: DateTime<Utc>) -> DateTime<Utc> {
        let wait = Duration::milliseconds(i64::try_from(step.wait_ms).unwrap_or(i64::MAX));
        let due = now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC);
        match step.timing {
            StepTiming::Delay => due,
            StepTiming::Optimal => self.planner.best_send_at(None, due),
        }
    }

    async fn commit<S: JourneyStore>(
        &self,
        store: &S,
        commit: EnrollmentCommit,
    ) -> CadenceResult<Enrollment> {
        store.commit(commit).await.map_err(CadenceError::StoreWrite)
    }

    fn emit(
        &self,
        event_type: JourneyEventType,
        enrollment: &Enrollment,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.event_sink.emit(make_event(
            event_type,
            enrollment.id,
            Some(enrollment.customer_id),
            Some(enrollment.current_step_index),
            detail,
            now,
        ));
    }
}

fn finish_patch(now: DateTime<Utc>) -> EnrollmentPatch {
    EnrollmentPatch::new()
        .status(EnrollmentStatus::Finished)
        .touched(now)
}

/// Whole seconds as a chrono duration, clamped to what chrono can represent.
fn seconds(value: u64) -> Duration {
    const MAX_SECS: u64 = (i64::MAX / 1_000) as u64;
    Duration::seconds(value.min(MAX_SECS) as i64)
}
