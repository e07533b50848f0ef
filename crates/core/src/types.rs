use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Meta keys written by the executor into `Enrollment::meta`.
pub mod meta_keys {
    pub const LAST_ERROR: &str = "last_error";
    pub const LAST_ERROR_AT: &str = "last_error_at";
    pub const BLOCK_REASON: &str = "block_reason";
    pub const BLOCKED_AT: &str = "blocked_at";
    pub const PROVIDER_MESSAGE_ID: &str = "last_provider_message_id";
}

/// Lifecycle status of a sequence definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Draft => "draft",
            SequenceStatus::Active => "active",
            SequenceStatus::Paused => "paused",
        }
    }
}

/// An ordered messaging campaign. Sequences do not change while enrollments
/// are executing against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub status: SequenceStatus,
}

/// What a step does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepAction {
    SendEmail { subject: String, body: String },
    SendSms { body: String },
    Wait,
}

impl StepAction {
    /// The outbound channel for send steps, `None` for waits.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            StepAction::SendEmail { .. } => Some(Channel::Email),
            StepAction::SendSms { .. } => Some(Channel::Sms),
            StepAction::Wait => None,
        }
    }
}

/// How the executor schedules a step once the enrollment reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTiming {
    /// Due exactly `wait_ms` after the previous step ran.
    #[default]
    Delay,
    /// Due at the heuristic send time computed from `now + wait_ms`.
    Optimal,
}

/// One entry of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub step_index: u32,
    pub action: StepAction,
    /// Delay before this step becomes due once the enrollment moves onto it.
    pub wait_ms: u64,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub timing: StepTiming,
}

/// Runtime status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Finished,
    Paused,
    Error,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Finished => "finished",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Error => "error",
        }
    }
}

/// A customer's progress through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub business_id: Uuid,
    pub sequence_id: Uuid,
    pub customer_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_step_index: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Optimistic concurrency counter, bumped on every store write.
    #[serde(default)]
    pub version: u64,
    /// Lease held by the invocation currently processing this enrollment.
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    /// Consecutive gateway failures on the current step.
    #[serde(default)]
    pub failed_sends: u32,
}

impl Enrollment {
    /// A fresh active enrollment positioned at `first_step_index`.
    pub fn new(
        business_id: Uuid,
        sequence_id: Uuid,
        customer_id: Uuid,
        first_step_index: u32,
        next_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            business_id,
            sequence_id,
            customer_id,
            status: EnrollmentStatus::Active,
            current_step_index: first_step_index,
            next_run_at,
            last_event_at: None,
            meta: serde_json::Map::new(),
            version: 0,
            claimed_until: None,
            failed_sends: 0,
        }
    }

    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active && self.next_run_at <= now && !self.is_claimed(now)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }
}

/// A message recipient together with their safety flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub business_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub unsubscribed: bool,
    #[serde(default)]
    pub dnc: bool,
    #[serde(default)]
    pub hard_bounced: bool,
    #[serde(default)]
    pub last_contacted_at: Option<DateTime<Utc>>,
}

impl Customer {
    /// Address to use for `channel`, if the customer has one.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let address = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        };
        address.filter(|a| !a.trim().is_empty())
    }

    pub fn full_name(&self) -> Option<String> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.to_string()),
            (None, Some(last)) => Some(last.to_string()),
            (None, None) => None,
        }
    }
}

/// The business sending the messages. Supplies `business.*` and `links.*`
/// template variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

/// Outbound delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
