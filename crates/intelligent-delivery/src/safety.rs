//! Message-safety gate — decides whether a customer may be messaged right
//! now. Opt-out flags always win over the contact cooldown.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use cadence_core::config::SafetyConfig;
use cadence_core::types::{Channel, Customer};

/// Why a send was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Unsubscribed,
    Dnc,
    HardBounced,
    /// Contacted too recently; `remaining` is the time left in the window.
    Cooldown { remaining: Duration },
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Unsubscribed => "unsubscribed",
            BlockReason::Dnc => "dnc",
            BlockReason::HardBounced => "hard_bounced",
            BlockReason::Cooldown { .. } => "cooldown",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allowed,
    Blocked(BlockReason),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allowed)
    }

    pub fn reason(&self) -> Option<&BlockReason> {
        match self {
            SafetyDecision::Allowed => None,
            SafetyDecision::Blocked(reason) => Some(reason),
        }
    }
}

/// Applies the opt-out flags and the contact cooldown to a customer.
///
/// The gate is pure: recording `last_contacted_at` after a successful send
/// is the store's job, done in the same commit as the step advance.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    cooldown: Duration,
}

impl SafetyGate {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(Duration::hours(i64::from(config.cooldown_hours)))
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Evaluate the gate. First match wins: unsubscribed, dnc, hard bounce,
    /// then cooldown.
    pub fn can_send(&self, customer: &Customer, channel: Channel, now: DateTime<Utc>) -> SafetyDecision {
        let decision = if customer.unsubscribed {
            SafetyDecision::Blocked(BlockReason::Unsubscribed)
        } else if customer.dnc {
            SafetyDecision::Blocked(BlockReason::Dnc)
        } else if customer.hard_bounced {
            SafetyDecision::Blocked(BlockReason::HardBounced)
        } else if let Some(remaining) = self.cooldown_remaining(customer, now) {
            SafetyDecision::Blocked(BlockReason::Cooldown { remaining })
        } else {
            SafetyDecision::Allowed
        };

        debug!(
            customer_id = %customer.id,
            channel = %channel,
            allowed = decision.is_allowed(),
            reason = decision.reason().map(BlockReason::as_str),
            "safety gate evaluated"
        );
        decision
    }

    /// Time left before `customer` may be contacted again, or `None` when
    /// the cooldown has elapsed. Elapsed time equal to the cooldown is clear.
    pub fn cooldown_remaining(&self, customer: &Customer, now: DateTime<Utc>) -> Option<Duration> {
        let last = customer.last_contacted_at?;
        let elapsed = now - last;
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default())
    }
}
