use serde::{Deserialize, Serialize};

use cadence_core::error::StoreError;
use cadence_core::types::EnrollmentStatus;

/// Describes a single valid status transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// status transitions. `Finished` is terminal.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub transitions: Vec<StatusTransition>,
}

impl EnrollmentStateMachine {
    pub fn new() -> Self {
        let transition = |from, to, trigger: &str| StatusTransition {
            from,
            to,
            trigger: trigger.to_string(),
        };
        let transitions = vec![
            // Active ->
            transition(EnrollmentStatus::Active, EnrollmentStatus::Finished, "sequence_complete"),
            transition(EnrollmentStatus::Active, EnrollmentStatus::Error, "blocked_or_failed"),
            transition(EnrollmentStatus::Active, EnrollmentStatus::Paused, "operator_pause"),
            // Paused ->
            transition(EnrollmentStatus::Paused, EnrollmentStatus::Active, "operator_resume"),
            transition(EnrollmentStatus::Paused, EnrollmentStatus::Error, "operator_abandon"),
            // Error ->
            transition(EnrollmentStatus::Error, EnrollmentStatus::Active, "operator_retry"),
        ];
        Self { transitions }
    }

    /// Staying in the same status is always allowed.
    pub fn can_transition(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        from == to || self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    pub fn check(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> Result<(), StoreError> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition(format!(
                "{} -> {}",
                from.as_str(),
                to.as_str()
            )))
        }
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
