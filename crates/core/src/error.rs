use thiserror::Error;
use uuid::Uuid;

pub type CadenceResult<T> = Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Store read error: {0}")]
    StoreRead(#[source] StoreError),

    #[error("Store write error: {0}")]
    StoreWrite(#[source] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Failures reported by the enrollment/customer store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Another writer moved the row (enrollment or customer) first.
    #[error("version conflict on {id}")]
    Conflict { id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("customer {customer_id} already has an active enrollment in sequence {sequence_id}")]
    DuplicateActive { sequence_id: Uuid, customer_id: Uuid },

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Failures reported by the message gateway for a single send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("customer has no {channel} address")]
    MissingRecipient { channel: &'static str },

    #[error("provider rejected message: {0}")]
    Rejected(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}
