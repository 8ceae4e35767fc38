use chrono::NaiveDateTime;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{OccurrenceStatus, Slot};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {kind} {id}")]
    NotFound { kind: &'static str, id: Ulid },

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("occurrence {id} starts at {starts_at}, which is already in the past")]
    PastSlot { id: Ulid, starts_at: NaiveDateTime },

    #[error("caregiver {caregiver_id} is already committed on {slot} (occurrence {occurrence_id})")]
    Conflict {
        caregiver_id: Ulid,
        slot: Slot,
        occurrence_id: Ulid,
    },

    #[error("caregiver {caregiver_id} has blocked {slot}")]
    Blocked { caregiver_id: Ulid, slot: Slot },

    #[error("caregiver {0} is inactive")]
    Inactive(Ulid),

    #[error("caregiver {caregiver_id} does not offer {service}")]
    ServiceNotOffered { caregiver_id: Ulid, service: &'static str },

    #[error("cannot move occurrence from {from} to {to}")]
    InvalidTransition {
        from: OccurrenceStatus,
        to: OccurrenceStatus,
    },

    #[error("occurrence {id} is at version {actual}, expected {expected}")]
    StaleVersion { id: Ulid, expected: u64, actual: u64 },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { kind, id }
    }

    /// Caregiver unavailable for the requested slot.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::Blocked { .. } | EngineError::Inactive(_)
        )
    }
}
