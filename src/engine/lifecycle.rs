//! Occurrence lifecycle.
//!
//! ```text
//! PENDING ──assign──▶ ASSIGNED ──confirm──▶ CONFIRMED ──complete──▶ COMPLETED
//!    ▲                  │  ▲ reassign
//!    └────unassign──────┘──┘
//! any non-terminal ──cancel──▶ CANCELLED
//! ```

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Admin mutation on one occurrence. A `caregiver_id` implies the ASSIGN transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationCommand {
    pub occurrence_id: Ulid,
    pub caregiver_id: Option<Ulid>,
    pub status: Option<OccurrenceStatus>,
    pub admin_notes: Option<String>,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Assign {
        caregiver_id: Ulid,
        admin_notes: Option<String>,
    },
    SetStatus {
        to: OccurrenceStatus,
        admin_notes: Option<String>,
    },
    EditNotes {
        admin_notes: Option<String>,
    },
}

impl Transition {
    /// Decide which transition a command asks for and whether the current status allows it.
    pub fn plan(current: &BookingOccurrence, cmd: &MutationCommand) -> Result<Self, EngineError> {
        let notes = cmd.admin_notes.clone();

        if let Some(caregiver_id) = cmd.caregiver_id {
            if let Some(status) = cmd.status
                && status != OccurrenceStatus::Assigned
            {
                return Err(EngineError::Validation(format!(
                    "caregiverId implies ASSIGNED, got status {status}"
                )));
            }
            return match current.status {
                OccurrenceStatus::Pending | OccurrenceStatus::Assigned => Ok(Transition::Assign {
                    caregiver_id,
                    admin_notes: notes,
                }),
                from => Err(EngineError::InvalidTransition {
                    from,
                    to: OccurrenceStatus::Assigned,
                }),
            };
        }

        if let Some(to) = cmd.status {
            if to == OccurrenceStatus::Assigned {
                return Err(EngineError::Validation(
                    "assigning requires a caregiverId".into(),
                ));
            }
            if !status_transition_allowed(current.status, to) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            return Ok(Transition::SetStatus {
                to,
                admin_notes: notes,
            });
        }

        match notes {
            Some(n) => Ok(Transition::EditNotes {
                admin_notes: Some(n).filter(|n| !n.trim().is_empty()),
            }),
            None => Err(EngineError::Validation(
                "nothing to update: supply caregiverId, status or adminNotes".into(),
            )),
        }
    }

    pub fn action(&self) -> DecisionAction {
        match self {
            Transition::Assign { .. } => DecisionAction::Assign,
            Transition::SetStatus { .. } => DecisionAction::StatusChange,
            Transition::EditNotes { .. } => DecisionAction::Update,
        }
    }
}

/// Status changes reachable without a caregiver id.
pub fn status_transition_allowed(from: OccurrenceStatus, to: OccurrenceStatus) -> bool {
    use OccurrenceStatus::*;
    matches!(
        (from, to),
        (Pending, Cancelled)
            | (Assigned, Confirmed)
            | (Assigned, Pending)
            | (Assigned, Cancelled)
            | (Confirmed, Completed)
            | (Confirmed, Cancelled)
    )
}

/// Note written on ASSIGN when the admin supplies none.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNotePolicy;

impl DefaultNotePolicy {
    pub fn resolve(&self, supplied: Option<String>, caregiver: &CaregiverProfile, slot: &Slot) -> String {
        supplied
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Assigned to {} for {slot}", caregiver.name))
    }
}
