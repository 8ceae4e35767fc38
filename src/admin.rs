//! Admin entry points: listing, mutation and deletion of bookings.
//!
//! Guard order on every call: authorization, identifier validation, then the engine
//! (row lookup, past slot, version, transition, availability).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use ulid::Ulid;

use crate::auth::{AuthContext, AuthError};
use crate::engine::{EligibilityCache, Engine, EngineError, MutationCommand, Page};
use crate::model::*;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid {field}: {value:?}")]
    InvalidId { field: &'static str, value: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub include_unavailable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub occurrence_id: Option<String>,
    pub caregiver_id: Option<String>,
    pub status: Option<String>,
    pub admin_notes: Option<String>,
    pub expected_version: Option<u64>,
}

/// Exactly one of the two ids.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionRequest {
    pub occurrence_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedKind {
    Occurrence,
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionResponse {
    pub deleted: DeletedKind,
    pub id: Ulid,
    pub occurrences_removed: usize,
    pub notified: usize,
}

pub struct AdminService {
    engine: Arc<Engine>,
}

impl AdminService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Request trees with eligible caregivers. One fresh cache per call.
    pub async fn list(&self, auth: &AuthContext, query: ListingQuery) -> Result<Vec<RequestTree>, AdminError> {
        auth.require_admin()?;
        let page = Page {
            limit: query.limit,
            offset: query.offset.unwrap_or(0),
        };
        let cache = EligibilityCache::new();
        self.engine
            .list_requests(page, query.include_unavailable, &cache)
            .await
            .map_err(logged)
    }

    pub async fn mutate(&self, auth: &AuthContext, req: MutationRequest) -> Result<BookingOccurrence, AdminError> {
        let admin = auth.require_admin()?;
        let occurrence_id = required_id("occurrenceId", req.occurrence_id.as_deref())?;
        let caregiver_id = optional_id("caregiverId", req.caregiver_id.as_deref())?;
        let status = req
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_status)
            .transpose()?;

        let cmd = MutationCommand {
            occurrence_id,
            caregiver_id,
            status,
            admin_notes: req.admin_notes,
            expected_version: req.expected_version,
        };
        self.engine
            .apply_mutation(admin.admin_id(), cmd)
            .await
            .map_err(logged)
    }

    pub async fn delete(&self, auth: &AuthContext, req: DeletionRequest) -> Result<DeletionResponse, AdminError> {
        let admin = auth.require_admin()?;
        let occurrence_id = optional_id("occurrenceId", req.occurrence_id.as_deref())?;
        let request_id = optional_id("requestId", req.request_id.as_deref())?;
        let (deleted, id, report) = match (occurrence_id, request_id) {
            (Some(id), None) => (
                DeletedKind::Occurrence,
                id,
                self.engine.delete_occurrence(admin.admin_id(), id).await,
            ),
            (None, Some(id)) => (
                DeletedKind::Request,
                id,
                self.engine.delete_request(admin.admin_id(), id).await,
            ),
            _ => {
                return Err(AdminError::BadRequest(
                    "supply exactly one of occurrenceId or requestId".into(),
                ));
            }
        };
        let report = report.map_err(logged)?;
        Ok(DeletionResponse {
            deleted,
            id,
            occurrences_removed: report.occurrences_removed,
            notified: report.recipients,
        })
    }
}

fn logged(e: EngineError) -> AdminError {
    if let EngineError::WalError(msg) = &e {
        error!(error = %msg, "persistence failure");
    }
    AdminError::Engine(e)
}

fn required_id(field: &'static str, value: Option<&str>) -> Result<Ulid, AdminError> {
    optional_id(field, value)?.ok_or(AdminError::InvalidId {
        field,
        value: String::new(),
    })
}

/// Blank counts as absent.
fn optional_id(field: &'static str, value: Option<&str>) -> Result<Option<Ulid>, AdminError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => Ulid::from_string(v).map(Some).map_err(|_| AdminError::InvalidId {
            field,
            value: v.to_string(),
        }),
    }
}

fn parse_status(value: &str) -> Result<OccurrenceStatus, AdminError> {
    [
        OccurrenceStatus::Pending,
        OccurrenceStatus::Assigned,
        OccurrenceStatus::Confirmed,
        OccurrenceStatus::Completed,
        OccurrenceStatus::Cancelled,
    ]
    .into_iter()
    .find(|s| s.as_str().eq_ignore_ascii_case(value))
    .ok_or_else(|| AdminError::BadRequest(format!("unknown status {value:?}")))
}
