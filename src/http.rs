//! HTTP surface for the admin bookings API.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, warn};

use crate::admin::{AdminError, AdminService, DeletionRequest, DeletionResponse, ListingQuery, MutationRequest};
use crate::auth::{AuthContext, AuthError, TokenAuthority};
use crate::engine::EngineError;
use crate::model::{BookingOccurrence, RequestTree};

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
    pub tokens: Arc<TokenAuthority>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/admin/bookings",
            get(list_bookings).patch(mutate_booking).delete(delete_booking),
        )
        .with_state(state)
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::Auth(AuthError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            AdminError::Auth(AuthError::Forbidden) => StatusCode::FORBIDDEN,
            AdminError::InvalidId { .. } | AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Engine(e) => match e {
                EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::Validation(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
                EngineError::AlreadyExists(_)
                | EngineError::Conflict { .. }
                | EngineError::Blocked { .. }
                | EngineError::Inactive(_)
                | EngineError::StaleVersion { .. } => StatusCode::CONFLICT,
                EngineError::PastSlot { .. }
                | EngineError::ServiceNotOffered { .. }
                | EngineError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        if matches!(self, AdminError::Auth(_)) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn auth_context(state: &AppState, headers: &HeaderMap) -> AuthContext {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.tokens.resolve(authorization)
}

fn record(route: &'static str, started: Instant, status: StatusCode) {
    metrics::counter!(
        crate::observability::HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(crate::observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
}

fn finish<T: serde::Serialize>(route: &'static str, started: Instant, result: Result<T, AdminError>) -> Response {
    let response = match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            if e.status_code().is_client_error() {
                warn!(route, error = %e, "request rejected");
            }
            e.into_response()
        }
    };
    record(route, started, response.status());
    response
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let store = &state.admin.engine().store;
    Json(json!({
        "status": "ok",
        "requests": store.requests().len(),
        "occurrences": store.occurrence_count(),
    }))
}

async fn list_bookings(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListingQuery>, QueryRejection>,
) -> Response {
    let started = Instant::now();
    let auth = auth_context(&state, &headers);
    let result: Result<Vec<RequestTree>, AdminError> = async {
        auth.require_admin()?;
        let Query(query) = query.map_err(|e| AdminError::BadRequest(e.body_text()))?;
        state.admin.list(&auth, query).await
    }
    .await;
    finish("list_bookings", started, result)
}

async fn mutate_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<MutationRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let auth = auth_context(&state, &headers);
    let result: Result<BookingOccurrence, AdminError> = async {
        auth.require_admin()?;
        let Json(req) = payload.map_err(|e| AdminError::BadRequest(e.body_text()))?;
        state.admin.mutate(&auth, req).await
    }
    .await;
    finish("mutate_booking", started, result)
}

async fn delete_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<DeletionRequest>, QueryRejection>,
) -> Response {
    let started = Instant::now();
    let auth = auth_context(&state, &headers);
    let result: Result<DeletionResponse, AdminError> = async {
        auth.require_admin()?;
        let Query(req) = query.map_err(|e| AdminError::BadRequest(e.body_text()))?;
        state.admin.delete(&auth, req).await
    }
    .await;
    finish("delete_booking", started, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::dispatch::DispatchMode;
    use crate::dispatch::testing::{Recorder, dispatcher};
    use crate::engine::{Engine, EngineDeps, EngineSettings, FixedClock};
    use crate::geo::PostalDirectory;
    use crate::model::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use chrono::{NaiveDate, TimeZone, Utc};
    use tower::ServiceExt;
    use ulid::Ulid;

    const ADMIN: &str = "admin-token";
    const OWNER: &str = "owner-token";

    struct Fixture {
        app: Router,
        occurrence_id: Ulid,
        request_id: Ulid,
        caregiver_id: Ulid,
    }

    async fn fixture(name: &str) -> Fixture {
        let dir = std::env::temp_dir().join("petdispatch_test_http");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()));
        let engine = Arc::new(
            Engine::open(
                path,
                EngineSettings {
                    dispatch_mode: DispatchMode::Inline,
                    ..EngineSettings::default()
                },
                EngineDeps {
                    clock,
                    regions: Arc::new(PostalDirectory::default()),
                    dispatcher: Arc::new(dispatcher(Arc::new(Recorder::default()))),
                },
            )
            .unwrap(),
        );

        let owner = OwnerProfile {
            id: Ulid::new(),
            name: "Olive".into(),
            email: "olive@example.com".into(),
            phone: None,
        };
        engine.upsert_owner(owner.clone()).await.unwrap();
        let caregiver = CaregiverProfile {
            id: Ulid::new(),
            name: "Casey".into(),
            email: "casey@example.com".into(),
            phone: None,
            services: vec![ServiceKind::DogWalking],
            region: Some("Sydney".into()),
            postal_code: Some("2000".into()),
            service_radius_km: None,
            active: true,
        };
        engine.upsert_caregiver(caregiver.clone()).await.unwrap();
        let location = Location {
            city: "Sydney".into(),
            postal_code: "2000".into(),
            address: None,
            region: Some("Sydney".into()),
        };
        let request = OwnerRequest {
            id: Ulid::new(),
            owner_id: owner.id,
            service: ServiceKind::DogWalking,
            location: location.clone(),
            preferred_time: None,
            start_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            recurrence: None,
            status: RequestStatus::Active,
            notes: None,
            created_at: Utc::now(),
        };
        let occurrence = BookingOccurrence {
            id: Ulid::new(),
            request_id: request.id,
            scheduled_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            time_window: TimeWindow::Morning,
            time: None,
            service: ServiceKind::DogWalking,
            location,
            status: OccurrenceStatus::Pending,
            assigned_caregiver_id: None,
            admin_notes: None,
            version: 1,
        };
        engine
            .create_request(request.clone(), vec![occurrence.clone()])
            .await
            .unwrap();

        let tokens = TokenAuthority::new([(ADMIN.to_string(), Ulid::new())]).with_user(OWNER, owner.id, Role::Owner);
        let app = router(AppState {
            admin: Arc::new(AdminService::new(engine)),
            tokens: Arc::new(tokens),
        });
        Fixture {
            app,
            occurrence_id: occurrence.id,
            request_id: request.id,
            caregiver_id: caregiver.id,
        }
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let f = fixture("healthz.wal").await;
        let response = f
            .app
            .oneshot(request(Method::GET, "/healthz", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["occurrences"], 1);
    }

    #[tokio::test]
    async fn listing_requires_admin() {
        let f = fixture("list_auth.wal").await;
        let anonymous = f
            .app
            .clone()
            .oneshot(request(Method::GET, "/admin/bookings", None, None))
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let owner = f
            .app
            .clone()
            .oneshot(request(Method::GET, "/admin/bookings", Some(OWNER), None))
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::FORBIDDEN);

        let admin = f
            .app
            .oneshot(request(
                Method::GET,
                "/admin/bookings?includeUnavailable=false",
                Some(ADMIN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(admin.status(), StatusCode::OK);
        let body = json_body(admin).await;
        assert_eq!(body[0]["id"], f.request_id.to_string());
        let eligible = &body[0]["occurrences"][0]["eligibleCaregivers"];
        assert_eq!(eligible[0]["id"], f.caregiver_id.to_string());
    }

    #[tokio::test]
    async fn unauthenticated_beats_malformed_body() {
        let f = fixture("auth_first.wal").await;
        let malformed = || {
            Request::builder()
                .method(Method::PATCH)
                .uri("/admin/bookings")
                .header(header::CONTENT_TYPE, "application/json")
        };
        let anonymous = f
            .app
            .clone()
            .oneshot(malformed().body(Body::from("{ not json")).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let admin = f
            .app
            .oneshot(
                malformed()
                    .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
                    .body(Body::from("{ not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(admin.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_assigns_then_conflicts_on_version() {
        let f = fixture("patch.wal").await;
        let body = json!({
            "occurrenceId": f.occurrence_id.to_string(),
            "caregiverId": f.caregiver_id.to_string(),
            "expectedVersion": 1,
        });
        let ok = f
            .app
            .clone()
            .oneshot(request(Method::PATCH, "/admin/bookings", Some(ADMIN), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let occ = json_body(ok).await;
        assert_eq!(occ["status"], "ASSIGNED");
        assert_eq!(occ["assignedCaregiverId"], f.caregiver_id.to_string());

        let stale = f
            .app
            .oneshot(request(Method::PATCH, "/admin/bookings", Some(ADMIN), Some(body)))
            .await
            .unwrap();
        assert_eq!(stale.status(), StatusCode::CONFLICT);
        assert!(json_body(stale).await["error"].as_str().unwrap().contains("version"));
    }

    #[tokio::test]
    async fn patch_validates_ids() {
        let f = fixture("patch_ids.wal").await;
        let bad = f
            .app
            .clone()
            .oneshot(request(
                Method::PATCH,
                "/admin/bookings",
                Some(ADMIN),
                Some(json!({ "occurrenceId": "nope", "adminNotes": "x" })),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = f
            .app
            .oneshot(request(
                Method::PATCH,
                "/admin/bookings",
                Some(ADMIN),
                Some(json!({ "occurrenceId": Ulid::new().to_string(), "adminNotes": "x" })),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_needs_exactly_one_id() {
        let f = fixture("delete.wal").await;
        let both = f
            .app
            .clone()
            .oneshot(request(
                Method::DELETE,
                &format!(
                    "/admin/bookings?occurrenceId={}&requestId={}",
                    f.occurrence_id, f.request_id
                ),
                Some(ADMIN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(both.status(), StatusCode::BAD_REQUEST);

        let ok = f
            .app
            .oneshot(request(
                Method::DELETE,
                &format!("/admin/bookings?requestId={}", f.request_id),
                Some(ADMIN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json_body(ok).await;
        assert_eq!(body["deleted"], "request");
        assert_eq!(body["occurrencesRemoved"], 1);
        assert_eq!(body["notified"], 1);
    }
}
