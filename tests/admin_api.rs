use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use ulid::Ulid;

use petdispatch::admin::AdminService;
use petdispatch::auth::TokenAuthority;
use petdispatch::dispatch::{
    DeliveryError, DispatchMode, Dispatcher, DispatcherSettings, EmailMessage, Mailer, StaticBaseUrl,
};
use petdispatch::engine::{Engine, EngineDeps, EngineSettings, FixedClock};
use petdispatch::geo::{PostalArea, PostalDirectory};
use petdispatch::http::{AppState, router};
use petdispatch::model::*;
use petdispatch::notify::InboxHub;

// ── Test infrastructure ──────────────────────────────────────

const TOKEN: &str = "integration-admin";

#[derive(Default)]
struct CapturingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

struct TestServer {
    addr: SocketAddr,
    engine: Arc<Engine>,
    inbox: Arc<InboxHub>,
    mailer: Arc<CapturingMailer>,
    client: reqwest::Client,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    async fn patch(&self, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .patch(self.url("/admin/bookings"))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    async fn delete(&self, query: &str) -> (u16, Value) {
        let resp = self
            .client
            .delete(self.url(&format!("/admin/bookings?{query}")))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }
}

fn directory() -> PostalDirectory {
    PostalDirectory::new([
        PostalArea {
            postal_code: "2000".into(),
            region: "Sydney".into(),
            lat: -33.8688,
            lon: 151.2093,
        },
        PostalArea {
            postal_code: "2150".into(),
            region: "Parramatta".into(),
            lat: -33.8150,
            lon: 151.0011,
        },
    ])
}

async fn start_test_server() -> TestServer {
    let dir = std::env::temp_dir().join(format!("petdispatch_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let inbox = Arc::new(InboxHub::new());
    let mailer = Arc::new(CapturingMailer::default());
    let dispatcher = Dispatcher::new(
        mailer.clone(),
        inbox.clone(),
        Arc::new(StaticBaseUrl("https://pets.example".into())),
        DispatcherSettings {
            timeout: Duration::from_secs(1),
            concurrency: 4,
        },
    );
    let engine = Arc::new(
        Engine::open(
            dir.join("petdispatch.wal"),
            EngineSettings {
                dispatch_mode: DispatchMode::Inline,
                ..EngineSettings::default()
            },
            EngineDeps {
                clock: Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap())),
                regions: Arc::new(directory()),
                dispatcher: Arc::new(dispatcher),
            },
        )
        .unwrap(),
    );

    let app = router(AppState {
        admin: Arc::new(AdminService::new(engine.clone())),
        tokens: Arc::new(TokenAuthority::new([(TOKEN.to_string(), Ulid::new())])),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        engine,
        inbox,
        mailer,
        client: reqwest::Client::new(),
    }
}

fn location() -> Location {
    Location {
        city: "Sydney".into(),
        postal_code: "2000".into(),
        address: Some("1 George St".into()),
        region: None,
    }
}

fn caregiver(name: &str, postal_code: &str, region: &str, radius: Option<f64>) -> CaregiverProfile {
    CaregiverProfile {
        id: Ulid::new(),
        name: name.into(),
        email: format!("{}@example.com", name.to_lowercase()),
        phone: None,
        services: vec![ServiceKind::DogWalking],
        region: Some(region.into()),
        postal_code: Some(postal_code.into()),
        service_radius_km: radius,
        active: true,
    }
}

struct Fixture {
    owner: OwnerProfile,
    local: CaregiverProfile,
    nearby: CaregiverProfile,
    request: OwnerRequest,
    occurrences: Vec<BookingOccurrence>,
}

async fn seed(engine: &Engine) -> Fixture {
    let owner = OwnerProfile {
        id: Ulid::new(),
        name: "Olive".into(),
        email: "olive@example.com".into(),
        phone: Some("0400 000 000".into()),
    };
    engine.upsert_owner(owner.clone()).await.unwrap();

    let local = caregiver("Casey", "2000", "Sydney", None);
    let nearby = caregiver("Parker", "2150", "Parramatta", Some(30.0));
    let far = caregiver("Morgan", "2150", "Parramatta", Some(5.0));
    for c in [&local, &nearby, &far] {
        engine.upsert_caregiver(c.clone()).await.unwrap();
    }

    let request = OwnerRequest {
        id: Ulid::new(),
        owner_id: owner.id,
        service: ServiceKind::DogWalking,
        location: location(),
        preferred_time: Some(TimeWindow::Morning),
        start_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
        recurrence: Some("FREQ=DAILY;COUNT=2".into()),
        status: RequestStatus::Active,
        notes: None,
        created_at: Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap(),
    };
    let occurrences: Vec<BookingOccurrence> = [10, 11]
        .into_iter()
        .map(|day| BookingOccurrence {
            id: Ulid::new(),
            request_id: request.id,
            scheduled_date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
            time_window: TimeWindow::Morning,
            time: None,
            service: ServiceKind::DogWalking,
            location: location(),
            status: OccurrenceStatus::Pending,
            assigned_caregiver_id: None,
            admin_notes: None,
            version: 1,
        })
        .collect();
    engine
        .create_request(request.clone(), occurrences.clone())
        .await
        .unwrap();

    Fixture {
        owner,
        local,
        nearby,
        request,
        occurrences,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn listing_ranks_region_before_distance() {
    let server = start_test_server().await;
    let f = seed(&server.engine).await;

    let (status, body) = server.get("/admin/bookings").await;
    assert_eq!(status, 200);
    let tree = &body[0];
    assert_eq!(tree["id"], f.request.id.to_string());
    assert_eq!(tree["owner"]["email"], "olive@example.com");

    let occurrences = tree["occurrences"].as_array().unwrap();
    assert_eq!(occurrences.len(), 2);
    let eligible: Vec<&str> = occurrences[0]["eligibleCaregivers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    let local = f.local.id.to_string();
    let nearby = f.nearby.id.to_string();
    assert_eq!(eligible, vec![local.as_str(), nearby.as_str()]);
    assert_eq!(occurrences[0]["eligibleCaregivers"][0]["regionMatch"], true);
}

#[tokio::test]
async fn assign_notifies_both_parties_and_blocks_double_booking() {
    let server = start_test_server().await;
    let f = seed(&server.engine).await;
    let mut caregiver_rx = server.inbox.subscribe(f.local.id);

    let (status, occ) = server
        .patch(json!({
            "occurrenceId": f.occurrences[0].id.to_string(),
            "caregiverId": f.local.id.to_string(),
        }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(occ["status"], "ASSIGNED");
    assert_eq!(occ["version"], 2);

    let note = tokio::time::timeout(Duration::from_secs(2), caregiver_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.kind, NotificationKind::BookingAssigned);
    assert_eq!(note.entity_id, f.occurrences[0].id);
    assert_eq!(server.inbox.inbox(&f.owner.id)[0].kind, NotificationKind::CaregiverAssigned);
    assert_eq!(server.mailer.sent.lock().unwrap().len(), 2);

    let conversation = server.engine.store.conversation(&f.occurrences[0].id).unwrap();
    assert_eq!(conversation.status, ConversationStatus::Active);
    assert_eq!(conversation.caregiver_id, f.local.id);

    // A second request on the same slot cannot take the same caregiver.
    let mut clash = f.request.clone();
    clash.id = Ulid::new();
    let mut other = f.occurrences[0].clone();
    other.id = Ulid::new();
    other.request_id = clash.id;
    server.engine.create_request(clash, vec![other.clone()]).await.unwrap();

    let (status, body) = server
        .patch(json!({
            "occurrenceId": other.id.to_string(),
            "caregiverId": f.local.id.to_string(),
        }))
        .await;
    assert_eq!(status, 409);
    assert!(body["error"].as_str().unwrap().contains("already committed"));

    let first = server.engine.occurrence(&f.occurrences[0].id).await.unwrap();
    assert_eq!(first.status, OccurrenceStatus::Assigned);
}

#[tokio::test]
async fn deleting_request_fans_out_cancellations() {
    let server = start_test_server().await;
    let f = seed(&server.engine).await;

    for (occ, caregiver) in f.occurrences.iter().zip([&f.local, &f.nearby]) {
        let (status, _) = server
            .patch(json!({
                "occurrenceId": occ.id.to_string(),
                "caregiverId": caregiver.id.to_string(),
            }))
            .await;
        assert_eq!(status, 200);
    }
    let mut owner_rx = server.inbox.subscribe(f.owner.id);

    let (status, body) = server.delete(&format!("requestId={}", f.request.id)).await;
    assert_eq!(status, 200);
    assert_eq!(body["deleted"], "request");
    assert_eq!(body["occurrencesRemoved"], 2);
    assert_eq!(body["notified"], 3);

    let cancelled = tokio::time::timeout(Duration::from_secs(2), owner_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.kind, NotificationKind::Cancelled);
    assert_eq!(cancelled.entity_id, f.request.id);

    for caregiver in [&f.local, &f.nearby] {
        let inbox = server.inbox.inbox(&caregiver.id);
        assert_eq!(inbox.last().unwrap().kind, NotificationKind::Cancelled);
    }
    assert!(server.engine.store.request(&f.request.id).is_none());
    assert_eq!(server.engine.store.occurrence_count(), 0);

    let (_, body) = server.get("/admin/bookings").await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn rejects_missing_token() {
    let server = start_test_server().await;
    let resp = server
        .client
        .get(server.url("/admin/bookings"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "authentication required");
}
