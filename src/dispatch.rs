//! Notification/email fan-out.
//!
//! Everything here sits outside the consistency boundary: the caller's state
//! change is already durable, so delivery failures are logged and counted but
//! never returned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub link: String,
}

/// Transactional email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), DeliveryError>;
}

/// In-app notification creation.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create(&self, notification: Notification) -> Result<(), DeliveryError>;
}

/// Public base URL used to build dashboard deep links.
pub trait BaseUrlProvider: Send + Sync {
    fn base_url(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct StaticBaseUrl(pub String);

impl BaseUrlProvider for StaticBaseUrl {
    fn base_url(&self) -> String {
        self.0.trim_end_matches('/').to_string()
    }
}

/// Whether assignment fan-out runs on the request task or a spawned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    Inline,
    #[default]
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Owner,
    Caregiver,
}

/// A notification recipient with contact details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub user_id: Ulid,
    pub role: PartyRole,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl Party {
    pub fn owner(owner: &OwnerProfile) -> Self {
        Self {
            user_id: owner.id,
            role: PartyRole::Owner,
            name: owner.name.clone(),
            email: owner.email.clone(),
            phone: owner.phone.clone(),
        }
    }

    pub fn caregiver(caregiver: &CaregiverProfile) -> Self {
        Self {
            user_id: caregiver.id,
            role: PartyRole::Caregiver,
            name: caregiver.name.clone(),
            email: caregiver.email.clone(),
            phone: caregiver.phone.clone(),
        }
    }

    fn contact_line(&self) -> String {
        match &self.phone {
            Some(phone) => format!("{} ({}, {})", self.name, self.email, phone),
            None => format!("{} ({})", self.name, self.email),
        }
    }
}

/// Keep the first entry per user id, preserving order.
pub fn dedup_recipients(parties: impl IntoIterator<Item = Party>) -> Vec<Party> {
    let mut seen = HashSet::new();
    parties
        .into_iter()
        .filter(|p| seen.insert(p.user_id))
        .collect()
}

#[derive(Debug, Clone)]
pub struct AssignmentNotice {
    pub occurrence: BookingOccurrence,
    pub caregiver: CaregiverProfile,
    pub owner: OwnerProfile,
}

/// What got cancelled. Captured before the rows are removed.
#[derive(Debug, Clone)]
pub struct CancellationNotice {
    /// Occurrence id, or request id for a request-level deletion.
    pub entity_id: Ulid,
    pub request_id: Ulid,
    pub service: ServiceKind,
    pub slots: Vec<Slot>,
    pub location: Location,
}

impl CancellationNotice {
    pub fn for_occurrence(occ: &BookingOccurrence) -> Self {
        Self {
            entity_id: occ.id,
            request_id: occ.request_id,
            service: occ.service,
            slots: vec![occ.slot()],
            location: occ.location.clone(),
        }
    }

    fn when(&self) -> String {
        match self.slots.as_slice() {
            [] => "all scheduled dates".to_string(),
            [one] => one.to_string(),
            many => format!("{} dates from {}", many.len(), many[0]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTask {
    InApp(Notification),
    Email(EmailMessage),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Per outbound call.
    pub timeout: Duration,
    /// Max deliveries in flight for one fan-out.
    pub concurrency: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            concurrency: 4,
        }
    }
}

pub struct Dispatcher {
    mailer: Arc<dyn Mailer>,
    sink: Arc<dyn NotificationSink>,
    base_url: Arc<dyn BaseUrlProvider>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        sink: Arc<dyn NotificationSink>,
        base_url: Arc<dyn BaseUrlProvider>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            mailer,
            sink,
            base_url,
            settings,
        }
    }

    fn caregiver_link(&self, occurrence_id: Ulid) -> String {
        format!("{}/dashboard/caregiver/bookings/{occurrence_id}", self.base_url.base_url())
    }

    fn owner_link(&self, request_id: Ulid) -> String {
        format!("{}/dashboard/owner/requests/{request_id}", self.base_url.base_url())
    }

    fn link_for(&self, party: &Party, occurrence_id: Ulid, request_id: Ulid) -> String {
        match party.role {
            PartyRole::Owner => self.owner_link(request_id),
            PartyRole::Caregiver => self.caregiver_link(occurrence_id),
        }
    }

    /// Two in-app notifications and two emails: one pair each for caregiver and owner.
    pub fn assignment_tasks(&self, notice: &AssignmentNotice) -> Vec<DispatchTask> {
        let occ = &notice.occurrence;
        let caregiver = Party::caregiver(&notice.caregiver);
        let owner = Party::owner(&notice.owner);
        let service = occ.service.label();
        let when = occ.slot();
        let place = occ.location.describe();

        let caregiver_link = self.caregiver_link(occ.id);
        let caregiver_msg = format!(
            "{service} on {when} at {place}. Owner: {}.",
            owner.contact_line()
        );
        let owner_link = self.owner_link(occ.request_id);
        let owner_msg = format!(
            "{service} on {when} at {place}. Caregiver: {}.",
            caregiver.contact_line()
        );

        vec![
            DispatchTask::InApp(Notification {
                user_id: caregiver.user_id,
                kind: NotificationKind::BookingAssigned,
                title: format!("New booking: {service}"),
                message: caregiver_msg.clone(),
                entity_id: occ.id,
                link: caregiver_link.clone(),
            }),
            DispatchTask::Email(EmailMessage {
                to: caregiver.email.clone(),
                subject: format!("You have been assigned: {service} on {when}"),
                body: format!("Hi {},\n\n{caregiver_msg}\n\nDetails: {caregiver_link}\n", caregiver.name),
                link: caregiver_link,
            }),
            DispatchTask::InApp(Notification {
                user_id: owner.user_id,
                kind: NotificationKind::CaregiverAssigned,
                title: format!("Caregiver assigned: {service}"),
                message: owner_msg.clone(),
                entity_id: occ.id,
                link: owner_link.clone(),
            }),
            DispatchTask::Email(EmailMessage {
                to: owner.email.clone(),
                subject: format!("Your caregiver for {service} on {when}"),
                body: format!("Hi {},\n\n{owner_msg}\n\nDetails: {owner_link}\n", owner.name),
                link: owner_link,
            }),
        ]
    }

    /// One CANCELLED notification and one email per distinct recipient.
    pub fn cancellation_tasks(&self, notice: &CancellationNotice, recipients: &[Party]) -> Vec<DispatchTask> {
        let service = notice.service.label();
        let when = notice.when();
        let place = notice.location.describe();
        let mut tasks = Vec::new();
        for party in dedup_recipients(recipients.iter().cloned()) {
            let link = self.link_for(&party, notice.entity_id, notice.request_id);
            let message = format!("{service} on {when} at {place} has been cancelled.");
            tasks.push(DispatchTask::InApp(Notification {
                user_id: party.user_id,
                kind: NotificationKind::Cancelled,
                title: format!("Cancelled: {service}"),
                message: message.clone(),
                entity_id: notice.entity_id,
                link: link.clone(),
            }));
            tasks.push(DispatchTask::Email(EmailMessage {
                to: party.email.clone(),
                subject: format!("Cancelled: {service} on {when}"),
                body: format!("Hi {},\n\n{message}\n\n{link}\n", party.name),
                link,
            }));
        }
        tasks
    }

    pub async fn notify_assignment(&self, notice: &AssignmentNotice) -> DispatchReport {
        self.run(self.assignment_tasks(notice)).await
    }

    pub async fn notify_cancellation(&self, notice: &CancellationNotice, recipients: &[Party]) -> DispatchReport {
        self.run(self.cancellation_tasks(notice, recipients)).await
    }

    /// Deliver every task with bounded parallelism. Never fails.
    pub async fn run(&self, tasks: Vec<DispatchTask>) -> DispatchReport {
        let attempted = tasks.len();
        let delivered = stream::iter(tasks)
            .map(|task| self.deliver(task))
            .buffer_unordered(self.settings.concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        let report = DispatchReport {
            attempted,
            delivered,
            failed: attempted - delivered,
        };
        debug!(?report, "dispatch fan-out finished");
        report
    }

    async fn deliver(&self, task: DispatchTask) -> bool {
        let (channel, recipient) = match &task {
            DispatchTask::InApp(n) => ("in_app", n.user_id.to_string()),
            DispatchTask::Email(m) => ("email", m.to.clone()),
        };
        let call = async {
            match task {
                DispatchTask::InApp(n) => self.sink.create(n).await,
                DispatchTask::Email(m) => self.mailer.send(m).await,
            }
        };
        let result = match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(r) => r,
            Err(_) => Err(DeliveryError::Timeout(self.settings.timeout)),
        };
        match result {
            Ok(()) => {
                metrics::counter!(crate::observability::DISPATCH_DELIVERED_TOTAL, "channel" => channel)
                    .increment(1);
                true
            }
            Err(e) => {
                warn!(channel, %recipient, error = %e, "dispatch delivery failed");
                metrics::counter!(crate::observability::DISPATCH_FAILED_TOTAL, "channel" => channel)
                    .increment(1);
                false
            }
        }
    }
}
