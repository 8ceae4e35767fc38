use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Coarse daypart bucket. The unit of scheduling granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeWindow {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeWindow {
    /// Wall-clock start of the window.
    pub fn start_time(&self) -> NaiveTime {
        let hour = match self {
            TimeWindow::Morning => 6,
            TimeWindow::Afternoon => 12,
            TimeWindow::Evening => 17,
            TimeWindow::Night => 21,
        };
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default()
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeWindow::Morning => "morning",
            TimeWindow::Afternoon => "afternoon",
            TimeWindow::Evening => "evening",
            TimeWindow::Night => "night",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A (date, time window) pair. Two commitments on the same slot always conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl Slot {
    pub fn new(date: NaiveDate, window: TimeWindow) -> Self {
        Self { date, window }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.date, self.window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceKind {
    DogWalking,
    PetSitting,
    DropInVisit,
    Boarding,
    Grooming,
    Training,
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::DogWalking => "Dog walking",
            ServiceKind::PetSitting => "Pet sitting",
            ServiceKind::DropInVisit => "Drop-in visit",
            ServiceKind::Boarding => "Boarding",
            ServiceKind::Grooming => "Grooming",
            ServiceKind::Training => "Training",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccurrenceStatus {
    Pending,
    Assigned,
    Confirmed,
    Completed,
    Cancelled,
}

impl OccurrenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OccurrenceStatus::Completed | OccurrenceStatus::Cancelled)
    }

    /// Statuses that require `assigned_caregiver_id` to be set.
    pub fn holds_caregiver(&self) -> bool {
        matches!(
            self,
            OccurrenceStatus::Assigned | OccurrenceStatus::Confirmed | OccurrenceStatus::Completed
        )
    }

    /// Statuses that occupy the caregiver's calendar slot.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, OccurrenceStatus::Assigned | OccurrenceStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceStatus::Pending => "PENDING",
            OccurrenceStatus::Assigned => "ASSIGNED",
            OccurrenceStatus::Confirmed => "CONFIRMED",
            OccurrenceStatus::Completed => "COMPLETED",
            OccurrenceStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub city: String,
    pub postal_code: String,
    pub address: Option<String>,
    pub region: Option<String>,
}

impl Location {
    pub fn describe(&self) -> String {
        match &self.address {
            Some(address) => format!("{address}, {} {}", self.postal_code, self.city),
            None => format!("{} {}", self.postal_code, self.city),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRequest {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub service: ServiceKind,
    pub location: Location,
    pub preferred_time: Option<TimeWindow>,
    pub start_date: NaiveDate,
    /// Opaque recurrence rule; expansion happens upstream.
    pub recurrence: Option<String>,
    pub status: RequestStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One concrete dated instance of a requested service. The unit of assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingOccurrence {
    pub id: Ulid,
    pub request_id: Ulid,
    pub scheduled_date: NaiveDate,
    pub time_window: TimeWindow,
    pub time: Option<NaiveTime>,
    pub service: ServiceKind,
    pub location: Location,
    pub status: OccurrenceStatus,
    pub assigned_caregiver_id: Option<Ulid>,
    pub admin_notes: Option<String>,
    /// Bumped on every committed mutation.
    pub version: u64,
}

impl BookingOccurrence {
    pub fn slot(&self) -> Slot {
        Slot::new(self.scheduled_date, self.time_window)
    }

    /// Local wall-clock start: exact time if set, otherwise the window start.
    pub fn starts_at(&self) -> NaiveTime {
        self.time.unwrap_or_else(|| self.time_window.start_time())
    }

    /// `assigned_caregiver_id.is_some() == status.holds_caregiver()`
    pub fn invariant_holds(&self) -> bool {
        self.assigned_caregiver_id.is_some() == self.status.holds_caregiver()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerProfile {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaregiverProfile {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub services: Vec<ServiceKind>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub service_radius_km: Option<f64>,
    pub active: bool,
}

impl CaregiverProfile {
    pub fn offers(&self, service: ServiceKind) -> bool {
        self.services.contains(&service)
    }
}

/// A caregiver-declared unavailable slot. `window: None` blocks the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotBlock {
    pub id: Ulid,
    pub caregiver_id: Ulid,
    pub date: NaiveDate,
    pub window: Option<TimeWindow>,
    pub reason: Option<String>,
}

impl SlotBlock {
    pub fn covers(&self, slot: &Slot) -> bool {
        self.date == slot.date && self.window.is_none_or(|w| w == slot.window)
    }
}

/// Per-caregiver calendar: declared blocks plus ASSIGNED/CONFIRMED commitments.
#[derive(Debug, Clone, Default)]
pub struct CaregiverCalendar {
    pub caregiver_id: Ulid,
    /// Sorted by `date`.
    pub blocks: Vec<SlotBlock>,
    pub commitments: BTreeMap<Slot, BTreeSet<Ulid>>,
}

impl CaregiverCalendar {
    pub fn new(caregiver_id: Ulid) -> Self {
        Self {
            caregiver_id,
            blocks: Vec::new(),
            commitments: BTreeMap::new(),
        }
    }

    /// Insert block maintaining sort order by date.
    pub fn insert_block(&mut self, block: SlotBlock) {
        self.remove_block(block.id);
        let pos = self
            .blocks
            .binary_search_by_key(&block.date, |b| b.date)
            .unwrap_or_else(|e| e);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<SlotBlock> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// First block covering the slot, if any.
    pub fn block_for(&self, slot: &Slot) -> Option<&SlotBlock> {
        let start = self.blocks.partition_point(|b| b.date < slot.date);
        self.blocks[start..]
            .iter()
            .take_while(|b| b.date == slot.date)
            .find(|b| b.covers(slot))
    }

    pub fn commit(&mut self, slot: Slot, occurrence_id: Ulid) {
        self.commitments.entry(slot).or_default().insert(occurrence_id);
    }

    pub fn release(&mut self, slot: Slot, occurrence_id: Ulid) {
        if let Some(held) = self.commitments.get_mut(&slot) {
            held.remove(&occurrence_id);
            if held.is_empty() {
                self.commitments.remove(&slot);
            }
        }
    }

    /// Occurrences occupying `slot`, skipping `except`.
    pub fn commitments_at(&self, slot: &Slot, except: Option<Ulid>) -> impl Iterator<Item = Ulid> + '_ {
        self.commitments
            .get(slot)
            .into_iter()
            .flatten()
            .copied()
            .filter(move |id| Some(*id) != except)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Active,
    Closed,
}

/// Owner/caregiver channel, one per assigned occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub occurrence_id: Ulid,
    pub request_id: Ulid,
    pub owner_id: Ulid,
    pub caregiver_id: Ulid,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Assign,
    StatusChange,
    Update,
    Delete,
}

/// Immutable audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDecision {
    pub id: Ulid,
    pub request_id: Ulid,
    pub occurrence_id: Option<Ulid>,
    pub admin_id: Ulid,
    pub action: DecisionAction,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BookingAssigned,
    CaregiverAssigned,
    Cancelled,
}

/// Transient in-app notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub entity_id: Ulid,
    pub link: String,
}

/// The event types. A WAL record is one commit: a `Vec<Event>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OwnerUpserted {
        owner: OwnerProfile,
    },
    CaregiverUpserted {
        caregiver: CaregiverProfile,
    },
    BlockAdded {
        block: SlotBlock,
    },
    BlockRemoved {
        id: Ulid,
        caregiver_id: Ulid,
    },
    RequestCreated {
        request: OwnerRequest,
        occurrences: Vec<BookingOccurrence>,
    },
    OccurrenceAssigned {
        id: Ulid,
        slot: Slot,
        caregiver_id: Ulid,
        previous_caregiver_id: Option<Ulid>,
        admin_notes: String,
        version: u64,
    },
    OccurrenceStatusChanged {
        id: Ulid,
        slot: Slot,
        from: OccurrenceStatus,
        to: OccurrenceStatus,
        /// Caregiver on the row before the change.
        caregiver_id: Option<Ulid>,
        admin_notes: Option<String>,
        version: u64,
    },
    OccurrenceNotesEdited {
        id: Ulid,
        admin_notes: Option<String>,
        version: u64,
    },
    OccurrenceDeleted {
        id: Ulid,
        request_id: Ulid,
        slot: Slot,
        caregiver_id: Option<Ulid>,
    },
    RequestDeleted {
        id: Ulid,
    },
    ConversationUpserted {
        conversation: Conversation,
    },
    DecisionRecorded {
        decision: AdminDecision,
    },
}

impl Event {
    /// Occurrence row touched by this event, if any.
    pub fn occurrence_id(&self) -> Option<Ulid> {
        match self {
            Event::OccurrenceAssigned { id, .. }
            | Event::OccurrenceStatusChanged { id, .. }
            | Event::OccurrenceNotesEdited { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Caregiver calendars touched by this event.
    pub fn calendar_ids(&self) -> Vec<Ulid> {
        match self {
            Event::BlockAdded { block } => vec![block.caregiver_id],
            Event::BlockRemoved { caregiver_id, .. } => vec![*caregiver_id],
            Event::RequestCreated { occurrences, .. } => occurrences
                .iter()
                .filter(|o| o.status.occupies_slot())
                .filter_map(|o| o.assigned_caregiver_id)
                .collect(),
            Event::OccurrenceAssigned {
                caregiver_id,
                previous_caregiver_id,
                ..
            } => std::iter::once(*caregiver_id)
                .chain(previous_caregiver_id.filter(|p| p != caregiver_id))
                .collect(),
            Event::OccurrenceStatusChanged { caregiver_id, .. }
            | Event::OccurrenceDeleted { caregiver_id, .. } => caregiver_id.iter().copied().collect(),
            _ => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaregiverSummary {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub region_match: bool,
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OccurrenceView {
    #[serde(flatten)]
    pub occurrence: BookingOccurrence,
    pub eligible_caregivers: Vec<CaregiverSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTree {
    #[serde(flatten)]
    pub request: OwnerRequest,
    pub owner: Option<OwnerProfile>,
    pub occurrences: Vec<OccurrenceView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn block(caregiver_id: Ulid, d: NaiveDate, window: Option<TimeWindow>) -> SlotBlock {
        SlotBlock {
            id: Ulid::new(),
            caregiver_id,
            date: d,
            window,
            reason: None,
        }
    }

    #[test]
    fn window_starts() {
        assert_eq!(TimeWindow::Morning.start_time(), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(TimeWindow::Night.start_time(), NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        assert!(TimeWindow::Morning < TimeWindow::Afternoon);
    }

    #[test]
    fn status_caregiver_rules() {
        assert!(!OccurrenceStatus::Pending.holds_caregiver());
        assert!(OccurrenceStatus::Completed.holds_caregiver());
        assert!(!OccurrenceStatus::Completed.occupies_slot());
        assert!(!OccurrenceStatus::Cancelled.holds_caregiver());
        assert!(OccurrenceStatus::Cancelled.is_terminal());
        assert!(!OccurrenceStatus::Confirmed.is_terminal());
    }

    #[test]
    fn whole_day_block_covers_every_window() {
        let cid = Ulid::new();
        let b = block(cid, date(2025, 6, 10), None);
        assert!(b.covers(&Slot::new(date(2025, 6, 10), TimeWindow::Morning)));
        assert!(b.covers(&Slot::new(date(2025, 6, 10), TimeWindow::Night)));
        assert!(!b.covers(&Slot::new(date(2025, 6, 11), TimeWindow::Morning)));
    }

    #[test]
    fn calendar_blocks_sorted_and_found() {
        let cid = Ulid::new();
        let mut cal = CaregiverCalendar::new(cid);
        cal.insert_block(block(cid, date(2025, 6, 12), Some(TimeWindow::Evening)));
        cal.insert_block(block(cid, date(2025, 6, 10), Some(TimeWindow::Morning)));
        cal.insert_block(block(cid, date(2025, 6, 11), None));
        assert_eq!(cal.blocks[0].date, date(2025, 6, 10));
        assert_eq!(cal.blocks[2].date, date(2025, 6, 12));

        assert!(cal.block_for(&Slot::new(date(2025, 6, 10), TimeWindow::Morning)).is_some());
        assert!(cal.block_for(&Slot::new(date(2025, 6, 10), TimeWindow::Evening)).is_none());
        assert!(cal.block_for(&Slot::new(date(2025, 6, 11), TimeWindow::Afternoon)).is_some());
    }

    #[test]
    fn calendar_remove_block() {
        let cid = Ulid::new();
        let mut cal = CaregiverCalendar::new(cid);
        let b = block(cid, date(2025, 6, 10), None);
        let id = b.id;
        cal.insert_block(b);
        assert!(cal.remove_block(id).is_some());
        assert!(cal.remove_block(id).is_none());
        assert!(cal.blocks.is_empty());
    }

    #[test]
    fn commitments_release_and_skip_self() {
        let mut cal = CaregiverCalendar::new(Ulid::new());
        let slot = Slot::new(date(2025, 6, 10), TimeWindow::Morning);
        let a = Ulid::new();
        let b = Ulid::new();
        cal.commit(slot, a);
        cal.commit(slot, b);
        assert_eq!(cal.commitments_at(&slot, Some(a)).collect::<Vec<_>>(), vec![b]);
        cal.release(slot, a);
        cal.release(slot, b);
        assert!(cal.commitments.is_empty());
    }

    #[test]
    fn assigned_event_touches_both_calendars() {
        let new = Ulid::new();
        let old = Ulid::new();
        let event = Event::OccurrenceAssigned {
            id: Ulid::new(),
            slot: Slot::new(date(2025, 6, 10), TimeWindow::Morning),
            caregiver_id: new,
            previous_caregiver_id: Some(old),
            admin_notes: "n".into(),
            version: 2,
        };
        assert_eq!(event.calendar_ids(), vec![new, old]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BlockAdded {
            block: block(Ulid::new(), date(2025, 6, 10), Some(TimeWindow::Night)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
