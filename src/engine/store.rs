use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{SharedCalendar, SharedOccurrence};

/// Row tables for the dispatch core. Occurrence rows and caregiver calendars sit behind
/// their own locks; everything else is a plain concurrent map.
pub struct InMemoryStore {
    owners: DashMap<Ulid, OwnerProfile>,
    caregivers: DashMap<Ulid, CaregiverProfile>,
    calendars: DashMap<Ulid, SharedCalendar>,
    requests: DashMap<Ulid, OwnerRequest>,
    occurrences: DashMap<Ulid, SharedOccurrence>,
    /// Request → child occurrence ids.
    children: DashMap<Ulid, Vec<Ulid>>,
    /// Keyed by occurrence id.
    conversations: DashMap<Ulid, Conversation>,
    /// Append-only.
    decisions: Mutex<Vec<AdminDecision>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
            caregivers: DashMap::new(),
            calendars: DashMap::new(),
            requests: DashMap::new(),
            occurrences: DashMap::new(),
            children: DashMap::new(),
            conversations: DashMap::new(),
            decisions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty() && self.caregivers.is_empty() && self.requests.is_empty()
    }

    // ── Profiles ─────────────────────────────────────────────

    pub fn owner(&self, id: &Ulid) -> Option<OwnerProfile> {
        self.owners.get(id).map(|e| e.value().clone())
    }

    pub fn caregiver(&self, id: &Ulid) -> Option<CaregiverProfile> {
        self.caregivers.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every caregiver, sorted by id.
    pub fn caregivers(&self) -> Vec<CaregiverProfile> {
        let mut all: Vec<_> = self.caregivers.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn calendar(&self, caregiver_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(caregiver_id).map(|e| e.value().clone())
    }

    pub fn owners(&self) -> Vec<OwnerProfile> {
        self.owners.iter().map(|e| e.value().clone()).collect()
    }

    // ── Requests & occurrences ───────────────────────────────

    pub fn request(&self, id: &Ulid) -> Option<OwnerRequest> {
        self.requests.get(id).map(|e| e.value().clone())
    }

    pub fn requests(&self) -> Vec<OwnerRequest> {
        self.requests.iter().map(|e| e.value().clone()).collect()
    }

    pub fn occurrence(&self, id: &Ulid) -> Option<SharedOccurrence> {
        self.occurrences.get(id).map(|e| e.value().clone())
    }

    pub fn contains_occurrence(&self, id: &Ulid) -> bool {
        self.occurrences.contains_key(id)
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn children_of(&self, request_id: &Ulid) -> Vec<Ulid> {
        self.children
            .get(request_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Conversations & decisions ────────────────────────────

    pub fn conversation(&self, occurrence_id: &Ulid) -> Option<Conversation> {
        self.conversations.get(occurrence_id).map(|e| e.value().clone())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.iter().map(|e| e.value().clone()).collect()
    }

    pub fn decisions(&self) -> Vec<AdminDecision> {
        self.decisions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn decisions_for(&self, request_id: &Ulid) -> Vec<AdminDecision> {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|d| d.request_id == *request_id)
            .cloned()
            .collect()
    }

    // ── Event application ────────────────────────────────────

    /// Table-level effects: row creation/removal and the append-only logs.
    /// Row contents and calendars are updated by `apply_to_occurrence` /
    /// `apply_to_calendar` under the caller's locks.
    pub fn apply_tables(&self, event: &Event) {
        match event {
            Event::OwnerUpserted { owner } => {
                self.owners.insert(owner.id, owner.clone());
            }
            Event::CaregiverUpserted { caregiver } => {
                self.calendars
                    .entry(caregiver.id)
                    .or_insert_with(|| Arc::new(RwLock::new(CaregiverCalendar::new(caregiver.id))));
                self.caregivers.insert(caregiver.id, caregiver.clone());
            }
            Event::RequestCreated { request, occurrences } => {
                self.requests.insert(request.id, request.clone());
                let mut ids = Vec::with_capacity(occurrences.len());
                for occ in occurrences {
                    ids.push(occ.id);
                    self.occurrences
                        .insert(occ.id, Arc::new(RwLock::new(occ.clone())));
                }
                self.children.entry(request.id).or_default().extend(ids);
            }
            Event::OccurrenceDeleted { id, request_id, .. } => {
                self.occurrences.remove(id);
                self.conversations.remove(id);
                if let Some(mut kids) = self.children.get_mut(request_id) {
                    kids.retain(|c| c != id);
                }
            }
            Event::RequestDeleted { id } => {
                self.requests.remove(id);
                if let Some((_, kids)) = self.children.remove(id) {
                    for kid in kids {
                        self.occurrences.remove(&kid);
                        self.conversations.remove(&kid);
                    }
                }
            }
            Event::ConversationUpserted { conversation } => {
                self.conversations
                    .insert(conversation.occurrence_id, conversation.clone());
            }
            Event::DecisionRecorded { decision } => {
                self.decisions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(decision.clone());
            }
            Event::BlockAdded { .. }
            | Event::BlockRemoved { .. }
            | Event::OccurrenceAssigned { .. }
            | Event::OccurrenceStatusChanged { .. }
            | Event::OccurrenceNotesEdited { .. } => {}
        }
    }
}

/// Apply an event to an occurrence row (no locking, caller holds the lock).
pub fn apply_to_occurrence(occ: &mut BookingOccurrence, event: &Event) {
    match event {
        Event::OccurrenceAssigned {
            id,
            caregiver_id,
            admin_notes,
            version,
            ..
        } if *id == occ.id => {
            occ.status = OccurrenceStatus::Assigned;
            occ.assigned_caregiver_id = Some(*caregiver_id);
            occ.admin_notes = Some(admin_notes.clone());
            occ.version = *version;
        }
        Event::OccurrenceStatusChanged {
            id,
            to,
            admin_notes,
            version,
            ..
        } if *id == occ.id => {
            occ.status = *to;
            if !to.holds_caregiver() {
                occ.assigned_caregiver_id = None;
            }
            if let Some(notes) = admin_notes {
                occ.admin_notes = Some(notes.clone());
            }
            occ.version = *version;
        }
        Event::OccurrenceNotesEdited {
            id,
            admin_notes,
            version,
        } if *id == occ.id => {
            occ.admin_notes = admin_notes.clone();
            occ.version = *version;
        }
        _ => {}
    }
}

/// Apply an event to a caregiver calendar (no locking, caller holds the lock).
pub fn apply_to_calendar(cal: &mut CaregiverCalendar, event: &Event) {
    let me = cal.caregiver_id;
    match event {
        Event::BlockAdded { block } if block.caregiver_id == me => cal.insert_block(block.clone()),
        Event::BlockRemoved { id, caregiver_id } if *caregiver_id == me => {
            cal.remove_block(*id);
        }
        Event::RequestCreated { occurrences, .. } => {
            for occ in occurrences {
                if occ.assigned_caregiver_id == Some(me) && occ.status.occupies_slot() {
                    cal.commit(occ.slot(), occ.id);
                }
            }
        }
        Event::OccurrenceAssigned {
            id,
            slot,
            caregiver_id,
            previous_caregiver_id,
            ..
        } => {
            if *previous_caregiver_id == Some(me) {
                cal.release(*slot, *id);
            }
            if *caregiver_id == me {
                cal.commit(*slot, *id);
            }
        }
        Event::OccurrenceStatusChanged {
            id,
            slot,
            to,
            caregiver_id,
            ..
        } if *caregiver_id == Some(me) && !to.occupies_slot() => cal.release(*slot, *id),
        Event::OccurrenceDeleted {
            id,
            slot,
            caregiver_id,
            ..
        } if *caregiver_id == Some(me) => cal.release(*slot, *id),
        _ => {}
    }
}
