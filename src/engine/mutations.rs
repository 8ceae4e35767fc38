use std::collections::{BTreeMap, HashSet};

use tokio::sync::{OwnedRwLockWriteGuard, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::dispatch::{
    AssignmentNotice, CancellationNotice, DispatchMode, DispatchReport, Party, dedup_recipients,
};
use crate::limits::*;
use crate::model::*;

use super::availability::check_slot;
use super::conflict::{guard_not_past, guard_version, is_past, validate_name, validate_note};
use super::lifecycle::{MutationCommand, Transition};
use super::{Engine, EngineError, WalCommand};

/// Outcome of an occurrence or request deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub occurrences_removed: usize,
    /// Distinct users sent a cancellation.
    pub recipients: usize,
    pub dispatch: DispatchReport,
}

/// Side effect to run once the row lock is released.
enum FollowUp {
    Assignment(AssignmentNotice),
    Cancellation(CancellationNotice, Vec<Party>),
}

fn decision(
    request_id: Ulid,
    occurrence_id: Option<Ulid>,
    admin_id: Ulid,
    action: DecisionAction,
    note: Option<String>,
    at: chrono::DateTime<chrono::Utc>,
) -> AdminDecision {
    AdminDecision {
        id: Ulid::new(),
        request_id,
        occurrence_id,
        admin_id,
        action,
        note,
        at,
    }
}

impl Engine {
    /// Apply one admin mutation to an occurrence. Guards run in order: row lookup,
    /// past slot, note length, version, transition rules, availability.
    pub async fn apply_mutation(
        &self,
        admin_id: Ulid,
        cmd: MutationCommand,
    ) -> Result<BookingOccurrence, EngineError> {
        let _gate = self.snapshot_gate.read().await;
        let mut occ = self.lock_occurrence(cmd.occurrence_id).await?;
        guard_not_past(&occ, self.clock.now(), self.settings.utc_offset)?;
        validate_note(cmd.admin_notes.as_deref())?;
        guard_version(&occ, cmd.expected_version)?;

        let transition = Transition::plan(&occ, &cmd)?;
        let action = transition.action();
        let follow_up = match transition {
            Transition::Assign {
                caregiver_id,
                admin_notes,
            } => self.commit_assign(admin_id, &mut occ, caregiver_id, admin_notes).await?,
            Transition::SetStatus { to, admin_notes } => {
                self.commit_status(admin_id, &mut occ, to, admin_notes).await?
            }
            Transition::EditNotes { admin_notes } => {
                self.commit_notes(admin_id, &mut occ, admin_notes).await?
            }
        };
        let updated = occ.clone();
        drop(occ);

        info!(
            occurrence_id = %updated.id,
            action = ?action,
            status = %updated.status,
            version = updated.version,
            "occurrence mutated"
        );
        if let Some(follow_up) = follow_up {
            self.run_follow_up(follow_up).await;
        }
        Ok(updated)
    }

    async fn commit_assign(
        &self,
        admin_id: Ulid,
        occ: &mut OwnedRwLockWriteGuard<BookingOccurrence>,
        caregiver_id: Ulid,
        admin_notes: Option<String>,
    ) -> Result<Option<FollowUp>, EngineError> {
        let caregiver = self
            .store
            .caregiver(&caregiver_id)
            .ok_or(EngineError::not_found("caregiver", caregiver_id))?;
        if !caregiver.active {
            return Err(EngineError::Inactive(caregiver_id));
        }
        if !caregiver.offers(occ.service) {
            return Err(EngineError::ServiceNotOffered {
                caregiver_id,
                service: occ.service.label(),
            });
        }
        let request = self
            .store
            .request(&occ.request_id)
            .ok_or(EngineError::not_found("request", occ.request_id))?;
        let owner = self
            .store
            .owner(&request.owner_id)
            .ok_or(EngineError::not_found("owner", request.owner_id))?;

        let slot = occ.slot();
        let previous = occ.assigned_caregiver_id;
        let mut cals = self
            .lock_calendars(std::iter::once(caregiver_id).chain(previous).collect())
            .await?;
        let target = cals
            .iter()
            .find(|c| c.caregiver_id == caregiver_id)
            .ok_or(EngineError::not_found("caregiver", caregiver_id))?;
        if let Err(e) = check_slot(target, &slot, Some(occ.id)) {
            metrics::counter!(crate::observability::ASSIGNMENT_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = self.clock.now();
        let notes = self.note_policy.resolve(admin_notes, &caregiver, &slot);
        let created_at = self
            .store
            .conversation(&occ.id)
            .map_or(now, |c| c.created_at);
        let events = vec![
            Event::OccurrenceAssigned {
                id: occ.id,
                slot,
                caregiver_id,
                previous_caregiver_id: previous,
                admin_notes: notes.clone(),
                version: occ.version + 1,
            },
            Event::ConversationUpserted {
                conversation: Conversation {
                    occurrence_id: occ.id,
                    request_id: occ.request_id,
                    owner_id: owner.id,
                    caregiver_id,
                    status: ConversationStatus::Active,
                    created_at,
                    updated_at: now,
                },
            },
            Event::DecisionRecorded {
                decision: decision(
                    occ.request_id,
                    Some(occ.id),
                    admin_id,
                    DecisionAction::Assign,
                    Some(notes),
                    now,
                ),
            },
        ];
        self.persist_and_apply(events, Some(&mut **occ), &mut cals).await?;
        metrics::counter!(crate::observability::ASSIGNMENTS_TOTAL).increment(1);

        Ok(Some(FollowUp::Assignment(AssignmentNotice {
            occurrence: (**occ).clone(),
            caregiver,
            owner,
        })))
    }

    async fn commit_status(
        &self,
        admin_id: Ulid,
        occ: &mut OwnedRwLockWriteGuard<BookingOccurrence>,
        to: OccurrenceStatus,
        admin_notes: Option<String>,
    ) -> Result<Option<FollowUp>, EngineError> {
        let from = occ.status;
        let holder = occ.assigned_caregiver_id;
        let mut cals = match holder {
            Some(caregiver_id) if !to.occupies_slot() => self.lock_calendars(vec![caregiver_id]).await?,
            _ => Vec::new(),
        };

        let now = self.clock.now();
        let admin_notes = admin_notes.filter(|n| !n.trim().is_empty());
        let mut events = vec![Event::OccurrenceStatusChanged {
            id: occ.id,
            slot: occ.slot(),
            from,
            to,
            caregiver_id: holder,
            admin_notes: admin_notes.clone(),
            version: occ.version + 1,
        }];
        if !to.holds_caregiver()
            && let Some(mut conversation) = self.store.conversation(&occ.id)
        {
            conversation.status = ConversationStatus::Closed;
            conversation.updated_at = now;
            events.push(Event::ConversationUpserted { conversation });
        }
        events.push(Event::DecisionRecorded {
            decision: decision(
                occ.request_id,
                Some(occ.id),
                admin_id,
                DecisionAction::StatusChange,
                admin_notes.or_else(|| Some(format!("{from} -> {to}"))),
                now,
            ),
        });
        self.persist_and_apply(events, Some(&mut **occ), &mut cals).await?;

        if to != OccurrenceStatus::Cancelled {
            return Ok(None);
        }
        let mut recipients = Vec::new();
        if let Some(owner) = self
            .store
            .request(&occ.request_id)
            .and_then(|r| self.store.owner(&r.owner_id))
        {
            recipients.push(Party::owner(&owner));
        }
        if let Some(caregiver) = holder.and_then(|id| self.store.caregiver(&id)) {
            recipients.push(Party::caregiver(&caregiver));
        }
        Ok(Some(FollowUp::Cancellation(
            CancellationNotice::for_occurrence(&**occ),
            recipients,
        )))
    }

    async fn commit_notes(
        &self,
        admin_id: Ulid,
        occ: &mut OwnedRwLockWriteGuard<BookingOccurrence>,
        admin_notes: Option<String>,
    ) -> Result<Option<FollowUp>, EngineError> {
        let events = vec![
            Event::OccurrenceNotesEdited {
                id: occ.id,
                admin_notes: admin_notes.clone(),
                version: occ.version + 1,
            },
            Event::DecisionRecorded {
                decision: decision(
                    occ.request_id,
                    Some(occ.id),
                    admin_id,
                    DecisionAction::Update,
                    admin_notes,
                    self.clock.now(),
                ),
            },
        ];
        self.persist_and_apply(events, Some(&mut **occ), &mut []).await?;
        Ok(None)
    }

    async fn run_follow_up(&self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::Assignment(notice) => match self.settings.dispatch_mode {
                DispatchMode::Inline => {
                    self.dispatcher.notify_assignment(&notice).await;
                }
                DispatchMode::Detached => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.notify_assignment(&notice).await;
                    });
                }
            },
            // Cancellations are rare and the caller usually wants them out before responding.
            FollowUp::Cancellation(notice, recipients) => {
                self.dispatcher.notify_cancellation(&notice, &recipients).await;
            }
        }
    }

    /// Delete one occurrence. Cancellation goes to the owner and the assigned caregiver
    /// before the row is removed. A CANCELLED or COMPLETED row is removed silently.
    pub async fn delete_occurrence(&self, admin_id: Ulid, occurrence_id: Ulid) -> Result<DeletionReport, EngineError> {
        let _gate = self.snapshot_gate.read().await;
        let occ = self.lock_occurrence(occurrence_id).await?;
        guard_not_past(&occ, self.clock.now(), self.settings.utc_offset)?;

        let mut parties = Vec::new();
        if !occ.status.is_terminal() {
            if let Some(owner) = self
                .store
                .request(&occ.request_id)
                .and_then(|r| self.store.owner(&r.owner_id))
            {
                parties.push(Party::owner(&owner));
            }
            if let Some(caregiver) = occ
                .assigned_caregiver_id
                .and_then(|id| self.store.caregiver(&id))
            {
                parties.push(Party::caregiver(&caregiver));
            }
        }
        let recipients = dedup_recipients(parties);
        let mut cals = self
            .lock_calendars(occ.assigned_caregiver_id.into_iter().collect())
            .await?;

        let dispatch = if recipients.is_empty() {
            DispatchReport::default()
        } else {
            self.dispatcher
                .notify_cancellation(&CancellationNotice::for_occurrence(&occ), &recipients)
                .await
        };

        let events = vec![
            Event::OccurrenceDeleted {
                id: occ.id,
                request_id: occ.request_id,
                slot: occ.slot(),
                caregiver_id: occ.assigned_caregiver_id,
            },
            Event::DecisionRecorded {
                decision: decision(
                    occ.request_id,
                    Some(occ.id),
                    admin_id,
                    DecisionAction::Delete,
                    Some(format!("deleted occurrence on {}", occ.slot())),
                    self.clock.now(),
                ),
            },
        ];
        self.persist_and_apply(events, None, &mut cals).await?;
        info!(%occurrence_id, recipients = recipients.len(), "occurrence deleted");
        Ok(DeletionReport {
            occurrences_removed: 1,
            recipients: recipients.len(),
            dispatch,
        })
    }

    /// Delete a request and every occurrence under it. The owner gets one cancellation and
    /// each distinct caregiver holding an upcoming occurrence gets one, all before removal.
    /// Occurrences already in the past are purged silently.
    pub async fn delete_request(&self, admin_id: Ulid, request_id: Ulid) -> Result<DeletionReport, EngineError> {
        let _gate = self.snapshot_gate.read().await;
        let request = self
            .store
            .request(&request_id)
            .ok_or(EngineError::not_found("request", request_id))?;

        let mut ids = self.store.children_of(&request_id);
        ids.sort();
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.store.occurrence(&id) {
                rows.push(row.write_owned().await);
            }
        }
        rows.retain(|occ| self.store.contains_occurrence(&occ.id));
        if self.store.request(&request_id).is_none() {
            return Err(EngineError::not_found("request", request_id));
        }

        let now = self.clock.now();
        let offset = self.settings.utc_offset;
        let upcoming: Vec<&BookingOccurrence> = rows
            .iter()
            .map(|g| &**g)
            .filter(|occ| !is_past(occ, now, offset) && !occ.status.is_terminal())
            .collect();

        let mut by_caregiver: BTreeMap<Ulid, Vec<&BookingOccurrence>> = BTreeMap::new();
        for occ in &upcoming {
            if let Some(caregiver_id) = occ.assigned_caregiver_id {
                by_caregiver.entry(caregiver_id).or_default().push(*occ);
            }
        }

        let mut parties = Vec::new();
        if let Some(owner) = self.store.owner(&request.owner_id) {
            parties.push(Party::owner(&owner));
        }
        parties.extend(
            by_caregiver
                .keys()
                .filter_map(|id| self.store.caregiver(id))
                .map(|c| Party::caregiver(&c)),
        );
        let recipients = dedup_recipients(parties);

        let mut tasks = Vec::new();
        if !upcoming.is_empty() {
            for party in &recipients {
                let notice = match by_caregiver.get(&party.user_id) {
                    Some(held) if party.user_id != request.owner_id => {
                        request_notice(&request, held[0].id, held)
                    }
                    _ => request_notice(&request, request.id, &upcoming),
                };
                tasks.extend(
                    self.dispatcher
                        .cancellation_tasks(&notice, std::slice::from_ref(party)),
                );
            }
        }
        let notified = if tasks.is_empty() { 0 } else { recipients.len() };
        let dispatch = self.dispatcher.run(tasks).await;

        let caregiver_ids: Vec<Ulid> = rows.iter().filter_map(|o| o.assigned_caregiver_id).collect();
        let mut cals = self.lock_calendars(caregiver_ids).await?;

        let mut events: Vec<Event> = rows
            .iter()
            .map(|occ| Event::OccurrenceDeleted {
                id: occ.id,
                request_id,
                slot: occ.slot(),
                caregiver_id: occ.assigned_caregiver_id,
            })
            .collect();
        events.push(Event::RequestDeleted { id: request_id });
        events.push(Event::DecisionRecorded {
            decision: decision(
                request_id,
                None,
                admin_id,
                DecisionAction::Delete,
                Some(format!("deleted request with {} occurrence(s)", rows.len())),
                now,
            ),
        });
        self.persist_and_apply(events, None, &mut cals).await?;

        info!(%request_id, occurrences = rows.len(), recipients = notified, "request deleted");
        Ok(DeletionReport {
            occurrences_removed: rows.len(),
            recipients: notified,
            dispatch,
        })
    }

    /// Import a request with its materialized occurrences.
    pub async fn create_request(
        &self,
        request: OwnerRequest,
        occurrences: Vec<BookingOccurrence>,
    ) -> Result<(), EngineError> {
        if occurrences.len() > MAX_OCCURRENCES_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many occurrences in request"));
        }
        if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("request notes too long"));
        }
        let _gate = self.snapshot_gate.read().await;
        if self.store.request(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }
        if self.store.owner(&request.owner_id).is_none() {
            return Err(EngineError::not_found("owner", request.owner_id));
        }

        let mut seen = HashSet::new();
        let mut held_slots = HashSet::new();
        for occ in &occurrences {
            if occ.request_id != request.id {
                return Err(EngineError::Validation(format!(
                    "occurrence {} belongs to request {}",
                    occ.id, occ.request_id
                )));
            }
            if !seen.insert(occ.id) || self.store.contains_occurrence(&occ.id) {
                return Err(EngineError::AlreadyExists(occ.id));
            }
            if !occ.invariant_holds() {
                return Err(EngineError::Validation(format!(
                    "occurrence {} is {} but caregiver is {:?}",
                    occ.id, occ.status, occ.assigned_caregiver_id
                )));
            }
            validate_note(occ.admin_notes.as_deref())?;
            if let Some(caregiver_id) = occ.assigned_caregiver_id
                && occ.status.occupies_slot()
                && !held_slots.insert((caregiver_id, occ.slot()))
            {
                return Err(EngineError::Conflict {
                    caregiver_id,
                    slot: occ.slot(),
                    occurrence_id: occ.id,
                });
            }
        }

        let mut cals = self
            .lock_calendars(held_slots.iter().map(|(c, _)| *c).collect())
            .await?;
        for (caregiver_id, slot) in &held_slots {
            if let Some(cal) = cals.iter().find(|c| c.caregiver_id == *caregiver_id) {
                check_slot(cal, slot, None)?;
            }
        }

        let count = occurrences.len();
        let request_id = request.id;
        let events = vec![Event::RequestCreated { request, occurrences }];
        self.persist_and_apply(events, None, &mut cals).await?;
        debug!(%request_id, occurrences = count, "request created");
        Ok(())
    }

    pub async fn upsert_owner(&self, owner: OwnerProfile) -> Result<(), EngineError> {
        validate_name(&owner.name)?;
        let _gate = self.snapshot_gate.read().await;
        self.persist_and_apply(vec![Event::OwnerUpserted { owner }], None, &mut [])
            .await
    }

    pub async fn upsert_caregiver(&self, caregiver: CaregiverProfile) -> Result<(), EngineError> {
        validate_name(&caregiver.name)?;
        if caregiver
            .service_radius_km
            .is_some_and(|r| !r.is_finite() || r < 0.0)
        {
            return Err(EngineError::Validation("serviceRadiusKm must be a non-negative number".into()));
        }
        let _gate = self.snapshot_gate.read().await;
        self.persist_and_apply(vec![Event::CaregiverUpserted { caregiver }], None, &mut [])
            .await
    }

    pub async fn add_block(&self, block: SlotBlock) -> Result<(), EngineError> {
        if block.reason.as_ref().is_some_and(|r| r.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("block reason too long"));
        }
        let _gate = self.snapshot_gate.read().await;
        let mut cals = self.lock_calendars(vec![block.caregiver_id]).await?;
        if cals[0].blocks.len() >= MAX_BLOCKS_PER_CAREGIVER {
            return Err(EngineError::LimitExceeded("too many blocks on caregiver"));
        }
        self.persist_and_apply(vec![Event::BlockAdded { block }], None, &mut cals)
            .await
    }

    pub async fn remove_block(&self, caregiver_id: Ulid, block_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.snapshot_gate.read().await;
        let mut cals = self.lock_calendars(vec![caregiver_id]).await?;
        if !cals[0].blocks.iter().any(|b| b.id == block_id) {
            return Err(EngineError::not_found("block", block_id));
        }
        let event = Event::BlockRemoved {
            id: block_id,
            caregiver_id,
        };
        self.persist_and_apply(vec![event], None, &mut cals).await
    }

    /// Standalone audit entry. Mutations record their own in the same commit.
    pub async fn record_decision(
        &self,
        request_id: Ulid,
        admin_id: Ulid,
        action: DecisionAction,
        note: Option<String>,
    ) -> Result<AdminDecision, EngineError> {
        validate_note(note.as_deref())?;
        if self.store.request(&request_id).is_none() {
            return Err(EngineError::not_found("request", request_id));
        }
        let _gate = self.snapshot_gate.read().await;
        let entry = decision(request_id, None, admin_id, action, note, self.clock.now());
        self.persist_and_apply(
            vec![Event::DecisionRecorded {
                decision: entry.clone(),
            }],
            None,
            &mut [],
        )
        .await?;
        Ok(entry)
    }

    /// Rewrite the WAL as a single snapshot commit of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.snapshot_gate.write().await;
        let mut events = Vec::new();

        events.extend(
            self.store
                .owners()
                .into_iter()
                .map(|owner| Event::OwnerUpserted { owner }),
        );
        for caregiver in self.store.caregivers() {
            let caregiver_id = caregiver.id;
            events.push(Event::CaregiverUpserted { caregiver });
            if let Some(cal) = self.store.calendar(&caregiver_id) {
                let cal = cal.read().await;
                events.extend(cal.blocks.iter().cloned().map(|block| Event::BlockAdded { block }));
            }
        }
        for request in self.store.requests() {
            let mut occurrences = Vec::new();
            for id in self.store.children_of(&request.id) {
                if let Some(row) = self.store.occurrence(&id) {
                    occurrences.push(row.read().await.clone());
                }
            }
            events.push(Event::RequestCreated { request, occurrences });
        }
        events.extend(
            self.store
                .conversations()
                .into_iter()
                .map(|conversation| Event::ConversationUpserted { conversation }),
        );
        events.extend(
            self.store
                .decisions()
                .into_iter()
                .map(|decision| Event::DecisionRecorded { decision }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn request_notice(request: &OwnerRequest, entity_id: Ulid, occurrences: &[&BookingOccurrence]) -> CancellationNotice {
    let mut slots: Vec<Slot> = occurrences.iter().map(|o| o.slot()).collect();
    slots.sort();
    CancellationNotice {
        entity_id,
        request_id: request.id,
        service: request.service,
        slots,
        location: request.location.clone(),
    }
}
