mod availability;
mod conflict;
mod eligibility;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use availability::check_slot;
pub use conflict::{Clock, FixedClock, SystemClock};
pub use eligibility::{EligibilityCache, EligibilityCriteria, EligibilityKey};
pub use error::EngineError;
pub use lifecycle::{DefaultNotePolicy, MutationCommand, Transition, status_transition_allowed};
pub use mutations::DeletionReport;
pub use queries::Page;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::dispatch::{Dispatcher, DispatchMode};
use crate::geo::RegionLookup;
use crate::model::*;
use crate::wal::Wal;

use store::{apply_to_calendar, apply_to_occurrence};

pub type SharedOccurrence = Arc<RwLock<BookingOccurrence>>;
pub type SharedCalendar = Arc<RwLock<CaregiverCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches commits.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingCommit>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let results = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for ((_, tx), result) in batch.drain(..).zip(results) {
        if let Err(e) = &result {
            error!(error = %e, "WAL commit failed");
        }
        let _ = tx.send(result);
    }
}

/// One result per commit. A commit rejected before any of its bytes were buffered
/// fails alone; any other error fails the rest of the batch.
fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> Vec<io::Result<()>> {
    let mut rejected: Vec<Option<io::Error>> = Vec::with_capacity(batch.len());
    let mut fatal: Option<io::Error> = None;
    for (events, _) in batch {
        if fatal.is_some() {
            rejected.push(None);
            continue;
        }
        match wal.append_buffered(events) {
            Ok(()) => rejected.push(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => rejected.push(Some(e)),
            Err(e) => {
                fatal = Some(e);
                rejected.push(None);
            }
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let shared = fatal.or(wal.flush_sync().err());
    rejected
        .into_iter()
        .map(|r| match (r, &shared) {
            (Some(e), _) => Err(e),
            (None, Some(e)) => Err(io::Error::new(e.kind(), e.to_string())),
            (None, None) => Ok(()),
        })
        .collect()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Offset used to read occurrence dates/times as instants.
    pub utc_offset: FixedOffset,
    /// Reach for caregivers without their own radius.
    pub default_radius_km: f64,
    /// Occurrences resolved concurrently by one listing.
    pub listing_concurrency: usize,
    pub dispatch_mode: DispatchMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            default_radius_km: 15.0,
            listing_concurrency: 8,
            dispatch_mode: DispatchMode::Detached,
        }
    }
}

/// Collaborators the engine consumes.
pub struct EngineDeps {
    pub clock: Arc<dyn Clock>,
    pub regions: Arc<dyn RegionLookup>,
    pub dispatcher: Arc<Dispatcher>,
}

pub struct Engine {
    pub store: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared for their whole duration; compaction takes it exclusively
    /// so the snapshot never misses an in-flight commit.
    snapshot_gate: RwLock<()>,
    clock: Arc<dyn Clock>,
    regions: Arc<dyn RegionLookup>,
    dispatcher: Arc<Dispatcher>,
    settings: EngineSettings,
    note_policy: DefaultNotePolicy,
}

impl Engine {
    /// Replay the WAL at `wal_path`, cut any torn tail, and start its writer task.
    /// Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf, settings: EngineSettings, deps: EngineDeps) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            snapshot_gate: RwLock::new(()),
            clock: deps.clock,
            regions: deps.regions,
            dispatcher: deps.dispatcher,
            settings,
            note_policy: DefaultNotePolicy,
        };

        for event in &events {
            engine.replay_event(event);
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            requests = engine.store.requests().len(),
            occurrences = engine.store.occurrence_count(),
            "engine opened"
        );
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Snapshot of one occurrence row.
    pub async fn occurrence(&self, id: &Ulid) -> Option<BookingOccurrence> {
        let row = self.store.occurrence(id)?;
        let occ = row.read().await.clone();
        Some(occ)
    }

    /// Snapshot of a caregiver calendar.
    pub async fn calendar(&self, caregiver_id: &Ulid) -> Option<CaregiverCalendar> {
        let cal = self.store.calendar(caregiver_id)?;
        let snapshot = cal.read().await.clone();
        Some(snapshot)
    }

    /// Replay runs before the engine is shared, so every lock is uncontended.
    fn replay_event(&self, event: &Event) {
        self.store.apply_tables(event);
        if let Some(id) = event.occurrence_id()
            && let Some(row) = self.store.occurrence(&id)
        {
            match row.try_write() {
                Ok(mut occ) => apply_to_occurrence(&mut occ, event),
                Err(_) => warn!(%id, "replay: occurrence row busy, event skipped"),
            }
        }
        for caregiver_id in event.calendar_ids() {
            if let Some(cal) = self.store.calendar(&caregiver_id) {
                match cal.try_write() {
                    Ok(mut cal) => apply_to_calendar(&mut cal, event),
                    Err(_) => warn!(%caregiver_id, "replay: calendar busy, event skipped"),
                }
            }
        }
    }

    /// Write one commit through the group-commit writer.
    async fn wal_commit(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-commit + apply. The caller holds the write locks on `occ` and `cals`.
    pub(super) async fn persist_and_apply(
        &self,
        events: Vec<Event>,
        mut occ: Option<&mut BookingOccurrence>,
        cals: &mut [OwnedRwLockWriteGuard<CaregiverCalendar>],
    ) -> Result<(), EngineError> {
        self.wal_commit(events.clone()).await?;
        for event in &events {
            self.store.apply_tables(event);
            if let Some(occ) = occ.as_deref_mut() {
                apply_to_occurrence(occ, event);
            }
            for cal in cals.iter_mut() {
                apply_to_calendar(cal, event);
            }
        }
        Ok(())
    }

    /// Write-lock calendars in sorted id order.
    pub(super) async fn lock_calendars(
        &self,
        mut caregiver_ids: Vec<Ulid>,
    ) -> Result<Vec<OwnedRwLockWriteGuard<CaregiverCalendar>>, EngineError> {
        caregiver_ids.sort();
        caregiver_ids.dedup();
        let mut guards = Vec::with_capacity(caregiver_ids.len());
        for id in caregiver_ids {
            let cal = self
                .store
                .calendar(&id)
                .ok_or(EngineError::not_found("caregiver", id))?;
            guards.push(cal.write_owned().await);
        }
        Ok(guards)
    }

    /// Write-lock one occurrence row, failing if it was deleted while we waited.
    pub(super) async fn lock_occurrence(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BookingOccurrence>, EngineError> {
        let row = self
            .store
            .occurrence(&id)
            .ok_or(EngineError::not_found("occurrence", id))?;
        let guard = row.write_owned().await;
        if !self.store.contains_occurrence(&id) {
            return Err(EngineError::not_found("occurrence", id));
        }
        Ok(guard)
    }
}
