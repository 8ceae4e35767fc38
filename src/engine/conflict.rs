use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, Utc};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Source of "now" for the past-slot guard and audit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and benchmarks.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Local start of the occurrence (exact time, else window start).
pub(crate) fn local_start(occ: &BookingOccurrence) -> NaiveDateTime {
    occ.scheduled_date.and_time(occ.starts_at())
}

/// True once the occurrence's start, read in `offset`, is at or before `now`.
pub(crate) fn is_past(occ: &BookingOccurrence, now: DateTime<Utc>, offset: FixedOffset) -> bool {
    let start_utc = local_start(occ) - TimeDelta::seconds(offset.local_minus_utc() as i64);
    start_utc <= now.naive_utc()
}

/// Runs before every other domain check on a mutating call.
pub(crate) fn guard_not_past(
    occ: &BookingOccurrence,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<(), EngineError> {
    if is_past(occ, now, offset) {
        metrics::counter!(crate::observability::PAST_SLOT_REJECTIONS_TOTAL).increment(1);
        return Err(EngineError::PastSlot {
            id: occ.id,
            starts_at: local_start(occ),
        });
    }
    Ok(())
}

pub(crate) fn guard_version(occ: &BookingOccurrence, expected: Option<u64>) -> Result<(), EngineError> {
    match expected {
        Some(expected) if expected != occ.version => Err(EngineError::StaleVersion {
            id: occ.id,
            expected,
            actual: occ.version,
        }),
        _ => Ok(()),
    }
}

pub(crate) fn validate_note(note: Option<&str>) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::LimitExceeded("admin note too long"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}
