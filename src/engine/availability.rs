use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

// ── Availability Checker ──────────────────────────────────────────

/// Check one slot against a caregiver calendar.
///
/// Conflict granularity is the (date, window) pair: any other ASSIGNED/CONFIRMED
/// commitment on the same slot conflicts, whatever its exact time. A block on the
/// slot (or a whole-day block on its date) also conflicts. `except` skips an
/// occurrence the caregiver already holds.
pub fn check_slot(cal: &CaregiverCalendar, slot: &Slot, except: Option<Ulid>) -> Result<(), EngineError> {
    if cal.block_for(slot).is_some() {
        return Err(EngineError::Blocked {
            caregiver_id: cal.caregiver_id,
            slot: *slot,
        });
    }
    if let Some(occurrence_id) = cal.commitments_at(slot, except).next() {
        return Err(EngineError::Conflict {
            caregiver_id: cal.caregiver_id,
            slot: *slot,
            occurrence_id,
        });
    }
    Ok(())
}

impl Engine {
    /// Pre-flight availability check. The assignment write repeats it under lock.
    pub async fn assert_available(
        &self,
        caregiver_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    ) -> Result<(), EngineError> {
        let caregiver = self
            .store
            .caregiver(&caregiver_id)
            .ok_or(EngineError::not_found("caregiver", caregiver_id))?;
        if !caregiver.active {
            return Err(EngineError::Inactive(caregiver_id));
        }
        let cal = self
            .store
            .calendar(&caregiver_id)
            .ok_or(EngineError::not_found("caregiver", caregiver_id))?;
        let guard = cal.read().await;
        check_slot(&guard, &Slot::new(date, window), None)
    }

    /// Non-failing variant used by the eligibility read path.
    pub(super) async fn is_available(&self, caregiver_id: Ulid, slot: &Slot) -> bool {
        match self.store.calendar(&caregiver_id) {
            Some(cal) => check_slot(&*cal.read().await, slot, None).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(day: u32, window: TimeWindow) -> Slot {
        Slot::new(NaiveDate::from_ymd_opt(2025, 6, day).unwrap(), window)
    }

    #[test]
    fn empty_calendar_is_free() {
        let cal = CaregiverCalendar::new(Ulid::new());
        assert!(check_slot(&cal, &slot(10, TimeWindow::Morning), None).is_ok());
    }

    #[test]
    fn same_slot_commitment_conflicts() {
        let mut cal = CaregiverCalendar::new(Ulid::new());
        let held = Ulid::new();
        cal.commit(slot(10, TimeWindow::Morning), held);

        let err = check_slot(&cal, &slot(10, TimeWindow::Morning), None).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { occurrence_id, .. } if occurrence_id == held));
        assert!(check_slot(&cal, &slot(10, TimeWindow::Afternoon), None).is_ok());
        assert!(check_slot(&cal, &slot(11, TimeWindow::Morning), None).is_ok());
    }

    #[test]
    fn own_commitment_is_skipped() {
        let mut cal = CaregiverCalendar::new(Ulid::new());
        let held = Ulid::new();
        cal.commit(slot(10, TimeWindow::Morning), held);
        assert!(check_slot(&cal, &slot(10, TimeWindow::Morning), Some(held)).is_ok());
    }

    #[test]
    fn block_conflicts() {
        let cid = Ulid::new();
        let mut cal = CaregiverCalendar::new(cid);
        cal.insert_block(SlotBlock {
            id: Ulid::new(),
            caregiver_id: cid,
            date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            window: Some(TimeWindow::Evening),
            reason: None,
        });
        assert!(matches!(
            check_slot(&cal, &slot(10, TimeWindow::Evening), None),
            Err(EngineError::Blocked { .. })
        ));
        assert!(check_slot(&cal, &slot(10, TimeWindow::Morning), None).is_ok());
    }

    #[test]
    fn whole_day_block_beats_everything() {
        let cid = Ulid::new();
        let mut cal = CaregiverCalendar::new(cid);
        cal.insert_block(SlotBlock {
            id: Ulid::new(),
            caregiver_id: cid,
            date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            window: None,
            reason: Some("holiday".into()),
        });
        for w in [TimeWindow::Morning, TimeWindow::Afternoon, TimeWindow::Evening, TimeWindow::Night] {
            assert!(check_slot(&cal, &slot(10, w), None).is_err());
        }
    }
}
