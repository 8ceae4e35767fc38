use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::geo::{normalize_postal_code, normalize_region};
use crate::model::*;

use super::Engine;

// ── Eligibility Resolver ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityCriteria {
    pub service: ServiceKind,
    pub postal_code: String,
    pub region: Option<String>,
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl EligibilityCriteria {
    pub fn for_occurrence(occ: &BookingOccurrence) -> Self {
        Self {
            service: occ.service,
            postal_code: occ.location.postal_code.clone(),
            region: occ.location.region.clone(),
            date: occ.scheduled_date,
            window: occ.time_window,
        }
    }

    fn slot(&self) -> Slot {
        Slot::new(self.date, self.window)
    }
}

/// Memo key. Postal code and region are normalized so cosmetic differences share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EligibilityKey {
    pub service: ServiceKind,
    pub window: TimeWindow,
    pub date: NaiveDate,
    pub region: Option<String>,
    pub postal_code: String,
    pub require_availability: bool,
}

impl EligibilityKey {
    pub fn new(criteria: &EligibilityCriteria, require_availability: bool) -> Self {
        Self {
            service: criteria.service,
            window: criteria.window,
            date: criteria.date,
            region: criteria
                .region
                .as_deref()
                .map(normalize_region)
                .filter(|r| !r.is_empty()),
            postal_code: normalize_postal_code(&criteria.postal_code),
            require_availability,
        }
    }
}

type Eligible = Arc<Vec<CaregiverSummary>>;

/// Per-listing memo. Concurrent misses on one key share a single computation.
#[derive(Debug, Default)]
pub struct EligibilityCache {
    entries: DashMap<EligibilityKey, Arc<OnceCell<Eligible>>>,
    lookups: AtomicUsize,
    computations: AtomicUsize,
}

impl EligibilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_compute<F, Fut>(&self, key: EligibilityKey, compute: F) -> Eligible
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<CaregiverSummary>>,
    {
        self.lookups.fetch_add(1, AtomicOrdering::Relaxed);
        // Clone the cell out so no map shard lock is held across the await.
        let cell = self.entries.entry(key).or_default().value().clone();
        if let Some(hit) = cell.get() {
            metrics::counter!(crate::observability::ELIGIBILITY_CACHE_HITS_TOTAL).increment(1);
            return hit.clone();
        }
        let value = cell
            .get_or_init(|| async move {
                self.computations.fetch_add(1, AtomicOrdering::Relaxed);
                metrics::counter!(crate::observability::ELIGIBILITY_CACHE_MISSES_TOTAL).increment(1);
                Arc::new(compute().await)
            })
            .await
            .clone();
        value
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(AtomicOrdering::Relaxed)
    }

    /// Underlying resolver runs. At most one per distinct key.
    pub fn computations(&self) -> usize {
        self.computations.load(AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Region matches first, then nearest (unknown distance last), then id.
fn rank(a: &CaregiverSummary, b: &CaregiverSummary) -> Ordering {
    b.region_match
        .cmp(&a.region_match)
        .then_with(|| match (a.distance_km, b.distance_km) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

fn same_region(a: &str, b: &str) -> bool {
    normalize_region(a) == normalize_region(b)
}

impl Engine {
    /// Memoized through `cache`, which lives for one listing call.
    pub async fn resolve_eligible(
        &self,
        criteria: &EligibilityCriteria,
        require_availability: bool,
        cache: &EligibilityCache,
    ) -> Vec<CaregiverSummary> {
        let key = EligibilityKey::new(criteria, require_availability);
        let found = cache
            .get_or_compute(key, || self.compute_eligible(criteria, require_availability))
            .await;
        found.as_ref().clone()
    }

    /// Uncached resolver. Never fails; unknown postal codes just disable the radius rule.
    pub async fn compute_eligible(
        &self,
        criteria: &EligibilityCriteria,
        require_availability: bool,
    ) -> Vec<CaregiverSummary> {
        let region = criteria
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .or_else(|| self.regions.region_of(&criteria.postal_code));
        let slot = criteria.slot();

        let mut eligible = Vec::new();
        for caregiver in self.store.caregivers() {
            if !caregiver.active || !caregiver.offers(criteria.service) {
                continue;
            }
            let region_match = match (&region, &caregiver.region) {
                (Some(wanted), Some(home)) => same_region(wanted, home),
                _ => false,
            };
            let distance_km = caregiver
                .postal_code
                .as_deref()
                .and_then(|home| self.regions.distance_km(home, &criteria.postal_code));
            let radius = caregiver
                .service_radius_km
                .unwrap_or(self.settings.default_radius_km);
            let in_radius = distance_km.is_some_and(|d| d <= radius);
            if !region_match && !in_radius {
                continue;
            }
            if require_availability && !self.is_available(caregiver.id, &slot).await {
                continue;
            }
            eligible.push(CaregiverSummary {
                id: caregiver.id,
                name: caregiver.name,
                email: caregiver.email,
                phone: caregiver.phone,
                region: caregiver.region,
                postal_code: caregiver.postal_code,
                region_match,
                distance_km,
            });
        }
        eligible.sort_by(rank);
        eligible
    }
}
