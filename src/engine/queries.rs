use std::time::Instant;

use futures::StreamExt;
use futures::stream;
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::eligibility::{EligibilityCache, EligibilityCriteria};
use super::{Engine, EngineError};

/// Listing window over requests. `limit: None` returns everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Engine {
    /// Request → occurrence → eligible caregiver trees, newest request first.
    ///
    /// Eligibility is resolved for every non-terminal occurrence with bounded parallelism,
    /// memoized through `cache`. With `include_unavailable == false` a caregiver must also
    /// be free on the occurrence's slot.
    pub async fn list_requests(
        &self,
        page: Page,
        include_unavailable: bool,
        cache: &EligibilityCache,
    ) -> Result<Vec<RequestTree>, EngineError> {
        if page.limit.is_some_and(|l| l > MAX_PAGE_SIZE) {
            return Err(EngineError::LimitExceeded("page size too large"));
        }
        let started = Instant::now();

        let mut requests = self.store.requests();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let requests: Vec<OwnerRequest> = requests
            .into_iter()
            .skip(page.offset)
            .take(page.limit.unwrap_or(usize::MAX))
            .collect();

        let mut shapes = Vec::with_capacity(requests.len());
        let mut occurrences = Vec::new();
        for request in &requests {
            let mut children = Vec::new();
            for id in self.store.children_of(&request.id) {
                if let Some(row) = self.store.occurrence(&id) {
                    children.push(row.read().await.clone());
                }
            }
            children.sort_by(|a, b| {
                (a.scheduled_date, a.time_window, a.id).cmp(&(b.scheduled_date, b.time_window, b.id))
            });
            shapes.push(children.len());
            occurrences.extend(children);
        }

        let require_availability = !include_unavailable;
        let mut views = stream::iter(occurrences)
            .map(|occurrence| async move {
                let eligible_caregivers = if occurrence.status.is_terminal() {
                    Vec::new()
                } else {
                    let criteria = EligibilityCriteria::for_occurrence(&occurrence);
                    self.resolve_eligible(&criteria, require_availability, cache).await
                };
                OccurrenceView {
                    occurrence,
                    eligible_caregivers,
                }
            })
            .buffered(self.settings.listing_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter();

        let trees: Vec<RequestTree> = requests
            .into_iter()
            .zip(shapes)
            .map(|(request, n)| RequestTree {
                owner: self.store.owner(&request.owner_id),
                occurrences: views.by_ref().take(n).collect(),
                request,
            })
            .collect();

        metrics::histogram!(crate::observability::LISTING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(
            requests = trees.len(),
            lookups = cache.lookups(),
            computations = cache.computations(),
            "listing resolved"
        );
        Ok(trees)
    }

    /// Audit trail for one request, oldest first.
    pub fn decisions_for(&self, request_id: &ulid::Ulid) -> Vec<AdminDecision> {
        self.store.decisions_for(request_id)
    }
}
