use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "petdispatch_http_requests_total";

/// Histogram: HTTP handler latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "petdispatch_http_request_duration_seconds";

/// Counter: requests rejected for missing or non-admin credentials.
pub const AUTH_FAILURES_TOTAL: &str = "petdispatch_auth_failures_total";

/// Histogram: admin listing build time in seconds.
pub const LISTING_DURATION_SECONDS: &str = "petdispatch_listing_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: committed assignments.
pub const ASSIGNMENTS_TOTAL: &str = "petdispatch_assignments_total";

/// Counter: assignments refused because the caregiver was busy or blocked.
pub const ASSIGNMENT_CONFLICTS_TOTAL: &str = "petdispatch_assignment_conflicts_total";

/// Counter: mutations refused because the slot already started.
pub const PAST_SLOT_REJECTIONS_TOTAL: &str = "petdispatch_past_slot_rejections_total";

/// Counter: eligibility lookups served from the per-listing cache.
pub const ELIGIBILITY_CACHE_HITS_TOTAL: &str = "petdispatch_eligibility_cache_hits_total";

/// Counter: eligibility lookups that ran the resolver.
pub const ELIGIBILITY_CACHE_MISSES_TOTAL: &str = "petdispatch_eligibility_cache_misses_total";

/// Counter: notifications and emails delivered. Labels: channel.
pub const DISPATCH_DELIVERED_TOTAL: &str = "petdispatch_dispatch_delivered_total";

/// Counter: notifications and emails that failed or timed out. Labels: channel.
pub const DISPATCH_FAILED_TOTAL: &str = "petdispatch_dispatch_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "petdispatch_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "petdispatch_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "petdispatch_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged; the service keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}
