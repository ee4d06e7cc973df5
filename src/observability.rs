use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "wishlist_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "wishlist_http_request_duration_seconds";

/// Counter: reservations written to the store.
pub const RESERVATIONS_GRANTED: &str = "wishlist_reservations_granted_total";

/// Counter: reservation attempts refused. Labels: reason.
pub const RESERVATIONS_REJECTED: &str = "wishlist_reservations_rejected_total";

/// Counter: admission writes that lost a version race and were retried.
pub const ADMISSION_CONFLICTS: &str = "wishlist_admission_conflicts_total";

/// Counter: requests refused by the per-client limiter.
pub const RATE_LIMITED_TOTAL: &str = "wishlist_rate_limited_total";

// ── Reconciler ──────────────────────────────────────────────────

/// Counter: reconciliation passes. Labels: result.
pub const RECONCILES_TOTAL: &str = "wishlist_reconciles_total";

/// Histogram: reconciliation pass duration in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "wishlist_reconcile_duration_seconds";

/// Gauge: names waiting in the controller queue (ready or in backoff).
pub const QUEUE_DEPTH: &str = "wishlist_controller_queue_depth";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: client buckets held by the limiter.
pub const LIMITER_BUCKETS: &str = "wishlist_limiter_buckets";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "wishlist_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "wishlist_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
