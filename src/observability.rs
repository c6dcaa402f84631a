use std::net::SocketAddr;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "docket_bookings_created_total";

/// Counter: booking creations/edits refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "docket_bookings_rejected_total";

/// Counter: bookings deleted.
pub const BOOKINGS_DELETED_TOTAL: &str = "docket_bookings_deleted_total";

// ── Schedule maintenance ────────────────────────────────────────

/// Counter: slot merges applied.
pub const SLOT_MERGES_TOTAL: &str = "docket_slot_merges_total";

/// Counter: bookings re-keyed by merges.
pub const MERGE_REWRITES_TOTAL: &str = "docket_merge_rewrites_total";

/// Gauge: providers loaded in the engine.
pub const PROVIDERS_ACTIVE: &str = "docket_providers_active";

/// Counter: persisted records skipped while loading. Labels: kind.
pub const RECORDS_SKIPPED_TOTAL: &str = "docket_records_skipped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count a refused booking operation.
pub fn record_rejection(err: &crate::engine::EngineError) {
    metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => err.reason()).increment(1);
}
