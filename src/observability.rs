use std::net::SocketAddr;

// ── Reservations ────────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "roombook_reservations_created_total";

/// Counter: create/modify attempts rejected because of an overlap.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "roombook_reservation_conflicts_total";

/// Counter: reservations cancelled. Labels: reason (owner, cascade).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "roombook_reservations_cancelled_total";

/// Histogram: reservation create latency in seconds.
pub const RESERVATION_CREATE_SECONDS: &str = "roombook_reservation_create_seconds";

// ── Membership ──────────────────────────────────────────────────

/// Counter: tenants created.
pub const TENANTS_CREATED_TOTAL: &str = "roombook_tenants_created_total";

/// Counter: invite codes redeemed.
pub const INVITES_REDEEMED_TOTAL: &str = "roombook_invites_redeemed_total";

/// Counter: members leaving or removed. Labels: kind (leave, remove).
pub const MEMBER_DEPARTURES_TOTAL: &str = "roombook_member_departures_total";

/// Counter: internal retries after losing a unique value race. Labels: what.
pub const UNIQUE_RETRIES_TOTAL: &str = "roombook_unique_retries_total";

// ── Calendar sync ───────────────────────────────────────────────

/// Counter: sync attempts. Labels: outcome (synced, failed).
pub const CALENDAR_SYNC_TOTAL: &str = "roombook_calendar_sync_total";

/// Counter: credential refreshes after an auth-expired reply.
pub const CALENDAR_REFRESH_TOTAL: &str = "roombook_calendar_refresh_total";

/// Histogram: gateway call latency in seconds. Labels: op.
pub const GATEWAY_CALL_SECONDS: &str = "roombook_gateway_call_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

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
