use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "labres_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "labres_query_duration_seconds";

// ── Booking rules ───────────────────────────────────────────────

/// Counter: reservations accepted as pending.
pub const RESERVATIONS_CREATED_TOTAL: &str = "labres_reservations_created_total";

/// Counter: requests refused by a rule. Labels: op, rule.
pub const REJECTIONS_TOTAL: &str = "labres_rejections_total";

/// Counter: status transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "labres_transitions_total";

/// Counter: pending reservations flipped to expired by the sweep.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "labres_reservations_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "labres_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "labres_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "labres_connections_rejected_total";

/// Histogram: snapshot save duration in seconds.
pub const STORE_SAVE_DURATION_SECONDS: &str = "labres_store_save_duration_seconds";

/// Counter: failed snapshot saves.
pub const STORE_ERRORS_TOTAL: &str = "labres_store_errors_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectLabs { .. } => "select_labs",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertApproval { .. } => "insert_approval",
        Command::InsertDenial { .. } => "insert_denial",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
    }
}
