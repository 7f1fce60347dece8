use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tutorium_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tutorium_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tutorium_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tutorium_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tutorium_connections_rejected_total";

/// Gauge: number of active schools (loaded schedulers).
pub const SCHOOLS_ACTIVE: &str = "tutorium_schools_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorium_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorium_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SubmitBooking { .. } => "submit_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::DecideBooking { .. } => "decide_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::DeleteBlackout { .. } => "delete_blackout",
        Command::SelectBlackouts => "select_blackouts",
        Command::InsertBusy { .. } => "insert_busy",
        Command::DeleteBusy { .. } => "delete_busy",
        Command::SelectBusy { .. } => "select_busy",
        Command::SelectQuotas { .. } => "select_quotas",
        Command::SetQuotaLimit { .. } => "set_quota_limit",
        Command::ResetQuota { .. } => "reset_quota",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
