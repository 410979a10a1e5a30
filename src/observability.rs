use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "docent_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "docent_query_duration_seconds";

// ── Capacity ────────────────────────────────────────────────────

/// Counter: reservation attempts. Labels: kind (appointment|registration),
/// outcome (ok or the rejection code).
pub const RESERVATIONS_TOTAL: &str = "docent_reservations_total";

/// Counter: units handed back by cancellations. Labels: kind.
pub const CAPACITY_RELEASES_TOTAL: &str = "docent_capacity_releases_total";

/// Counter: reservations rolled back because the WAL append failed.
pub const WAL_COMPENSATIONS_TOTAL: &str = "docent_wal_compensations_total";

/// Counter: appointments moved to completed by the sweep.
pub const SWEEP_COMPLETED_TOTAL: &str = "docent_sweep_completed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "docent_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "docent_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "docent_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "docent_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "docent_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "docent_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectTimeSlots => "select_time_slots",
        Command::InsertTimeSlot { .. } => "insert_time_slot",
        Command::UpdateTimeSlot { .. } => "update_time_slot",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAppointmentCounts => "select_appointment_counts",
        Command::InsertActivity(_) => "insert_activity",
        Command::UpdateActivity { .. } => "update_activity",
        Command::SelectActivities { .. } => "select_activities",
        Command::SelectActivityCategories => "select_activity_categories",
        Command::InsertRegistration { .. } => "insert_registration",
        Command::CancelRegistration { .. } => "cancel_registration",
        Command::SelectRegistrations { .. } => "select_registrations",
        Command::SelectLedgerCheck => "select_ledger_check",
    }
}
