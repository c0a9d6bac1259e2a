use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "scopetime_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "scopetime_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: lifecycle transitions applied. Labels: action.
pub const APPOINTMENT_TRANSITIONS_TOTAL: &str = "scopetime_appointment_transitions_total";

/// Counter: failed commands of any kind. Labels: command, reason (error tag).
pub const COMMAND_REJECTIONS_TOTAL: &str = "scopetime_command_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "scopetime_connections_active";
pub const CONNECTIONS_TOTAL: &str = "scopetime_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "scopetime_connections_rejected_total";

/// Gauge: loaded observatory engines.
pub const TENANTS_ACTIVE: &str = "scopetime_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "scopetime_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "scopetime_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "scopetime_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTelescope { .. } => "insert_telescope",
        Command::DeleteTelescope { .. } => "delete_telescope",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUserRoles { .. } => "update_user_roles",
        Command::SetAllottedTime { .. } => "set_allotted_time",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::RequestAppointment { .. } => "request_appointment",
        Command::RescheduleAppointment { .. } => "reschedule_appointment",
        Command::TransitionAppointment { .. } => "transition_appointment",
        Command::AddCoordinate { .. } => "add_coordinate",
        Command::Calibrate { .. } => "calibrate",
        Command::PurgeAppointment { .. } => "purge_appointment",
        Command::SelectTelescopes => "select_telescopes",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectOverlap { .. } => "select_overlap",
        Command::SelectAllottedTime { .. } => "select_allotted_time",
    }
}
