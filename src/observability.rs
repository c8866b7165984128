use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "nevermiss_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "nevermiss_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "nevermiss_bookings_confirmed_total";

/// Counter: bookings cancelled, by guest or owner.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "nevermiss_bookings_cancelled_total";

/// Counter: booking attempts rejected because the time was already taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "nevermiss_booking_conflicts_total";

/// Counter: conferencing links that could not be created.
pub const MEETING_PROVISION_FAILURES_TOTAL: &str = "nevermiss_meeting_provision_failures_total";

/// Histogram: slots offered per slot query.
pub const SLOTS_GENERATED: &str = "nevermiss_slots_generated";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "nevermiss_connections_active";

pub const CONNECTIONS_TOTAL: &str = "nevermiss_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "nevermiss_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "nevermiss_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "nevermiss_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "nevermiss_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "nevermiss_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPage { .. } => "insert_page",
        Command::UpdatePage { .. } => "update_page",
        Command::DeletePage { .. } => "delete_page",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SetMeetingUrl { .. } => "set_meeting_url",
        Command::MarkNotificationRead { .. } => "mark_notification_read",
        Command::MarkAllNotificationsRead { .. } => "mark_all_notifications_read",
        Command::SelectPage { .. } => "select_page",
        Command::SelectPageBySlug { .. } => "select_page_by_slug",
        Command::SelectPages { .. } => "select_pages",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectEligibleDates { .. } => "select_eligible_dates",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectNotifications { .. } => "select_notifications",
    }
}
