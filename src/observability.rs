use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "rentd_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "rentd_op_duration_seconds";

/// Counter: reservations successfully booked.
pub const RESERVATIONS_BOOKED_TOTAL: &str = "rentd_reservations_booked_total";

/// Counter: bookings rejected by the availability-conflict check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "rentd_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Counter: hello/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "rentd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

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

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Reserve { .. } => "reserve",
        Request::ReserveMany { .. } => "reserve_many",
        Request::Cancel { .. } => "cancel",
        Request::ProcessReturn { .. } => "process_return",
        Request::ScheduleMaintenance { .. } => "schedule_maintenance",
        Request::SetMaintenanceStatus { .. } => "set_maintenance_status",
        Request::AddCategory { .. } => "add_category",
        Request::UpdateCategory { .. } => "update_category",
        Request::DeleteCategory { .. } => "delete_category",
        Request::AddItem { .. } => "add_item",
        Request::UpdateItem { .. } => "update_item",
        Request::DeleteItem { .. } => "delete_item",
        Request::SetAvailable { .. } => "set_available",
        Request::ProvisionProfile { .. } => "provision_profile",
        Request::ChangeRole { .. } => "change_role",
        Request::DeleteProfile { .. } => "delete_profile",
        Request::GetItem { .. } => "get_item",
        Request::ListItems { .. } => "list_items",
        Request::ListCategories => "list_categories",
        Request::MyReservations => "my_reservations",
        Request::DueBack => "due_back",
        Request::MaintenanceSchedule => "maintenance_schedule",
        Request::Report => "report",
        Request::Watch { .. } => "watch",
    }
}
