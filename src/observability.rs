use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spotledger_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spotledger_query_duration_seconds";

// ── Connections and canvases ────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "spotledger_connections_active";
pub const CONNECTIONS_TOTAL: &str = "spotledger_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spotledger_connections_rejected_total";

/// Gauge: canvases with a loaded engine.
pub const CANVASES_ACTIVE: &str = "spotledger_canvases_active";

// ── Ledger ──────────────────────────────────────────────────────

pub const SPOTS_CLAIMED_TOTAL: &str = "spotledger_spots_claimed_total";

/// Counter: claims rejected because the region was already taken.
pub const OVERLAP_CONFLICTS_TOTAL: &str = "spotledger_overlap_conflicts_total";

pub const UPLOADS_TOTAL: &str = "spotledger_uploads_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotledger_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotledger_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on every request metric.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSelection { .. } => "select_selection",
        Command::InsertSpot { .. } => "insert_spot",
        Command::SelectSpots { .. } => "select_spots",
        Command::SelectStats => "select_stats",
        Command::SelectLeaderboard { .. } => "select_leaderboard",
        Command::SelectWhitelist { .. } => "select_whitelist",
        Command::InsertWhitelist { .. } => "insert_whitelist",
        Command::DeleteWhitelist { .. } => "delete_whitelist",
        Command::ConsumeAllowance { .. } => "consume_allowance",
        Command::InsertUpload { .. } => "insert_upload",
    }
}
