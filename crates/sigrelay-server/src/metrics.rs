//! Prometheus metrics recorder and `/metrics` endpoint support.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Build a handle without installing it globally (tests, embedding).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric names.

/// WebSocket sessions opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket sessions closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Registered connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused at the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Rooms with at least one member (gauge).
pub const SIGNAL_ROOMS_ACTIVE: &str = "signal_rooms_active";
/// Inbound signaling messages (counter, labels: type).
pub const SIGNAL_MESSAGES_TOTAL: &str = "signal_messages_total";
/// Inbound messages that failed to parse (counter).
pub const SIGNAL_MALFORMED_TOTAL: &str = "signal_malformed_total";
/// Frames enqueued for a recipient by fan-out (counter).
pub const SIGNAL_BROADCAST_RECIPIENTS_TOTAL: &str = "signal_broadcast_recipients_total";
/// Best-effort deliveries that failed (counter, labels: reason).
pub const SIGNAL_DELIVERY_FAILURES_TOTAL: &str = "signal_delivery_failures_total";
/// Peers evicted after a failed delivery (counter).
pub const SIGNAL_EVICTIONS_TOTAL: &str = "signal_evictions_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders() {
        let handle = detached_handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_REJECTED_TOTAL,
            SIGNAL_ROOMS_ACTIVE,
            SIGNAL_MESSAGES_TOTAL,
            SIGNAL_MALFORMED_TOTAL,
            SIGNAL_BROADCAST_RECIPIENTS_TOTAL,
            SIGNAL_DELIVERY_FAILURES_TOTAL,
            SIGNAL_EVICTIONS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
