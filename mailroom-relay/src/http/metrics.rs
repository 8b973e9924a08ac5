//! Prometheus metrics endpoint.

use crate::hub::RelayHub;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
pub async fn metrics_handler(Extension(hub): Extension<Arc<RelayHub>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&hub),
    )
}

/// Render all metrics in Prometheus text format.
pub fn render(hub: &RelayHub) -> String {
    let m = hub.metrics();

    // Gauges
    let connected = hub.connection_count();
    let queued = hub.queued_count();
    let recipients = hub.queued_recipients();

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let received = m.messages_received.load(Ordering::Relaxed);
    let delivered = m.messages_delivered.load(Ordering::Relaxed);
    let queued_total = m.messages_queued.load(Ordering::Relaxed);
    let expired = m.messages_expired.load(Ordering::Relaxed);
    let dropped = m.messages_dropped.load(Ordering::Relaxed);
    let federated = m.federated_received.load(Ordering::Relaxed);
    let malformed = m.malformed_frames.load(Ordering::Relaxed);
    let displacements = m.displacements.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);

    let mut body = format!(
        r#"# HELP mailroom_connected_clients Number of registered connections
# TYPE mailroom_connected_clients gauge
mailroom_connected_clients {connected}

# HELP mailroom_queued_messages Envelopes waiting for their recipient
# TYPE mailroom_queued_messages gauge
mailroom_queued_messages {queued}

# HELP mailroom_queued_recipients Recipients with at least one waiting envelope
# TYPE mailroom_queued_recipients gauge
mailroom_queued_recipients {recipients}

# HELP mailroom_info Server information
# TYPE mailroom_info gauge
mailroom_info{{version="{version}"}} 1

# HELP mailroom_connections_total Total connections registered
# TYPE mailroom_connections_total counter
mailroom_connections_total {conns_total}

# HELP mailroom_messages_received_total Envelopes accepted for routing
# TYPE mailroom_messages_received_total counter
mailroom_messages_received_total {received}

# HELP mailroom_messages_delivered_total Envelopes pushed to a live connection
# TYPE mailroom_messages_delivered_total counter
mailroom_messages_delivered_total {delivered}

# HELP mailroom_messages_queued_total Envelopes queued for an unavailable recipient
# TYPE mailroom_messages_queued_total counter
mailroom_messages_queued_total {queued_total}

# HELP mailroom_messages_expired_total Queued envelopes dropped at TTL expiry
# TYPE mailroom_messages_expired_total counter
mailroom_messages_expired_total {expired}

# HELP mailroom_messages_dropped_total Queued envelopes dropped by queue cap or shutdown
# TYPE mailroom_messages_dropped_total counter
mailroom_messages_dropped_total {dropped}

# HELP mailroom_federated_messages_total Envelopes received from peer relays
# TYPE mailroom_federated_messages_total counter
mailroom_federated_messages_total {federated}

# HELP mailroom_malformed_frames_total Client frames rejected as malformed
# TYPE mailroom_malformed_frames_total counter
mailroom_malformed_frames_total {malformed}

# HELP mailroom_displacements_total Connections replaced by a newer one for the same identity
# TYPE mailroom_displacements_total counter
mailroom_displacements_total {displacements}

# HELP mailroom_rate_limit_hits_total Total rate limit rejections
# TYPE mailroom_rate_limit_hits_total counter
mailroom_rate_limit_hits_total {rate_limits}

# HELP mailroom_delivery_latency_seconds Time from acceptance to push onto a connection
# TYPE mailroom_delivery_latency_seconds histogram
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    let histogram = &m.delivery_latency;
    for (le, count) in histogram.cumulative() {
        let _ = writeln!(
            body,
            "mailroom_delivery_latency_seconds_bucket{{le=\"{le}\"}} {count}"
        );
    }
    let _ = writeln!(
        body,
        "mailroom_delivery_latency_seconds_bucket{{le=\"+Inf\"}} {}",
        histogram.count()
    );
    let _ = writeln!(
        body,
        "mailroom_delivery_latency_seconds_sum {}",
        histogram.sum_seconds()
    );
    let _ = writeln!(
        body,
        "mailroom_delivery_latency_seconds_count {}",
        histogram.count()
    );
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mailroom_types::{Envelope, Identity};

    #[test]
    fn render_reports_gauges_counters_and_histogram() {
        let hub = RelayHub::new(Config::default());
        let env = Envelope::new(
            Identity::new("dave").unwrap(),
            Identity::new("alice").unwrap(),
            b"x".to_vec(),
        );
        hub.route(env).unwrap();

        let text = render(&hub);
        assert!(text.contains("mailroom_queued_messages 1\n"));
        assert!(text.contains("mailroom_queued_recipients 1\n"));
        assert!(text.contains("mailroom_messages_queued_total 1\n"));
        assert!(text.contains("# TYPE mailroom_delivery_latency_seconds histogram"));
        assert!(text.contains("mailroom_delivery_latency_seconds_bucket{le=\"0.001\"} 0"));
        assert!(text.contains("mailroom_delivery_latency_seconds_bucket{le=\"+Inf\"} 0"));
        assert!(text.contains("mailroom_delivery_latency_seconds_count 0"));
    }
}
