//! Prometheus recorder and metric descriptions.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and describe every metric the
/// core emits. Fails if a recorder is already installed.
pub fn install_prometheus(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .add_global_label("service", service_name)
        .install_recorder()?;
    describe_metrics();
    tracing::info!(service_name, "Prometheus recorder installed");
    Ok(handle)
}

fn describe_metrics() {
    // Events
    describe_counter!("confluence_events_appended_total", "Events durably appended to the store");
    describe_counter!("confluence_events_published_total", "Events routed to a bus topic");
    describe_counter!("confluence_handler_failures_total", "Subscriber handler attempts that failed");
    describe_counter!("confluence_poll_rejected_total", "Polled changes skipped because ingest refused them");
    describe_counter!(
        "confluence_handler_dead_letters_total",
        "Deliveries abandoned after exhausting handler retries"
    );

    // Resilience
    describe_gauge!(
        "confluence_circuit_state",
        "Circuit breaker state per dependency (0 closed, 1 open, 2 half-open)"
    );
    describe_counter!("confluence_circuit_rejections_total", "Calls rejected by an open breaker");
    describe_counter!("confluence_rate_limit_rejections_total", "Requests denied by a rate limiter");

    // Conflicts and sagas
    describe_counter!("confluence_conflicts_detected_total", "Concurrent or stale entity writes detected");
    describe_counter!("confluence_conflicts_resolved_total", "Contested fields resolved, by strategy");
    describe_counter!("confluence_saga_total", "Saga lifecycle transitions by type and status");
    describe_counter!(
        "confluence_saga_compensation_failures_total",
        "Compensating actions that failed and need manual remediation"
    );

    // Routing and reconciliation
    describe_counter!("confluence_strangler_requests_total", "Strangler requests by route and serving side");
    describe_counter!("confluence_strangler_fallbacks_total", "Modern failures that fell back to legacy");
    describe_counter!(
        "confluence_reconciliation_corrections_total",
        "Divergent records corrected by a reconciliation sweep"
    );

    describe_counter!("confluence_errors_total", "Errors by code, category and severity");
}
