use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and pre-register pipeline metrics
/// so a scrape shows them before the first event.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    // Ingestion
    counter!("signals_accepted_total").absolute(0);
    counter!("integrity_rejections_total").absolute(0);

    // Routing + execution
    counter!("signals_routing_deferred_total").absolute(0);
    counter!("intents_unroutable_total").absolute(0);
    counter!("intents_sizing_failed_total").absolute(0);
    counter!("intents_skipped_total").absolute(0);
    counter!("intents_failed_total").absolute(0);
    counter!("intents_ambiguous_total").absolute(0);

    // Settlement
    counter!("positions_closed_at_venue_total").absolute(0);
    counter!("positions_settled_total").absolute(0);
    counter!("reputation_updates_total").absolute(0);
    gauge!("scored_alpha_sources").set(0.0);

    histogram!("execution_latency_seconds").record(0.0);

    Ok(handle)
}
