use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("detections_total", "Detections served, labelled by method.");
        describe_counter!(
            "detection_fallbacks_total",
            "Detections that fell back to the catch-all category."
        );
        describe_counter!(
            "detection_escalations_total",
            "AI escalations, labelled by outcome."
        );
        describe_histogram!("detection_latency_ms", "End-to-end detection time in milliseconds.");
        describe_counter!(
            "detection_stats_write_failures_total",
            "Stats records that could not be persisted."
        );
        describe_counter!(
            "detection_stats_dropped_total",
            "Stats records dropped because the write queue was full."
        );
        describe_counter!("learning_runs_total", "Learning operations started, by op.");
        describe_counter!(
            "learning_skipped_total",
            "Learning operations skipped because another run held the lock."
        );
        describe_counter!(
            "learning_keywords_added_total",
            "Keywords inserted by auto-improvement."
        );
        describe_counter!("keywords_generated_total", "Keywords proposed by the generator.");
        describe_gauge!("index_ttl_secs", "Configured keyword index TTL in seconds.");
        describe_gauge!(
            "learning_last_run_ts",
            "Unix ts when scheduled learning last completed."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the index TTL as a static gauge.
    pub fn init(index_ttl_secs: u64) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        ensure_metrics_described();
        gauge!("index_ttl_secs").set(index_ttl_secs as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
