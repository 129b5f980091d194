// src/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::DetectionEngine;

/// Spawn the periodic learning loop. `interval_secs == 0` disables it and
/// returns `None`. The first tick fires after one full interval.
pub fn spawn_learning_scheduler(
    engine: Arc<DetectionEngine>,
    interval_secs: u64,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!(target: "learning", "scheduled learning disabled");
        return None;
    }
    let period = Duration::from_secs(interval_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match engine.scheduled_learning().await {
                Ok(report) => {
                    gauge!("learning_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
                    tracing::info!(
                        target: "learning",
                        duration_ms = report.duration_ms,
                        errors = report.errors.len(),
                        "scheduled learning tick"
                    );
                }
                Err(e) => {
                    tracing::warn!(target: "learning", error = %e, "scheduled learning skipped");
                }
            }
        }
        tracing::info!(target: "learning", "learning scheduler stopped");
    }))
}
