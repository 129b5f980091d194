//! Category Detection Service: Binary Entrypoint
//! Boots the Axum HTTP server: detection engine, learning scheduler and
//! Prometheus `/metrics`.

use std::sync::Arc;

use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use category_detector::config::AppConfig;
use category_detector::metrics::Metrics;
use category_detector::scheduler::spawn_learning_scheduler;
use category_detector::{api, engine_from_config};

/// Compact logs by default; `DETECTION_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("category_detector=info,warn"));
    let json = std::env::var("DETECTION_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    // Shuttle may already have installed a subscriber; that is not fatal.
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already set");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_toml()?;
    let interval_secs = cfg.learning.interval_secs;
    let ttl_secs = cfg.index.ttl_secs;

    let engine = Arc::new(engine_from_config(cfg).await?);
    let metrics = Metrics::init(ttl_secs)?;

    // Lives for the process; the runtime tears the task down on shutdown.
    let _scheduler = spawn_learning_scheduler(engine.clone(), interval_secs, CancellationToken::new());

    let router = api::router(engine).merge(metrics.router());
    Ok(router.into())
}
