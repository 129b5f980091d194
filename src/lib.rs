// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod ai;
pub mod api;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod generator;
pub mod index;
pub mod introspection;
pub mod learning;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod text;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::engine::DetectionEngine;
pub use crate::error::DetectionError;
pub use crate::model::{
    AlternativeCategory, Category, CategoryId, DetectionInput, DetectionMethod, DetectionResult,
    DetectionWarning, FeedbackOutcome, StatsId,
};

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::ai::AiClient;
use crate::config::AppConfig;
use crate::model::NewKeyword;
use crate::scoring::HashingEmbedder;
use crate::store::{CategoryCatalog, DetectionStore, MemoryStore, StaticCatalog};

/// Build the engine from configuration: file-backed store, JSON catalog,
/// hashing embedder and the configured AI provider.
pub async fn engine_from_config(cfg: AppConfig) -> anyhow::Result<DetectionEngine> {
    let store: Arc<dyn DetectionStore> = match &cfg.store.stats_path {
        Some(p) => Arc::new(MemoryStore::open(p)?),
        None => Arc::new(MemoryStore::new()),
    };
    let catalog: Arc<dyn CategoryCatalog> =
        Arc::new(StaticCatalog::load_from_file(&cfg.store.categories_path)?);
    let ai = AiClient::from_config(&cfg.ai);
    let seed = cfg.store.seed_keywords_path.clone();

    let engine = DetectionEngine::build(
        cfg,
        store,
        catalog,
        Arc::new(HashingEmbedder::default()),
        ai,
    )
    .await?;

    if let Some(path) = seed {
        let rows = load_seed_keywords(&path)?;
        let inserted = engine
            .add_keywords(rows)
            .await
            .context("merging seed keywords")?;
        tracing::info!(path = %path.display(), inserted, "seed keywords merged");
    }
    Ok(engine)
}

fn load_seed_keywords(path: &Path) -> anyhow::Result<Vec<NewKeyword>> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed keywords {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parsing seed keywords {}", path.display()))
}
