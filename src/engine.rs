//! # Detection Engine
//! Facade over the index, detector, feedback recorder, learning engine and
//! keyword generator. This is the surface the HTTP adapter and the binary use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::{AiClient, GenerationRequest};
use crate::config::AppConfig;
use crate::detector::Detector;
use crate::error::DetectionError;
use crate::feedback::FeedbackRecorder;
use crate::generator::{BulkGeneration, KeywordGenerator};
use crate::index::KeywordIndex;
use crate::introspection::{
    accuracy_metrics, categories_needing_keywords, keyword_stats, window_start, AccuracyMetrics,
    CategoryCoverage, KeywordStats,
};
use crate::learning::{FeedbackLearning, KeywordImprovement, LearningEngine, LearningReport};
use crate::model::{
    Category, CategoryId, DetectionInput, DetectionResult, FeedbackOutcome, KeywordId,
    KeywordSource, NewKeyword, StatsId,
};
use crate::scoring::{Embedder, SimilarityScorer};
use crate::store::{CategoryCatalog, DetectionStore};

pub const BULK_MIN_KEYWORDS_RANGE: (usize, usize) = (10, 200);
pub const BULK_MIN_KEYWORDS_DEFAULT: usize = 50;

/// Keyword generation request for one category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerateKeywordsRequest {
    pub category_id: CategoryId,
    /// Looked up in the catalog when absent.
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub min_keywords: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    pub category_id: CategoryId,
    pub language: String,
    pub generated: usize,
    pub inserted: usize,
    pub keywords: Vec<NewKeyword>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkCategoryOutcome {
    pub category_id: CategoryId,
    pub category_name: String,
    pub generated: usize,
    pub inserted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub min_keywords: usize,
    pub categories_processed: usize,
    pub keywords_generated: usize,
    pub keywords_inserted: usize,
    pub failed: usize,
    pub categories: Vec<BulkCategoryOutcome>,
}

/// Clamp a caller-supplied minimum into the bulk range.
pub fn bulk_min_keywords(requested: Option<usize>) -> usize {
    let (lo, hi) = BULK_MIN_KEYWORDS_RANGE;
    requested
        .unwrap_or(BULK_MIN_KEYWORDS_DEFAULT)
        .clamp(lo, hi)
}

pub struct DetectionEngine {
    cfg: AppConfig,
    store: Arc<dyn DetectionStore>,
    catalog: Arc<dyn CategoryCatalog>,
    index: KeywordIndex,
    detector: Detector,
    generator: KeywordGenerator,
    learning: Arc<LearningEngine>,
}

impl DetectionEngine {
    /// Wire every component and load the index. Must run inside a tokio runtime
    /// (the feedback worker is spawned here).
    pub async fn build(
        cfg: AppConfig,
        store: Arc<dyn DetectionStore>,
        catalog: Arc<dyn CategoryCatalog>,
        embedder: Arc<dyn Embedder>,
        ai: AiClient,
    ) -> anyhow::Result<Self> {
        let index = KeywordIndex::load(store.clone(), catalog.clone(), &cfg.index).await?;
        let recorder = FeedbackRecorder::spawn(store.clone(), cfg.store.feedback_queue);
        let detector = Detector::new(
            cfg.detection.clone(),
            index.clone(),
            SimilarityScorer::new(embedder),
            ai.clone(),
            recorder,
        );
        let generator = KeywordGenerator::new(ai.clone(), cfg.learning.clone());
        let learning = Arc::new(LearningEngine::new(
            store.clone(),
            index.clone(),
            generator.clone(),
            cfg.learning.clone(),
            &cfg.detection.default_language,
            cfg.detection.other_category_id,
        ));
        info!(
            alpha = cfg.detection.alpha,
            low = cfg.detection.low_threshold,
            high = cfg.detection.high_threshold,
            ai = ai.provider_name(),
            "detection engine ready"
        );
        Ok(Self {
            cfg,
            store,
            catalog,
            index,
            detector,
            generator,
            learning,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn index(&self) -> &KeywordIndex {
        &self.index
    }

    pub fn learning(&self) -> Arc<LearningEngine> {
        self.learning.clone()
    }

    // ---- detection ----

    pub async fn detect_category(&self, input: &DetectionInput) -> Result<DetectionResult, DetectionError> {
        self.detector.detect_category(input).await
    }

    pub async fn detect_with_ai_fallback(
        &self,
        input: &DetectionInput,
    ) -> Result<DetectionResult, DetectionError> {
        self.detector.detect_with_ai_fallback(input).await
    }

    pub async fn detect_with_ai_fallback_cancellable(
        &self,
        input: &DetectionInput,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectionError> {
        self.detector
            .detect_with_ai_fallback_cancellable(input, cancel)
            .await
    }

    pub async fn select_category_directly(
        &self,
        input: &DetectionInput,
    ) -> Result<DetectionResult, DetectionError> {
        self.detector.select_category_directly(input).await
    }

    // ---- feedback ----

    /// Record the category the user settled on. Idempotent: a second call for
    /// the same stats id returns `AlreadySet` and changes nothing.
    pub async fn confirm_detection(
        &self,
        stats_id: StatsId,
        correct_category_id: CategoryId,
    ) -> Result<FeedbackOutcome, DetectionError> {
        if self.index.snapshot().category(correct_category_id).is_none() {
            return Err(DetectionError::Validation(format!(
                "unknown category {correct_category_id}"
            )));
        }
        let outcome = self
            .detector
            .recorder()
            .confirm_category(stats_id, correct_category_id)
            .await?;
        match outcome {
            FeedbackOutcome::NotFound => Err(DetectionError::NotFound(format!(
                "detection {stats_id}"
            ))),
            other => Ok(other),
        }
    }

    /// Explicit confirmation form: `confirmed` plus an optional correction.
    pub async fn confirm_feedback(
        &self,
        stats_id: StatsId,
        confirmed: bool,
        corrected_category_id: Option<CategoryId>,
    ) -> Result<FeedbackOutcome, DetectionError> {
        let outcome = self
            .detector
            .recorder()
            .confirm(stats_id, confirmed, corrected_category_id)
            .await?;
        match outcome {
            FeedbackOutcome::NotFound => Err(DetectionError::NotFound(format!(
                "detection {stats_id}"
            ))),
            other => Ok(other),
        }
    }

    /// Wait for queued stats writes.
    pub async fn flush_feedback(&self) {
        self.detector.recorder().flush().await;
    }

    // ---- learning ----

    pub async fn learn_from_feedback(&self, window_days: Option<u32>) -> Result<FeedbackLearning, DetectionError> {
        self.flush_feedback().await;
        self.learning
            .learn_from_feedback(window_days.unwrap_or(self.cfg.learning.window_days))
            .await
    }

    pub async fn auto_improve_keywords(&self) -> Result<KeywordImprovement, DetectionError> {
        self.flush_feedback().await;
        self.learning.auto_improve_keywords().await
    }

    pub async fn scheduled_learning(&self) -> Result<LearningReport, DetectionError> {
        self.flush_feedback().await;
        self.learning.scheduled_learning().await
    }

    // ---- keywords ----

    async fn refresh_after_write(&self) {
        self.index.invalidate();
        if let Err(e) = self.index.refresh().await {
            warn!(target: "index", error = %format!("{e:#}"), "refresh after keyword write failed");
        }
    }

    /// Operator-curated keywords. Deduplicated against existing rows.
    pub async fn add_keywords(&self, keywords: Vec<NewKeyword>) -> Result<usize, DetectionError> {
        let inserted = self
            .store
            .insert_keywords(keywords)
            .await
            .map_err(DetectionError::persistence)?;
        if inserted > 0 {
            self.refresh_after_write().await;
        }
        Ok(inserted)
    }

    /// Soft delete; the row stays for history.
    pub async fn disable_keyword(&self, id: KeywordId) -> Result<(), DetectionError> {
        let found = self
            .store
            .disable_keyword(id)
            .await
            .map_err(DetectionError::persistence)?;
        if !found {
            return Err(DetectionError::NotFound(format!("keyword {id}")));
        }
        self.refresh_after_write().await;
        Ok(())
    }

    async fn categories(&self) -> Result<Vec<Category>, DetectionError> {
        self.catalog
            .categories()
            .await
            .map_err(DetectionError::persistence)
    }

    /// Generate and persist keywords for one category (`ai_generated`).
    pub async fn generate_keywords_for_category(
        &self,
        req: GenerateKeywordsRequest,
    ) -> Result<GenerationOutcome, DetectionError> {
        let cat = self
            .categories()
            .await?
            .into_iter()
            .find(|c| c.id == req.category_id);
        let (name, slug) = match (req.category_name.filter(|n| !n.trim().is_empty()), cat) {
            (Some(n), c) => (n, c.map(|c| c.slug).unwrap_or_default()),
            (None, Some(c)) => (c.name, c.slug),
            (None, None) => {
                return Err(DetectionError::NotFound(format!(
                    "category {}",
                    req.category_id
                )))
            }
        };
        let language = req
            .language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.cfg.detection.default_language.clone());
        let gen_req = GenerationRequest {
            category_id: req.category_id,
            category_name: name,
            category_slug: slug,
            language,
            min_keywords: req.min_keywords.unwrap_or(self.cfg.learning.min_keywords),
        };

        let generated = self
            .generator
            .generate(&gen_req, KeywordSource::AiGenerated)
            .await?;
        let inserted = self
            .store
            .insert_keywords(generated.keywords.clone())
            .await
            .map_err(DetectionError::persistence)?;
        if inserted > 0 {
            self.refresh_after_write().await;
        }
        Ok(GenerationOutcome {
            category_id: generated.category_id,
            language: generated.language,
            generated: generated.keywords.len(),
            inserted,
            keywords: generated.keywords,
        })
    }

    /// Generate and persist keywords (`ai_generated_bulk`) for `categories`, or
    /// for every category below `min_keywords` when none are given.
    pub async fn generate_keywords_for_all_categories(
        &self,
        categories: Option<Vec<Category>>,
        min_keywords: Option<usize>,
    ) -> Result<BulkOutcome, DetectionError> {
        let min_keywords = bulk_min_keywords(min_keywords);
        let targets = match categories {
            Some(c) => c,
            None => {
                let needing = self.get_categories_needing_keywords(min_keywords).await?;
                needing
                    .into_iter()
                    .map(|c| Category {
                        id: c.category_id,
                        name: c.name,
                        slug: c.slug,
                        parent_id: None,
                        is_active: true,
                    })
                    .collect()
            }
        };

        let bulk: BulkGeneration = self
            .generator
            .generate_bulk(&targets, &self.cfg.detection.default_language, min_keywords)
            .await;

        let mut out = BulkOutcome {
            min_keywords,
            categories_processed: bulk.categories.len(),
            ..Default::default()
        };
        for c in bulk.categories {
            let mut line = BulkCategoryOutcome {
                category_id: c.category_id,
                category_name: c.category_name,
                generated: c.generated,
                inserted: 0,
                error: c.error,
            };
            if line.error.is_none() && !c.keywords.is_empty() {
                match self.store.insert_keywords(c.keywords).await {
                    Ok(n) => line.inserted = n,
                    Err(e) => line.error = Some(format!("{e:#}")),
                }
            }
            out.keywords_generated += line.generated;
            out.keywords_inserted += line.inserted;
            if line.error.is_some() {
                out.failed += 1;
            }
            out.categories.push(line);
        }
        if out.keywords_inserted > 0 {
            self.refresh_after_write().await;
        }
        info!(
            target: "generator",
            categories = out.categories_processed,
            inserted = out.keywords_inserted,
            failed = out.failed,
            "bulk generation finished"
        );
        Ok(out)
    }

    // ---- introspection ----

    pub async fn get_accuracy_metrics(&self, days: u32) -> Result<AccuracyMetrics, DetectionError> {
        self.flush_feedback().await;
        let since = window_start(days);
        let stats = self
            .store
            .stats_since(since)
            .await
            .map_err(DetectionError::persistence)?;
        Ok(accuracy_metrics(days, &stats))
    }

    pub async fn get_keyword_stats(&self, category: Option<CategoryId>) -> Result<KeywordStats, DetectionError> {
        let rows = self
            .store
            .load_keywords()
            .await
            .map_err(DetectionError::persistence)?;
        Ok(keyword_stats(&rows, category))
    }

    pub async fn get_categories_needing_keywords(
        &self,
        min_keywords: usize,
    ) -> Result<Vec<CategoryCoverage>, DetectionError> {
        let categories = self.categories().await?;
        let rows = self
            .store
            .load_keywords()
            .await
            .map_err(DetectionError::persistence)?;
        Ok(categories_needing_keywords(
            &categories,
            &rows,
            min_keywords,
            self.cfg.detection.other_category_id,
        ))
    }
}
