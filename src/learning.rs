// src/learning.rs
//! Self-improvement passes over recorded detections.
//!
//! Passes never run concurrently with each other: a second caller gets
//! `DetectionError::Concurrency` instead of waiting. Writes go to the store as
//! one batch and are followed by an index refresh.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ai::GenerationRequest;
use crate::config::LearningConfig;
use crate::error::DetectionError;
use crate::generator::KeywordGenerator;
use crate::index::KeywordIndex;
use crate::introspection::window_start;
use crate::model::{CategoryId, DetectionStats, KeywordSource};
use crate::store::{DetectionStore, LearningBatch, SuccessRateUpdate, UsageIncrement};
use crate::text::normalize_keyword;

type KeywordKey = (CategoryId, String, String);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackLearning {
    pub window_days: u32,
    pub stats_scanned: usize,
    pub feedback_records: usize,
    pub success_rates_updated: usize,
    pub usage_records: usize,
    pub usage_increments: u64,
    pub checkpoint: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryImprovement {
    pub category_id: CategoryId,
    pub keywords_before: usize,
    pub keywords_after: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeywordImprovement {
    pub categories_flagged: usize,
    pub keywords_added: usize,
    pub categories: Vec<CategoryImprovement>,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LearningReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackLearning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement: Option<KeywordImprovement>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct LearningEngine {
    store: Arc<dyn DetectionStore>,
    index: KeywordIndex,
    generator: KeywordGenerator,
    cfg: LearningConfig,
    default_language: String,
    other_category_id: CategoryId,
    running: Mutex<()>,
}

impl LearningEngine {
    pub fn new(
        store: Arc<dyn DetectionStore>,
        index: KeywordIndex,
        generator: KeywordGenerator,
        cfg: LearningConfig,
        default_language: &str,
        other_category_id: CategoryId,
    ) -> Self {
        Self {
            store,
            index,
            generator,
            cfg,
            default_language: default_language.to_ascii_lowercase(),
            other_category_id,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    fn acquire(&self, op: &'static str) -> Result<tokio::sync::MutexGuard<'_, ()>, DetectionError> {
        self.running.try_lock().map_err(|_| {
            counter!("learning_skipped_total", "op" => op).increment(1);
            warn!(target: "learning", op, "learning pass already running, skipped");
            DetectionError::Concurrency("learning pass already running".into())
        })
    }

    /// Recompute success rates over the trailing window and apply pending usage.
    pub async fn learn_from_feedback(&self, window_days: u32) -> Result<FeedbackLearning, DetectionError> {
        let _guard = self.acquire("learn_from_feedback")?;
        counter!("learning_runs_total", "op" => "learn_from_feedback").increment(1);
        self.learn_locked(window_days).await
    }

    /// Generate keywords for under-performing, under-covered categories.
    pub async fn auto_improve_keywords(&self) -> Result<KeywordImprovement, DetectionError> {
        let _guard = self.acquire("auto_improve_keywords")?;
        counter!("learning_runs_total", "op" => "auto_improve_keywords").increment(1);
        self.improve_locked().await
    }

    /// Both passes under one lock hold. A failing half is reported in `errors`.
    pub async fn scheduled_learning(&self) -> Result<LearningReport, DetectionError> {
        let _guard = self.acquire("scheduled_learning")?;
        counter!("learning_runs_total", "op" => "scheduled_learning").increment(1);
        let started = Instant::now();
        let mut report = LearningReport::default();

        match self.learn_locked(self.cfg.window_days).await {
            Ok(f) => report.feedback = Some(f),
            Err(e) => report.errors.push(e.to_string()),
        }
        match self.improve_locked().await {
            Ok(i) => report.improvement = Some(i),
            Err(e) => report.errors.push(e.to_string()),
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            target: "learning",
            errors = report.errors.len(),
            ms = report.duration_ms,
            "scheduled learning finished"
        );
        Ok(report)
    }

    fn language_of(&self, s: &DetectionStats) -> String {
        let l = s.input.language.trim();
        if l.is_empty() {
            self.default_language.clone()
        } else {
            l.to_ascii_lowercase()
        }
    }

    /// Distinct normalized keys for the keywords a record matched.
    fn keys_of(&self, s: &DetectionStats) -> HashSet<KeywordKey> {
        let language = self.language_of(s);
        s.matched_keywords
            .iter()
            .map(|k| normalize_keyword(k))
            .filter(|k| !k.is_empty())
            .map(|k| (s.category_id, language.clone(), k))
            .collect()
    }

    async fn learn_locked(&self, window_days: u32) -> Result<FeedbackLearning, DetectionError> {
        let since = window_start(window_days);
        let window = self
            .store
            .stats_since(since)
            .await
            .map_err(DetectionError::persistence)?;

        // confirmed / total per keyword, recomputed from scratch
        let mut tallies: HashMap<KeywordKey, (u32, u32)> = HashMap::new();
        let mut feedback_records = 0;
        for s in window.iter().filter(|s| s.has_feedback()) {
            feedback_records += 1;
            let success = s.is_success();
            for key in self.keys_of(s) {
                let t = tallies.entry(key).or_default();
                t.1 += 1;
                if success {
                    t.0 += 1;
                }
            }
        }
        let min_samples = self.cfg.min_samples.max(1);
        let success_rates: Vec<SuccessRateUpdate> = tallies
            .into_iter()
            .filter(|(_, (_, total))| *total >= min_samples)
            .map(|((category_id, language, keyword), (confirmed, total))| SuccessRateUpdate {
                category_id,
                language,
                keyword,
                success_rate: confirmed as f32 / total as f32,
            })
            .collect();

        // usage since the last checkpoint
        let checkpoint = self
            .store
            .learning_checkpoint()
            .await
            .map_err(DetectionError::persistence)?;
        let fresh = self
            .store
            .stats_after(checkpoint)
            .await
            .map_err(DetectionError::persistence)?;
        let mut usage_counts: HashMap<KeywordKey, u64> = HashMap::new();
        for s in &fresh {
            for key in self.keys_of(s) {
                *usage_counts.entry(key).or_default() += 1;
            }
        }
        let new_checkpoint = fresh.iter().map(|s| s.seq).max().unwrap_or(checkpoint).max(checkpoint);
        let usage_increments = usage_counts.values().sum();
        let usage: Vec<UsageIncrement> = usage_counts
            .into_iter()
            .map(|((category_id, language, keyword), count)| UsageIncrement {
                category_id,
                language,
                keyword,
                count,
            })
            .collect();

        let report = FeedbackLearning {
            window_days,
            stats_scanned: window.len(),
            feedback_records,
            success_rates_updated: success_rates.len(),
            usage_records: fresh.len(),
            usage_increments,
            checkpoint: new_checkpoint,
        };

        let batch = LearningBatch {
            success_rates,
            usage,
            checkpoint: (new_checkpoint > checkpoint).then_some(new_checkpoint),
        };
        if !batch.is_empty() {
            // all or nothing; a failed batch is retried by the next pass
            self.store
                .apply_learning_batch(batch)
                .await
                .map_err(DetectionError::persistence)?;
            self.index.invalidate();
            if let Err(e) = self.index.refresh().await {
                warn!(target: "learning", error = %format!("{e:#}"), "index refresh after learning failed");
            }
        }

        info!(
            target: "learning",
            window_days,
            stats = report.stats_scanned,
            feedback = report.feedback_records,
            rates = report.success_rates_updated,
            usage = report.usage_increments,
            checkpoint = report.checkpoint,
            "learned from feedback"
        );
        Ok(report)
    }

    async fn improve_locked(&self) -> Result<KeywordImprovement, DetectionError> {
        let since = window_start(self.cfg.window_days);
        let window = self
            .store
            .stats_since(since)
            .await
            .map_err(DetectionError::persistence)?;

        let mut confidence: HashMap<CategoryId, Vec<f32>> = HashMap::new();
        for s in &window {
            confidence.entry(s.category_id).or_default().push(s.confidence);
            if let Some(c) = s.corrected_category_id.filter(|c| *c != s.category_id) {
                // misrouted listings count against the category they belonged to
                confidence.entry(c).or_default().push(0.0);
            }
        }

        let rows = self
            .store
            .load_keywords()
            .await
            .map_err(DetectionError::persistence)?;
        // (active count, success-rate sum) per category
        let mut coverage: HashMap<CategoryId, (usize, f32)> = HashMap::new();
        for k in rows.iter().filter(|k| !k.disabled) {
            let e = coverage.entry(k.category_id).or_default();
            e.0 += 1;
            e.1 += k.success_rate;
        }

        let snapshot = self.index.snapshot();
        let mut flagged: BTreeMap<CategoryId, (String, String, usize)> = BTreeMap::new();
        for cat in snapshot
            .active_categories()
            .filter(|c| c.id != self.other_category_id)
        {
            let (count, sr_sum) = coverage.get(&cat.id).copied().unwrap_or((0, 0.0));
            if count >= self.cfg.min_keywords {
                continue;
            }
            let low_confidence = confidence
                .get(&cat.id)
                .filter(|v| !v.is_empty())
                .is_some_and(|v| mean(v) < self.cfg.confidence_floor);
            let low_success = count > 0 && sr_sum / (count as f32) < self.cfg.success_rate_floor;
            if low_confidence || low_success {
                flagged.insert(cat.id, (cat.name.clone(), cat.slug.clone(), count));
            }
        }

        let mut report = KeywordImprovement {
            categories_flagged: flagged.len(),
            ..Default::default()
        };

        for (category_id, (name, slug, before)) in flagged {
            let req = GenerationRequest {
                category_id,
                category_name: name,
                category_slug: slug,
                language: self.default_language.clone(),
                min_keywords: self.cfg.min_keywords,
            };
            let outcome = match self.generator.generate(&req, KeywordSource::AiGenerated).await {
                Ok(g) => self
                    .store
                    .insert_keywords(g.keywords)
                    .await
                    .map_err(DetectionError::persistence),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(added) => {
                    report.keywords_added += added;
                    report.categories.push(CategoryImprovement {
                        category_id,
                        keywords_before: before,
                        keywords_after: before + added,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(target: "learning", category_id = %category_id, error = %e, "keyword improvement failed");
                    report.categories.push(CategoryImprovement {
                        category_id,
                        keywords_before: before,
                        keywords_after: before,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if report.keywords_added > 0 {
            counter!("learning_keywords_added_total").increment(report.keywords_added as u64);
            self.index.invalidate();
            if let Err(e) = self.index.refresh().await {
                warn!(target: "learning", error = %format!("{e:#}"), "index refresh after improvement failed");
            }
        }

        info!(
            target: "learning",
            flagged = report.categories_flagged,
            added = report.keywords_added,
            "auto improve finished"
        );
        Ok(report)
    }
}

fn mean(v: &[f32]) -> f32 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f32>() / v.len() as f32
    }
}
