// src/config/detection.rs
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ai::AiConfig;
use crate::model::CategoryId;

// --- env defaults & names ---
pub const DEFAULT_DETECTION_CONFIG_PATH: &str = "config/detection.toml";

pub const ENV_DETECTION_CONFIG_PATH: &str = "DETECTION_CONFIG_PATH";
pub const ENV_DETECTION_ALPHA: &str = "DETECTION_ALPHA";
pub const ENV_DETECTION_HIGH_THRESHOLD: &str = "DETECTION_HIGH_THRESHOLD";
pub const ENV_DETECTION_LOW_THRESHOLD: &str = "DETECTION_LOW_THRESHOLD";

fn default_alpha() -> f32 {
    0.6
}
fn default_high() -> f32 {
    0.8
}
fn default_low() -> f32 {
    0.3
}
fn default_top_n() -> usize {
    5
}
fn default_max_alternatives() -> usize {
    3
}
fn default_alternative_floor() -> f32 {
    0.3
}
fn default_other_category() -> CategoryId {
    CategoryId(9999)
}
fn default_language() -> String {
    "en".to_string()
}
fn default_min_token_len() -> usize {
    3
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_window_days() -> u32 {
    30
}
fn default_confidence_floor() -> f32 {
    0.5
}
fn default_success_rate_floor() -> f32 {
    0.5
}
fn default_min_keywords() -> usize {
    50
}
fn default_weight() -> f32 {
    1.0
}
fn default_max_generated_weight() -> f32 {
    1.5
}
fn default_min_samples() -> u32 {
    1
}
fn default_interval_secs() -> u64 {
    3600
}
fn default_stats_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/detection_store.json"))
}
fn default_categories_path() -> PathBuf {
    PathBuf::from("config/categories.json")
}
fn default_feedback_queue() -> usize {
    10_000
}

/// Threshold policy and scoring knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Blend weight of the keyword score; similarity gets `1 - alpha`.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_high")]
    pub high_threshold: f32,
    #[serde(default = "default_low")]
    pub low_threshold: f32,
    /// Candidates taken from each scorer before blending.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
    #[serde(default = "default_alternative_floor")]
    pub alternative_floor: f32,
    /// Reserved catch-all category.
    #[serde(default = "default_other_category")]
    pub other_category_id: CategoryId,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            high_threshold: default_high(),
            low_threshold: default_low(),
            top_n: default_top_n(),
            max_alternatives: default_max_alternatives(),
            alternative_floor: default_alternative_floor(),
            other_category_id: default_other_category(),
            default_language: default_language(),
            min_token_len: default_min_token_len(),
        }
    }
}

impl DetectionConfig {
    /// Builder used by tests and tools: set the three tuning parameters at once.
    pub fn with_policy(mut self, alpha: f32, low: f32, high: f32) -> Self {
        self.alpha = alpha;
        self.low_threshold = low;
        self.high_threshold = high;
        self.sanitize();
        self
    }

    /// Clamp knobs into range and keep `low <= high`.
    pub fn sanitize(&mut self) {
        if !(0.0..=1.0).contains(&self.alpha) {
            self.alpha = default_alpha();
        }
        if !(0.0..=1.0).contains(&self.high_threshold) {
            self.high_threshold = default_high();
        }
        if !(0.0..=1.0).contains(&self.low_threshold) {
            self.low_threshold = default_low();
        }
        if self.low_threshold > self.high_threshold {
            // swap to keep a valid band
            std::mem::swap(&mut self.low_threshold, &mut self.high_threshold);
        }
        self.top_n = self.top_n.max(1);
        self.min_token_len = self.min_token_len.max(1);
        if self.default_language.trim().is_empty() {
            self.default_language = default_language();
        }
        self.default_language = self.default_language.trim().to_ascii_lowercase();
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl IndexConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,
    #[serde(default = "default_success_rate_floor")]
    pub success_rate_floor: f32,
    /// Categories below this many active keywords are eligible for generation.
    #[serde(default = "default_min_keywords")]
    pub min_keywords: usize,
    /// Weight given to generated keywords before clamping.
    #[serde(default = "default_weight")]
    pub default_weight: f32,
    #[serde(default = "default_max_generated_weight")]
    pub max_generated_weight: f32,
    /// Feedback records a keyword needs before its success rate is recomputed.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            confidence_floor: default_confidence_floor(),
            success_rate_floor: default_success_rate_floor(),
            min_keywords: default_min_keywords(),
            default_weight: default_weight(),
            max_generated_weight: default_max_generated_weight(),
            min_samples: default_min_samples(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl LearningConfig {
    /// Weight applied to a generated keyword, clamped to `[0, max_generated_weight]`.
    pub fn generated_weight(&self, proposed: Option<f32>) -> f32 {
        let max = self.max_generated_weight.max(0.0);
        let w = proposed.filter(|w| w.is_finite()).unwrap_or(self.default_weight);
        w.clamp(0.0, max)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot of keywords; stats are appended to `<name>.stats.jsonl`
    /// beside it. `None` keeps everything in memory.
    #[serde(default = "default_stats_path")]
    pub stats_path: Option<PathBuf>,
    #[serde(default = "default_categories_path")]
    pub categories_path: PathBuf,
    /// Manual keyword dictionary merged in at startup (deduplicated).
    #[serde(default)]
    pub seed_keywords_path: Option<PathBuf>,
    /// Pending stats writes before new records are dropped.
    #[serde(default = "default_feedback_queue")]
    pub feedback_queue: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stats_path: default_stats_path(),
            categories_path: default_categories_path(),
            seed_keywords_path: None,
            feedback_queue: default_feedback_queue(),
        }
    }
}

/// Root of `config/detection.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    /// Load using DETECTION_CONFIG_PATH or "config/detection.toml"; built-in defaults
    /// when the default file is absent. An explicit env path must exist.
    pub fn from_toml() -> anyhow::Result<Self> {
        let explicit = std::env::var(ENV_DETECTION_CONFIG_PATH).ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DETECTION_CONFIG_PATH));

        let mut cfg = if path.exists() {
            Self::from_path(&path)?
        } else if explicit.is_some() {
            anyhow::bail!(
                "{} points to non-existent path {}",
                ENV_DETECTION_CONFIG_PATH,
                path.display()
            );
        } else {
            tracing::info!(path = %path.display(), "detection config not found, using defaults");
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.finish()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading detection config at {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse + sanitize, without env overrides.
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let mut cfg: AppConfig = toml::from_str(toml_str).context("parsing detection config")?;
        cfg.detection.sanitize();
        Ok(cfg)
    }

    /// DETECTION_ALPHA / DETECTION_HIGH_THRESHOLD / DETECTION_LOW_THRESHOLD.
    pub fn apply_env_overrides(&mut self) {
        if let Some(a) = parse_unit_env(std::env::var(ENV_DETECTION_ALPHA).ok()) {
            self.detection.alpha = a;
        }
        if let Some(h) = parse_unit_env(std::env::var(ENV_DETECTION_HIGH_THRESHOLD).ok()) {
            self.detection.high_threshold = h;
        }
        if let Some(l) = parse_unit_env(std::env::var(ENV_DETECTION_LOW_THRESHOLD).ok()) {
            self.detection.low_threshold = l;
        }
        self.detection.sanitize();
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.ai.resolve()?;
        Ok(())
    }
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_unit_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
}
