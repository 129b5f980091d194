// src/store/mod.rs
//! Collaborator seams: the persistent keyword/stats store and the category catalog.
//!
//! The relational schema lives elsewhere; the core only needs the operations
//! below. `MemoryStore` and `StaticCatalog` are the in-process implementations
//! used by the binary and the tests.

pub mod catalog;
pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Category, CategoryId, CategoryKeyword, DetectionStats, Feedback, FeedbackOutcome, KeywordId,
    NewKeyword, StatsId,
};

pub use catalog::StaticCatalog;
pub use memory::MemoryStore;

/// Recomputed success rate for one (category, language, keyword).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRateUpdate {
    pub category_id: CategoryId,
    pub language: String,
    /// Normalized keyword.
    pub keyword: String,
    pub success_rate: f32,
}

/// Usage increment for one (category, language, keyword).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageIncrement {
    pub category_id: CategoryId,
    pub language: String,
    /// Normalized keyword.
    pub keyword: String,
    pub count: u64,
}

/// One learning write. Applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningBatch {
    pub success_rates: Vec<SuccessRateUpdate>,
    pub usage: Vec<UsageIncrement>,
    /// Highest stats `seq` whose usage is included in this batch.
    pub checkpoint: Option<u64>,
}

impl LearningBatch {
    pub fn is_empty(&self) -> bool {
        self.success_rates.is_empty() && self.usage.is_empty() && self.checkpoint.is_none()
    }
}

#[async_trait::async_trait]
pub trait DetectionStore: Send + Sync {
    /// All keyword rows, disabled ones included.
    async fn load_keywords(&self) -> Result<Vec<CategoryKeyword>>;

    /// Insert keywords, skipping any whose (category, language, normalized keyword)
    /// already exists. Existing rows are never touched. Returns inserted count.
    async fn insert_keywords(&self, keywords: Vec<NewKeyword>) -> Result<usize>;

    /// Soft-delete. Returns false when the id is unknown.
    async fn disable_keyword(&self, id: KeywordId) -> Result<bool>;

    async fn apply_learning_batch(&self, batch: LearningBatch) -> Result<()>;

    /// Highest stats `seq` already counted into keyword usage.
    async fn learning_checkpoint(&self) -> Result<u64>;

    /// Append a stats record; the store assigns `seq`.
    async fn insert_stats(&self, stats: DetectionStats) -> Result<()>;

    async fn get_stats(&self, id: StatsId) -> Result<Option<DetectionStats>>;

    /// Set feedback fields once. A second call is a no-op reporting `AlreadySet`.
    async fn set_feedback(&self, id: StatsId, feedback: Feedback) -> Result<FeedbackOutcome>;

    /// Records with `recorded_at >= since`, in insertion order.
    async fn stats_since(&self, since: DateTime<Utc>) -> Result<Vec<DetectionStats>>;

    /// Records with `seq > seq`, in insertion order.
    async fn stats_after(&self, seq: u64) -> Result<Vec<DetectionStats>>;
}

#[async_trait::async_trait]
pub trait CategoryCatalog: Send + Sync {
    /// Every category, active or not.
    async fn categories(&self) -> Result<Vec<Category>>;
}
