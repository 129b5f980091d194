//! # Data model
//! Typed records shared by the scorers, the detector, the feedback recorder and
//! the learning engine. Invariants are enforced at construction (`clamp01`,
//! non-negative weights) so downstream code can rely on them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog category id. Owned by the catalog collaborator; referenced by id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub i64);

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of one detection stats record. Allocated locally so the caller gets it
/// before the record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsId(pub Uuid);

impl StatsId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StatsId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StatsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type KeywordId = u64;

/// External catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub parent_id: Option<CategoryId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordType {
    Main,
    Synonym,
    Negative,
}

impl KeywordType {
    pub fn is_negative(self) -> bool {
        matches!(self, KeywordType::Negative)
    }

    /// Lenient parse used for AI output ("main", "Synonym", "negative", "brand" → main).
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "synonym" | "synonyms" | "alias" => KeywordType::Synonym,
            "negative" | "exclude" | "excluded" => KeywordType::Negative,
            _ => KeywordType::Main,
        }
    }
}

/// Provenance of a keyword row, so audits can tell curated entries from generated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordSource {
    Manual,
    AiGenerated,
    AiGeneratedBulk,
}

/// Persisted keyword row. Never hard-deleted; `disabled` removes it from the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryKeyword {
    pub id: KeywordId,
    pub keyword: String,
    pub language: String,
    pub category_id: CategoryId,
    pub weight: f32,
    pub keyword_type: KeywordType,
    pub usage_count: u64,
    pub success_rate: f32,
    pub source: KeywordSource,
    #[serde(default)]
    pub disabled: bool,
}

/// Insert payload for the store; the store assigns id, usage and success rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKeyword {
    pub keyword: String,
    pub language: String,
    pub category_id: CategoryId,
    pub weight: f32,
    pub keyword_type: KeywordType,
    pub source: KeywordSource,
}

impl NewKeyword {
    pub fn manual(
        category_id: CategoryId,
        language: &str,
        keyword: &str,
        keyword_type: KeywordType,
        weight: f32,
    ) -> Self {
        Self {
            keyword: keyword.to_string(),
            language: language.to_string(),
            category_id,
            weight: clamp_weight(weight),
            keyword_type,
            source: KeywordSource::Manual,
        }
    }
}

/// Initial success rate for a keyword with no feedback yet (neutral prior).
pub const DEFAULT_SUCCESS_RATE: f32 = 0.5;

/// Per-request detection input. Built once and never mutated by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionInput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Upstream AI hint, e.g. "electronics".
    #[serde(default)]
    pub domain: Option<String>,
    /// Upstream AI hint, e.g. "smartphone".
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl DetectionInput {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// True when there is nothing to classify.
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty()
            && self.description.trim().is_empty()
            && self.keywords.iter().all(|k| k.trim().is_empty())
    }

    /// Text used for the similarity path: title, description and explicit keywords.
    pub fn similarity_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(2 + self.keywords.len());
        if !self.title.trim().is_empty() {
            parts.push(self.title.trim());
        }
        if !self.description.trim().is_empty() {
            parts.push(self.description.trim());
        }
        for k in &self.keywords {
            if !k.trim().is_empty() {
                parts.push(k.trim());
            }
        }
        parts.join(" ")
    }
}

/// Closed set of pipeline outcomes attached to every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMethod {
    #[serde(rename = "keyword")]
    Keyword,
    #[serde(rename = "keyword+similarity")]
    KeywordSimilarity,
    #[serde(rename = "ai_fallback")]
    AiFallback,
    #[serde(rename = "direct_ai")]
    DirectAi,
}

impl DetectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::Keyword => "keyword",
            DetectionMethod::KeywordSimilarity => "keyword+similarity",
            DetectionMethod::AiFallback => "ai_fallback",
            DetectionMethod::DirectAi => "direct_ai",
        }
    }

    pub fn is_ai(self) -> bool {
        matches!(self, DetectionMethod::AiFallback | DetectionMethod::DirectAi)
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a result should be double-checked by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionWarning {
    /// Nothing cleared the low threshold; the reserved "Other" category was returned.
    LowConfidence,
    /// Escalation was attempted but failed; the local result was returned.
    EscalationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeCategory {
    pub category_id: CategoryId,
    pub category_name: String,
    pub category_slug: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub category_id: CategoryId,
    pub category_name: String,
    pub category_slug: String,
    pub confidence: f32,
    pub method: DetectionMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_categories: Vec<AlternativeCategory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_keywords: Vec<String>,
    pub keyword_score: f32,
    pub similarity_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<DetectionWarning>,
    pub stats_id: StatsId,
    pub processing_time_ms: u64,
}

/// User feedback attached to a stats record exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub confirmed: bool,
    pub corrected_category_id: Option<CategoryId>,
}

impl Feedback {
    /// Derive feedback from the category the user settled on.
    pub fn from_correct_category(chosen: CategoryId, correct: CategoryId) -> Self {
        if chosen == correct {
            Self {
                confirmed: true,
                corrected_category_id: None,
            }
        } else {
            Self {
                confirmed: false,
                corrected_category_id: Some(correct),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Applied,
    AlreadySet,
    NotFound,
}

/// Snapshot of the input as it was classified. Raw text is kept for learning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub language: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl From<&DetectionInput> for InputSnapshot {
    fn from(input: &DetectionInput) -> Self {
        Self {
            title: input.title.clone(),
            description: input.description.clone(),
            keywords: input.keywords.clone(),
            language: input.language.clone(),
            domain: input.domain.clone(),
            product_type: input.product_type.clone(),
            user_id: input.user_id,
            session_id: input.session_id.clone(),
        }
    }
}

/// Append-only record of one detection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub id: StatsId,
    /// Assigned by the store on insert; monotonically increasing.
    #[serde(default)]
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub input: InputSnapshot,
    pub method: DetectionMethod,
    pub category_id: CategoryId,
    pub confidence: f32,
    pub keyword_score: f32,
    pub similarity_score: f32,
    pub matched_keywords: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<(CategoryId, f32)>,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub warning: Option<DetectionWarning>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub user_confirmed: Option<bool>,
    #[serde(default)]
    pub corrected_category_id: Option<CategoryId>,
}

impl DetectionStats {
    pub fn from_result(input: &DetectionInput, result: &DetectionResult, escalated: bool) -> Self {
        Self {
            id: result.stats_id,
            seq: 0,
            recorded_at: Utc::now(),
            input: InputSnapshot::from(input),
            method: result.method,
            category_id: result.category_id,
            confidence: result.confidence,
            keyword_score: result.keyword_score,
            similarity_score: result.similarity_score,
            matched_keywords: result.matched_keywords.clone(),
            alternatives: result
                .alternative_categories
                .iter()
                .map(|a| (a.category_id, a.confidence))
                .collect(),
            processing_time_ms: result.processing_time_ms,
            warning: result.warning,
            escalated,
            user_confirmed: None,
            corrected_category_id: None,
        }
    }

    pub fn has_feedback(&self) -> bool {
        self.user_confirmed.is_some()
    }

    /// Confirmed and not redirected to another category.
    pub fn is_success(&self) -> bool {
        self.user_confirmed == Some(true)
            && self
                .corrected_category_id
                .map_or(true, |c| c == self.category_id)
    }
}

pub fn clamp01(x: f32) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn clamp_weight(w: f32) -> f32 {
    if w.is_finite() {
        w.max(0.0)
    } else {
        0.0
    }
}
