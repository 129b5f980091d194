// src/introspection.rs
//! Read-only reports over stats records and keyword rows.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::model::{
    Category, CategoryId, CategoryKeyword, DetectionStats, DetectionWarning, KeywordType,
};

const TOP_KEYWORDS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyMetrics {
    pub days: u32,
    pub total_detections: usize,
    pub with_feedback: usize,
    pub confirmed: usize,
    pub corrected: usize,
    /// confirmed / with_feedback, in percent. 0 when nothing was rated.
    pub accuracy_percent: f32,
    pub mean_confidence: f32,
    pub median_processing_ms: u64,
    pub by_method: BTreeMap<String, usize>,
    pub fallbacks: usize,
    pub escalations: usize,
}

/// Start of a trailing window of `days` days. Windows reaching past the
/// representable range start at the earliest timestamp.
pub fn window_start(days: u32) -> DateTime<Utc> {
    ChronoDuration::try_days(i64::from(days))
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn accuracy_metrics(days: u32, stats: &[DetectionStats]) -> AccuracyMetrics {
    let mut m = AccuracyMetrics {
        days,
        total_detections: stats.len(),
        ..Default::default()
    };
    if stats.is_empty() {
        return m;
    }

    let mut confidence_sum = 0.0f32;
    let mut times: Vec<u64> = Vec::with_capacity(stats.len());
    for s in stats {
        confidence_sum += s.confidence;
        times.push(s.processing_time_ms);
        *m.by_method.entry(s.method.as_str().to_string()).or_default() += 1;
        if s.warning == Some(DetectionWarning::LowConfidence) {
            m.fallbacks += 1;
        }
        if s.escalated {
            m.escalations += 1;
        }
        if s.has_feedback() {
            m.with_feedback += 1;
            if s.is_success() {
                m.confirmed += 1;
            } else if s.corrected_category_id.is_some() {
                m.corrected += 1;
            }
        }
    }

    m.mean_confidence = confidence_sum / stats.len() as f32;
    if m.with_feedback > 0 {
        m.accuracy_percent = m.confirmed as f32 * 100.0 / m.with_feedback as f32;
    }
    times.sort_unstable();
    let mid = times.len() / 2;
    m.median_processing_ms = if times.len() % 2 == 0 {
        (times[mid - 1] + times[mid]) / 2
    } else {
        times[mid]
    };
    m
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordUsage {
    pub keyword: String,
    pub category_id: CategoryId,
    pub language: String,
    pub usage_count: u64,
    pub success_rate: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryKeywordDetail {
    pub category_id: CategoryId,
    pub by_type: BTreeMap<String, usize>,
    pub keywords: Vec<CategoryKeyword>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeywordStats {
    pub categories_with_keywords: usize,
    pub total_active: usize,
    pub total_disabled: usize,
    pub per_category: BTreeMap<CategoryId, usize>,
    pub top_keywords: Vec<KeywordUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<CategoryKeywordDetail>,
}

fn type_label(t: KeywordType) -> &'static str {
    match t {
        KeywordType::Main => "main",
        KeywordType::Synonym => "synonym",
        KeywordType::Negative => "negative",
    }
}

pub fn keyword_stats(rows: &[CategoryKeyword], category: Option<CategoryId>) -> KeywordStats {
    let mut out = KeywordStats::default();
    for k in rows {
        if k.disabled {
            out.total_disabled += 1;
            continue;
        }
        out.total_active += 1;
        *out.per_category.entry(k.category_id).or_default() += 1;
    }
    out.categories_with_keywords = out.per_category.len();

    let mut active: Vec<&CategoryKeyword> = rows.iter().filter(|k| !k.disabled).collect();
    active.sort_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then_with(|| a.keyword.cmp(&b.keyword))
            .then_with(|| a.category_id.cmp(&b.category_id))
    });
    out.top_keywords = active
        .iter()
        .take(TOP_KEYWORDS)
        .map(|k| KeywordUsage {
            keyword: k.keyword.clone(),
            category_id: k.category_id,
            language: k.language.clone(),
            usage_count: k.usage_count,
            success_rate: k.success_rate,
        })
        .collect();

    if let Some(id) = category {
        let keywords: Vec<CategoryKeyword> = rows
            .iter()
            .filter(|k| k.category_id == id)
            .cloned()
            .collect();
        let mut by_type = BTreeMap::new();
        for k in keywords.iter().filter(|k| !k.disabled) {
            *by_type.entry(type_label(k.keyword_type).to_string()).or_default() += 1;
        }
        out.category = Some(CategoryKeywordDetail {
            category_id: id,
            by_type,
            keywords,
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCoverage {
    pub category_id: CategoryId,
    pub name: String,
    pub slug: String,
    pub keyword_count: usize,
}

/// Active categories (catch-all excluded) with fewer than `min_keywords`
/// active keywords, thinnest first.
pub fn categories_needing_keywords(
    categories: &[Category],
    rows: &[CategoryKeyword],
    min_keywords: usize,
    other: CategoryId,
) -> Vec<CategoryCoverage> {
    let mut counts: HashMap<CategoryId, usize> = HashMap::new();
    for k in rows.iter().filter(|k| !k.disabled) {
        *counts.entry(k.category_id).or_default() += 1;
    }
    let mut out: Vec<CategoryCoverage> = categories
        .iter()
        .filter(|c| c.is_active && c.id != other)
        .map(|c| CategoryCoverage {
            category_id: c.id,
            name: c.name.clone(),
            slug: c.slug.clone(),
            keyword_count: counts.get(&c.id).copied().unwrap_or(0),
        })
        .filter(|c| c.keyword_count < min_keywords)
        .collect();
    out.sort_by(|a, b| {
        a.keyword_count
            .cmp(&b.keyword_count)
            .then_with(|| a.category_id.cmp(&b.category_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectionMethod, InputSnapshot, KeywordSource, StatsId};

    fn stats(
        method: DetectionMethod,
        confidence: f32,
        ms: u64,
        confirmed: Option<bool>,
        corrected: Option<i64>,
    ) -> DetectionStats {
        DetectionStats {
            id: StatsId::new(),
            seq: 0,
            recorded_at: Utc::now(),
            input: InputSnapshot::default(),
            method,
            category_id: CategoryId(1),
            confidence,
            keyword_score: 0.0,
            similarity_score: 0.0,
            matched_keywords: vec![],
            alternatives: vec![],
            processing_time_ms: ms,
            warning: None,
            escalated: method.is_ai(),
            user_confirmed: confirmed,
            corrected_category_id: corrected.map(CategoryId),
        }
    }

    fn row(id: u64, cat: i64, kw: &str, usage: u64, disabled: bool) -> CategoryKeyword {
        CategoryKeyword {
            id,
            keyword: kw.into(),
            language: "en".into(),
            category_id: CategoryId(cat),
            weight: 1.0,
            keyword_type: if kw.starts_with('-') {
                KeywordType::Negative
            } else {
                KeywordType::Main
            },
            usage_count: usage,
            success_rate: 0.5,
            source: KeywordSource::Manual,
            disabled,
        }
    }

    #[test]
    fn accuracy_over_rated_records_only() {
        let s = vec![
            stats(DetectionMethod::KeywordSimilarity, 0.9, 10, Some(true), None),
            stats(DetectionMethod::KeywordSimilarity, 0.8, 30, Some(false), Some(2)),
            stats(DetectionMethod::AiFallback, 0.7, 20, None, None),
            stats(DetectionMethod::DirectAi, 0.6, 40, Some(true), None),
        ];
        let m = accuracy_metrics(7, &s);
        assert_eq!(m.total_detections, 4);
        assert_eq!(m.with_feedback, 3);
        assert_eq!(m.confirmed, 2);
        assert_eq!(m.corrected, 1);
        assert!((m.accuracy_percent - 66.666_67).abs() < 1e-3);
        assert!((m.mean_confidence - 0.75).abs() < 1e-6);
        assert_eq!(m.median_processing_ms, 25);
        assert_eq!(m.by_method["keyword+similarity"], 2);
        assert_eq!(m.escalations, 2);
    }

    #[test]
    fn empty_window_is_all_zero() {
        let m = accuracy_metrics(30, &[]);
        assert_eq!(m.total_detections, 0);
        assert_eq!(m.accuracy_percent, 0.0);
    }

    #[test]
    fn huge_windows_start_at_the_earliest_timestamp() {
        assert_eq!(window_start(u32::MAX), DateTime::<Utc>::MIN_UTC);
        let week = Utc::now() - window_start(7);
        assert!(week >= ChronoDuration::days(7));
        assert!(week < ChronoDuration::days(8));
    }

    #[test]
    fn keyword_stats_top_and_detail() {
        let rows = vec![
            row(1, 1, "phone", 10, false),
            row(2, 1, "-case", 3, false),
            row(3, 2, "sofa", 50, false),
            row(4, 2, "couch", 99, true),
        ];
        let s = keyword_stats(&rows, Some(CategoryId(1)));
        assert_eq!(s.total_active, 3);
        assert_eq!(s.total_disabled, 1);
        assert_eq!(s.categories_with_keywords, 2);
        assert_eq!(s.top_keywords[0].keyword, "sofa");
        let d = s.category.unwrap();
        assert_eq!(d.by_type["main"], 1);
        assert_eq!(d.by_type["negative"], 1);
    }

    #[test]
    fn needing_keywords_excludes_catch_all_and_inactive() {
        let cats: Vec<Category> = [(1, true), (2, true), (3, false), (9999, true)]
            .into_iter()
            .map(|(id, active)| Category {
                id: CategoryId(id),
                name: format!("c{id}"),
                slug: format!("c{id}"),
                parent_id: None,
                is_active: active,
            })
            .collect();
        let rows = vec![row(1, 1, "phone", 0, false), row(2, 1, "mobile", 0, false)];
        let need = categories_needing_keywords(&cats, &rows, 2, CategoryId(9999));
        let ids: Vec<i64> = need.iter().map(|c| c.category_id.0).collect();
        assert_eq!(ids, vec![2]);
        let need = categories_needing_keywords(&cats, &rows, 3, CategoryId(9999));
        let ids: Vec<i64> = need.iter().map(|c| c.category_id.0).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
