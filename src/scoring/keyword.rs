// src/scoring/keyword.rs
use std::cmp::Ordering;

use crate::index::IndexSnapshot;
use crate::model::{CategoryId, DEFAULT_SUCCESS_RATE};
use crate::text::TokenSet;

/// Keyword evidence for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    pub category_id: CategoryId,
    /// Σ positive − Σ negative, clamped at zero.
    pub raw: f32,
    /// `raw` divided by the best raw score among compared categories.
    pub score: f32,
    pub matched: Vec<String>,
    pub negatives: Vec<String>,
    /// Mean success rate of the matched positive keywords.
    pub success_rate: f32,
}

/// All categories with at least one positive match, best first.
#[derive(Debug, Clone, Default)]
pub struct KeywordScores {
    pub matches: Vec<KeywordMatch>,
}

impl KeywordScores {
    pub fn get(&self, id: CategoryId) -> Option<&KeywordMatch> {
        self.matches.iter().find(|m| m.category_id == id)
    }

    pub fn score_of(&self, id: CategoryId) -> f32 {
        self.get(id).map_or(0.0, |m| m.score)
    }

    pub fn top(&self, n: usize) -> &[KeywordMatch] {
        &self.matches[..n.min(self.matches.len())]
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordScorer;

impl KeywordScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score every category that has keywords in `language`.
    pub fn score(&self, snapshot: &IndexSnapshot, language: &str, tokens: &TokenSet) -> KeywordScores {
        let Some(dictionary) = snapshot.lookup(language) else {
            return KeywordScores::default();
        };
        if tokens.is_empty() {
            return KeywordScores::default();
        }

        let mut matches = Vec::new();
        for (&category_id, keywords) in dictionary {
            let mut positive = 0.0f32;
            let mut negative = 0.0f32;
            let mut matched = Vec::new();
            let mut negatives = Vec::new();
            let mut success_sum = 0.0f32;

            for kw in keywords {
                if !tokens.matches(&kw.normalized) {
                    continue;
                }
                if kw.keyword_type.is_negative() {
                    negative += kw.weight;
                    negatives.push(kw.keyword.clone());
                } else {
                    positive += kw.weight;
                    success_sum += kw.success_rate;
                    matched.push(kw.keyword.clone());
                }
            }
            if matched.is_empty() {
                continue;
            }
            let success_rate = success_sum / matched.len() as f32;
            matches.push(KeywordMatch {
                category_id,
                raw: (positive - negative).max(0.0),
                score: 0.0,
                matched,
                negatives,
                success_rate: if success_rate.is_finite() {
                    success_rate
                } else {
                    DEFAULT_SUCCESS_RATE
                },
            });
        }

        let max_raw = matches.iter().map(|m| m.raw).fold(0.0f32, f32::max);
        if max_raw > 0.0 {
            for m in &mut matches {
                m.score = (m.raw / max_raw).clamp(0.0, 1.0);
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.success_rate
                        .partial_cmp(&a.success_rate)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| slug_of(snapshot, a.category_id).cmp(slug_of(snapshot, b.category_id)))
        });

        KeywordScores { matches }
    }
}

fn slug_of(snapshot: &IndexSnapshot, id: CategoryId) -> &str {
    snapshot.category(id).map_or("", |c| c.slug.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, CategoryKeyword, KeywordSource, KeywordType};

    fn cat(id: i64, slug: &str) -> Category {
        Category {
            id: CategoryId(id),
            name: slug.into(),
            slug: slug.into(),
            parent_id: None,
            is_active: true,
        }
    }

    fn kw(id: u64, cat: i64, word: &str, t: KeywordType, weight: f32, sr: f32) -> CategoryKeyword {
        CategoryKeyword {
            id,
            keyword: word.into(),
            language: "en".into(),
            category_id: CategoryId(cat),
            weight,
            keyword_type: t,
            usage_count: 0,
            success_rate: sr,
            source: KeywordSource::Manual,
            disabled: false,
        }
    }

    fn snapshot(rows: &[CategoryKeyword]) -> IndexSnapshot {
        IndexSnapshot::build(
            1,
            vec![cat(1, "smartphones"), cat(2, "cases"), cat(3, "audio")],
            rows,
        )
    }

    fn tokens(title: &str) -> TokenSet {
        TokenSet::build(&[title], &[], 3)
    }

    #[test]
    fn normalizes_against_best_category() {
        let snap = snapshot(&[
            kw(1, 1, "iphone", KeywordType::Main, 2.0, 0.5),
            kw(2, 1, "smartphone", KeywordType::Synonym, 1.0, 0.5),
            kw(3, 2, "case", KeywordType::Main, 1.5, 0.5),
        ]);
        let s = KeywordScorer::new().score(&snap, "en", &tokens("iPhone smartphone with case"));
        assert_eq!(s.matches[0].category_id, CategoryId(1));
        assert!((s.score_of(CategoryId(1)) - 1.0).abs() < 1e-6);
        assert!((s.score_of(CategoryId(2)) - 0.5).abs() < 1e-6);
        assert_eq!(s.score_of(CategoryId(3)), 0.0);
    }

    #[test]
    fn negatives_reduce_and_clamp() {
        let rows = [
            kw(1, 2, "case", KeywordType::Main, 1.0, 0.5),
            kw(2, 2, "iphone", KeywordType::Negative, 3.0, 0.5),
            kw(3, 1, "iphone", KeywordType::Main, 1.0, 0.5),
        ];
        let snap = snapshot(&rows);
        let s = KeywordScorer::new().score(&snap, "en", &tokens("iphone case"));
        let cases = s.get(CategoryId(2)).unwrap();
        assert_eq!(cases.raw, 0.0);
        assert_eq!(cases.negatives, vec!["iphone".to_string()]);
        assert_eq!(s.matches[0].category_id, CategoryId(1));
    }

    #[test]
    fn ties_break_on_success_rate_then_slug() {
        let snap = snapshot(&[
            kw(1, 1, "speaker", KeywordType::Main, 1.0, 0.4),
            kw(2, 3, "speaker", KeywordType::Main, 1.0, 0.9),
            kw(3, 2, "speaker", KeywordType::Main, 1.0, 0.4),
        ]);
        let s = KeywordScorer::new().score(&snap, "en", &tokens("bluetooth speaker"));
        let order: Vec<i64> = s.matches.iter().map(|m| m.category_id.0).collect();
        // audio (0.9), then cases < smartphones by slug
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn language_scoped() {
        let snap = snapshot(&[kw(1, 1, "telefon", KeywordType::Main, 1.0, 0.5)]);
        let s = KeywordScorer::new().score(&snap, "sr", &tokens("telefon"));
        assert!(s.is_empty());
    }
}
