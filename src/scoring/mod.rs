// src/scoring/mod.rs
pub mod keyword;
pub mod similarity;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::index::IndexSnapshot;
use crate::model::{clamp01, CategoryId, DEFAULT_SUCCESS_RATE};

pub use keyword::{KeywordMatch, KeywordScorer, KeywordScores};
pub use similarity::{
    cosine, CategoryProfile, Embedder, HashingEmbedder, SimilarityScorer, SimilarityScores,
};

/// `alpha * keyword + (1 - alpha) * similarity`, in [0,1].
pub fn blend(alpha: f32, keyword: f32, similarity: f32) -> f32 {
    let a = clamp01(alpha);
    clamp01(a * clamp01(keyword) + (1.0 - a) * clamp01(similarity))
}

/// One category after both scorers ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub category_id: CategoryId,
    pub name: String,
    pub slug: String,
    pub keyword_score: f32,
    pub similarity_score: f32,
    pub combined: f32,
    pub success_rate: f32,
    pub matched: Vec<String>,
}

/// Union of the top `top_n` of each scorer, blended and ordered by combined
/// score, then keyword success rate, then slug. `exclude` (the catch-all) is
/// never a candidate.
pub fn rank_candidates(
    snapshot: &IndexSnapshot,
    keywords: &KeywordScores,
    similarity: &SimilarityScores,
    alpha: f32,
    top_n: usize,
    exclude: CategoryId,
) -> Vec<Candidate> {
    let ids: BTreeSet<CategoryId> = keywords
        .top(top_n)
        .iter()
        .map(|m| m.category_id)
        .chain(similarity.top(top_n).iter().map(|(id, _)| *id))
        .filter(|id| *id != exclude)
        .collect();

    let mut out: Vec<Candidate> = ids
        .into_iter()
        .filter_map(|id| {
            let cat = snapshot.category(id)?;
            let kw = keywords.get(id);
            let keyword_score = kw.map_or(0.0, |m| m.score);
            let similarity_score = similarity.score_of(id);
            Some(Candidate {
                category_id: id,
                name: cat.name.clone(),
                slug: cat.slug.clone(),
                keyword_score,
                similarity_score,
                combined: blend(alpha, keyword_score, similarity_score),
                success_rate: kw.map_or(DEFAULT_SUCCESS_RATE, |m| m.success_rate),
                matched: kw.map(|m| m.matched.clone()).unwrap_or_default(),
            })
        })
        .collect();

    out.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.success_rate
                    .partial_cmp(&a.success_rate)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.slug.cmp(&b.slug))
    });
    out.truncate(top_n.max(1));
    out
}
