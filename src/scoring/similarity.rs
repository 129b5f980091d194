// src/scoring/similarity.rs
//! Semantic path: cosine between the input embedding and per-category centroids.
//!
//! Categories without keywords still get a centroid from their name and slug,
//! so this path covers what the keyword scorer cannot.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::index::IndexSnapshot;
use crate::model::{CategoryId, KeywordType};
use crate::text::normalize;

/// What an embedder gets to describe a category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryProfile {
    pub category_id: CategoryId,
    pub name: String,
    pub slug: String,
    pub language: String,
    /// Main and synonym keywords in `language`.
    pub keywords: Vec<String>,
}

impl CategoryProfile {
    pub fn from_snapshot(snapshot: &IndexSnapshot, id: CategoryId, language: &str) -> Option<Self> {
        let cat = snapshot.category(id)?;
        let keywords = snapshot
            .keywords_for(id, language)
            .iter()
            .filter(|k| !matches!(k.keyword_type, KeywordType::Negative))
            .map(|k| k.keyword.clone())
            .collect();
        Some(Self {
            category_id: id,
            name: cat.name.clone(),
            slug: cat.slug.clone(),
            language: language.to_string(),
            keywords,
        })
    }
}

/// External embedding collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Representative vector for a category; `None` when it has nothing to embed.
    async fn centroid(&self, profile: &CategoryProfile) -> Result<Option<Vec<f32>>>;
}

/// Feature-hashed bag of words. Deterministic, no network.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dim: 256 }
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.dim as u64) as usize
    }

    fn accumulate(&self, v: &mut [f32], text: &str, weight: f32) {
        for tok in normalize(text).split(' ').filter(|t| t.chars().count() >= 2) {
            let i = self.bucket(tok);
            v[i] += weight;
        }
    }

    fn finish(mut v: Vec<f32>) -> Option<Vec<f32>> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return None;
        }
        for x in &mut v {
            *x /= norm;
        }
        Some(v)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0; self.dim];
        self.accumulate(&mut v, text, 1.0);
        Ok(Self::finish(v).unwrap_or_else(|| vec![0.0; self.dim]))
    }

    async fn centroid(&self, profile: &CategoryProfile) -> Result<Option<Vec<f32>>> {
        let mut v = vec![0.0; self.dim];
        self.accumulate(&mut v, &profile.name, 1.0);
        self.accumulate(&mut v, &profile.slug.replace(['-', '_', '/'], " "), 0.5);
        for k in &profile.keywords {
            self.accumulate(&mut v, k, 1.0);
        }
        Ok(Self::finish(v))
    }
}

/// Cosine similarity mapped to [0,1]; opposite or orthogonal vectors give 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    let c = dot / (na * nb);
    if c.is_finite() {
        c.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityScores {
    /// (category, similarity), best first.
    pub scores: Vec<(CategoryId, f32)>,
}

impl SimilarityScores {
    pub fn score_of(&self, id: CategoryId) -> f32 {
        self.scores
            .iter()
            .find(|(c, _)| *c == id)
            .map_or(0.0, |(_, s)| *s)
    }

    pub fn top(&self, n: usize) -> &[(CategoryId, f32)] {
        &self.scores[..n.min(self.scores.len())]
    }
}

#[derive(Default)]
struct CentroidCache {
    generation: u64,
    vectors: HashMap<(String, CategoryId), Option<Arc<Vec<f32>>>>,
}

pub struct SimilarityScorer {
    embedder: Arc<dyn Embedder>,
    cache: Mutex<CentroidCache>,
}

impl SimilarityScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: Mutex::new(CentroidCache::default()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, CentroidCache> {
        match self.cache.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn cached(&self, generation: u64, key: &(String, CategoryId)) -> Option<Option<Arc<Vec<f32>>>> {
        let mut cache = self.cache();
        if cache.generation != generation {
            cache.generation = generation;
            cache.vectors.clear();
            return None;
        }
        cache.vectors.get(key).cloned()
    }

    async fn centroid(
        &self,
        snapshot: &IndexSnapshot,
        id: CategoryId,
        language: &str,
    ) -> Result<Option<Arc<Vec<f32>>>> {
        let key = (language.to_string(), id);
        if let Some(hit) = self.cached(snapshot.generation(), &key) {
            return Ok(hit);
        }
        let Some(profile) = CategoryProfile::from_snapshot(snapshot, id, language) else {
            return Ok(None);
        };
        let vector = self.embedder.centroid(&profile).await?.map(Arc::new);
        let mut cache = self.cache();
        if cache.generation == snapshot.generation() {
            cache.vectors.insert(key, vector.clone());
        }
        Ok(vector)
    }

    /// Score every active category except `exclude` (the catch-all).
    pub async fn score(
        &self,
        snapshot: &IndexSnapshot,
        language: &str,
        text: &str,
        exclude: CategoryId,
    ) -> Result<SimilarityScores> {
        if text.trim().is_empty() {
            return Ok(SimilarityScores::default());
        }
        let query = self.embedder.embed(text).await?;

        let ids: Vec<CategoryId> = snapshot
            .active_categories()
            .map(|c| c.id)
            .filter(|id| *id != exclude)
            .collect();

        let mut scores = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = self.centroid(snapshot, id, language).await? {
                scores.push((id, cosine(&query, &c)));
            }
        }
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(SimilarityScores { scores })
    }
}
