// src/generator.rs
//! AI-assisted keyword bootstrap for categories that lack a dictionary.
//!
//! Generation is a pure proposal: nothing is persisted here. Callers merge the
//! output through the store's deduplicating insert.

use std::collections::HashSet;

use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::{AiClient, GenerationRequest};
use crate::config::LearningConfig;
use crate::error::DetectionError;
use crate::model::{Category, CategoryId, KeywordSource, NewKeyword};
use crate::text::normalize_keyword;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedKeywords {
    pub category_id: CategoryId,
    pub language: String,
    pub keywords: Vec<NewKeyword>,
}

impl GeneratedKeywords {
    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// Per-category line of a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryOutcome {
    pub category_id: CategoryId,
    pub category_name: String,
    pub generated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub keywords: Vec<NewKeyword>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkGeneration {
    pub categories: Vec<CategoryOutcome>,
}

impl BulkGeneration {
    pub fn total_generated(&self) -> usize {
        self.categories.iter().map(|c| c.generated).sum()
    }

    pub fn failed(&self) -> usize {
        self.categories.iter().filter(|c| c.error.is_some()).count()
    }
}

#[derive(Clone)]
pub struct KeywordGenerator {
    ai: AiClient,
    cfg: LearningConfig,
}

impl KeywordGenerator {
    pub fn new(ai: AiClient, cfg: LearningConfig) -> Self {
        Self { ai, cfg }
    }

    /// Propose keywords for one category, tagged with `source`.
    pub async fn generate(
        &self,
        req: &GenerationRequest,
        source: KeywordSource,
    ) -> Result<GeneratedKeywords, DetectionError> {
        if req.category_name.trim().is_empty() {
            return Err(DetectionError::Validation("category name required".into()));
        }
        let language = req.language.trim().to_ascii_lowercase();
        let raw = self
            .ai
            .generate_keywords(req, &CancellationToken::new())
            .await
            .map_err(|e| DetectionError::ExternalService(e.to_string()))?;

        let mut seen = HashSet::new();
        let keywords: Vec<NewKeyword> = raw
            .into_iter()
            .filter(|k| {
                let n = normalize_keyword(&k.keyword);
                !n.is_empty() && seen.insert(n)
            })
            .map(|k| NewKeyword {
                keyword: k.keyword,
                language: language.clone(),
                category_id: req.category_id,
                weight: self.cfg.generated_weight(k.weight),
                keyword_type: k.keyword_type,
                source,
            })
            .collect();

        counter!("keywords_generated_total").increment(keywords.len() as u64);
        info!(
            target: "generator",
            category_id = %req.category_id,
            language = %language,
            generated = keywords.len(),
            "keywords generated"
        );
        Ok(GeneratedKeywords {
            category_id: req.category_id,
            language,
            keywords,
        })
    }

    /// One request per category; a failing category is reported, not fatal.
    pub async fn generate_bulk(
        &self,
        categories: &[Category],
        language: &str,
        min_keywords: usize,
    ) -> BulkGeneration {
        let mut out = BulkGeneration::default();
        for cat in categories {
            let req = GenerationRequest {
                category_id: cat.id,
                category_name: cat.name.clone(),
                category_slug: cat.slug.clone(),
                language: language.to_string(),
                min_keywords,
            };
            match self.generate(&req, KeywordSource::AiGeneratedBulk).await {
                Ok(g) => out.categories.push(CategoryOutcome {
                    category_id: cat.id,
                    category_name: cat.name.clone(),
                    generated: g.len(),
                    error: None,
                    keywords: g.keywords,
                }),
                Err(e) => {
                    warn!(target: "generator", category_id = %cat.id, error = %e, "bulk generation failed for category");
                    out.categories.push(CategoryOutcome {
                        category_id: cat.id,
                        category_name: cat.name.clone(),
                        generated: 0,
                        error: Some(e.to_string()),
                        keywords: Vec::new(),
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Completion, MockProvider, Provider, ProviderFuture, Task};
    use crate::model::KeywordType;
    use std::sync::Arc;
    use std::time::Duration;

    struct Canned;

    impl Provider for Canned {
        fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a> {
            let fail = req.user.contains("Category name: Broken");
            Box::pin(async move {
                assert_eq!(req.task, Task::GenerateKeywords);
                if fail {
                    return Err(crate::ai::EscalationError::Provider("boom".into()));
                }
                Ok(r#"{"keywords": [
                    {"keyword": "Drill", "type": "main", "weight": 5.0},
                    {"keyword": "drill", "type": "synonym"},
                    {"keyword": "screwdriver", "type": "synonym", "weight": 0.7},
                    {"keyword": "toy", "type": "negative"}
                ]}"#
                .to_string())
            })
        }
        fn name(&self) -> &'static str {
            "canned"
        }
    }

    fn generator(p: Arc<dyn Provider>) -> KeywordGenerator {
        KeywordGenerator::new(
            AiClient::new(p, Duration::from_secs(1)),
            LearningConfig::default(),
        )
    }

    fn cat(id: i64, name: &str) -> Category {
        Category {
            id: CategoryId(id),
            name: name.into(),
            slug: name.to_lowercase(),
            parent_id: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn dedups_clamps_and_tags_provenance() {
        let g = generator(Arc::new(Canned));
        let req = GenerationRequest {
            category_id: CategoryId(7),
            category_name: "Power Tools".into(),
            category_slug: "power-tools".into(),
            language: "EN".into(),
            min_keywords: 10,
        };
        let out = g.generate(&req, KeywordSource::AiGenerated).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out.language, "en");
        assert!((out.keywords[0].weight - 1.5).abs() < 1e-6);
        assert!((out.keywords[1].weight - 0.7).abs() < 1e-6);
        assert!((out.keywords[2].weight - 1.0).abs() < 1e-6);
        assert_eq!(out.keywords[2].keyword_type, KeywordType::Negative);
        assert!(out
            .keywords
            .iter()
            .all(|k| k.source == KeywordSource::AiGenerated));
    }

    #[tokio::test]
    async fn bulk_reports_partial_failures() {
        let g = generator(Arc::new(Canned));
        let out = g
            .generate_bulk(&[cat(1, "Tools"), cat(2, "Broken"), cat(3, "Garden")], "en", 20)
            .await;
        assert_eq!(out.categories.len(), 3);
        assert_eq!(out.failed(), 1);
        assert_eq!(out.total_generated(), 6);
        assert!(out.categories[1].error.is_some());
        assert!(out.categories[0]
            .keywords
            .iter()
            .all(|k| k.source == KeywordSource::AiGeneratedBulk));
    }

    #[tokio::test]
    async fn mock_provider_output_is_usable() {
        let g = generator(Arc::new(MockProvider));
        let req = GenerationRequest {
            category_id: CategoryId(1),
            category_name: "Mountain Bikes".into(),
            category_slug: "mountain-bikes".into(),
            language: "en".into(),
            min_keywords: 10,
        };
        let out = g.generate(&req, KeywordSource::AiGenerated).await.unwrap();
        assert_eq!(out.len(), 3);
    }
}
