// tests/common/mod.rs
//
// Shared fixtures: a small catalog + dictionary, an embedder with fixed
// per-category similarity, and a scripted AI provider.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use category_detector::ai::{
    AiClient, Completion, EscalationError, Provider, ProviderFuture, Task,
};
use category_detector::config::AppConfig;
use category_detector::engine::DetectionEngine;
use category_detector::model::{Category, CategoryId, KeywordType, NewKeyword};
use category_detector::scoring::{CategoryProfile, Embedder};
use category_detector::store::{DetectionStore, MemoryStore, StaticCatalog};

pub const PHONES: CategoryId = CategoryId(1);
pub const ACCESSORIES: CategoryId = CategoryId(2);
pub const SOFAS: CategoryId = CategoryId(4);
pub const TOOLS: CategoryId = CategoryId(5);
pub const OTHER: CategoryId = CategoryId(9999);

pub fn category(id: CategoryId, name: &str, slug: &str) -> Category {
    Category {
        id,
        name: name.into(),
        slug: slug.into(),
        parent_id: None,
        is_active: true,
    }
}

pub fn categories() -> Vec<Category> {
    vec![
        category(PHONES, "Mobile Phones", "mobile-phones"),
        category(ACCESSORIES, "Phone Accessories", "phone-accessories"),
        category(SOFAS, "Sofas", "sofas"),
        category(TOOLS, "Power Tools", "power-tools"),
        category(OTHER, "Other", "other"),
    ]
}

pub fn dictionary() -> Vec<NewKeyword> {
    use KeywordType::*;
    let en = |c, k, t, w| NewKeyword::manual(c, "en", k, t, w);
    vec![
        en(PHONES, "iphone", Main, 1.0),
        en(PHONES, "smartphone", Main, 1.0),
        en(PHONES, "phone", Synonym, 0.8),
        en(PHONES, "case", Negative, 0.7),
        en(PHONES, "charger", Negative, 0.7),
        en(ACCESSORIES, "phone case", Main, 1.0),
        en(ACCESSORIES, "charger", Main, 1.0),
        en(ACCESSORIES, "screen protector", Main, 1.0),
        en(SOFAS, "sofa", Main, 1.0),
        en(SOFAS, "couch", Synonym, 0.8),
        en(TOOLS, "drill", Main, 1.0),
        NewKeyword::manual(SOFAS, "de", "sessel", Main, 1.0),
    ]
}

/// Query embeds to `[1, 0]`; a category centroid to `[s, sqrt(1 - s²)]`, so the
/// cosine is exactly `s`. Unlisted categories score 0.
#[derive(Default)]
pub struct FixedSimilarity {
    scores: HashMap<CategoryId, f32>,
    fail: bool,
}

impl FixedSimilarity {
    pub fn new(scores: &[(CategoryId, f32)]) -> Self {
        Self {
            scores: scores.iter().copied().collect(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            scores: HashMap::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl Embedder for FixedSimilarity {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        if self.fail {
            anyhow::bail!("embedding backend unavailable");
        }
        Ok(vec![1.0, 0.0])
    }

    async fn centroid(&self, profile: &CategoryProfile) -> Result<Option<Vec<f32>>> {
        let s = self.scores.get(&profile.category_id).copied().unwrap_or(0.0);
        Ok(Some(vec![s, (1.0 - s * s).max(0.0).sqrt()]))
    }
}

#[derive(Clone)]
pub enum Script {
    Reply(String),
    Fail(EscalationError),
    /// Never answers in any reasonable time.
    Hang,
}

/// Provider double: one script per task, optional delay, call counter.
pub struct ScriptedProvider {
    select: Script,
    generate: Script,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(select: Script) -> Self {
        Self {
            select,
            generate: Script::Fail(EscalationError::Provider("no generation scripted".into())),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn selecting(reply: &str) -> Self {
        Self::new(Script::Reply(reply.to_string()))
    }

    pub fn failing(err: EscalationError) -> Self {
        Self::new(Script::Fail(err))
    }

    pub fn with_keywords(mut self, reply: &str) -> Self {
        self.generate = Script::Reply(reply.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Provider for ScriptedProvider {
    fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = match req.task {
            Task::SelectCategory => self.select.clone(),
            Task::GenerateKeywords => self.generate.clone(),
        };
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match script {
                Script::Reply(s) => Ok(s),
                Script::Fail(e) => Err(e),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(EscalationError::Provider("hung".into()))
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// alpha 0.5, thresholds 0.3 / 0.8, in-memory store.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.detection = cfg.detection.with_policy(0.5, 0.3, 0.8);
    cfg.store.stats_path = None;
    cfg
}

pub struct Harness {
    pub engine: Arc<DetectionEngine>,
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<StaticCatalog>,
}

pub struct HarnessBuilder {
    cfg: AppConfig,
    similarity: FixedSimilarity,
    ai: AiClient,
    keywords: Vec<NewKeyword>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            cfg: test_config(),
            similarity: FixedSimilarity::default(),
            ai: AiClient::disabled(),
            keywords: dictionary(),
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut AppConfig)) -> Self {
        f(&mut self.cfg);
        self
    }

    pub fn similarity(mut self, s: FixedSimilarity) -> Self {
        self.similarity = s;
        self
    }

    pub fn provider(mut self, p: Arc<dyn Provider>, timeout: Duration) -> Self {
        self.ai = AiClient::new(p, timeout);
        self
    }

    pub fn keywords(mut self, k: Vec<NewKeyword>) -> Self {
        self.keywords = k;
        self
    }

    pub async fn build(self) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_keywords(self.keywords)
            .await
            .expect("seed keywords");
        let catalog = Arc::new(StaticCatalog::new(categories()));
        let engine = DetectionEngine::build(
            self.cfg,
            store.clone(),
            catalog.clone(),
            Arc::new(self.similarity),
            self.ai,
        )
        .await
        .expect("build engine");
        Harness {
            engine: Arc::new(engine),
            store,
            catalog,
        }
    }
}

pub async fn harness() -> Harness {
    HarnessBuilder::new().build().await
}
