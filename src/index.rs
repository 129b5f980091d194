// src/index.rs
//! Cached per-category, per-language keyword dictionary.
//!
//! Readers take an `Arc<IndexSnapshot>` and never wait on a reload: a refresh
//! builds the next snapshot off to the side and swaps the pointer under a short
//! write lock. `invalidate()` only marks the current snapshot stale; the next
//! read serves it once more and kicks off a background refresh.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::IndexConfig;
use crate::model::{Category, CategoryId, CategoryKeyword, KeywordId, KeywordType};
use crate::store::{CategoryCatalog, DetectionStore};
use crate::text::normalize_keyword;

/// One active keyword as the scorers see it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedKeyword {
    pub id: KeywordId,
    /// As stored (shown in `matched_keywords`).
    pub keyword: String,
    /// Normalized form used for matching.
    pub normalized: String,
    pub weight: f32,
    pub keyword_type: KeywordType,
    pub success_rate: f32,
    pub usage_count: u64,
}

impl IndexedKeyword {
    fn from_row(row: &CategoryKeyword) -> Option<Self> {
        let normalized = normalize_keyword(&row.keyword);
        if normalized.is_empty() {
            return None;
        }
        Some(Self {
            id: row.id,
            keyword: row.keyword.clone(),
            normalized,
            weight: row.weight.max(0.0),
            keyword_type: row.keyword_type,
            success_rate: row.success_rate,
            usage_count: row.usage_count,
        })
    }
}

pub type CategoryKeywords = BTreeMap<CategoryId, Vec<IndexedKeyword>>;

/// Immutable view of the catalog and keywords at one point in time.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    loaded_at: Option<Instant>,
    categories: BTreeMap<CategoryId, Category>,
    by_language: HashMap<String, CategoryKeywords>,
}

impl IndexSnapshot {
    /// Build from raw rows. Disabled keywords, keywords of unknown or inactive
    /// categories and keywords that normalize to nothing are dropped.
    pub fn build(generation: u64, categories: Vec<Category>, keywords: &[CategoryKeyword]) -> Self {
        let categories: BTreeMap<CategoryId, Category> =
            categories.into_iter().map(|c| (c.id, c)).collect();

        let mut by_language: HashMap<String, CategoryKeywords> = HashMap::new();
        for row in keywords.iter().filter(|k| !k.disabled) {
            let active = categories.get(&row.category_id).is_some_and(|c| c.is_active);
            if !active {
                continue;
            }
            let Some(ik) = IndexedKeyword::from_row(row) else {
                continue;
            };
            by_language
                .entry(row.language.trim().to_ascii_lowercase())
                .or_default()
                .entry(row.category_id)
                .or_default()
                .push(ik);
        }

        Self {
            generation,
            loaded_at: Some(Instant::now()),
            categories,
            by_language,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `{category_id -> [keywords]}` for one language.
    pub fn lookup(&self, language: &str) -> Option<&CategoryKeywords> {
        self.by_language.get(&language.trim().to_ascii_lowercase())
    }

    pub fn keywords_for(&self, category_id: CategoryId, language: &str) -> &[IndexedKeyword] {
        self.lookup(language)
            .and_then(|m| m.get(&category_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.get(&id)
    }

    pub fn active_categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values().filter(|c| c.is_active)
    }

    fn expired(&self, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        self.loaded_at.map_or(true, |t| t.elapsed() >= ttl)
    }
}

struct Inner {
    store: Arc<dyn DetectionStore>,
    catalog: Arc<dyn CategoryCatalog>,
    ttl: Duration,
    current: RwLock<Arc<IndexSnapshot>>,
    stale: AtomicBool,
    refreshing: AtomicBool,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Cheap-to-clone handle over the shared cache.
#[derive(Clone)]
pub struct KeywordIndex {
    inner: Arc<Inner>,
}

impl KeywordIndex {
    /// Empty, stale index. The first `refresh` (or read) loads it.
    pub fn new(
        store: Arc<dyn DetectionStore>,
        catalog: Arc<dyn CategoryCatalog>,
        cfg: &IndexConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                catalog,
                ttl: cfg.ttl(),
                current: RwLock::new(Arc::new(IndexSnapshot::default())),
                stale: AtomicBool::new(true),
                refreshing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Build and load synchronously before serving.
    pub async fn load(
        store: Arc<dyn DetectionStore>,
        catalog: Arc<dyn CategoryCatalog>,
        cfg: &IndexConfig,
    ) -> Result<Self> {
        let idx = Self::new(store, catalog, cfg);
        idx.refresh().await?;
        Ok(idx)
    }

    /// Current snapshot. Never blocks on a refresh; when the snapshot is stale
    /// or past its TTL a background refresh is started.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        let snap = self.current();
        if self.inner.stale.load(Ordering::Acquire) || snap.expired(self.inner.ttl) {
            self.spawn_refresh();
        }
        snap
    }

    /// Keyword map for one language, cloned out of the current snapshot.
    pub fn lookup(&self, language: &str) -> CategoryKeywords {
        self.snapshot().lookup(language).cloned().unwrap_or_default()
    }

    /// Mark the cached snapshot stale.
    pub fn invalidate(&self) {
        self.inner.stale.store(true, Ordering::Release);
        debug!(target: "index", "invalidated");
    }

    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::Acquire)
    }

    /// Load from the collaborators and swap. Concurrent refreshes are serialized.
    pub async fn refresh(&self) -> Result<u64> {
        let _guard = self.inner.refresh_lock.lock().await;
        // a write that lands after this point re-marks stale
        self.inner.stale.store(false, Ordering::Release);

        let loaded = async {
            let categories = self
                .inner
                .catalog
                .categories()
                .await
                .context("loading categories")?;
            let keywords = self
                .inner
                .store
                .load_keywords()
                .await
                .context("loading keywords")?;
            anyhow::Ok((categories, keywords))
        }
        .await;

        let (categories, keywords) = match loaded {
            Ok(v) => v,
            Err(e) => {
                self.inner.stale.store(true, Ordering::Release);
                return Err(e);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(IndexSnapshot::build(generation, categories, &keywords));
        debug!(
            target: "index",
            generation,
            categories = next.categories.len(),
            languages = next.by_language.len(),
            "refreshed"
        );
        {
            let mut cur = match self.inner.current.write() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            *cur = next;
        }
        Ok(generation)
    }

    fn current(&self) -> Arc<IndexSnapshot> {
        match self.inner.current.read() {
            Ok(g) => Arc::clone(&g),
            Err(poison) => Arc::clone(&poison.into_inner()),
        }
    }

    fn spawn_refresh(&self) {
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            self.inner.refreshing.store(false, Ordering::Release);
            return;
        };
        let this = self.clone();
        rt.spawn(async move {
            if let Err(e) = this.refresh().await {
                warn!(target: "index", error = %format!("{e:#}"), "background refresh failed");
            }
            this.inner.refreshing.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewKeyword;
    use crate::store::{MemoryStore, StaticCatalog};

    fn cat(id: i64, slug: &str, active: bool) -> Category {
        Category {
            id: CategoryId(id),
            name: slug.to_uppercase(),
            slug: slug.into(),
            parent_id: None,
            is_active: active,
        }
    }

    async fn fixture() -> (Arc<MemoryStore>, KeywordIndex) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_keywords(vec![
                NewKeyword::manual(CategoryId(1), "en", "Smart-Phone", KeywordType::Main, 1.0),
                NewKeyword::manual(CategoryId(1), "sr", "telefon", KeywordType::Main, 1.0),
                NewKeyword::manual(CategoryId(2), "en", "sofa", KeywordType::Main, 1.0),
            ])
            .await
            .unwrap();
        let catalog = Arc::new(StaticCatalog::new(vec![
            cat(1, "phones", true),
            cat(2, "furniture", false),
        ]));
        let idx = KeywordIndex::new(store.clone(), catalog, &IndexConfig { ttl_secs: 0 });
        (store, idx)
    }

    #[tokio::test]
    async fn refresh_scopes_by_language_and_drops_inactive() {
        let (_store, idx) = fixture().await;
        assert_eq!(idx.refresh().await.unwrap(), 1);
        let snap = idx.snapshot();
        let en = snap.lookup("EN").unwrap();
        assert_eq!(en.len(), 1);
        assert_eq!(en[&CategoryId(1)][0].normalized, "smart phone");
        assert_eq!(snap.keywords_for(CategoryId(1), "sr").len(), 1);
        assert!(snap.keywords_for(CategoryId(2), "en").is_empty());
        assert_eq!(snap.active_categories().count(), 1);
    }

    #[tokio::test]
    async fn readers_keep_old_snapshot_until_swap() {
        let (store, idx) = fixture().await;
        idx.refresh().await.unwrap();
        let before = idx.snapshot();

        store
            .insert_keywords(vec![NewKeyword::manual(
                CategoryId(1),
                "en",
                "iphone",
                KeywordType::Synonym,
                1.0,
            )])
            .await
            .unwrap();
        idx.invalidate();
        assert!(idx.is_stale());

        // held snapshot is untouched
        assert_eq!(before.keywords_for(CategoryId(1), "en").len(), 1);

        idx.refresh().await.unwrap();
        let after = idx.snapshot();
        assert_eq!(after.generation(), before.generation() + 1);
        assert_eq!(after.keywords_for(CategoryId(1), "en").len(), 2);
        assert!(!idx.is_stale());
    }

    #[tokio::test]
    async fn stale_read_triggers_background_refresh() {
        let (_store, idx) = fixture().await;
        // never loaded: first read returns the empty snapshot
        assert_eq!(idx.snapshot().generation(), 0);
        for _ in 0..50 {
            if idx.snapshot().generation() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(idx.snapshot().generation() >= 1);
        assert_eq!(idx.lookup("en").len(), 1);
    }
}
