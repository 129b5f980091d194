// src/store/memory.rs
//! In-process store with optional file persistence.
//!
//! Keyword rows and learning counters live in a JSON snapshot (tmp file +
//! rename). Stats records and their feedback are appended to a JSON-lines log
//! next to it (`<name>.stats.jsonl`) and replayed on open, so recording a
//! detection costs one line regardless of history size. File I/O runs on the
//! blocking pool; memory is only updated after the write succeeded.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use super::{DetectionStore, LearningBatch};
use crate::model::{
    clamp01, clamp_weight, CategoryId, CategoryKeyword, DetectionStats, Feedback,
    FeedbackOutcome, KeywordId, NewKeyword, StatsId, DEFAULT_SUCCESS_RATE,
};
use crate::text::normalize_keyword;

/// Snapshot part: small, rewritten whole on keyword or learning writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeywordState {
    keywords: Vec<CategoryKeyword>,
    next_keyword_id: KeywordId,
    checkpoint: u64,
}

#[derive(Debug, Default)]
struct State {
    kw: KeywordState,
    stats: Vec<DetectionStats>,
    by_id: HashMap<StatsId, usize>,
    next_seq: u64,
}

impl State {
    fn push_stats(&mut self, stats: DetectionStats) {
        self.next_seq = self.next_seq.max(stats.seq);
        self.by_id.insert(stats.id, self.stats.len());
        self.stats.push(stats);
    }

    fn stats(&self, id: StatsId) -> Option<&DetectionStats> {
        self.by_id.get(&id).and_then(|&i| self.stats.get(i))
    }

    fn stats_mut(&mut self, id: StatsId) -> Option<&mut DetectionStats> {
        let i = *self.by_id.get(&id)?;
        self.stats.get_mut(i)
    }
}

type KeywordKey = (CategoryId, String, String);

fn keyword_key(k: &CategoryKeyword) -> KeywordKey {
    (
        k.category_id,
        k.language.to_ascii_lowercase(),
        normalize_keyword(&k.keyword),
    )
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogLine<'a> {
    Stats(&'a DetectionStats),
    Feedback { id: StatsId, feedback: Feedback },
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Stats(DetectionStats),
    Feedback { id: StatsId, feedback: Feedback },
}

#[derive(Debug, Clone)]
struct Files {
    snapshot: PathBuf,
    stats_log: PathBuf,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<State>,
    files: Option<Files>,
}

impl MemoryStore {
    /// Pure in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) a store persisted to `path` and its stats log.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let files = Files {
            snapshot: path.as_ref().to_path_buf(),
            stats_log: stats_log_path(path.as_ref()),
        };
        let mut state = State::default();
        if files.snapshot.exists() {
            let s = fs::read_to_string(&files.snapshot)
                .with_context(|| format!("reading store snapshot {}", files.snapshot.display()))?;
            state.kw = serde_json::from_str(&s)
                .with_context(|| format!("parsing store snapshot {}", files.snapshot.display()))?;
        } else if let Some(parent) = files.snapshot.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        replay_stats_log(&files.stats_log, &mut state)?;
        Ok(Self {
            inner: Mutex::new(state),
            files: Some(files),
        })
    }

    /// Apply `f` to a copy of the keyword state, persist the snapshot, then commit.
    async fn mutate_keywords<T>(&self, f: impl FnOnce(&mut KeywordState) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().await;
        let Some(files) = &self.files else {
            return f(&mut guard.kw);
        };
        let mut next = guard.kw.clone();
        let out = f(&mut next)?;
        let bytes = serde_json::to_vec(&next).context("serializing store snapshot")?;
        write_snapshot(files.snapshot.clone(), bytes).await?;
        guard.kw = next;
        Ok(out)
    }

    /// Append one line to the stats log; no-op without persistence.
    async fn append_log(&self, line: &LogLine<'_>) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let mut bytes = serde_json::to_vec(line).context("serializing stats log line")?;
        bytes.push(b'\n');
        append_line(files.stats_log.clone(), bytes).await
    }

    /// Number of stats records (diagnostics/tests).
    pub async fn stats_len(&self) -> usize {
        self.inner.lock().await.stats.len()
    }
}

/// `detection_store.json` → `detection_store.stats.jsonl`.
pub fn stats_log_path(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("stats.jsonl")
}

fn replay_stats_log(path: &Path, state: &mut State) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let f = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    for (n, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(LogEntry::Stats(s)) => {
                if !state.by_id.contains_key(&s.id) {
                    state.push_stats(s);
                }
            }
            Ok(LogEntry::Feedback { id, feedback }) => {
                if let Some(s) = state.stats_mut(id).filter(|s| !s.has_feedback()) {
                    s.user_confirmed = Some(feedback.confirmed);
                    s.corrected_category_id = feedback.corrected_category_id;
                }
            }
            // a torn tail from a crash mid-append
            Err(e) => warn!(target: "store", line = n + 1, error = %e, "skipping unreadable stats log line"),
        }
    }
    Ok(())
}

async fn write_snapshot(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let tmp = path.with_extension("json.tmp");
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(&bytes)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))
    })
    .await
    .context("snapshot writer task")?
}

async fn append_line(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        f.write_all(&bytes)
            .with_context(|| format!("appending to {}", path.display()))
    })
    .await
    .context("stats log writer task")?
}

#[async_trait::async_trait]
impl DetectionStore for MemoryStore {
    async fn load_keywords(&self) -> Result<Vec<CategoryKeyword>> {
        Ok(self.inner.lock().await.kw.keywords.clone())
    }

    async fn insert_keywords(&self, keywords: Vec<NewKeyword>) -> Result<usize> {
        self.mutate_keywords(|state| {
            let mut seen: HashSet<KeywordKey> = state.keywords.iter().map(keyword_key).collect();
            let mut inserted = 0;
            for nk in keywords {
                let normalized = normalize_keyword(&nk.keyword);
                if normalized.is_empty() {
                    continue;
                }
                let language = nk.language.trim().to_ascii_lowercase();
                if !seen.insert((nk.category_id, language.clone(), normalized)) {
                    continue;
                }
                state.next_keyword_id += 1;
                state.keywords.push(CategoryKeyword {
                    id: state.next_keyword_id,
                    keyword: nk.keyword.trim().to_string(),
                    language,
                    category_id: nk.category_id,
                    weight: clamp_weight(nk.weight),
                    keyword_type: nk.keyword_type,
                    usage_count: 0,
                    success_rate: DEFAULT_SUCCESS_RATE,
                    source: nk.source,
                    disabled: false,
                });
                inserted += 1;
            }
            Ok(inserted)
        })
        .await
    }

    async fn disable_keyword(&self, id: KeywordId) -> Result<bool> {
        self.mutate_keywords(|state| {
            Ok(match state.keywords.iter_mut().find(|k| k.id == id) {
                Some(k) => {
                    k.disabled = true;
                    true
                }
                None => false,
            })
        })
        .await
    }

    async fn apply_learning_batch(&self, batch: LearningBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.mutate_keywords(|state| {
            let mut by_key: HashMap<KeywordKey, Vec<usize>> = HashMap::new();
            for (i, k) in state.keywords.iter().enumerate() {
                by_key.entry(keyword_key(k)).or_default().push(i);
            }
            for u in &batch.success_rates {
                let key = (u.category_id, u.language.to_ascii_lowercase(), u.keyword.clone());
                for &i in by_key.get(&key).into_iter().flatten() {
                    state.keywords[i].success_rate = clamp01(u.success_rate);
                }
            }
            for u in &batch.usage {
                let key = (u.category_id, u.language.to_ascii_lowercase(), u.keyword.clone());
                for &i in by_key.get(&key).into_iter().flatten() {
                    let k = &mut state.keywords[i];
                    k.usage_count = k.usage_count.saturating_add(u.count);
                }
            }
            if let Some(cp) = batch.checkpoint {
                // never moves backwards
                state.checkpoint = state.checkpoint.max(cp);
            }
            Ok(())
        })
        .await
    }

    async fn learning_checkpoint(&self) -> Result<u64> {
        Ok(self.inner.lock().await.kw.checkpoint)
    }

    async fn insert_stats(&self, mut stats: DetectionStats) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.by_id.contains_key(&stats.id) {
            anyhow::bail!("duplicate stats id {}", stats.id);
        }
        stats.seq = state.next_seq + 1;
        stats.user_confirmed = None;
        stats.corrected_category_id = None;
        self.append_log(&LogLine::Stats(&stats)).await?;
        state.push_stats(stats);
        Ok(())
    }

    async fn get_stats(&self, id: StatsId) -> Result<Option<DetectionStats>> {
        Ok(self.inner.lock().await.stats(id).cloned())
    }

    async fn set_feedback(&self, id: StatsId, feedback: Feedback) -> Result<FeedbackOutcome> {
        let mut state = self.inner.lock().await;
        match state.stats(id) {
            None => return Ok(FeedbackOutcome::NotFound),
            Some(s) if s.has_feedback() => return Ok(FeedbackOutcome::AlreadySet),
            Some(_) => {}
        }
        self.append_log(&LogLine::Feedback { id, feedback }).await?;
        if let Some(s) = state.stats_mut(id) {
            s.user_confirmed = Some(feedback.confirmed);
            s.corrected_category_id = feedback.corrected_category_id;
        }
        Ok(FeedbackOutcome::Applied)
    }

    async fn stats_since(&self, since: DateTime<Utc>) -> Result<Vec<DetectionStats>> {
        Ok(self
            .inner
            .lock()
            .await
            .stats
            .iter()
            .filter(|s| s.recorded_at >= since)
            .cloned()
            .collect())
    }

    async fn stats_after(&self, seq: u64) -> Result<Vec<DetectionStats>> {
        Ok(self
            .inner
            .lock()
            .await
            .stats
            .iter()
            .filter(|s| s.seq > seq)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectionMethod, InputSnapshot, KeywordType};
    use crate::store::{SuccessRateUpdate, UsageIncrement};

    fn stats(cat: i64) -> DetectionStats {
        DetectionStats {
            id: StatsId::new(),
            seq: 0,
            recorded_at: Utc::now(),
            input: InputSnapshot::default(),
            method: DetectionMethod::KeywordSimilarity,
            category_id: CategoryId(cat),
            confidence: 0.9,
            keyword_score: 1.0,
            similarity_score: 0.75,
            matched_keywords: vec!["phone".into()],
            alternatives: vec![],
            processing_time_ms: 3,
            warning: None,
            escalated: false,
            user_confirmed: None,
            corrected_category_id: None,
        }
    }

    #[tokio::test]
    async fn insert_dedups_on_normalized_keyword() {
        let store = MemoryStore::new();
        let n = store
            .insert_keywords(vec![
                NewKeyword::manual(CategoryId(1), "en", "Phone", KeywordType::Main, 1.0),
                NewKeyword::manual(CategoryId(1), "EN", " phone ", KeywordType::Synonym, 2.0),
                NewKeyword::manual(CategoryId(2), "en", "phone", KeywordType::Negative, 1.0),
                NewKeyword::manual(CategoryId(1), "en", "  ", KeywordType::Main, 1.0),
            ])
            .await
            .unwrap();
        assert_eq!(n, 2);
        let all = store.load_keywords().await.unwrap();
        assert_eq!(all[0].keyword_type, KeywordType::Main);
        assert_eq!(all[0].success_rate, DEFAULT_SUCCESS_RATE);
    }

    #[tokio::test]
    async fn feedback_is_set_once() {
        let store = MemoryStore::new();
        let s = stats(1);
        let id = s.id;
        store.insert_stats(s).await.unwrap();

        let fb = Feedback::from_correct_category(CategoryId(1), CategoryId(1));
        assert_eq!(store.set_feedback(id, fb).await.unwrap(), FeedbackOutcome::Applied);
        let other = Feedback::from_correct_category(CategoryId(1), CategoryId(7));
        assert_eq!(
            store.set_feedback(id, other).await.unwrap(),
            FeedbackOutcome::AlreadySet
        );
        let got = store.get_stats(id).await.unwrap().unwrap();
        assert_eq!(got.user_confirmed, Some(true));
        assert_eq!(got.corrected_category_id, None);
        assert_eq!(
            store.set_feedback(StatsId::new(), fb).await.unwrap(),
            FeedbackOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn learning_batch_updates_and_checkpoint_is_monotonic() {
        let store = MemoryStore::new();
        store
            .insert_keywords(vec![NewKeyword::manual(
                CategoryId(1),
                "en",
                "Phone",
                KeywordType::Main,
                1.0,
            )])
            .await
            .unwrap();
        let batch = LearningBatch {
            success_rates: vec![SuccessRateUpdate {
                category_id: CategoryId(1),
                language: "en".into(),
                keyword: "phone".into(),
                success_rate: 3.0,
            }],
            usage: vec![UsageIncrement {
                category_id: CategoryId(1),
                language: "en".into(),
                keyword: "phone".into(),
                count: 4,
            }],
            checkpoint: Some(10),
        };
        store.apply_learning_batch(batch).await.unwrap();
        store
            .apply_learning_batch(LearningBatch {
                checkpoint: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        let k = &store.load_keywords().await.unwrap()[0];
        assert_eq!(k.success_rate, 1.0);
        assert_eq!(k.usage_count, 4);
        assert_eq!(store.learning_checkpoint().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = MemoryStore::open(&path).unwrap();
            store.insert_stats(stats(3)).await.unwrap();
            store.insert_stats(stats(4)).await.unwrap();
            store
                .insert_keywords(vec![NewKeyword::manual(
                    CategoryId(3),
                    "en",
                    "laptop",
                    KeywordType::Main,
                    1.0,
                )])
                .await
                .unwrap();
            store
                .apply_learning_batch(LearningBatch {
                    checkpoint: Some(2),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.load_keywords().await.unwrap().len(), 1);
        assert_eq!(store.learning_checkpoint().await.unwrap(), 2);
        let all = store.stats_after(0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 1);
        assert_eq!(all[1].seq, 2);
        assert_eq!(store.stats_after(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_and_feedback_append_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let (a, b) = (stats(1), stats(2));
        let (ida, idb) = (a.id, b.id);
        {
            let store = MemoryStore::open(&path).unwrap();
            store.insert_stats(a).await.unwrap();
            store.insert_stats(b).await.unwrap();
            let fb = Feedback::from_correct_category(CategoryId(1), CategoryId(5));
            store.set_feedback(ida, fb).await.unwrap();
        }
        // recording stats never rewrites the snapshot
        assert!(!path.exists());
        let log = fs::read_to_string(stats_log_path(&path)).unwrap();
        assert_eq!(log.lines().count(), 3);

        // a torn last line is skipped on replay
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(stats_log_path(&path))
            .unwrap();
        f.write_all(br#"{"op":"stats","id":"#).unwrap();
        drop(f);

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.stats_len().await, 2);
        let got = store.get_stats(ida).await.unwrap().unwrap();
        assert_eq!(got.corrected_category_id, Some(CategoryId(5)));
        assert_eq!(got.user_confirmed, Some(false));
        assert!(!store.get_stats(idb).await.unwrap().unwrap().has_feedback());

        // sequence numbers continue after the replayed records
        let c = stats(3);
        let idc = c.id;
        store.insert_stats(c).await.unwrap();
        assert_eq!(store.get_stats(idc).await.unwrap().unwrap().seq, 3);
    }

    #[tokio::test]
    async fn duplicate_stats_ids_are_rejected() {
        let store = MemoryStore::new();
        let s = stats(1);
        store.insert_stats(s.clone()).await.unwrap();
        assert!(store.insert_stats(s).await.is_err());
        assert_eq!(store.stats_len().await, 1);
    }

    #[tokio::test]
    async fn disable_keeps_row() {
        let store = MemoryStore::new();
        store
            .insert_keywords(vec![NewKeyword::manual(
                CategoryId(1),
                "en",
                "tablet",
                KeywordType::Main,
                1.0,
            )])
            .await
            .unwrap();
        let id = store.load_keywords().await.unwrap()[0].id;
        assert!(store.disable_keyword(id).await.unwrap());
        assert!(!store.disable_keyword(999).await.unwrap());
        let all = store.load_keywords().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].disabled);
    }
}
