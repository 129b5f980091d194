// src/ai/cache.rs
//! Provider wrapper: file cache of replies + per-day call limit.
//! Cache hits are free; only successful real calls count against the limit,
//! but a call in flight holds its slot so concurrent callers cannot overrun it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{Completion, EscalationError, Provider, ProviderFuture};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedReply {
    text: String,
}

/// File names and counter state are guarded by a `Mutex`.
pub struct CachingProvider<P: Provider> {
    inner: P,
    cache_dir: Option<PathBuf>,
    daily_limit_max: u32,
    counter: Arc<Mutex<DailyCounter>>,
}

impl<P: Provider> CachingProvider<P> {
    /// `cache_dir = None` keeps only the in-memory daily counter.
    pub fn new(inner: P, cache_dir: Option<PathBuf>, daily_limit_max: u32) -> Self {
        let counter = match &cache_dir {
            Some(dir) => {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!(target: "ai", dir = %dir.display(), error = %e, "cannot create AI cache dir");
                }
                load_daily_counter(dir).unwrap_or_default()
            }
            None => DailyCounter::default(),
        };
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter: Arc::new(Mutex::new(counter)),
        }
    }

    fn counter(&self) -> MutexGuard<'_, DailyCounter> {
        lock_counter(&self.counter)
    }

    /// Real calls made today.
    pub fn calls_today(&self) -> u32 {
        let g = self.counter();
        if g.is_expired() {
            0
        } else {
            g.count
        }
    }

    async fn complete_impl(&self, req: &Completion) -> Result<String, EscalationError> {
        let key = cache_key(self.inner.name(), req);

        // 1) Cache lookup.
        if let Some(dir) = &self.cache_dir {
            if let Some(hit) = read_cache_file(dir, &key) {
                debug!(target: "ai", task = req.task.as_str(), "cache hit");
                return Ok(hit.text);
            }
        }

        // 2) Daily limit: reserve a slot before calling out.
        let slot = {
            let mut g = self.counter();
            if g.is_expired() {
                g.reset_to_today();
                self.persist_counter(&g);
            }
            if g.count.saturating_add(g.in_flight) >= self.daily_limit_max {
                return Err(EscalationError::DailyLimit);
            }
            g.in_flight += 1;
            Reservation {
                counter: &*self.counter,
            }
        };

        // 3) Real call. Dropping `slot` (error, timeout, cancellation) frees it.
        let text = self.inner.complete(req).await?;
        if let Some(dir) = &self.cache_dir {
            if let Err(e) = write_cache_file(dir, &key, &CachedReply { text: text.clone() }) {
                warn!(target: "ai", error = %e, "AI cache write failed");
            }
        }
        {
            let mut g = self.counter();
            g.count = g.count.saturating_add(1);
            self.persist_counter(&g);
        }
        drop(slot);
        Ok(text)
    }

    fn persist_counter(&self, dc: &DailyCounter) {
        if let Some(dir) = &self.cache_dir {
            if let Err(e) = save_daily_counter(dir, dc) {
                warn!(target: "ai", error = %e, "AI daily counter write failed");
            }
        }
    }
}

impl<P: Provider> Provider for CachingProvider<P> {
    fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a> {
        Box::pin(self.complete_impl(req))
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

fn lock_counter(m: &Mutex<DailyCounter>) -> MutexGuard<'_, DailyCounter> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

/// One in-flight real call counted against the daily limit.
struct Reservation<'a> {
    counter: &'a Mutex<DailyCounter>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut g = lock_counter(self.counter);
        g.in_flight = g.in_flight.saturating_sub(1);
    }
}

fn cache_key(provider: &str, req: &Completion) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0u8]);
    hasher.update(req.task.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(req.system.as_bytes());
    hasher.update([0u8]);
    hasher.update(req.user.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cache_file(dir: &Path, key: &str) -> Option<CachedReply> {
    let s = fs::read_to_string(cache_path(dir, key)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_cache_file(dir: &Path, key: &str, value: &CachedReply) -> io::Result<()> {
    let path = cache_path(dir, key);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(json.as_bytes())?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
    #[serde(skip)]
    in_flight: u32,
}

impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
            in_flight: 0,
        }
    }
}

impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }

    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    Utc::now().date_naive().to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

fn load_daily_counter(dir: &Path) -> io::Result<DailyCounter> {
    let s = fs::read_to_string(counter_path(dir))?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_daily_counter(dir: &Path, dc: &DailyCounter) -> io::Result<()> {
    let p = counter_path(dir);
    let tmp = p.with_extension("json.tmp");
    let s = serde_json::to_string(dc).map_err(io::Error::other)?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(s.as_bytes())?;
    fs::rename(tmp, p)?;
    Ok(())
}
