//! Per-ASIN JSON snapshot cache.
//!
//! One `{asin}.json` per product under the cache directory plus a typed
//! `metadata.json` with hit/miss counters. Purely a latency optimization
//! and debugging surface: any operation may rebuild it from the store and
//! the SP-API.

use crate::daemon::ShutdownSignal;
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Price,
    Stock,
    BasicInfo,
    All,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub total_cached: u64,
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub cache_misses: u64,
    #[serde(default)]
    pub last_bulk_update: Option<String>,
}

pub struct ProductCache {
    cache_dir: PathBuf,
    metadata_file: PathBuf,
    ttl: Duration,
    metadata: parking_lot::Mutex<CacheMetadata>,
}

impl ProductCache {
    pub fn new(cache_dir: &Path, ttl: Option<Duration>) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("create cache dir {}", cache_dir.display()))?;
        let metadata_file = cache_dir.join("metadata.json");

        let metadata = match std::fs::read_to_string(&metadata_file) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                // Legacy free-form metadata: migrate by starting a fresh
                // typed record.
                warn!("rebuilding cache metadata ({e})");
                CacheMetadata::default()
            }),
            Err(_) => CacheMetadata::default(),
        };

        let cache = Self {
            cache_dir: cache_dir.to_path_buf(),
            metadata_file,
            ttl: ttl.unwrap_or(Duration::from_secs(DEFAULT_TTL_SECS)),
            metadata: parking_lot::Mutex::new(metadata),
        };
        cache.save_metadata()?;
        Ok(cache)
    }

    fn snapshot_path(&self, asin: &str) -> PathBuf {
        self.cache_dir.join(format!("{asin}.json"))
    }

    fn save_metadata(&self) -> Result<()> {
        let metadata = self.metadata.lock().clone();
        let raw = serde_json::to_string_pretty(&metadata).context("serialize cache metadata")?;
        std::fs::write(&self.metadata_file, raw).context("write cache metadata")?;
        Ok(())
    }

    /// Snapshot for `asin`, or `None` when absent or older than the TTL.
    pub fn get(&self, asin: &str) -> Option<Value> {
        let path = self.snapshot_path(asin);

        let fresh = path
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age <= self.ttl)
            .unwrap_or(false);

        if !fresh {
            self.metadata.lock().cache_misses += 1;
            self.save_metadata().ok();
            return None;
        }

        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(data) => {
                self.metadata.lock().cache_hits += 1;
                self.save_metadata().ok();
                Some(data)
            }
            None => {
                self.metadata.lock().cache_misses += 1;
                self.save_metadata().ok();
                None
            }
        }
    }

    /// Merge `data` into the stored snapshot and stamp the update-type
    /// timestamps. `cached_at` is always refreshed.
    pub fn set(&self, asin: &str, data: &Value, update_types: &[UpdateType]) -> Result<()> {
        let path = self.snapshot_path(asin);
        let is_new = !path.exists();
        let full_update = update_types.is_empty() || update_types.contains(&UpdateType::All);

        let mut merged: Map<String, Value> = if !full_update && !is_new {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default()
        } else {
            Map::new()
        };

        if let Some(obj) = data.as_object() {
            for (key, value) in obj {
                merged.insert(key.clone(), value.clone());
            }
        }

        let now = Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.f").to_string();
        if full_update || update_types.contains(&UpdateType::Price) {
            merged.insert("price_updated_at".to_string(), Value::String(now.clone()));
        }
        if full_update || update_types.contains(&UpdateType::Stock) {
            merged.insert("stock_updated_at".to_string(), Value::String(now.clone()));
        }
        if full_update || update_types.contains(&UpdateType::BasicInfo) {
            merged.insert("basic_info_updated_at".to_string(), Value::String(now.clone()));
        }
        merged.insert("cached_at".to_string(), Value::String(now));

        let raw = serde_json::to_string_pretty(&Value::Object(merged))
            .context("serialize cache snapshot")?;
        std::fs::write(&path, raw)
            .with_context(|| format!("write cache snapshot {}", path.display()))?;

        if is_new {
            self.metadata.lock().total_cached += 1;
        }
        self.save_metadata()?;
        Ok(())
    }

    pub fn delete(&self, asin: &str) -> bool {
        let path = self.snapshot_path(asin);
        if path.exists() && std::fs::remove_file(&path).is_ok() {
            let mut metadata = self.metadata.lock();
            metadata.total_cached = metadata.total_cached.saturating_sub(1);
            drop(metadata);
            self.save_metadata().ok();
            true
        } else {
            false
        }
    }

    /// Sequential refresh driver: fetch each ASIN through `fetcher`,
    /// pausing `sleep` in between, honoring the shutdown signal.
    pub async fn bulk_update<F, Fut>(
        &self,
        asins: &[String],
        mut fetcher: F,
        sleep: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<BulkUpdateSummary>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<Option<Value>>>,
    {
        let mut summary = BulkUpdateSummary {
            total: asins.len(),
            ..Default::default()
        };

        for (idx, asin) in asins.iter().enumerate() {
            if shutdown.is_set() {
                info!("shutdown requested, bulk update stopped at {idx}/{}", asins.len());
                break;
            }

            match fetcher(asin.clone()).await {
                Ok(Some(data)) => {
                    self.set(asin, &data, &[UpdateType::All])?;
                    summary.success += 1;
                }
                Ok(None) => {
                    summary.errors += 1;
                }
                Err(e) => {
                    warn!("bulk update failed for {asin}: {e:#}");
                    summary.errors += 1;
                }
            }

            if idx + 1 < asins.len() && !shutdown.sleep(sleep).await {
                break;
            }
        }

        self.metadata.lock().last_bulk_update = Some(Utc::now().to_rfc3339());
        self.save_metadata()?;
        Ok(summary)
    }

    pub fn cleanup_expired(&self) -> Result<usize> {
        let mut deleted = 0;
        for entry in std::fs::read_dir(&self.cache_dir).context("read cache dir")? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || path == self.metadata_file
            {
                continue;
            }
            let expired = path
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|age| age > self.ttl)
                .unwrap_or(false);
            if expired && std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
        if deleted > 0 {
            let mut metadata = self.metadata.lock();
            metadata.total_cached = metadata.total_cached.saturating_sub(deleted as u64);
            drop(metadata);
            self.save_metadata()?;
            info!("deleted {deleted} expired cache snapshots");
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> CacheMetadata {
        self.metadata.lock().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkUpdateSummary {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> ProductCache {
        ProductCache::new(dir.path(), None).unwrap()
    }

    #[test]
    fn get_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        assert!(cache.get("B000MISS").is_none());
        cache
            .set("B000MISS", &json!({"price": 1200}), &[UpdateType::All])
            .unwrap();
        let snapshot = cache.get("B000MISS").unwrap();
        assert_eq!(snapshot["price"], 1200);

        let stats = cache.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.total_cached, 1);
    }

    #[test]
    fn partial_update_merges_and_stamps() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        cache
            .set("B000MERGE", &json!({"title": "item", "price": 100}), &[UpdateType::All])
            .unwrap();
        cache
            .set("B000MERGE", &json!({"price": 200}), &[UpdateType::Price])
            .unwrap();

        let snapshot = cache.get("B000MERGE").unwrap();
        assert_eq!(snapshot["title"], "item");
        assert_eq!(snapshot["price"], 200);
        assert!(snapshot.get("price_updated_at").is_some());
        assert!(snapshot.get("cached_at").is_some());
    }

    #[test]
    fn stock_update_does_not_stamp_price() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        cache
            .set("B000STAMP", &json!({"in_stock": true}), &[UpdateType::Stock])
            .unwrap();
        let snapshot = cache.get("B000STAMP").unwrap();
        assert!(snapshot.get("stock_updated_at").is_some());
        assert!(snapshot.get("price_updated_at").is_none());
    }

    #[test]
    fn expired_snapshot_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ProductCache::new(dir.path(), Some(Duration::from_secs(0))).unwrap();
        cache
            .set("B000OLD", &json!({"price": 1}), &[UpdateType::All])
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("B000OLD").is_none());
    }

    #[tokio::test]
    async fn bulk_update_counts_and_stamps() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let asins = vec!["A1".to_string(), "A2".to_string()];

        let summary = cache
            .bulk_update(
                &asins,
                |asin| async move {
                    if asin == "A1" {
                        Ok(Some(json!({"price": 10})))
                    } else {
                        Ok(None)
                    }
                },
                Duration::from_millis(1),
                &ShutdownSignal::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.success, 1);
        assert_eq!(summary.errors, 1);
        assert!(cache.stats().last_bulk_update.is_some());
    }

    #[tokio::test]
    async fn bulk_update_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let asins = vec!["A1".to_string()];
        let summary = cache
            .bulk_update(
                &asins,
                |_| async { Ok(Some(json!({}))) },
                Duration::from_millis(1),
                &shutdown,
            )
            .await
            .unwrap();
        assert_eq!(summary.success, 0);
    }
}
