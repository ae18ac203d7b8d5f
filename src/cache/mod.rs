//! Per-(kind, range) series cache with range-dependent expiry.
//!
//! Entries live in a [`CacheStore`] as JSON `{data, timestamp, expiry}` with
//! millisecond times. Intraday (`1D`) entries are also dropped once the zone's
//! calendar day changes, whatever their expiry says. Nothing here returns an
//! error: unreadable or corrupted entries are evicted and count as a miss.

pub mod store;

pub use store::{CacheStore, FileStore, MemoryStore};

use crate::domain::chart::{ChartBlock, Point, TimeNormalizer};
use crate::error::CacheError;
use crate::shared::{ChartKind, Clock, RangeKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const KEY_PREFIX: &str = "chart";

/// What a cache entry holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CachedData {
    /// Canonical points (streaming buffers, line series).
    Points(Vec<Point>),
    /// A rendered block (derived overlays, candles).
    Block(ChartBlock),
}

impl CachedData {
    pub fn is_empty(&self) -> bool {
        match self {
            CachedData::Points(points) => points.is_empty(),
            CachedData::Block(block) => block.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: CachedData,
    /// Write time, Unix millis.
    pub timestamp: i64,
    /// Unix millis after which the entry is no longer served.
    pub expiry: i64,
}

pub struct ChartCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    normalizer: TimeNormalizer,
}

impl std::fmt::Debug for ChartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartCache")
            .field("normalizer", &self.normalizer)
            .finish_non_exhaustive()
    }
}

impl ChartCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, normalizer: TimeNormalizer) -> Self {
        Self {
            store,
            clock,
            normalizer,
        }
    }

    pub fn key(range: RangeKey, kind: ChartKind) -> String {
        format!("{}:{}:{}", KEY_PREFIX, kind, range)
    }

    /// Persist `data` for `(range, kind)` with the range's TTL.
    pub fn save(&self, range: RangeKey, kind: ChartKind, data: &CachedData) {
        self.check_day_rollover();

        let now = self.clock.now_millis();
        let ttl = i64::try_from(range.cache_ttl().as_millis()).unwrap_or(i64::MAX);
        let entry = CacheEntry {
            data: data.clone(),
            timestamp: now,
            expiry: now.saturating_add(ttl),
        };

        let key = Self::key(range, kind);
        let result = serde_json::to_string(&entry)
            .map_err(|e| CacheError::Corrupted {
                key: key.clone(),
                reason: e.to_string(),
            })
            .and_then(|json| self.store.set(&key, json));
        if let Err(e) = result {
            tracing::warn!("cache write failed for {}: {}", key, e);
        }
    }

    /// Cached data for `(range, kind)` while `now < expiry`. Expired entries are evicted.
    pub fn load(&self, range: RangeKey, kind: ChartKind) -> Option<CachedData> {
        self.check_day_rollover();

        let key = Self::key(range, kind);
        let entry = self.read_entry(&key)?;
        if self.clock.now_millis() < entry.expiry {
            Some(entry.data)
        } else {
            tracing::debug!("cache entry {} expired", key);
            self.evict(&key);
            None
        }
    }

    pub fn remove(&self, range: RangeKey, kind: ChartKind) {
        self.evict(&Self::key(range, kind));
    }

    /// Drop every chart entry.
    pub fn clear(&self) {
        for key in self.chart_keys() {
            self.evict(&key);
        }
    }

    /// Evict `1D` entries written on an earlier zone calendar day.
    /// Returns whether anything was evicted.
    pub fn check_day_rollover(&self) -> bool {
        let today = self.normalizer.today(self.clock.now());
        let suffix = format!(":{}", RangeKey::Day1);
        let mut evicted = false;

        for key in self.chart_keys().into_iter().filter(|k| k.ends_with(&suffix)) {
            let stale = match self.read_entry(&key) {
                Some(entry) => self
                    .normalizer
                    .civil_date(entry.timestamp.div_euclid(1000))
                    .map_or(true, |written| written != today),
                // Already evicted as corrupted.
                None => continue,
            };
            if stale {
                self.evict(&key);
                evicted = true;
            }
        }

        if evicted {
            tracing::info!(%today, "day rollover: evicted intraday cache entries");
        }
        evicted
    }

    fn chart_keys(&self) -> Vec<String> {
        let prefix = format!("{}:", KEY_PREFIX);
        match self.store.keys() {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(&prefix)).collect(),
            Err(e) => {
                tracing::warn!("cache key listing failed: {}", e);
                Vec::new()
            }
        }
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("cache read failed for {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("{}", CacheError::Corrupted {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
                self.evict(key);
                None
            }
        }
    }

    fn evict(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            tracing::warn!("cache eviction failed for {}: {}", key, e);
        }
    }
}
