//! Two-tier cache for index summaries and per-source record data.
//!
//! Tier one is an in-process LRU; tier two is the durable key-value store.
//! Every entry carries `CacheMetadata` and is trusted only when its schema
//! version matches the live one and it is younger than the expiry window.
//! Stale entries read as misses. They are removed by `sweep_expired`.
//!
//! Reads never fail: store or decode errors are logged and reported as a miss.

use crate::config::CacheConfig;
use crate::database::{DatabaseError, KeyValueStore};
use crate::interface::{CacheStats, SweepReport};
use crate::models::{metadata_key, CacheEntry, CacheKey, CacheMetadata, Partition};
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    memory: Mutex<LruCache<String, CacheEntry<Arc<str>>>>,
    /// Held across every mutation so a payload and its metadata are never interleaved
    write_lock: Mutex<()>,
    schema_version: String,
    expiry_ms: i64,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            memory: Mutex::new(LruCache::new(capacity)),
            write_lock: Mutex::new(()),
            schema_version: config.schema_version.clone(),
            expiry_ms: config.expiry_ms(),
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, payload: &T) -> CacheResult<()> {
        self.put_at(key, payload, now_ms())
    }

    /// Write `payload` with metadata stamped at `timestamp`.
    pub fn put_at<T: Serialize + ?Sized>(&self, key: &CacheKey, payload: &T, timestamp: i64) -> CacheResult<()> {
        let metadata = CacheMetadata {
            timestamp,
            schema_version: self.schema_version.clone(),
            category: key.category(),
            source: key.source().map(str::to_string),
        };
        let payload_json = serde_json::to_string(payload)?;
        let metadata_json = serde_json::to_string(&metadata)?;
        let storage_key = key.storage_key();
        let meta_key = key.metadata_key();

        let _guard = self.write_lock.lock();
        self.store.set_many(&[
            (key.partition(), storage_key.as_str(), payload_json.as_str()),
            (Partition::Metadata, meta_key.as_str(), metadata_json.as_str()),
        ])?;
        self.memory.lock().put(
            meta_key,
            CacheEntry {
                metadata,
                payload: Arc::from(payload_json),
            },
        );
        debug!(key = %storage_key, partition = key.partition().as_str(), "cache write");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.get_at(key, now_ms())
    }

    /// Look up `key` as if the current time were `now`. Stale, missing and
    /// unreadable entries all come back as `None`.
    pub fn get_at<T: DeserializeOwned>(&self, key: &CacheKey, now: i64) -> Option<T> {
        match self.try_get_at(key, now) {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key.storage_key(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    fn try_get_at<T: DeserializeOwned>(&self, key: &CacheKey, now: i64) -> CacheResult<Option<T>> {
        let meta_key = key.metadata_key();

        let remembered = {
            let mut memory = self.memory.lock();
            let cached = memory
                .get(&meta_key)
                .map(|entry| (self.is_valid(&entry.metadata, now), Arc::clone(&entry.payload)));
            match cached {
                Some((true, payload)) => Some(payload),
                Some((false, _)) => {
                    memory.pop(&meta_key);
                    None
                }
                None => None,
            }
        };
        if let Some(payload) = remembered {
            return Ok(Some(serde_json::from_str(&payload)?));
        }

        let Some(metadata_json) = self.store.get(Partition::Metadata, &meta_key)? else {
            return Ok(None);
        };
        let metadata: CacheMetadata = serde_json::from_str(&metadata_json)?;
        if !self.is_valid(&metadata, now) {
            debug!(key = %key.storage_key(), version = %metadata.schema_version, "stale cache entry");
            return Ok(None);
        }
        let Some(payload_json) = self.store.get(key.partition(), &key.storage_key())? else {
            return Ok(None);
        };
        let payload = serde_json::from_str(&payload_json)?;
        self.memory.lock().put(
            meta_key,
            CacheEntry {
                metadata,
                payload: Arc::from(payload_json),
            },
        );
        Ok(Some(payload))
    }

    fn is_valid(&self, metadata: &CacheMetadata, now: i64) -> bool {
        metadata.is_valid(&self.schema_version, self.expiry_ms, now)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────────

    /// Empty every partition and the memory tier.
    pub fn clear_all(&self) -> CacheResult<()> {
        let _guard = self.write_lock.lock();
        self.memory.lock().clear();
        for partition in [Partition::Index, Partition::Data, Partition::Metadata] {
            self.store.clear(partition)?;
        }
        info!("cache cleared");
        Ok(())
    }

    pub fn sweep_expired(&self) -> CacheResult<SweepReport> {
        self.sweep_at(now_ms())
    }

    /// Remove every entry that would read as stale at `now`, along with
    /// metadata documents whose payload is gone.
    pub fn sweep_at(&self, now: i64) -> CacheResult<SweepReport> {
        let _guard = self.write_lock.lock();
        let mut report = SweepReport::default();

        for partition in [Partition::Index, Partition::Data] {
            for storage_key in self.store.keys(partition)? {
                let meta_key = metadata_key(partition, &storage_key);
                let valid = self
                    .store
                    .get(Partition::Metadata, &meta_key)?
                    .and_then(|json| serde_json::from_str::<CacheMetadata>(&json).ok())
                    .is_some_and(|metadata| self.is_valid(&metadata, now));
                if valid {
                    continue;
                }
                self.store.remove(partition, &storage_key)?;
                self.store.remove(Partition::Metadata, &meta_key)?;
                self.memory.lock().pop(&meta_key);
                match partition {
                    Partition::Index => report.removed_index_count += 1,
                    _ => report.removed_data_count += 1,
                }
            }
        }

        for meta_key in self.store.keys(Partition::Metadata)? {
            let orphaned = match meta_key.split_once(':') {
                Some(("index", storage_key)) => self.store.get(Partition::Index, storage_key)?.is_none(),
                Some(("data", storage_key)) => self.store.get(Partition::Data, storage_key)?.is_none(),
                _ => true,
            };
            if orphaned {
                self.store.remove(Partition::Metadata, &meta_key)?;
                self.memory.lock().pop(&meta_key);
            }
        }

        Ok(report)
    }

    /// Startup hook: sweep stale entries, never fail.
    pub fn initialize(&self) {
        match self.sweep_expired() {
            Ok(report) => info!(
                removed_index = report.removed_index_count,
                removed_data = report.removed_data_count,
                "cache initialized"
            ),
            Err(e) => warn!(error = %e, "cache initialization failed"),
        }
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let index = self.store.usage(Partition::Index)?;
        let data = self.store.usage(Partition::Data)?;
        Ok(CacheStats {
            index_count: index.entries,
            data_count: data.entries,
            total_size: index.bytes + data.bytes,
        })
    }
}
