//! TTL-bounded cache for fused search results.
//!
//! Entries are keyed by [`SearchQuery::query_hash`]. Every material of a
//! stored result is also indexed by id, so a record can be fetched again
//! without re-running the query that found it.
//!
//! # Cache Structure
//!
//! ```text
//! ~/.cache/materials-master/
//!   searches/
//!     <query hash>.json
//! ```
//!
//! Each file holds the query, the result, the creation time and the TTL.
//! Files that fail to parse, or whose entry has expired, are deleted on
//! [`ResultCache::load`] instead of failing startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::persist::{read_json, remove_file, write_json, PersistError};
use crate::models::{Material, SearchQuery, SearchResult};

/// Default time-to-live of a cached result
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One cached search, as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub query: SearchQuery,

    pub result: SearchResult,

    /// When the entry was stored
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,

    /// Time-to-live, in seconds on disk
    #[serde(rename = "ttl", with = "duration_secs")]
    pub ttl: Duration,

    /// Times this entry has been served
    #[serde(default)]
    pub hit_count: u64,
}

impl CachedResult {
    fn new(query: SearchQuery, result: SearchResult, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            query,
            result,
            created_at: now,
            ttl,
            hit_count: 0,
        }
    }

    /// `(now - created_at) < ttl`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.created_at < ttl,
            Err(_) => true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Cache diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Stored entries, fresh or not
    pub entries: usize,

    /// Entries still within their TTL
    pub fresh_entries: usize,

    /// Materials in the id index
    pub indexed_materials: usize,

    /// Lookups answered from the cache
    pub hits: u64,

    /// Lookups that found nothing fresh
    pub misses: u64,

    pub ttl_seconds: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CachedResult>,
    materials: HashMap<String, Material>,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn index(&mut self, result: &SearchResult) {
        for material in result.materials() {
            self.materials.insert(material.id.clone(), material.clone());
        }
    }

    fn reindex(&mut self) {
        self.materials.clear();
        let results: Vec<SearchResult> = self.entries.values().map(|e| e.result.clone()).collect();
        for result in &results {
            self.index(result);
        }
    }
}

/// Result cache with optional one-file-per-entry persistence
#[derive(Debug)]
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    directory: Option<PathBuf>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResultCache {
    /// Create an in-memory cache
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            directory: None,
        }
    }

    /// Write every stored entry to `directory`
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Restore entries persisted in `directory`.
    ///
    /// Unparseable, mismatched or expired files are deleted and skipped.
    pub fn load(directory: impl Into<PathBuf>, ttl: Duration) -> Self {
        let cache = Self::new(ttl).with_directory(directory);
        let Some(dir) = cache.directory.as_deref() else {
            return cache;
        };

        let listing = match std::fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) => {
                tracing::debug!("Nothing to load from cache directory {}: {}", dir.display(), e);
                return cache;
            }
        };

        let now = Utc::now();
        let mut loaded = 0;
        let mut discarded = 0;
        {
            let mut inner = cache.lock();
            for path in listing.flatten().map(|entry| entry.path()) {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match Self::read_entry(&path, now) {
                    Some((key, entry)) => {
                        inner.index(&entry.result);
                        inner.entries.insert(key, entry);
                        loaded += 1;
                    }
                    None => {
                        let _ = std::fs::remove_file(&path);
                        discarded += 1;
                    }
                }
            }
        }

        tracing::debug!(
            "Cache loaded {} entries from {} ({} discarded)",
            loaded,
            dir.display(),
            discarded
        );
        cache
    }

    /// A fresh, well-formed entry whose file name matches its query hash
    fn read_entry(path: &Path, now: DateTime<Utc>) -> Option<(String, CachedResult)> {
        let entry: CachedResult = match read_json(path) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Discarding cache file: {}", e);
                return None;
            }
        };
        let key = entry.query.query_hash();
        let stem = path.file_stem().and_then(|s| s.to_str())?;

        let valid = entry.query.validate().is_ok() && stem == key && entry.is_fresh_at(now);
        valid.then_some((key, entry))
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", key)))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Fresh cached result for `query`, marked as served from cache
    pub fn get(&self, query: &SearchQuery) -> Option<SearchResult> {
        self.get_at(query, Utc::now())
    }

    /// [`get`](Self::get) evaluated at `now`
    pub fn get_at(&self, query: &SearchQuery, now: DateTime<Utc>) -> Option<SearchResult> {
        let key = query.query_hash();
        let mut inner = self.lock();

        let hit = match inner.entries.get_mut(&key) {
            Some(entry) if entry.is_fresh_at(now) => {
                entry.hit_count += 1;
                Some(entry.result.served_from_cache(None))
            }
            _ => None,
        };

        if hit.is_some() {
            inner.hits += 1;
            tracing::debug!("Cache HIT for search: {}", key);
        } else {
            inner.misses += 1;
            tracing::debug!("Cache MISS for search: {}", key);
        }
        hit
    }

    /// Store a result, replacing any previous entry for the same query
    pub async fn put(&self, query: &SearchQuery, result: &SearchResult) -> Result<(), PersistError> {
        self.put_at(query, result, Utc::now()).await
    }

    pub async fn put_at(
        &self,
        query: &SearchQuery,
        result: &SearchResult,
        now: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        let key = query.query_hash();
        let entry = CachedResult::new(query.clone(), result.clone(), self.ttl, now);

        {
            let mut inner = self.lock();
            inner.index(result);
            inner.entries.insert(key.clone(), entry.clone());
        }
        tracing::debug!(
            "Cached search result: {} ({} materials)",
            key,
            result.materials().len()
        );

        match self.entry_path(&key) {
            Some(path) => write_json(&path, &entry).await,
            None => Ok(()),
        }
    }

    /// A material from any stored result, by id
    pub fn get_material(&self, id: &str) -> Option<Material> {
        self.lock().materials.get(id).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            fresh_entries: inner.entries.values().filter(|e| e.is_fresh_at(now)).count(),
            indexed_materials: inner.materials.len(),
            hits: inner.hits,
            misses: inner.misses,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Drop expired entries (and their files); returns how many were removed
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now()).await
    }

    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let mut inner = self.lock();
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| !e.is_fresh_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                inner.entries.remove(key);
            }
            if !expired.is_empty() {
                inner.reindex();
            }
            expired
        };

        for key in &expired {
            if let Some(path) = self.entry_path(key) {
                if let Err(e) = remove_file(&path).await {
                    tracing::warn!("Failed to remove expired cache file: {}", e);
                }
            }
        }
        if !expired.is_empty() {
            tracing::debug!("Evicted {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Remove every entry, in memory and on disk
    pub async fn clear(&self) -> Result<(), PersistError> {
        {
            let mut inner = self.lock();
            *inner = CacheInner::default();
        }

        let Some(dir) = self.directory.as_deref() else {
            return Ok(());
        };
        let listing = match std::fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(_) => return Ok(()),
        };
        for path in listing.flatten().map(|entry| entry.path()) {
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                remove_file(&path).await?;
            }
        }
        tracing::info!("Cache cleared: {}", dir.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
