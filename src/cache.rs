//! Incremental analysis cache
//!
//! Decides which files need re-evaluation and keeps their last results
//! between runs. Change detection compares mtime first and falls back to a
//! SHA-256 of the content, so a touch that keeps the bytes is "unchanged".
//!
//! The whole cache is one JSON document. Loading is best-effort: a missing
//! or corrupt document gives an empty cache. Flushing writes a snapshot to a
//! temporary file and renames it into place.

use crate::engine::FileResult;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Cache document file name inside the results directory
pub const CACHE_FILE_NAME: &str = "fileCache.json";

/// Cache format version (bump to invalidate persisted caches)
const CACHE_VERSION: u32 = 1;

/// Internal cache I/O failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Cache version {found} does not match {expected}")]
    Version { found: u32, expected: u32 },
}

/// Cached state of one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCacheEntry {
    /// Absolute file path
    pub path: String,
    /// Modification time in milliseconds since the epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// SHA-256 of the content, hex encoded
    pub content_hash: String,
    /// Last analysis result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_result: Option<FileResult>,
    /// Last read or write of this entry, milliseconds since the epoch
    pub last_access: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    config_hash: String,
    #[serde(default)]
    entries: BTreeMap<String, FileCacheEntry>,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of entries
    pub total_entries: usize,
    /// Entries holding an analysis result
    pub entries_with_results: usize,
    /// Events stored across all cached results
    pub total_events: usize,
    /// Cached results handed out
    pub hits: usize,
    /// Lookups that found nothing usable
    pub misses: usize,
    /// Backing file, if persisted
    pub cache_file: Option<PathBuf>,
}

impl CacheStats {
    /// Calculate hit rate percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Path-addressed store of file fingerprints and results
#[derive(Debug, Default)]
pub struct FileAnalysisCache {
    file: Option<PathBuf>,
    entries: DashMap<String, FileCacheEntry>,
    config_hash: Mutex<String>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
    flush_lock: Mutex<()>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl FileAnalysisCache {
    /// In-memory cache that is never persisted
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache document at `file`, dropping entries older than `ttl`.
    ///
    /// Never fails: an unreadable document is logged and replaced by an
    /// empty cache bound to the same file.
    pub fn load(file: &Path, ttl: Option<Duration>) -> Self {
        let cache = Self {
            file: Some(file.to_path_buf()),
            ..Self::default()
        };

        match read_document(file) {
            Ok(Some(document)) => {
                *lock(&cache.config_hash) = document.config_hash;
                for (path, entry) in document.entries {
                    cache.entries.insert(path, entry);
                }
                debug!("Loaded {} cache entries from {}", cache.entries.len(), file.display());
            }
            Ok(None) => debug!("No cache at {}", file.display()),
            Err(e) => warn!("Ignoring cache {}: {}", file.display(), e),
        }

        if let Some(ttl) = ttl {
            cache.expire(ttl);
        }
        cache
    }

    /// Backing file, if any
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Drop every entry when the configuration changed since the last run
    pub fn set_config_hash(&self, hash: &str) {
        let mut current = lock(&self.config_hash);
        if *current != hash {
            if !self.entries.is_empty() {
                debug!("Configuration changed; invalidating {} cache entries", self.entries.len());
            }
            self.entries.clear();
            *current = hash.to_string();
        }
    }

    /// Whether `path` must be re-evaluated.
    ///
    /// Paths without an entry and paths that no longer exist are changed.
    pub fn is_file_changed(&self, path: &Path) -> bool {
        let key = cache_key(path);
        let Some(entry) = self.entries.get(&key).map(|e| e.clone()) else {
            return true;
        };

        let Ok(metadata) = fs::metadata(path) else {
            return true;
        };

        if modified_millis(&metadata) == entry.mtime_millis && metadata.len() == entry.size {
            return false;
        }

        let Ok(hash) = hash_file(path) else {
            return true;
        };
        if hash != entry.content_hash {
            return true;
        }

        // Same bytes under a new mtime: remember it so the next check
        // stays on the fast path
        let path_lock = Arc::clone(&self.path_locks.entry(key.clone()).or_default());
        let _guard = lock(&path_lock);
        if let Some(mut current) = self.entries.get_mut(&key) {
            if current.content_hash == hash {
                current.mtime_millis = modified_millis(&metadata);
                current.size = metadata.len();
            }
        }
        false
    }

    /// Subset of `paths` that must be re-evaluated, in input order
    pub fn get_changed_files(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths
            .iter()
            .filter(|p| self.is_file_changed(p))
            .cloned()
            .collect()
    }

    /// Record the current fingerprint of `path` along with its result.
    ///
    /// Updates to one path are serialized; different paths proceed in
    /// parallel. Returns `false` when the file could not be fingerprinted.
    pub fn update_file_cache(&self, path: &Path, result: Option<FileResult>) -> bool {
        let key = cache_key(path);
        let path_lock = Arc::clone(&self.path_locks.entry(key.clone()).or_default());
        let _guard = lock(&path_lock);

        let fingerprint = fs::metadata(path).and_then(|m| Ok((m, hash_file(path)?)));
        let (metadata, content_hash) = match fingerprint {
            Ok(f) => f,
            Err(e) => {
                warn!("Cannot cache {}: {}", path.display(), e);
                self.entries.remove(&key);
                return false;
            }
        };

        let entry = FileCacheEntry {
            path: key.clone(),
            mtime_millis: modified_millis(&metadata),
            size: metadata.len(),
            content_hash,
            cached_result: result,
            last_access: now_millis(),
        };
        self.entries.insert(key, entry);
        true
    }

    /// Last stored result for `path`
    pub fn get_cached_result(&self, path: &Path) -> Option<FileResult> {
        let key = cache_key(path);
        let result = self.entries.get_mut(&key).and_then(|mut entry| {
            entry.last_access = now_millis();
            entry.cached_result.clone()
        });

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Entry for `path`
    pub fn entry(&self, path: &Path) -> Option<FileCacheEntry> {
        self.entries.get(&cache_key(path)).map(|e| e.clone())
    }

    /// Remove all entries and the persisted document
    pub fn clear_cache(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);

        if let Some(file) = &self.file {
            let _guard = lock(&self.flush_lock);
            if file.exists() {
                if let Err(e) = fs::remove_file(file) {
                    warn!("Failed to remove cache {}: {}", file.display(), e);
                }
            }
        }
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cache_file: self.file.clone(),
            ..Default::default()
        };
        for entry in self.entries.iter() {
            if let Some(result) = &entry.cached_result {
                stats.entries_with_results += 1;
                stats.total_events += result.events.len();
            }
        }
        stats
    }

    /// Evict entries idle for longer than `ttl` or whose file is gone.
    /// Returns the number of evicted entries.
    pub fn expire(&self, ttl: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(ttl.as_millis() as u64);
        let before = self.entries.len();
        self.entries
            .retain(|path, entry| entry.last_access >= cutoff && Path::new(path).exists());
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("Evicted {} stale cache entries", evicted);
        }
        evicted
    }

    /// Persist the cache, logging failures
    pub fn flush(&self) -> bool {
        match self.try_flush() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write cache: {}", e);
                false
            }
        }
    }

    /// Persist a snapshot of the cache through a temporary file
    pub fn try_flush(&self) -> Result<(), CacheError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _guard = lock(&self.flush_lock);

        let document = CacheDocument {
            version: CACHE_VERSION,
            config_hash: lock(&self.config_hash).clone(),
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let content = serde_json::to_vec_pretty(&document)?;

        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp = file.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&temp, content)?;
        if let Err(e) = fs::rename(&temp, file) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        debug!("Wrote {} cache entries to {}", document.entries.len(), file.display());
        Ok(())
    }
}

fn read_document(file: &Path) -> Result<Option<CacheDocument>, CacheError> {
    if !file.exists() {
        return Ok(None);
    }
    let content = fs::read(file)?;
    let document: CacheDocument = serde_json::from_slice(&content)?;
    if document.version != CACHE_VERSION {
        return Err(CacheError::Version {
            found: document.version,
            expected: CACHE_VERSION,
        });
    }
    Ok(Some(document))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn cache_key(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

/// SHA-256 of a file's content
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let content = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

fn modified_millis(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
