//! Content-addressed cache of transferred resources
//!
//! Files are stored as `<cache_dir>/<fingerprint>` where the fingerprint is the
//! SHA-256 of the resolved URL. The index lives in `<cache_dir>/index.json` and
//! is rewritten through a temporary file on every insert.

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::DownloadError;
use crate::types::{CacheEntry, Fingerprint};

const INDEX_FILE: &str = "index.json";

/// Fingerprint-keyed file store shared by every fetch worker
#[derive(Debug)]
pub struct ContentCache {
    dir: PathBuf,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    /// One lock per fingerprint, created on first use
    locks: std::sync::Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl ContentCache {
    /// Open (or create) the cache in `dir`
    ///
    /// Index entries whose file is gone or has a different size are dropped.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::disk(&dir, e))?;

        let index_path = dir.join(INDEX_FILE);
        let stored: Vec<CacheEntry> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %index_path.display(), error = %e, "Cache index unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DownloadError::disk(&index_path, e)),
        };

        let total = stored.len();
        let mut entries = HashMap::with_capacity(total);
        for entry in stored {
            match tokio::fs::metadata(&entry.local_path).await {
                Ok(meta) if meta.len() == entry.size_bytes => {
                    entries.insert(entry.fingerprint.clone(), entry);
                }
                _ => {
                    tracing::debug!(fingerprint = %entry.fingerprint, "Dropping stale cache entry");
                }
            }
        }
        tracing::info!(dir = %dir.display(), entries = entries.len(), dropped = total - entries.len(), "Content cache opened");

        Ok(Self {
            dir,
            entries: Mutex::new(entries),
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize all work on one fingerprint until the guard is dropped
    ///
    /// The lock entry is forgotten once no task holds or waits for it.
    pub async fn lock(&self, fingerprint: &Fingerprint) -> FingerprintGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(fingerprint.clone()).or_default())
        };
        // Built before waiting so a cancelled waiter still cleans up
        let mut guard = FingerprintGuard {
            cache: self,
            fingerprint: fingerprint.clone(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    /// Number of fingerprints currently locked or waited on
    pub fn active_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Where a completed transfer is stored
    pub fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.as_str())
    }

    /// Where an in-progress transfer is written
    pub fn temp_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.part"))
    }

    /// Look up a fingerprint; an entry whose file has vanished is forgotten
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(fingerprint)?.clone();
        if tokio::fs::try_exists(&entry.local_path).await.unwrap_or(false) {
            return Some(entry);
        }
        tracing::warn!(fingerprint = %fingerprint, "Cached file missing, forgetting entry");
        entries.remove(fingerprint);
        None
    }

    /// Register a stored file and persist the index
    pub async fn insert(
        &self,
        fingerprint: Fingerprint,
        size_bytes: u64,
    ) -> Result<CacheEntry, DownloadError> {
        let entry = CacheEntry {
            local_path: self.blob_path(&fingerprint),
            fingerprint,
            size_bytes,
            stored_at: Utc::now(),
        };

        let mut entries = self.entries.lock().await;
        entries.insert(entry.fingerprint.clone(), entry.clone());
        self.persist(&entries).await?;
        Ok(entry)
    }

    /// Number of indexed entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the index is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self, entries: &HashMap<Fingerprint, CacheEntry>) -> Result<(), DownloadError> {
        let mut list: Vec<&CacheEntry> = entries.values().collect();
        list.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        let json = serde_json::to_vec_pretty(&list).map_err(|e| {
            DownloadError::disk(&self.dir, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let index_path = self.dir.join(INDEX_FILE);
        let temp_path = self.dir.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| DownloadError::disk(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &index_path)
            .await
            .map_err(|e| DownloadError::disk(&index_path, e))
    }
}

/// Exclusive hold on one fingerprint, see [`ContentCache::lock`]
pub struct FingerprintGuard<'a> {
    cache: &'a ContentCache,
    fingerprint: Fingerprint,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for FingerprintGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the only reference when nobody waits
        self.held.take();
        let mut locks = self.cache.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&self.fingerprint)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(&self.fingerprint);
        }
    }
}
