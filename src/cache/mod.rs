//! Content-addressed result cache
//!
//! Maps fingerprints to processed outputs stored in the storage backend,
//! bounded by total size (LRU eviction) and age (TTL).
//!
//! # Consistency
//!
//! - An index entry exists only while its blob is believed to exist
//! - Blobs are deleted before their index entry is removed; a failed delete
//!   keeps the entry and reports the backend error
//! - A backend `NotFound` on delete counts as deleted
//! - Writers (put, purge) are serialized; lookups never wait on I/O
//!
//! # Entry lifecycle
//!
//! | Event | Effect |
//! |-------|--------|
//! | put | blob stored, entry indexed, expired then LRU entries evicted |
//! | lookup | expired entries report a miss, nothing is mutated |
//! | touch | last access bumped, entry moves to the back of the LRU |
//! | purge | expired blobs deleted, entries removed |
//! | restore | saved entries whose blobs still exist are re-indexed |
//!
//! # Across restarts
//!
//! Every change writes a snapshot of the index to storage. A new process
//! calls [`ResultCache::restore`] to adopt the blobs it describes; output
//! blobs nobody tracks are deleted once they are older than the TTL.

mod index;
mod manifest;

pub use index::{CacheEntry, OutputMeta};

use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::{Fingerprint, OUTPUT_PREFIX};
use crate::storage::{StorageBackend, StoredObject};
use bytes::Bytes;
use index::CacheIndex;
use manifest::{Clocks, Manifest, MANIFEST_KEY};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Cache size status relative to the budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSizeStatus {
    /// Under 80% of budget
    Ok,
    /// Between 80% and 100% of budget
    Warning,
    /// Over budget; only reachable after a failed eviction
    Exceeded,
}

impl CacheSizeStatus {
    pub fn from_usage(current_bytes: u64, budget_bytes: u64) -> Self {
        if budget_bytes == 0 {
            return Self::Ok;
        }
        let percent = (current_bytes as f64 / budget_bytes as f64) * 100.0;
        if percent > 100.0 {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub ttl_seconds: u64,
    pub status: CacheSizeStatus,
}

/// What a startup reconciliation found in storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    /// Saved entries re-indexed
    pub adopted: usize,
    /// Untracked output blobs older than the TTL, deleted
    pub removed: usize,
    /// Untracked output blobs still inside the TTL, left alone
    pub untracked: usize,
}

/// Delete output blobs past `max_age` that `tracked` does not claim
async fn sweep_outputs(
    storage: &dyn StorageBackend,
    objects: &[StoredObject],
    max_age: Duration,
    clocks: Clocks,
    tracked: impl Fn(&Fingerprint, &str) -> bool,
) -> RestoreSummary {
    let mut summary = RestoreSummary::default();
    for object in objects {
        let Some((fp, _)) = Fingerprint::parse_storage_key(&object.key) else {
            continue;
        };
        if tracked(&fp, &object.key) {
            continue;
        }
        if clocks.age(object.modified) <= max_age {
            summary.untracked += 1;
            continue;
        }
        match storage.delete(&object.key).await {
            Ok(()) | Err(ForgeError::NotFound(_)) => summary.removed += 1,
            Err(e) => warn!("Failed to remove stale output {}: {}", object.key, e),
        }
    }
    summary
}

/// Remove stale outputs when no cache tracks them
///
/// Every output blob older than `max_age` is deleted.
pub async fn sweep_uncached(
    storage: &dyn StorageBackend,
    max_age: Duration,
) -> ForgeResult<RestoreSummary> {
    let objects = storage.list(OUTPUT_PREFIX).await?;
    let summary = sweep_outputs(storage, &objects, max_age, Clocks::now(), |_, _| false).await;
    if summary.removed > 0 {
        info!("Removed {} stale output(s)", summary.removed);
    }
    Ok(summary)
}

/// Size- and age-bounded output cache over a storage backend
pub struct ResultCache {
    storage: Arc<dyn StorageBackend>,
    budget: u64,
    ttl: Duration,
    index: Mutex<CacheIndex>,
    writer: tokio::sync::Mutex<()>,
}

impl ResultCache {
    pub fn new(storage: Arc<dyn StorageBackend>, budget: u64, ttl: Duration) -> Self {
        Self {
            storage,
            budget,
            ttl,
            index: Mutex::new(CacheIndex::default()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find a live entry without changing its recency
    pub fn lookup(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        let index = self.index();
        let entry = index.get(fp)?;
        if entry.is_expired(Instant::now(), self.ttl) {
            debug!("Cache entry {} expired", fp.short());
            return None;
        }
        Some(entry.clone())
    }

    /// Mark an entry as just used
    pub fn touch(&self, fp: &Fingerprint) -> bool {
        self.index().touch(fp, Instant::now())
    }

    /// Store an output and index it, evicting as needed to stay in budget
    ///
    /// Outputs larger than the whole budget are rejected without touching
    /// storage. Eviction failures are returned after the new entry has been
    /// indexed, so the output itself is never lost.
    pub async fn put(
        &self,
        fp: Fingerprint,
        bytes: Bytes,
        meta: OutputMeta,
    ) -> ForgeResult<CacheEntry> {
        let size = bytes.len() as u64;
        if size > self.budget {
            return Err(ForgeError::CacheRejected {
                size,
                budget: self.budget,
            });
        }

        let _writer = self.writer.lock().await;
        let storage_key = fp.storage_key(meta.format.extension());
        self.storage.put(&storage_key, bytes).await?;

        let now = Instant::now();
        let entry = CacheEntry {
            fingerprint: fp,
            storage_key,
            size_bytes: size,
            meta,
            created_at: now,
            last_access: now,
        };
        let previous = self.index().insert(entry.clone());
        debug!("Cached {} ({})", fp.short(), format_bytes(size));

        let trimmed = self.trim_after_insert(previous, &entry).await;
        self.save_manifest().await;
        trimmed.map(|()| entry)
    }

    async fn trim_after_insert(
        &self,
        previous: Option<CacheEntry>,
        entry: &CacheEntry,
    ) -> ForgeResult<()> {
        if let Some(previous) = previous {
            if previous.storage_key != entry.storage_key {
                self.delete_blob(&previous).await?;
            }
        }
        self.purge_expired_locked().await?;
        self.evict_to_budget(Some(&entry.fingerprint)).await
    }

    /// Adopt entries saved by an earlier process and sweep stale outputs
    ///
    /// A saved entry is adopted only while its blob still exists with the
    /// recorded size and it has not expired. The index is then trimmed to
    /// the budget.
    pub async fn restore(&self) -> ForgeResult<RestoreSummary> {
        let _writer = self.writer.lock().await;
        let objects = self.storage.list(OUTPUT_PREFIX).await?;
        let manifest = self.load_manifest().await;
        let clocks = Clocks::now();

        let listed: HashMap<&str, &StoredObject> =
            objects.iter().map(|o| (o.key.as_str(), o)).collect();
        let mut adopted = 0;
        {
            let mut index = self.index();
            for saved in manifest.entries {
                let key = saved.storage_key();
                let present = listed
                    .get(key.as_str())
                    .is_some_and(|object| object.size_bytes == saved.size_bytes);
                if present && clocks.age(saved.created_at) <= self.ttl {
                    index.insert(saved.into_entry(clocks));
                    adopted += 1;
                }
            }
        }

        let tracked = |fp: &Fingerprint, key: &str| self.index().tracks(fp, key);
        let mut summary =
            sweep_outputs(self.storage.as_ref(), &objects, self.ttl, clocks, tracked).await;
        summary.adopted = adopted;

        let trimmed = self.evict_to_budget(None).await;
        self.save_manifest().await;
        info!(
            "Restored {} cache entries ({} stale output(s) removed, {} untracked)",
            summary.adopted, summary.removed, summary.untracked
        );
        trimmed.map(|()| summary)
    }

    /// Write the current index snapshot, capturing recency changes
    pub async fn flush(&self) {
        let _writer = self.writer.lock().await;
        self.save_manifest().await;
    }

    /// Read the blob behind an entry
    pub async fn read(&self, entry: &CacheEntry) -> ForgeResult<Bytes> {
        self.storage.get(&entry.storage_key).await
    }

    /// Delete every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> ForgeResult<usize> {
        let _writer = self.writer.lock().await;
        let purged = self.purge_expired_locked().await;
        self.save_manifest().await;
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index();
        CacheStats {
            entries: index.len(),
            total_bytes: index.total_bytes(),
            budget_bytes: self.budget,
            ttl_seconds: self.ttl.as_secs(),
            status: CacheSizeStatus::from_usage(index.total_bytes(), self.budget),
        }
    }

    async fn purge_expired_locked(&self) -> ForgeResult<usize> {
        let expired = self.index().expired(Instant::now(), self.ttl);
        let count = expired.len();
        for entry in &expired {
            self.remove_entry(entry).await?;
        }
        if count > 0 {
            info!("Purged {} expired cache entries", count);
        }
        Ok(count)
    }

    /// Evict least recently used entries until the index fits the budget,
    /// never evicting `keep`
    async fn evict_to_budget(&self, keep: Option<&Fingerprint>) -> ForgeResult<()> {
        loop {
            let victim = {
                let index = self.index();
                if index.total_bytes() <= self.budget {
                    return Ok(());
                }
                match index.lru() {
                    Some(entry) if Some(&entry.fingerprint) != keep => entry.clone(),
                    // The newest entry fits on its own, so it is never the only one left
                    _ => return Ok(()),
                }
            };
            debug!(
                "Evicting {} ({}) to stay within {}",
                victim.fingerprint.short(),
                format_bytes(victim.size_bytes),
                format_bytes(self.budget)
            );
            self.remove_entry(&victim).await?;
        }
    }

    /// Caller holds the writer lock. Failures are logged only: the snapshot
    /// is an optimization and the blobs stay authoritative.
    async fn save_manifest(&self) {
        let manifest = Manifest::capture(&self.index(), Clocks::now());
        let bytes = match serde_json::to_vec(&manifest) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode cache snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.put(MANIFEST_KEY, Bytes::from(bytes)).await {
            warn!("Failed to save cache snapshot: {}", e);
        }
    }

    async fn load_manifest(&self) -> Manifest {
        let bytes = match self.storage.get(MANIFEST_KEY).await {
            Ok(bytes) => bytes,
            Err(ForgeError::NotFound(_)) => {
                debug!("No cache snapshot in storage");
                return Manifest::empty();
            }
            Err(e) => {
                warn!("Failed to read cache snapshot: {}", e);
                return Manifest::empty();
            }
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) if manifest.is_current() => manifest,
            Ok(_) => {
                warn!("Ignoring cache snapshot from another version");
                Manifest::empty()
            }
            Err(e) => {
                warn!("Ignoring unreadable cache snapshot: {}", e);
                Manifest::empty()
            }
        }
    }

    async fn remove_entry(&self, entry: &CacheEntry) -> ForgeResult<()> {
        self.delete_blob(entry).await?;
        self.index().remove(&entry.fingerprint);
        Ok(())
    }

    async fn delete_blob(&self, entry: &CacheEntry) -> ForgeResult<()> {
        match self.storage.delete(&entry.storage_key).await {
            Ok(()) | Err(ForgeError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!(
                    "Failed to delete cached blob {}: {}",
                    entry.storage_key, e
                );
                Err(e)
            }
        }
    }
}
