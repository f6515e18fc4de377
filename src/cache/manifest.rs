//! Persisted snapshot of the cache index
//!
//! The index itself lives in memory. A JSON snapshot is written to storage
//! after every change so the next process can adopt blobs left by this one
//! instead of orphaning them. Timestamps are stored as wall-clock time and
//! mapped back onto the monotonic clock on load.

use super::index::{CacheEntry, CacheIndex, OutputMeta};
use crate::fingerprint::Fingerprint;
use crate::transform::OutputFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Storage key of the snapshot; outside the output prefix
pub const MANIFEST_KEY: &str = "cache/index.json";

const MANIFEST_VERSION: u32 = 1;

/// A monotonic and a wall-clock reading taken together
#[derive(Debug, Clone, Copy)]
pub struct Clocks {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl Clocks {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// Time since a wall-clock moment; future moments count as zero
    pub fn age(&self, at: DateTime<Utc>) -> Duration {
        (self.wall - at).to_std().unwrap_or(Duration::ZERO)
    }

    fn to_wall(self, at: Instant) -> DateTime<Utc> {
        let elapsed = self.instant.saturating_duration_since(at);
        self.wall - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn to_instant(self, at: DateTime<Utc>) -> Instant {
        self.instant.checked_sub(self.age(at)).unwrap_or(self.instant)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    version: u32,
    pub entries: Vec<SavedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedEntry {
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl SavedEntry {
    pub fn storage_key(&self) -> String {
        self.fingerprint.storage_key(self.format.extension())
    }

    pub fn into_entry(self, clocks: Clocks) -> CacheEntry {
        CacheEntry {
            storage_key: self.storage_key(),
            fingerprint: self.fingerprint,
            size_bytes: self.size_bytes,
            meta: OutputMeta {
                format: self.format,
                width: self.width,
                height: self.height,
            },
            created_at: clocks.to_instant(self.created_at),
            last_access: clocks.to_instant(self.last_access),
        }
    }
}

impl Manifest {
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }

    pub fn capture(index: &CacheIndex, clocks: Clocks) -> Self {
        let entries = index
            .entries()
            .map(|entry| SavedEntry {
                fingerprint: entry.fingerprint,
                size_bytes: entry.size_bytes,
                format: entry.meta.format,
                width: entry.meta.width,
                height: entry.meta.height,
                created_at: clocks.to_wall(entry.created_at),
                last_access: clocks.to_wall(entry.last_access),
            })
            .collect();
        Self {
            version: MANIFEST_VERSION,
            entries,
        }
    }

    /// Snapshots from another format version are ignored
    pub fn is_current(&self) -> bool {
        self.version == MANIFEST_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ContentHash;
    use crate::transform::{ImageInfo, InputFormat, Operation, TransformParams};

    fn entry(seed: &str, created_at: Instant) -> CacheEntry {
        let info = ImageInfo {
            width: 1,
            height: 1,
            format: InputFormat::Png,
        };
        let params = TransformParams::new(Operation::Convert)
            .normalize(&info, false)
            .unwrap();
        let fingerprint =
            Fingerprint::compute(&ContentHash::of(seed.as_bytes()), "raster", 1, &params);
        CacheEntry {
            fingerprint,
            storage_key: fingerprint.storage_key("webp"),
            size_bytes: 9,
            meta: OutputMeta {
                format: OutputFormat::Webp,
                width: 3,
                height: 2,
            },
            created_at,
            last_access: created_at + Duration::from_secs(4),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_keeps_ages_across_clocks() {
        let start = Instant::now();
        let mut index = CacheIndex::default();
        index.insert(entry("a", start));
        tokio::time::advance(Duration::from_secs(10)).await;

        let json = serde_json::to_vec(&Manifest::capture(&index, Clocks::now())).unwrap();
        let manifest: Manifest = serde_json::from_slice(&json).unwrap();
        assert!(manifest.is_current());

        let clocks = Clocks::now();
        let restored = manifest.entries[0].clone().into_entry(clocks);
        let original = entry("a", start);
        assert_eq!(restored.storage_key, original.storage_key);
        assert_eq!(restored.meta, original.meta);
        let age = clocks.instant - restored.created_at;
        assert!(age >= Duration::from_secs(9) && age <= Duration::from_secs(11));
        assert!(restored.last_access > restored.created_at);
    }

    #[test]
    fn future_timestamps_have_no_age() {
        let clocks = Clocks::now();
        assert_eq!(clocks.age(clocks.wall + chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            clocks.age(clocks.wall - chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }
}
