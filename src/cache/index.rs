//! In-memory cache index
//!
//! Tracks entries by fingerprint and keeps a second ordering by
//! `(last_access, created_at, seq)` so the least recently used entry is
//! always the first key. Pure bookkeeping: no I/O happens here.

use crate::fingerprint::Fingerprint;
use crate::transform::OutputFormat;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Output properties remembered alongside a cached blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMeta {
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

/// One cached output
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub storage_key: String,
    pub size_bytes: u64,
    pub meta: OutputMeta,
    pub created_at: Instant,
    pub last_access: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

type OrderKey = (Instant, Instant, u64);

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

impl Slot {
    fn order_key(&self) -> OrderKey {
        (self.entry.last_access, self.entry.created_at, self.seq)
    }
}

#[derive(Default)]
pub(crate) struct CacheIndex {
    slots: HashMap<Fingerprint, Slot>,
    order: BTreeMap<OrderKey, Fingerprint>,
    total_bytes: u64,
    next_seq: u64,
}

impl CacheIndex {
    pub fn get(&self, fp: &Fingerprint) -> Option<&CacheEntry> {
        self.slots.get(fp).map(|slot| &slot.entry)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.values().map(|slot| &slot.entry)
    }

    /// True when `key` is the blob behind a live index entry
    pub fn tracks(&self, fp: &Fingerprint, key: &str) -> bool {
        self.get(fp).is_some_and(|entry| entry.storage_key == key)
    }

    /// Insert or replace, returning the replaced entry
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let previous = self.remove(&entry.fingerprint);
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = Slot { entry, seq };
        self.order.insert(slot.order_key(), slot.entry.fingerprint);
        self.total_bytes += slot.entry.size_bytes;
        self.slots.insert(slot.entry.fingerprint, slot);
        previous
    }

    pub fn remove(&mut self, fp: &Fingerprint) -> Option<CacheEntry> {
        let slot = self.slots.remove(fp)?;
        self.order.remove(&slot.order_key());
        self.total_bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }

    /// Bump the access time; returns false for unknown fingerprints
    pub fn touch(&mut self, fp: &Fingerprint, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(fp) else {
            return false;
        };
        self.order.remove(&slot.order_key());
        // Never move backwards, so the ordering stays consistent with history
        slot.entry.last_access = slot.entry.last_access.max(now);
        self.order.insert(slot.order_key(), *fp);
        true
    }

    /// Least recently used entry
    pub fn lru(&self) -> Option<&CacheEntry> {
        let (_, fp) = self.order.iter().next()?;
        self.get(fp)
    }

    pub fn expired(&self, now: Instant, ttl: Duration) -> Vec<CacheEntry> {
        self.slots
            .values()
            .filter(|slot| slot.entry.is_expired(now, ttl))
            .map(|slot| slot.entry.clone())
            .collect()
    }
}
