//! Read-through cache of ledger rows.
//!
//! Entries expire after a fixed TTL measured with the [`Clock`]. Every
//! ledger mutation must call [`RowCache::invalidate`] for the touched row
//! before returning. Cached rows feed read-only views only; the validity
//! checker and the accountant always read the store.
//!
//! A reader registers a [`PendingLoad`] before it reads the store and
//! hands it back to [`RowCache::put`]. An invalidation that lands between
//! the read and the put bumps the row's generation, and the stale result
//! is dropped instead of cached.

use crate::clock::Clock;
use crate::ledger::models::{KeyRecord, Module};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default bound on cached rows.
pub const DEFAULT_CAPACITY: usize = 10_000;

type RowKey = (Module, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    record: Option<KeyRecord>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    generation: u64,
    readers: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<RowKey, CacheEntry>,
    // Only rows with a store read in progress are tracked.
    loads: HashMap<RowKey, InFlight>,
}

impl Inner {
    /// Make room for one more entry: drop expired entries, then the one
    /// closest to expiry.
    fn make_room(&mut self, capacity: usize, now: DateTime<Utc>) {
        if self.entries.len() < capacity {
            return;
        }
        self.entries.retain(|_, entry| entry.expires_at > now);
        while self.entries.len() >= capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(row_key, _)| row_key.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// A store read in progress for one row.
///
/// Obtained from [`RowCache::begin_load`] before reading the store.
/// Dropping it without calling [`RowCache::put`] abandons the load.
pub struct PendingLoad<'a> {
    cache: &'a RowCache,
    row_key: RowKey,
    generation: u64,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        let mut inner = self.cache.inner();
        if let Entry::Occupied(mut slot) = inner.loads.entry(self.row_key.clone()) {
            slot.get_mut().readers -= 1;
            if slot.get().readers == 0 {
                slot.remove();
            }
        }
    }
}

/// TTL cache keyed by `(module, key)`. Caches misses too.
pub struct RowCache {
    inner: Mutex<Inner>,
    ttl: Option<chrono::Duration>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl RowCache {
    /// Create a cache holding up to [`DEFAULT_CAPACITY`] rows. A zero TTL
    /// disables caching.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY, clock)
    }

    /// Create a cache holding up to `capacity` rows. A zero TTL or a zero
    /// capacity disables caching.
    pub fn with_capacity(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let ttl = if ttl.is_zero() || capacity == 0 {
            None
        } else {
            chrono::Duration::from_std(ttl).ok()
        };
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            capacity,
            clock,
        }
    }

    /// Whether entries are kept at all.
    pub fn is_enabled(&self) -> bool {
        self.ttl.is_some()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-insert leaves at worst a stale entry that will expire.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached lookup. The outer `None` is a cache miss; `Some(None)` is a
    /// cached "no such key".
    pub fn get(&self, key: &str, module: Module) -> Option<Option<KeyRecord>> {
        self.ttl?;
        let now = self.clock.now_utc();
        let row_key = (module, key.to_string());
        let mut inner = self.inner();
        let expires_at = inner.entries.get(&row_key)?.expires_at;
        if now >= expires_at {
            inner.entries.remove(&row_key);
            return None;
        }
        inner.entries.get(&row_key).map(|entry| entry.record.clone())
    }

    /// Register a store read for one row. Call before reading the store.
    pub fn begin_load(&self, key: &str, module: Module) -> PendingLoad<'_> {
        let row_key = (module, key.to_string());
        let mut inner = self.inner();
        let slot = inner.loads.entry(row_key.clone()).or_insert(InFlight {
            generation: 0,
            readers: 0,
        });
        slot.readers += 1;
        let generation = slot.generation;
        drop(inner);
        PendingLoad {
            cache: self,
            row_key,
            generation,
        }
    }

    /// Store the result of a load, unless the row was invalidated after
    /// the load began. Returns whether the result was cached.
    pub fn put(&self, load: PendingLoad<'_>, record: Option<KeyRecord>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let now = self.clock.now_utc();
        let mut inner = self.inner();
        let current = inner.loads.get(&load.row_key).map(|slot| slot.generation);
        if current != Some(load.generation) {
            drop(inner);
            return false;
        }
        if !inner.entries.contains_key(&load.row_key) {
            inner.make_room(self.capacity, now);
        }
        inner.entries.insert(
            load.row_key.clone(),
            CacheEntry {
                record,
                expires_at: now + ttl,
            },
        );
        // Release before `load` drops and takes the lock again.
        drop(inner);
        true
    }

    /// Drop the entry for one row and discard loads of it in progress.
    pub fn invalidate(&self, key: &str, module: Module) {
        let row_key = (module, key.to_string());
        let mut inner = self.inner();
        inner.entries.remove(&row_key);
        if let Some(slot) = inner.loads.get_mut(&row_key) {
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner();
        inner.entries.clear();
        for slot in inner.loads.values_mut() {
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// Number of entries held, expired ones included.
    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    /// Whether no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
