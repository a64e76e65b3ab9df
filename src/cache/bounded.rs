//! Generic bounded cache
//!
//! A key → entry store with a cost quota and least-recently-used eviction.
//! Every entry sits behind its own read/write lock; the map itself is
//! guarded by a short-lived mutex that is never held while an entry lock is
//! waited on or while the allocate/cleanup callbacks run.
//!
//! New entries are inserted already write-locked, so the allocate callback
//! runs exactly once per key and every concurrent `get` on the same key
//! blocks until it has finished.

use lru::LruCache;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::ops::Deref;
use std::sync::Arc;

/// Fill ratio the cache is brought back to when it runs over quota.
pub const GC_FILL_RATIO: f64 = 0.8;

/// Requested lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Populate and release hooks for cache entries.
pub trait CacheCallbacks<T>: Send + Sync {
    /// Fill a freshly inserted entry and set its cost. Runs under the
    /// entry's write lock.
    fn allocate(&self, key: u64, entry: &mut CacheEntry<T>);

    /// Release an entry that left the cache. Runs under the entry's write
    /// lock after the entry was unlinked from the map.
    fn cleanup(&self, _key: u64, _entry: &mut CacheEntry<T>) {}
}

#[derive(Debug)]
pub struct CacheEntry<T> {
    key: u64,
    pub cost: u64,
    pub data: T,
    evicted: bool,
}

impl<T: Default> CacheEntry<T> {
    fn new(key: u64) -> Self {
        CacheEntry {
            key,
            cost: 0,
            data: T::default(),
            evicted: false,
        }
    }
}

impl<T> CacheEntry<T> {
    pub fn key(&self) -> u64 {
        self.key
    }
}

type Slot<T> = Arc<RwLock<CacheEntry<T>>>;
type WriteGuard<T> = ArcRwLockWriteGuard<RawRwLock, CacheEntry<T>>;
type ReadGuard<T> = ArcRwLockReadGuard<RawRwLock, CacheEntry<T>>;

/// A locked cache entry. The lock is released when the guard is dropped.
pub enum CacheGuard<T> {
    Read(ReadGuard<T>),
    Write(WriteGuard<T>),
}

impl<T> CacheGuard<T> {
    pub fn access(&self) -> Access {
        match self {
            CacheGuard::Read(_) => Access::Read,
            CacheGuard::Write(_) => Access::Write,
        }
    }

    /// Mutable access, only available for write guards.
    pub fn entry_mut(&mut self) -> Option<&mut CacheEntry<T>> {
        match self {
            CacheGuard::Read(_) => None,
            CacheGuard::Write(guard) => Some(&mut **guard),
        }
    }

    /// Turn a write lock into a read lock without letting writers in.
    pub fn downgrade(self) -> Self {
        match self {
            CacheGuard::Write(guard) => CacheGuard::Read(ArcRwLockWriteGuard::downgrade(guard)),
            read => read,
        }
    }
}

impl<T> Deref for CacheGuard<T> {
    type Target = CacheEntry<T>;

    fn deref(&self) -> &CacheEntry<T> {
        match self {
            CacheGuard::Read(guard) => guard,
            CacheGuard::Write(guard) => guard,
        }
    }
}

struct CacheMap<T> {
    entries: LruCache<u64, Slot<T>>,
    cost: u64,
    quota: u64,
}

pub struct BoundedCache<T> {
    name: &'static str,
    inner: Mutex<CacheMap<T>>,
    callbacks: Box<dyn CacheCallbacks<T>>,
}

impl<T: Default + Send + Sync + 'static> BoundedCache<T> {
    pub fn new(name: &'static str, quota: u64, callbacks: Box<dyn CacheCallbacks<T>>) -> Self {
        BoundedCache {
            name,
            inner: Mutex::new(CacheMap {
                entries: LruCache::unbounded(),
                cost: 0,
                quota,
            }),
            callbacks,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lock `key`, creating and allocating the entry on a miss.
    ///
    /// Blocks while another thread holds a conflicting lock on the entry,
    /// including while it is being generated.
    pub fn get(&self, key: u64, access: Access) -> CacheGuard<T> {
        loop {
            let mut map = self.inner.lock();
            if let Some(slot) = map.entries.get(&key).cloned() {
                drop(map);
                let guard = match access {
                    Access::Read => CacheGuard::Read(slot.read_arc()),
                    Access::Write => CacheGuard::Write(slot.write_arc()),
                };
                if guard.evicted {
                    // Unlinked while we waited for the lock.
                    continue;
                }
                return guard;
            }

            let victims = if map.cost as f64 > GC_FILL_RATIO * map.quota as f64 {
                Self::collect_victims(&mut map, GC_FILL_RATIO)
            } else {
                Vec::new()
            };
            let slot: Slot<T> = Arc::new(RwLock::new(CacheEntry::new(key)));
            let mut guard = slot.write_arc();
            map.entries.put(key, slot);
            drop(map);

            self.release_victims(victims);
            self.callbacks.allocate(key, &mut guard);
            self.inner.lock().cost += guard.cost;

            return match access {
                Access::Write => CacheGuard::Write(guard),
                Access::Read => CacheGuard::Read(ArcRwLockWriteGuard::downgrade(guard)),
            };
        }
    }

    /// Lock `key` only if it is resident and the lock is free right now.
    pub fn test_get(&self, key: u64, access: Access) -> Option<CacheGuard<T>> {
        let slot = self.inner.lock().entries.get(&key).cloned()?;
        let guard = match access {
            Access::Read => CacheGuard::Read(slot.try_read_arc()?),
            Access::Write => CacheGuard::Write(slot.try_write_arc()?),
        };
        if guard.evicted {
            return None;
        }
        Some(guard)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.inner.lock().entries.contains(&key)
    }

    /// Remove `key`, waiting for its write lock. Returns false when the key
    /// was not resident.
    pub fn remove(&self, key: u64) -> bool {
        self.remove_with(key, |_| {})
    }

    /// Like [`remove`](Self::remove) but lets the caller touch the entry
    /// (e.g. set flags) before the cleanup callback sees it.
    pub fn remove_with(&self, key: u64, mark: impl FnOnce(&mut T)) -> bool {
        let Some(slot) = self.inner.lock().entries.peek(&key).cloned() else {
            return false;
        };
        let mut guard = slot.write_arc();
        if guard.evicted {
            return false;
        }
        {
            let mut map = self.inner.lock();
            let same = map
                .entries
                .peek(&key)
                .map(|current| Arc::ptr_eq(current, &slot))
                .unwrap_or(false);
            if same {
                map.entries.pop(&key);
                map.cost = map.cost.saturating_sub(guard.cost);
            }
        }
        guard.evicted = true;
        mark(&mut guard.data);
        self.callbacks.cleanup(key, &mut guard);
        true
    }

    /// Evict unlocked entries, least recently used first, until the cost
    /// is at most `fill_ratio * quota`.
    pub fn gc(&self, fill_ratio: f64) -> usize {
        let victims = {
            let mut map = self.inner.lock();
            Self::collect_victims(&mut map, fill_ratio)
        };
        let count = victims.len();
        self.release_victims(victims);
        count
    }

    fn collect_victims(map: &mut CacheMap<T>, fill_ratio: f64) -> Vec<WriteGuard<T>> {
        let target = (map.quota as f64 * fill_ratio) as u64;
        let mut cost = map.cost;
        let mut victims = Vec::new();
        for (_, slot) in map.entries.iter().rev() {
            if cost <= target {
                break;
            }
            // Entries in use are skipped, not waited for.
            if let Some(guard) = slot.try_write_arc() {
                cost = cost.saturating_sub(guard.cost);
                victims.push(guard);
            }
        }
        for guard in victims.iter_mut() {
            map.entries.pop(&guard.key);
            guard.evicted = true;
        }
        map.cost = cost;
        victims
    }

    fn release_victims(&self, victims: Vec<WriteGuard<T>>) {
        for mut guard in victims {
            let key = guard.key;
            tracing::debug!("🧹 {}: evicting key {:#x}", self.name, key);
            self.callbacks.cleanup(key, &mut guard);
        }
    }

    /// Keys currently resident, most recently used first.
    pub fn keys(&self) -> Vec<u64> {
        self.inner.lock().entries.iter().map(|(key, _)| *key).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cost(&self) -> u64 {
        self.inner.lock().cost
    }

    pub fn quota(&self) -> u64 {
        self.inner.lock().quota
    }
}

impl<T> Drop for BoundedCache<T> {
    fn drop(&mut self) {
        let map = self.inner.get_mut();
        let slots: Vec<(u64, Slot<T>)> = map
            .entries
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect();
        map.entries.clear();
        map.cost = 0;
        for (key, slot) in slots {
            // A handle still held somewhere keeps its buffer; it is released
            // with the last Arc instead.
            let Some(mut guard) = slot.try_write() else {
                tracing::warn!("⚠️  {}: key {:#x} still locked at shutdown", self.name, key);
                continue;
            };
            if !guard.evicted {
                guard.evicted = true;
                self.callbacks.cleanup(key, &mut guard);
            }
        }
    }
}
