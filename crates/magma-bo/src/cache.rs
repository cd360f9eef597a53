//! # BO Cache
//!
//! Idle buffer objects kept around for reuse instead of being handed back to
//! the kernel.
//!
//! ## Layout
//!
//! ```text
//!   buckets: (size class, flags) ──► head ─► slot ─► slot ─► tail
//!                                             │        │
//!   lru:                       head ─► slot ─► slot ─► slot ─► tail
//!                              (oldest)                   (newest)
//! ```
//!
//! Every cached BO occupies one slot of a stable arena. A slot is linked into
//! its bucket list and into the global LRU list through slot indices, never
//! through references, so unlinking a slot can never leave a dangling pointer
//! to memory the provider already released.
//!
//! All state sits behind one lock. Operations under it are bounded list
//! manipulations; evicted BOs are returned to the caller, which destroys them
//! after the lock is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use magma_core::{BoFlags, ByteSize};
use spin::Mutex;

use crate::bo::{BufferObject, NO_SLOT};
use crate::config::BoCacheConfig;

/// End-of-list marker
const NIL: u32 = NO_SLOT;

// =============================================================================
// INTRUSIVE LINKS
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

impl Link {
    const DETACHED: Self = Self {
        prev: NIL,
        next: NIL,
    };
}

#[derive(Debug, Clone, Copy)]
struct ListHead {
    head: u32,
    tail: u32,
}

impl ListHead {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
    };

    fn is_empty(&self) -> bool {
        self.head == NIL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BucketKey {
    class: u32,
    flags: BoFlags,
}

#[derive(Debug)]
struct Slot {
    bo: Option<Arc<BufferObject>>,
    key: BucketKey,
    bucket: Link,
    lru: Link,
}

fn bucket_link(slot: &mut Slot) -> &mut Link {
    &mut slot.bucket
}

fn lru_link(slot: &mut Slot) -> &mut Link {
    &mut slot.lru
}

fn push_back(slots: &mut [Slot], list: &mut ListHead, idx: u32, sel: fn(&mut Slot) -> &mut Link) {
    let tail = list.tail;
    *sel(&mut slots[idx as usize]) = Link {
        prev: tail,
        next: NIL,
    };
    if tail == NIL {
        list.head = idx;
    } else {
        sel(&mut slots[tail as usize]).next = idx;
    }
    list.tail = idx;
}

fn unlink(slots: &mut [Slot], list: &mut ListHead, idx: u32, sel: fn(&mut Slot) -> &mut Link) {
    let Link { prev, next } = *sel(&mut slots[idx as usize]);
    if prev == NIL {
        list.head = next;
    } else {
        sel(&mut slots[prev as usize]).next = next;
    }
    if next == NIL {
        list.tail = prev;
    } else {
        sel(&mut slots[next as usize]).prev = prev;
    }
    *sel(&mut slots[idx as usize]) = Link::DETACHED;
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Allocations served from the cache
    pub hits: u64,
    /// Allocations that had to go to the provider
    pub misses: u64,
    /// BOs parked in the cache
    pub insertions: u64,
    /// BOs released from the cache to the provider
    pub evictions: u64,
    /// Bytes currently cached
    pub cached_bytes: u64,
    /// BOs currently cached
    pub cached_count: u64,
}

// =============================================================================
// CACHE STATE
// =============================================================================

#[derive(Debug)]
struct CacheState {
    slots: Vec<Slot>,
    /// Free slot indices (stack for O(1) reuse)
    free_slots: Vec<u32>,
    buckets: HashMap<BucketKey, ListHead>,
    lru: ListHead,
    cached_bytes: u64,
    stats: CacheStats,
}

impl CacheState {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: HashMap::new(),
            lru: ListHead::EMPTY,
            cached_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    fn insert(&mut self, key: BucketKey, bo: Arc<BufferObject>) -> u32 {
        let size = bo.size().as_bytes();
        let slot = Slot {
            bo: Some(bo),
            key,
            bucket: Link::DETACHED,
            lru: Link::DETACHED,
        };

        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };

        let bucket = self.buckets.entry(key).or_insert(ListHead::EMPTY);
        push_back(&mut self.slots, bucket, idx, bucket_link);
        push_back(&mut self.slots, &mut self.lru, idx, lru_link);

        self.cached_bytes += size;
        self.stats.insertions += 1;
        idx
    }

    /// Unlink a slot from both lists and hand its BO back
    fn remove(&mut self, idx: u32) -> Option<Arc<BufferObject>> {
        let key = self.slots.get(idx as usize)?.key;
        let bo = self.slots[idx as usize].bo.take()?;

        if let Some(bucket) = self.buckets.get_mut(&key) {
            unlink(&mut self.slots, bucket, idx, bucket_link);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
        unlink(&mut self.slots, &mut self.lru, idx, lru_link);

        self.free_slots.push(idx);
        self.cached_bytes -= bo.size().as_bytes();
        bo.set_cache_slot(NO_SLOT);
        Some(bo)
    }

    /// Smallest idle BO of the bucket that fits
    fn best_fit(&self, key: BucketKey, size: u64) -> Option<u32> {
        let bucket = self.buckets.get(&key)?;
        let mut best: Option<(u32, u64)> = None;

        let mut idx = bucket.head;
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if let Some(bo) = slot.bo.as_ref() {
                let candidate = bo.size().as_bytes();
                let fits = candidate >= size && bo.flags().cache_key() == key.flags;
                if fits && best.map_or(true, |(_, s)| candidate < s) {
                    best = Some((idx, candidate));
                }
            }
            idx = slot.bucket.next;
        }

        best.map(|(idx, _)| idx)
    }

    fn evict_lru(&mut self) -> Option<Arc<BufferObject>> {
        let head = self.lru.head;
        if head == NIL {
            return None;
        }
        let bo = self.remove(head)?;
        self.stats.evictions += 1;
        Some(bo)
    }

    /// Idle time of the least recently used entry
    fn lru_head_age(&self, now_ns: u64) -> Option<u64> {
        let head = self.lru.head;
        if head == NIL {
            return None;
        }
        let bo = self.slots[head as usize].bo.as_ref()?;
        Some(now_ns.saturating_sub(bo.last_used()))
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            cached_bytes: self.cached_bytes,
            cached_count: (self.slots.len() - self.free_slots.len()) as u64,
            ..self.stats
        }
    }
}

// =============================================================================
// BO CACHE
// =============================================================================

/// Bucketed cache of idle buffer objects with global LRU eviction
#[derive(Debug)]
pub struct BoCache {
    config: BoCacheConfig,
    state: Mutex<CacheState>,
}

impl BoCache {
    /// Create an empty cache
    pub fn new(config: BoCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::new()),
        }
    }

    fn key(&self, size: u64, flags: BoFlags) -> BucketKey {
        BucketKey {
            class: self.config.size_class(size),
            flags: flags.cache_key(),
        }
    }

    /// Take the smallest idle BO with `size` or more bytes and the same
    /// allocation flags
    ///
    /// The BO comes back unlinked but otherwise untouched; resetting its
    /// counters is up to the caller.
    pub fn fetch(&self, size: ByteSize, flags: BoFlags) -> Option<Arc<BufferObject>> {
        let mut state = self.state.lock();

        if flags.contains(BoFlags::SHARED) {
            state.stats.misses += 1;
            return None;
        }

        let key = self.key(size.as_bytes(), flags);
        let found = state
            .best_fit(key, size.as_bytes())
            .and_then(|idx| state.remove(idx));

        match found {
            Some(bo) => {
                state.stats.hits += 1;
                Some(bo)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Park an idle BO
    ///
    /// `bo.last_used()` must already be stamped with `now_ns`. Returns the
    /// entries that aged out or no longer fit the byte budget; the caller
    /// destroys them.
    pub fn insert(&self, bo: Arc<BufferObject>, now_ns: u64) -> Vec<Arc<BufferObject>> {
        let key = self.key(bo.size().as_bytes(), bo.flags());
        let mut evicted = Vec::new();
        let mut state = self.state.lock();

        let idx = state.insert(key, Arc::clone(&bo));
        bo.set_cache_slot(idx);

        if let Some(stale_after) = self.config.stale_after_ns {
            while let Some(oldest) = state.lru_head_age(now_ns) {
                if oldest <= stale_after {
                    break;
                }
                match state.evict_lru() {
                    Some(stale) => evicted.push(stale),
                    None => break,
                }
            }
        }

        if let Some(budget) = self.config.max_cached_bytes {
            while state.cached_bytes > budget {
                match state.evict_lru() {
                    Some(bo) => evicted.push(bo),
                    None => break,
                }
            }
        }

        evicted
    }

    /// Unlink a specific BO; returns whether it was cached
    pub fn remove(&self, bo: &BufferObject) -> bool {
        let mut state = self.state.lock();
        let idx = bo.cache_slot();
        if idx == NO_SLOT {
            return false;
        }

        let owned = state
            .slots
            .get(idx as usize)
            .and_then(|slot| slot.bo.as_ref())
            .is_some_and(|cached| core::ptr::eq(Arc::as_ptr(cached), bo));
        owned && state.remove(idx).is_some()
    }

    /// Empty the cache, oldest first
    pub fn drain(&self) -> Vec<Arc<BufferObject>> {
        self.trim(0)
    }

    /// Evict least recently used entries until at most `max_bytes` remain
    pub fn trim(&self, max_bytes: u64) -> Vec<Arc<BufferObject>> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        while state.cached_bytes > max_bytes {
            match state.evict_lru() {
                Some(bo) => evicted.push(bo),
                None => break,
            }
        }
        evicted
    }

    /// Bytes currently cached
    pub fn cached_bytes(&self) -> u64 {
        self.state.lock().cached_bytes
    }

    /// Number of cached BOs
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.slots.len() - state.free_slots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        self.state.lock().snapshot()
    }
}
