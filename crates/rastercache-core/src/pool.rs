//! Process-wide block pool
//!
//! Every cached block of every open band is accounted here against a single
//! byte budget. The pool keeps an intrusive LRU list over an arena of slots;
//! blocks store their slot handle so touching a block is O(1).
//!
//! Lock order: a band's block store lock may be held while calling into the
//! pool, never the reverse. The pool drops its own lock before asking an
//! owner to evict or write back a block.

use crate::band_cache::BandBlockCache;
use crate::block::{Block, DETACHED, EvictOutcome};
use parking_lot::Mutex;
use rastercache_common::{BlockAddr, CacheConfig, Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static GLOBAL_POOL: Mutex<Option<Arc<GlobalBlockPool>>> = parking_lot::const_mutex(None);

/// Pool statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups satisfied from cache
    pub hits: AtomicU64,
    /// Lookups that needed a decode
    pub misses: AtomicU64,
    /// Blocks evicted to make room
    pub evictions: AtomicU64,
    /// Dirty blocks written back
    pub writebacks: AtomicU64,
    /// Allocations that went over budget because nothing was evictable
    pub overruns: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.writebacks.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
    }
}

struct Slot {
    block: Option<Arc<Block>>,
    prev: Option<u32>,
    next: Option<u32>,
    generation: u32,
}

/// LRU list over an arena; `head` is most recently used
#[derive(Default)]
struct LruState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    used_bytes: u64,
    count: usize,
}

const fn pack(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

const fn unpack(handle: u64) -> (u32, u32) {
    (handle as u32, (handle >> 32) as u32)
}

impl LruState {
    /// Resolve a handle to a live slot index
    fn resolve(&self, handle: u64) -> Option<u32> {
        if handle == DETACHED {
            return None;
        }
        let (index, generation) = unpack(handle);
        let slot = self.slots.get(index as usize)?;
        (slot.generation == generation && slot.block.is_some()).then_some(index)
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[index as usize];
        slot.prev = None;
        slot.next = None;
    }

    fn push_front(&mut self, index: u32) {
        let old_head = self.head;
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h as usize].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn insert(&mut self, block: &Arc<Block>) -> u64 {
        let index = if let Some(index) = self.free.pop() {
            self.slots[index as usize].block = Some(Arc::clone(block));
            index
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Slot {
                block: Some(Arc::clone(block)),
                prev: None,
                next: None,
                generation: 0,
            });
            index
        };
        self.push_front(index);
        self.used_bytes += block.size_bytes() as u64;
        self.count += 1;
        pack(index, self.slots[index as usize].generation)
    }

    fn remove(&mut self, index: u32) -> Option<Arc<Block>> {
        self.unlink(index);
        let slot = &mut self.slots[index as usize];
        let block = slot.block.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.used_bytes = self.used_bytes.saturating_sub(block.size_bytes() as u64);
        self.count -= 1;
        block.set_slot(DETACHED);
        Some(block)
    }

    /// Walk from the LRU end collecting unlocked blocks worth `needed` bytes
    fn victims(&self, needed: u64, skip: &HashSet<u64>) -> Vec<Arc<Block>> {
        let mut picked = Vec::new();
        let mut freed = 0u64;
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            cursor = slot.prev;
            let Some(block) = slot.block.as_ref() else {
                continue;
            };
            if block.is_locked() || skip.contains(&pack(index, slot.generation)) {
                continue;
            }
            freed += block.size_bytes() as u64;
            picked.push(Arc::clone(block));
            if freed >= needed {
                break;
            }
        }
        picked
    }
}

/// Process-wide LRU accounting for cached blocks
pub struct GlobalBlockPool {
    state: Mutex<LruState>,
    max_bytes: AtomicU64,
    dirty_bytes: AtomicU64,
    config: CacheConfig,
    stats: CacheStats,
}

impl GlobalBlockPool {
    /// Get the process-wide pool, creating it from the environment on first
    /// use
    pub fn global() -> Result<Arc<Self>> {
        let mut slot = GLOBAL_POOL.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let config = CacheConfig::from_env()?;
        info!(
            max_bytes = config.max_bytes,
            hard_limit = config.hard_limit,
            "initializing global block pool"
        );
        let pool = Arc::new(Self::new(config));
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Flush and drop the process-wide pool
    ///
    /// Datasets still holding the old pool keep using it; the next call to
    /// [`GlobalBlockPool::global`] builds a fresh one.
    pub fn shutdown_global() -> Result<()> {
        let Some(pool) = GLOBAL_POOL.lock().take() else {
            return Ok(());
        };
        let flushed = pool.flush_dirty_all();
        let stats = pool.stats();
        info!(
            hits = stats.hits.load(Ordering::Relaxed),
            misses = stats.misses.load(Ordering::Relaxed),
            evictions = stats.evictions.load(Ordering::Relaxed),
            "global block pool shut down"
        );
        flushed.map(|_| ())
    }

    /// Create a pool with its own budget
    ///
    /// Most callers want [`GlobalBlockPool::global`]; standalone pools keep
    /// tests isolated.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            max_bytes: AtomicU64::new(config.max_bytes),
            dirty_bytes: AtomicU64::new(0),
            config,
            stats: CacheStats::default(),
        }
    }

    /// Get the configuration this pool was built from
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Current byte budget
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Change the budget, evicting down to it if needed
    pub fn set_max_bytes(&self, max_bytes: u64) {
        let old = self.max_bytes.swap(max_bytes, Ordering::AcqRel);
        info!(old, new = max_bytes, "block pool budget changed");
        if max_bytes < old {
            // Soft shrink: whatever is locked stays until it is released
            if let Err(e) = self.evict_to_fit(0, true) {
                debug!(error = %e, "budget shrink left the pool over budget");
            }
        }
    }

    /// Bytes held by cached blocks
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    /// Number of cached blocks
    pub fn block_count(&self) -> usize {
        self.state.lock().count
    }

    /// Bytes held by dirty blocks
    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes.load(Ordering::Acquire)
    }

    /// Check if dirty data has crossed the flush threshold
    pub fn needs_flush(&self) -> bool {
        let threshold = (self.max_bytes() as f64 * self.config.dirty_flush_ratio) as u64;
        self.dirty_bytes() >= threshold && self.dirty_bytes() > 0
    }

    pub(crate) fn add_dirty(&self, bytes: usize) {
        self.dirty_bytes.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    pub(crate) fn sub_dirty(&self, bytes: usize) {
        let _ = self
            .dirty_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes as u64))
            });
    }

    pub(crate) fn record_hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_writeback(&self) {
        self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a locked block of `band`, decoding it on a miss
    pub fn acquire(
        &self,
        band: &BandBlockCache,
        addr: BlockAddr,
        just_initialize: bool,
    ) -> Result<Arc<Block>> {
        if !std::ptr::eq(Arc::as_ptr(band.pool()), self) {
            return Err(Error::invalid_argument(format!(
                "{} belongs to another block pool",
                band.id()
            )));
        }
        band.get_locked_block_ref(addr, just_initialize)
    }

    /// Drop one lock taken by [`GlobalBlockPool::acquire`]
    pub fn release(&self, block: &Block) {
        block.drop_lock();
    }

    /// Put a block at the MRU end and account its bytes
    pub(crate) fn register(&self, block: &Arc<Block>) {
        let mut state = self.state.lock();
        if state.resolve(block.slot()).is_some() {
            return;
        }
        let handle = state.insert(block);
        block.set_slot(handle);
    }

    /// Move a block to the MRU end
    pub fn touch(&self, block: &Block) {
        let mut state = self.state.lock();
        if let Some(index) = state.resolve(block.slot()) {
            state.unlink(index);
            state.push_front(index);
        }
    }

    /// Forget a block; returns `true` if it was tracked
    pub(crate) fn detach(&self, block: &Block) -> bool {
        let mut state = self.state.lock();
        match state.resolve(block.slot()) {
            Some(index) => state.remove(index).is_some(),
            None => false,
        }
    }

    /// Evict until `incoming` more bytes fit in the budget
    ///
    /// When every cached block is locked the allocation overruns the budget
    /// and is logged, unless the pool runs with a hard limit, in which case
    /// this returns [`Error::OutOfMemory`].
    pub(crate) fn make_room(&self, incoming: usize) -> Result<()> {
        self.evict_to_fit(incoming as u64, !self.config.hard_limit)
    }

    fn evict_to_fit(&self, incoming: u64, allow_overrun: bool) -> Result<()> {
        let mut failed: HashSet<u64> = HashSet::new();
        loop {
            let victims = {
                let state = self.state.lock();
                let budget = self.max_bytes();
                let wanted = state.used_bytes.saturating_add(incoming);
                if wanted <= budget {
                    return Ok(());
                }
                state.victims(wanted - budget, &failed)
            };

            if victims.is_empty() {
                return self.overrun(incoming, allow_overrun);
            }

            let mut progress = false;
            for block in victims {
                let handle = block.slot();
                // An owner dropped without releasing its blocks cannot write them
                let outcome = block
                    .owner()
                    .map_or(EvictOutcome::Evicted, |owner| owner.evict(&block));
                match outcome {
                    EvictOutcome::Evicted => {
                        self.detach(&block);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %block.key(), "evicted block");
                        progress = true;
                    }
                    EvictOutcome::Gone => {
                        self.detach(&block);
                        progress = true;
                    }
                    EvictOutcome::Locked | EvictOutcome::WriteBackFailed => {
                        failed.insert(handle);
                    }
                }
            }

            if !progress && self.state.lock().victims(1, &failed).is_empty() {
                return self.overrun(incoming, allow_overrun);
            }
        }
    }

    fn overrun(&self, incoming: u64, allow_overrun: bool) -> Result<()> {
        let budget = self.max_bytes();
        if allow_overrun {
            self.stats.overruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                requested = incoming,
                budget,
                used = self.used_bytes(),
                "no evictable block, exceeding cache budget"
            );
            Ok(())
        } else {
            Err(Error::OutOfMemory {
                requested: incoming,
                budget,
            })
        }
    }

    /// Write back every dirty block matching `filter`
    ///
    /// Blocks are written in (band, row, col) order. A failure on one block
    /// does not stop the sweep; the first error is returned at the end.
    pub fn flush_dirty<F>(&self, filter: F) -> Result<usize>
    where
        F: Fn(&Block) -> bool,
    {
        let mut dirty: Vec<Arc<Block>> = {
            let state = self.state.lock();
            state
                .slots
                .iter()
                .filter_map(|s| s.block.as_ref())
                .filter(|b| b.is_dirty() && filter(b))
                .cloned()
                .collect()
        };
        dirty.sort_by_key(|b| (b.key().band, b.addr().row, b.addr().col));

        let mut written = 0;
        let mut first_error = None;
        for block in dirty {
            let Some(owner) = block.owner() else {
                continue;
            };
            match owner.write_back(&block) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %block.key(), error = %e, "write-back failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Write back every dirty block in the pool
    pub fn flush_dirty_all(&self) -> Result<usize> {
        self.flush_dirty(|_| true)
    }
}

impl std::fmt::Debug for GlobalBlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalBlockPool")
            .field("max_bytes", &self.max_bytes())
            .field("used_bytes", &self.used_bytes())
            .field("dirty_bytes", &self.dirty_bytes())
            .finish_non_exhaustive()
    }
}
