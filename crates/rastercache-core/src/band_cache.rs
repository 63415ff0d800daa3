//! Per-band block cache
//!
//! [`BandBlockCache`] owns the map from block address to cached block for one
//! band and implements the locking protocol on top of it:
//!
//! - a block handed out by [`BandBlockCache::get_locked_block_ref`] carries a
//!   lock and cannot be evicted until [`BandBlockCache::unreference_block`]
//! - misses decode outside every cache lock; when two threads race on the
//!   same address the first insert wins and the loser's decode is dropped
//! - dirty blocks are written back before they leave the cache, and a block
//!   whose write-back fails stays cached and dirty

use crate::block::{Block, BlockOwner, EvictOutcome};
use crate::codec::BlockCodec;
use crate::pool::GlobalBlockPool;
use crate::store::{BlockStore, new_block_store};
use parking_lot::Mutex;
use rastercache_common::{BandId, BlockAddr, BlockKey, DataType, Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Raster and block dimensions of one band
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockGeometry {
    pub raster_width: usize,
    pub raster_height: usize,
    pub block_width: usize,
    pub block_height: usize,
    pub data_type: DataType,
}

impl BlockGeometry {
    /// Validate dimensions and build a geometry
    pub fn new(
        raster_width: usize,
        raster_height: usize,
        block_width: usize,
        block_height: usize,
        data_type: DataType,
    ) -> Result<Self> {
        if raster_width == 0 || raster_height == 0 {
            return Err(Error::configuration(format!(
                "invalid raster size {raster_width}x{raster_height}"
            )));
        }
        if block_width == 0 || block_height == 0 {
            return Err(Error::configuration(format!(
                "invalid block size {block_width}x{block_height}"
            )));
        }
        block_width
            .checked_mul(block_height)
            .and_then(|n| n.checked_mul(data_type.size_bytes()))
            .ok_or_else(|| {
                Error::overflow(format!(
                    "block of {block_width}x{block_height} {data_type} does not fit in memory"
                ))
            })?;
        Ok(Self {
            raster_width,
            raster_height,
            block_width,
            block_height,
            data_type,
        })
    }

    pub fn blocks_per_row(&self) -> usize {
        self.raster_width.div_ceil(self.block_width)
    }

    pub fn blocks_per_col(&self) -> usize {
        self.raster_height.div_ceil(self.block_height)
    }

    pub fn element_size(&self) -> usize {
        self.data_type.size_bytes()
    }

    /// Bytes in one block buffer
    pub fn block_bytes(&self) -> usize {
        self.block_width * self.block_height * self.element_size()
    }

    pub fn contains(&self, addr: BlockAddr) -> bool {
        addr.col < self.blocks_per_row() && addr.row < self.blocks_per_col()
    }

    /// Width and height of the part of a block that lies inside the raster
    pub fn valid_extent(&self, addr: BlockAddr) -> (usize, usize) {
        let x0 = addr.col * self.block_width;
        let y0 = addr.row * self.block_height;
        (
            self.block_width.min(self.raster_width.saturating_sub(x0)),
            self.block_height.min(self.raster_height.saturating_sub(y0)),
        )
    }
}

/// Decodes in flight for one address
#[derive(Default)]
struct PendingDecode {
    decoders: usize,
    /// Bumped whenever the address leaves the cache
    removals: u64,
}

/// Cached blocks of one band
pub struct BandBlockCache {
    id: BandId,
    geometry: BlockGeometry,
    store: Mutex<Box<dyn BlockStore>>,
    codec: Arc<dyn BlockCodec>,
    pool: Arc<GlobalBlockPool>,
    self_ref: Weak<BandBlockCache>,
    /// Addresses being decoded; only locked while `store` is held
    pending: Mutex<HashMap<BlockAddr, PendingDecode>>,
    dirty_blocks: AtomicUsize,
    flush_error: Mutex<Option<(BlockAddr, String)>>,
    discard: AtomicBool,
    closed: AtomicBool,
}

impl BandBlockCache {
    /// Create the cache for a band, choosing its block store from the pool
    /// configuration
    pub fn new(
        geometry: BlockGeometry,
        codec: Arc<dyn BlockCodec>,
        pool: Arc<GlobalBlockPool>,
    ) -> Arc<Self> {
        let id = BandId::next();
        let store = new_block_store(
            geometry.blocks_per_row(),
            geometry.blocks_per_col(),
            pool.config(),
        );
        debug!(
            band = %id,
            store = store.name(),
            blocks_per_row = geometry.blocks_per_row(),
            blocks_per_col = geometry.blocks_per_col(),
            "created band block cache"
        );
        Arc::new_cyclic(|weak| Self {
            id,
            geometry,
            store: Mutex::new(store),
            codec,
            pool,
            self_ref: weak.clone(),
            pending: Mutex::new(HashMap::new()),
            dirty_blocks: AtomicUsize::new(0),
            flush_error: Mutex::new(None),
            discard: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> BandId {
        self.id
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    pub fn pool(&self) -> &Arc<GlobalBlockPool> {
        &self.pool
    }

    /// Number of blocks currently cached for this band
    pub fn cached_block_count(&self) -> usize {
        self.store.lock().len()
    }

    pub fn dirty_block_count(&self) -> usize {
        self.dirty_blocks.load(Ordering::Acquire)
    }

    pub fn has_dirty_blocks(&self) -> bool {
        self.dirty_block_count() > 0
    }

    /// Check if a write-back failed since the last flush reported it
    pub fn has_flush_error(&self) -> bool {
        self.flush_error.lock().is_some()
    }

    /// Forget a pending write-back failure without reporting it
    pub fn clear_flush_error(&self) {
        self.flush_error.lock().take();
    }

    /// Drop dirty data instead of writing it back from now on
    pub fn set_discard(&self, discard: bool) {
        self.discard.store(discard, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn owner_ref(&self) -> Weak<dyn BlockOwner> {
        self.self_ref.clone()
    }

    fn check(&self, addr: BlockAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.geometry.contains(addr) {
            return Err(Error::invalid_argument(format!(
                "block {addr} outside {}x{} block grid of {}",
                self.geometry.blocks_per_row(),
                self.geometry.blocks_per_col(),
                self.id
            )));
        }
        Ok(())
    }

    fn new_block(&self, addr: BlockAddr) -> Arc<Block> {
        Arc::new(Block::new_locked(
            BlockKey {
                band: self.id,
                addr,
            },
            self.geometry.block_width,
            self.geometry.block_height,
            self.geometry.data_type,
            self.owner_ref(),
        ))
    }

    /// Lock and return `block` if the store maps `addr` to it
    fn lock_cached(&self, store: &dyn BlockStore, addr: BlockAddr) -> Option<Arc<Block>> {
        let block = store.get(addr)?;
        block.add_lock();
        Some(Arc::clone(block))
    }

    /// Register a zero-filled block at `addr` and return it locked
    ///
    /// If the address is already cached the existing block is locked and
    /// returned instead.
    pub fn create_block(&self, addr: BlockAddr) -> Result<Arc<Block>> {
        self.check(addr)?;
        self.pool.make_room(self.geometry.block_bytes())?;
        let block = self.new_block(addr);

        let mut store = self.store.lock();
        if let Some(existing) = self.lock_cached(&**store, addr) {
            drop(store);
            self.pool.touch(&existing);
            return Ok(existing);
        }
        store.insert(addr, Arc::clone(&block));
        self.pool.register(&block);
        Ok(block)
    }

    /// Return the cached block at `addr`, locked, without decoding
    pub fn try_get_locked_block_ref(&self, addr: BlockAddr) -> Option<Arc<Block>> {
        if self.is_closed() {
            return None;
        }
        let block = {
            let store = self.store.lock();
            self.lock_cached(&**store, addr)?
        };
        self.pool.touch(&block);
        self.pool.record_hit();
        Some(block)
    }

    /// Return the block at `addr`, locked, decoding it on a miss
    ///
    /// With `just_initialize` the block is created zero-filled and the decode
    /// is skipped; callers use this when they are about to overwrite the
    /// whole block.
    pub fn get_locked_block_ref(&self, addr: BlockAddr, just_initialize: bool) -> Result<Arc<Block>> {
        self.check(addr)?;
        loop {
            let ticket = {
                let store = self.store.lock();
                if let Some(block) = self.lock_cached(&**store, addr) {
                    drop(store);
                    self.pool.touch(&block);
                    self.pool.record_hit();
                    return Ok(block);
                }
                let mut pending = self.pending.lock();
                let entry = pending.entry(addr).or_default();
                entry.decoders += 1;
                entry.removals
            };

            self.pool.record_miss();
            let block = self.pool.make_room(self.geometry.block_bytes()).and_then(|()| {
                let block = self.new_block(addr);
                if !just_initialize {
                    let mut data = block.data_mut();
                    self.codec.decode(addr, &mut data).map_err(|e| match e {
                        e @ Error::Decode { .. } => e,
                        other => Error::decode(self.id, addr, other),
                    })?;
                }
                Ok(block)
            });

            let mut store = self.store.lock();
            let removed = self.finish_pending(addr, ticket);
            let block = block?;
            if let Some(existing) = self.lock_cached(&**store, addr) {
                drop(store);
                debug!(band = %self.id, %addr, "lost decode race, using cached block");
                self.pool.touch(&existing);
                return Ok(existing);
            }
            if removed && !just_initialize {
                // A write-back of this address may have landed after our decode read storage
                debug!(band = %self.id, %addr, "block removed during decode, retrying");
                continue;
            }
            store.insert(addr, Arc::clone(&block));
            self.pool.register(&block);
            return Ok(block);
        }
    }

    /// Leave the pending set; returns `true` if `addr` was removed since
    /// `ticket` was taken. Caller holds the store lock.
    fn finish_pending(&self, addr: BlockAddr, ticket: u64) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&addr) else {
            return false;
        };
        let removed = entry.removals != ticket;
        entry.decoders -= 1;
        if entry.decoders == 0 {
            pending.remove(&addr);
        }
        removed
    }

    /// Record that `addr` left the cache. Caller holds the store lock.
    fn note_removal(&self, addr: BlockAddr) {
        if let Some(entry) = self.pending.lock().get_mut(&addr) {
            entry.removals += 1;
        }
    }

    /// Release one lock taken by a `*_locked_block_ref` call
    pub fn unreference_block(&self, block: &Block) {
        block.drop_lock();
    }

    /// Record that a locked block's buffer was modified
    ///
    /// Must be called after the buffer write guard is released.
    pub fn mark_dirty(&self, block: &Block) {
        if block.mark_dirty() {
            self.dirty_blocks.fetch_add(1, Ordering::AcqRel);
            self.pool.add_dirty(block.size_bytes());
        }
    }

    fn clear_dirty(&self, block: &Block) {
        if block.mark_clean() {
            self.dirty_blocks.fetch_sub(1, Ordering::AcqRel);
            self.pool.sub_dirty(block.size_bytes());
        }
    }

    /// Encode a dirty block; returns `true` when an encode happened
    fn write_block_back(&self, block: &Block) -> Result<bool> {
        let data = block.data();
        if !block.is_dirty() {
            return Ok(false);
        }
        if self.discard.load(Ordering::Acquire) {
            self.clear_dirty(block);
            return Ok(false);
        }
        match self.codec.encode(block.addr(), &data) {
            Ok(()) => {
                // Still under the buffer read lock, so no write slipped in
                self.clear_dirty(block);
                self.pool.record_writeback();
                Ok(true)
            }
            Err(e) => {
                let message = e.to_string();
                self.flush_error
                    .lock()
                    .get_or_insert_with(|| (block.addr(), message.clone()));
                Err(Error::write_back(self.id, block.addr(), message))
            }
        }
    }

    /// Remove one block from the cache
    ///
    /// With `write_dirty` a dirty block is written back first; if that fails
    /// the block stays cached. Without it dirty contents are dropped.
    pub fn flush_block(&self, addr: BlockAddr, write_dirty: bool) -> Result<()> {
        let mut store = self.store.lock();
        let Some(block) = store.get(addr).cloned() else {
            return Ok(());
        };
        if block.is_locked() {
            return Err(Error::LockConflict(format!(
                "{} block {addr} is locked and cannot be flushed",
                self.id
            )));
        }
        if write_dirty {
            self.write_block_back(&block)?;
        } else {
            self.clear_dirty(&block);
        }
        store.remove(addr);
        self.note_removal(addr);
        self.pool.detach(&block);
        Ok(())
    }

    /// Write back every dirty block in (row, col) order
    ///
    /// Failures do not stop the sweep. A write-back failure recorded since
    /// the last flush (for example during eviction) is reported once here.
    /// With `at_closing` every block is released afterwards, dirty or not.
    pub fn flush_cache(&self, at_closing: bool) -> Result<()> {
        let prior = self.flush_error.lock().take();

        let mut dirty: Vec<Arc<Block>> = self
            .store
            .lock()
            .blocks()
            .into_iter()
            .filter(|b| b.is_dirty())
            .collect();
        dirty.sort_by_key(|b| (b.addr().row, b.addr().col));

        let mut failed = 0usize;
        let mut first_error = None;
        for block in &dirty {
            if let Err(e) = self.write_block_back(block) {
                warn!(band = %self.id, addr = %block.addr(), error = %e, "block write-back failed");
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
        if failed > 0 {
            self.flush_error.lock().take();
        }
        if failed < dirty.len()
            && let Err(e) = self.codec.sync()
        {
            warn!(band = %self.id, error = %e, "sync after flush failed");
            first_error.get_or_insert(e);
        }

        if at_closing {
            self.release_all();
        }

        match (first_error, prior) {
            (Some(e), _) if at_closing => Err(Error::ClosingFailure {
                dirty_blocks: failed,
                message: e.to_string(),
            }),
            (Some(e), _) => Err(e),
            (None, Some((addr, message))) if at_closing => Err(Error::ClosingFailure {
                dirty_blocks: 0,
                message: format!("earlier write-back of {} block {addr} failed: {message}", self.id),
            }),
            (None, Some((addr, message))) => Err(Error::write_back(self.id, addr, message)),
            (None, None) => Ok(()),
        }
    }

    /// Drop every cached block, dirty or not
    fn release_all(&self) {
        let blocks = {
            let mut store = self.store.lock();
            let blocks = store.drain();
            for entry in self.pending.lock().values_mut() {
                entry.removals += 1;
            }
            blocks
        };
        if blocks.is_empty() {
            return;
        }
        for block in &blocks {
            self.clear_dirty(block);
            self.pool.detach(block);
        }
        debug!(band = %self.id, count = blocks.len(), "released cached blocks");
    }

    /// Stop serving blocks and release them
    ///
    /// With `discard` dirty contents are dropped; otherwise they are written
    /// back first.
    pub fn close(&self, discard: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if discard {
            self.set_discard(true);
            self.release_all();
            return Ok(());
        }
        self.flush_cache(true)
    }
}

impl BlockOwner for BandBlockCache {
    fn evict(&self, block: &Arc<Block>) -> EvictOutcome {
        let addr = block.addr();
        let mut store = self.store.lock();
        match store.get(addr) {
            Some(cached) if Arc::ptr_eq(cached, block) => {}
            _ => return EvictOutcome::Gone,
        }
        if block.is_locked() {
            return EvictOutcome::Locked;
        }
        // Write back under the store lock so nobody re-reads stale storage
        if let Err(e) = self.write_block_back(block) {
            warn!(band = %self.id, %addr, error = %e, "write-back during eviction failed");
            self.pool.touch(block);
            return EvictOutcome::WriteBackFailed;
        }
        store.remove(addr);
        self.note_removal(addr);
        self.pool.detach(block);
        EvictOutcome::Evicted
    }

    fn write_back(&self, block: &Arc<Block>) -> Result<bool> {
        self.write_block_back(block)
    }
}

impl Drop for BandBlockCache {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.flush_cache(true) {
            warn!(band = %self.id, error = %e, "flush on drop failed");
        }
    }
}

impl std::fmt::Debug for BandBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandBlockCache")
            .field("id", &self.id)
            .field("geometry", &self.geometry)
            .field("dirty_blocks", &self.dirty_block_count())
            .finish_non_exhaustive()
    }
}
