//! Cached raster blocks
//!
//! A [`Block`] is one decoded tile of one band. The pool owns its position in
//! the LRU list, the band's block store owns the map entry, and the block
//! itself only carries a weak reference back to its owner.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rastercache_common::{BlockAddr, BlockKey, DataType, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Sentinel for a block that has no LRU slot
pub(crate) const DETACHED: u64 = u64::MAX;

/// Result of asking an owner to give up one of its blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Block removed (and written back first if it was dirty)
    Evicted,
    /// Block gained a lock after it was picked as a victim
    Locked,
    /// Dirty block could not be written; it stays cached
    WriteBackFailed,
    /// Owner no longer knows this block
    Gone,
}

/// Band-side hooks the pool calls when it needs memory back or a flush
///
/// The pool never calls these while holding its own lock.
pub trait BlockOwner: Send + Sync {
    /// Remove an unlocked block, writing it back first when dirty
    fn evict(&self, block: &Arc<Block>) -> EvictOutcome;

    /// Write back a dirty block; returns `true` when an encode happened
    fn write_back(&self, block: &Arc<Block>) -> Result<bool>;
}

/// One decoded tile of one band
pub struct Block {
    key: BlockKey,
    width: usize,
    height: usize,
    data_type: DataType,
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    lock_count: AtomicUsize,
    owner: Weak<dyn BlockOwner>,
    /// Packed pool handle, `DETACHED` when not in the LRU list
    slot: AtomicU64,
}

impl Block {
    /// Create a zero-filled block holding one lock
    pub(crate) fn new_locked(
        key: BlockKey,
        width: usize,
        height: usize,
        data_type: DataType,
        owner: Weak<dyn BlockOwner>,
    ) -> Self {
        Self {
            key,
            width,
            height,
            data_type,
            data: RwLock::new(vec![0u8; width * height * data_type.size_bytes()]),
            dirty: AtomicBool::new(false),
            lock_count: AtomicUsize::new(1),
            owner,
            slot: AtomicU64::new(DETACHED),
        }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn addr(&self) -> BlockAddr {
        self.key.addr
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Buffer size in bytes
    pub fn size_bytes(&self) -> usize {
        self.width * self.height * self.data_type.size_bytes()
    }

    /// Shared access to the pixel buffer
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Exclusive access to the pixel buffer
    ///
    /// Callers must hold a lock on the block and mark it dirty after
    /// changing it.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Set the dirty flag; returns `true` if it was clean before
    pub(crate) fn mark_dirty(&self) -> bool {
        !self.dirty.swap(true, Ordering::AcqRel)
    }

    /// Clear the dirty flag; returns `true` if it was dirty before
    pub(crate) fn mark_clean(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// Increment the lock count, returning the new value
    pub(crate) fn add_lock(&self) -> usize {
        self.lock_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the lock count, returning the new value
    pub(crate) fn drop_lock(&self) -> usize {
        let prev = self
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        debug_assert!(prev > 0, "lock count underflow on {}", self.key);
        prev.saturating_sub(1)
    }

    /// Upgrade the weak owner reference
    pub fn owner(&self) -> Option<Arc<dyn BlockOwner>> {
        self.owner.upgrade()
    }

    pub(crate) fn slot(&self) -> u64 {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::Release);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("key", &self.key)
            .field("size", &self.size_bytes())
            .field("dirty", &self.is_dirty())
            .field("locks", &self.lock_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rastercache_common::BandId;

    /// Owner that records what the pool asked of it
    #[derive(Default)]
    pub(crate) struct RecordingOwner {
        pub evicted: Mutex<Vec<BlockKey>>,
        pub written: Mutex<Vec<BlockKey>>,
    }

    impl BlockOwner for RecordingOwner {
        fn evict(&self, block: &Arc<Block>) -> EvictOutcome {
            if block.is_locked() {
                return EvictOutcome::Locked;
            }
            self.evicted.lock().push(block.key());
            EvictOutcome::Evicted
        }

        fn write_back(&self, block: &Arc<Block>) -> Result<bool> {
            if block.mark_clean() {
                self.written.lock().push(block.key());
                return Ok(true);
            }
            Ok(false)
        }
    }

    pub(crate) fn make_block(owner: &Arc<RecordingOwner>, col: usize, size: usize) -> Arc<Block> {
        let weak: Weak<dyn BlockOwner> = Arc::downgrade(owner) as Weak<dyn BlockOwner>;
        Arc::new(Block::new_locked(
            BlockKey::new(BandId::next(), col, 0),
            size,
            1,
            DataType::Byte,
            weak,
        ))
    }

    #[test]
    fn test_new_block_is_locked_and_zeroed() {
        let owner = Arc::new(RecordingOwner::default());
        let block = make_block(&owner, 0, 16);
        assert_eq!(block.lock_count(), 1);
        assert_eq!(block.size_bytes(), 16);
        assert!(block.data().iter().all(|b| *b == 0));
        assert!(!block.is_dirty());
        assert_eq!(block.slot(), DETACHED);
    }

    #[test]
    fn test_dirty_transitions() {
        let owner = Arc::new(RecordingOwner::default());
        let block = make_block(&owner, 0, 4);
        assert!(block.mark_dirty());
        assert!(!block.mark_dirty());
        assert!(block.mark_clean());
        assert!(!block.mark_clean());
    }

    #[test]
    fn test_lock_counting() {
        let owner = Arc::new(RecordingOwner::default());
        let block = make_block(&owner, 0, 4);
        assert_eq!(block.add_lock(), 2);
        assert_eq!(block.drop_lock(), 1);
        assert_eq!(block.drop_lock(), 0);
        assert!(!block.is_locked());
    }

    #[test]
    fn test_owner_is_weak() {
        let owner = Arc::new(RecordingOwner::default());
        let block = make_block(&owner, 0, 4);
        assert!(block.owner().is_some());
        drop(owner);
        assert!(block.owner().is_none());
    }
}
