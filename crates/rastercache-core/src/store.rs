//! Per-band block indexes
//!
//! A band finds its cached blocks through one of two stores: a dense array
//! indexed by block address for small grids, or a hash map for grids too
//! large to preallocate. Both are plain maps; locking is the caller's job.

use crate::block::Block;
use rastercache_common::{BlockAddr, BlockStoreStrategy, CacheConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Map from block address to cached block
pub trait BlockStore: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn get(&self, addr: BlockAddr) -> Option<&Arc<Block>>;

    /// Insert a block, returning the one it replaced
    fn insert(&mut self, addr: BlockAddr, block: Arc<Block>) -> Option<Arc<Block>>;

    fn remove(&mut self, addr: BlockAddr) -> Option<Arc<Block>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every cached block, in no particular order
    fn blocks(&self) -> Vec<Arc<Block>>;

    /// Remove and return every cached block
    fn drain(&mut self) -> Vec<Arc<Block>>;
}

/// Dense store with one slot per block of the grid
pub struct ArrayBlockStore {
    blocks_per_row: usize,
    slots: Vec<Option<Arc<Block>>>,
    len: usize,
}

impl ArrayBlockStore {
    pub fn new(blocks_per_row: usize, blocks_per_col: usize) -> Self {
        Self {
            blocks_per_row,
            slots: vec![None; blocks_per_row * blocks_per_col],
            len: 0,
        }
    }

    fn index(&self, addr: BlockAddr) -> Option<usize> {
        if addr.col >= self.blocks_per_row {
            return None;
        }
        addr.row
            .checked_mul(self.blocks_per_row)
            .and_then(|i| i.checked_add(addr.col))
            .filter(|i| *i < self.slots.len())
    }
}

impl BlockStore for ArrayBlockStore {
    fn name(&self) -> &'static str {
        "array"
    }

    fn get(&self, addr: BlockAddr) -> Option<&Arc<Block>> {
        self.index(addr).and_then(|i| self.slots[i].as_ref())
    }

    fn insert(&mut self, addr: BlockAddr, block: Arc<Block>) -> Option<Arc<Block>> {
        let i = self.index(addr)?;
        let old = self.slots[i].replace(block);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    fn remove(&mut self, addr: BlockAddr) -> Option<Arc<Block>> {
        let i = self.index(addr)?;
        let old = self.slots[i].take();
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    fn len(&self) -> usize {
        self.len
    }

    fn blocks(&self) -> Vec<Arc<Block>> {
        self.slots.iter().flatten().cloned().collect()
    }

    fn drain(&mut self) -> Vec<Arc<Block>> {
        self.len = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// Sparse store for very large block grids
#[derive(Default)]
pub struct HashBlockStore {
    map: HashMap<BlockAddr, Arc<Block>>,
}

impl HashBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for HashBlockStore {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn get(&self, addr: BlockAddr) -> Option<&Arc<Block>> {
        self.map.get(&addr)
    }

    fn insert(&mut self, addr: BlockAddr, block: Arc<Block>) -> Option<Arc<Block>> {
        self.map.insert(addr, block)
    }

    fn remove(&mut self, addr: BlockAddr) -> Option<Arc<Block>> {
        self.map.remove(&addr)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn blocks(&self) -> Vec<Arc<Block>> {
        self.map.values().cloned().collect()
    }

    fn drain(&mut self) -> Vec<Arc<Block>> {
        self.map.drain().map(|(_, b)| b).collect()
    }
}

/// Pick a store for a grid of `blocks_per_row` x `blocks_per_col` blocks
///
/// The array store is only used while the grid stays under the configured
/// guard; larger grids, or grids whose block count overflows, get the hash
/// store whatever the configured strategy says.
pub fn new_block_store(
    blocks_per_row: usize,
    blocks_per_col: usize,
    config: &CacheConfig,
) -> Box<dyn BlockStore> {
    let fits_array = blocks_per_row
        .checked_mul(blocks_per_col)
        .is_some_and(|n| n <= config.array_max_blocks);

    match (config.block_store, fits_array) {
        (BlockStoreStrategy::Hash, _) => Box::new(HashBlockStore::new()),
        (_, true) => Box::new(ArrayBlockStore::new(blocks_per_row, blocks_per_col)),
        (strategy, false) => {
            if strategy == BlockStoreStrategy::Array {
                debug!(
                    blocks_per_row,
                    blocks_per_col, "block grid too large for array store, using hash store"
                );
            }
            Box::new(HashBlockStore::new())
        }
    }
}
