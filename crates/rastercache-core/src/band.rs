//! Raster band I/O facade
//!
//! A [`RasterBand`] pairs a [`BandBlockCache`] with the dataset lock it
//! shares with its sibling bands, and adds whole-block and windowed I/O on
//! top of it.

use crate::band_cache::{BandBlockCache, BlockGeometry};
use crate::block::Block;
use crate::codec::BlockCodec;
use crate::lock::{DatasetLock, LockMode};
use crate::pool::GlobalBlockPool;
use crate::rasterio::{self, BufferSpacing, IoBuffer, IoPath, IoStatus, RasterIoOptions};
use parking_lot::{RwLock, RwLockReadGuard};
use rastercache_common::{Access, BandId, BlockAddr, DataType, Error, Result, RwFlag, Window};
use std::sync::Arc;

/// A locked block; the lock is released on drop
pub struct BlockRef<'a> {
    cache: &'a BandBlockCache,
    block: Arc<Block>,
}

impl<'a> BlockRef<'a> {
    pub(crate) fn new(cache: &'a BandBlockCache, block: Arc<Block>) -> Self {
        Self { cache, block }
    }

    pub fn addr(&self) -> BlockAddr {
        self.block.addr()
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Shared access to the block buffer
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.block.data()
    }

    /// Modify the block buffer and mark the block dirty
    pub fn modify<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let result = {
            let mut data = self.block.data_mut();
            f(&mut data)
        };
        self.cache.mark_dirty(&self.block);
        result
    }

    pub fn is_dirty(&self) -> bool {
        self.block.is_dirty()
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        self.cache.unreference_block(&self.block);
    }
}

impl std::fmt::Debug for BlockRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockRef").field(&self.block).finish()
    }
}

/// One band of a dataset
pub struct RasterBand {
    /// 1-based position in the dataset
    index: usize,
    cache: Arc<BandBlockCache>,
    lock: Arc<DatasetLock>,
    access: Access,
    description: RwLock<String>,
    overviews: RwLock<Vec<Arc<RasterBand>>>,
}

impl RasterBand {
    /// Create a band; `lock` is shared with the other bands of the dataset
    pub fn new(
        index: usize,
        geometry: BlockGeometry,
        codec: Arc<dyn BlockCodec>,
        pool: Arc<GlobalBlockPool>,
        lock: Arc<DatasetLock>,
        access: Access,
    ) -> Self {
        Self {
            index,
            cache: BandBlockCache::new(geometry, codec, pool),
            lock,
            access,
            description: RwLock::new(String::new()),
            overviews: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> BandId {
        self.cache.id()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> &BlockGeometry {
        self.cache.geometry()
    }

    pub fn x_size(&self) -> usize {
        self.geometry().raster_width
    }

    pub fn y_size(&self) -> usize {
        self.geometry().raster_height
    }

    /// Block width and height
    pub fn block_size(&self) -> (usize, usize) {
        (self.geometry().block_width, self.geometry().block_height)
    }

    pub fn data_type(&self) -> DataType {
        self.geometry().data_type
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn description(&self) -> String {
        self.description.read().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.description.write() = description.into();
    }

    pub(crate) fn cache(&self) -> &BandBlockCache {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<GlobalBlockPool> {
        self.cache.pool()
    }

    pub fn dataset_lock(&self) -> &Arc<DatasetLock> {
        &self.lock
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        match self.access {
            Access::Update => Ok(()),
            Access::ReadOnly => Err(Error::invalid_argument(format!(
                "band {} is read-only",
                self.index
            ))),
        }
    }

    fn check_block_buffer(&self, len: usize) -> Result<()> {
        let expected = self.geometry().block_bytes();
        if len != expected {
            return Err(Error::invalid_argument(format!(
                "block buffer is {len} bytes, expected {expected}"
            )));
        }
        Ok(())
    }

    /// Copy block `(col, row)` into `buf`, decoding it on a miss
    pub fn read_block(&self, col: usize, row: usize, buf: &mut [u8]) -> Result<()> {
        self.check_block_buffer(buf.len())?;
        let _guard = self.lock.enter_read_write(LockMode::Read)?;
        let block = self.get_locked_block_ref(col, row, false)?;
        buf.copy_from_slice(&block.data());
        Ok(())
    }

    /// Stage `buf` as the new contents of block `(col, row)`
    ///
    /// Nothing reaches storage until the block is flushed or evicted.
    pub fn write_block(&self, col: usize, row: usize, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.check_block_buffer(buf.len())?;
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        let block = self.get_locked_block_ref(col, row, true)?;
        block.modify(|data| data.copy_from_slice(buf));
        Ok(())
    }

    /// Return the cached block, locked, without decoding
    pub fn try_get_locked_block_ref(&self, col: usize, row: usize) -> Option<BlockRef<'_>> {
        self.cache
            .try_get_locked_block_ref(BlockAddr::new(col, row))
            .map(|b| BlockRef::new(&self.cache, b))
    }

    /// Return the block, locked, decoding it unless `just_initialize`
    pub fn get_locked_block_ref(
        &self,
        col: usize,
        row: usize,
        just_initialize: bool,
    ) -> Result<BlockRef<'_>> {
        let block = self
            .cache
            .get_locked_block_ref(BlockAddr::new(col, row), just_initialize)?;
        Ok(BlockRef::new(&self.cache, block))
    }

    /// Remove one block from the cache, writing it back first if asked
    pub fn flush_block(&self, col: usize, row: usize, write_dirty: bool) -> Result<()> {
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        self.cache.flush_block(BlockAddr::new(col, row), write_dirty)
    }

    /// Write back every dirty block in (row, col) order
    ///
    /// With `at_closing` the band's blocks are also released from the pool.
    pub fn flush_cache(&self, at_closing: bool) -> Result<()> {
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        self.cache.flush_cache(at_closing)
    }

    /// Set every pixel of the band to `value`
    pub fn fill(&self, value: f64) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        let data_type = self.data_type();
        let mut pixel = vec![0u8; data_type.size_bytes()];
        data_type.write_sample(value, &mut pixel);

        let geometry = *self.geometry();
        for row in 0..geometry.blocks_per_col() {
            for col in 0..geometry.blocks_per_row() {
                let block = self.get_locked_block_ref(col, row, true)?;
                block.modify(|data| {
                    for chunk in data.chunks_exact_mut(pixel.len()) {
                        chunk.copy_from_slice(&pixel);
                    }
                });
            }
        }
        Ok(())
    }

    pub fn has_dirty_blocks(&self) -> bool {
        self.cache.has_dirty_blocks()
    }

    pub fn dirty_block_count(&self) -> usize {
        self.cache.dirty_block_count()
    }

    pub fn has_flush_error(&self) -> bool {
        self.cache.has_flush_error()
    }

    pub fn clear_flush_error(&self) {
        self.cache.clear_flush_error();
    }

    /// Attach a lower-resolution version of this band
    ///
    /// Overviews are kept ordered from finest to coarsest.
    pub fn add_overview(&self, overview: Arc<RasterBand>) -> Result<()> {
        if overview.data_type() != self.data_type() {
            return Err(Error::invalid_argument(format!(
                "overview type {} differs from band type {}",
                overview.data_type(),
                self.data_type()
            )));
        }
        if overview.x_size() > self.x_size() || overview.y_size() > self.y_size() {
            return Err(Error::invalid_argument(format!(
                "overview {}x{} is larger than band {}x{}",
                overview.x_size(),
                overview.y_size(),
                self.x_size(),
                self.y_size()
            )));
        }
        let mut overviews = self.overviews.write();
        let pos = overviews.partition_point(|o| o.x_size() >= overview.x_size());
        overviews.insert(pos, overview);
        Ok(())
    }

    pub fn overview_count(&self) -> usize {
        self.overviews.read().len()
    }

    pub fn overview(&self, i: usize) -> Option<Arc<RasterBand>> {
        self.overviews.read().get(i).cloned()
    }

    /// Read or write a window through the dispatcher
    ///
    /// The buffer holds `buf_x * buf_y` packed pixels of the band's data
    /// type. Returns [`IoStatus::Cancelled`] if the progress callback asked
    /// to stop.
    pub fn raster_io(
        &self,
        window: Window,
        mut buf: IoBuffer<'_>,
        buf_x: usize,
        buf_y: usize,
        options: &RasterIoOptions<'_>,
    ) -> Result<IoStatus> {
        let spacing = BufferSpacing::packed(buf_x, self.data_type().size_bytes());
        rasterio::band_io(self, &mut buf, window, buf_x, buf_y, spacing, options, None)
    }

    /// Report which dispatcher path a request would take
    pub fn plan_raster_io(&self, flag: RwFlag, window: Window, buf_x: usize, buf_y: usize) -> IoPath {
        rasterio::plan(self, flag, window, buf_x, buf_y)
    }

    /// Close the band's cache, dropping dirty blocks when `discard`
    pub(crate) fn close(&self, discard: bool) -> Result<()> {
        let result = self.cache.close(discard);
        for overview in self.overviews.read().iter() {
            if let Err(e) = overview.close(discard) {
                tracing::warn!(band = self.index, error = %e, "overview close failed");
            }
        }
        result
    }
}

impl std::fmt::Debug for RasterBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterBand")
            .field("index", &self.index)
            .field("cache", &self.cache)
            .field("overviews", &self.overview_count())
            .finish_non_exhaustive()
    }
}
