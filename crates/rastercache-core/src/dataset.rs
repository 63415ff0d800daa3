//! Multi-band raster dataset
//!
//! A [`Dataset`] groups bands that share one [`DatasetLock`] (and usually one
//! file), carries free-form metadata for outside collaborators, and owns the
//! close protocol: flush every band, report blocks that could not be written,
//! then hand the bands' blocks back to the pool.

use crate::band::RasterBand;
use crate::band_cache::BlockGeometry;
use crate::codec::BlockCodec;
use crate::lock::{DatasetLock, LockMode};
use crate::mem::MemCodec;
use crate::pool::GlobalBlockPool;
use crate::rasterio::{
    self, BufferSpacing, IoBuffer, IoPath, IoStatus, RasterIoOptions, transfer_block, window_blocks,
};
use parking_lot::RwLock;
use rastercache_common::{
    Access, BandId, DataType, Error, Interleave, ResampleAlg, Result, RwFlag, Window,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Largest block edge used for in-memory bands
const MEM_BLOCK_SIZE: usize = 256;

/// Storage of one band handed to [`Dataset::new`]
pub struct BandSpec {
    pub data_type: DataType,
    pub block_width: usize,
    pub block_height: usize,
    pub codec: Arc<dyn BlockCodec>,
}

impl std::fmt::Debug for BandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandSpec")
            .field("data_type", &self.data_type)
            .field("block_width", &self.block_width)
            .field("block_height", &self.block_height)
            .finish_non_exhaustive()
    }
}

/// Arrangement of several bands in a caller buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferLayout {
    /// All pixels of the first band, then the next band
    #[default]
    BandSequential,
    /// All bands of one pixel next to each other
    PixelInterleaved,
}

pub struct Dataset {
    description: String,
    x_size: usize,
    y_size: usize,
    bands: Vec<Arc<RasterBand>>,
    lock: Arc<DatasetLock>,
    interleave: Interleave,
    access: Access,
    metadata: RwLock<BTreeMap<String, String>>,
    suppress_on_close: AtomicBool,
    closed: AtomicBool,
    pool: Arc<GlobalBlockPool>,
}

impl Dataset {
    /// Build a dataset from per-band storage
    ///
    /// Fails with a configuration error on empty dimensions or block sizes.
    pub fn new(
        description: impl Into<String>,
        x_size: usize,
        y_size: usize,
        access: Access,
        interleave: Interleave,
        bands: Vec<BandSpec>,
        pool: Arc<GlobalBlockPool>,
    ) -> Result<Self> {
        let description = description.into();
        if bands.is_empty() {
            return Err(Error::configuration(format!("{description} has no bands")));
        }
        let lock = Arc::new(DatasetLock::new());
        let bands = bands
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let geometry = BlockGeometry::new(
                    x_size,
                    y_size,
                    spec.block_width,
                    spec.block_height,
                    spec.data_type,
                )?;
                Ok(Arc::new(RasterBand::new(
                    i + 1,
                    geometry,
                    spec.codec,
                    Arc::clone(&pool),
                    Arc::clone(&lock),
                    access,
                )))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            dataset = %description,
            x_size,
            y_size,
            bands = bands.len(),
            %interleave,
            ?access,
            "opened dataset"
        );
        Ok(Self {
            description,
            x_size,
            y_size,
            bands,
            lock,
            interleave,
            access,
            metadata: RwLock::new(BTreeMap::new()),
            suppress_on_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pool,
        })
    }

    /// In-memory dataset with zero-filled bands
    pub fn create_mem(
        description: impl Into<String>,
        x_size: usize,
        y_size: usize,
        band_count: usize,
        data_type: DataType,
        pool: Arc<GlobalBlockPool>,
    ) -> Result<Self> {
        let block_width = x_size.clamp(1, MEM_BLOCK_SIZE);
        let block_height = y_size.clamp(1, MEM_BLOCK_SIZE);
        let bands = (0..band_count)
            .map(|_| {
                let geometry = BlockGeometry::new(x_size, y_size, block_width, block_height, data_type)?;
                Ok(BandSpec {
                    data_type,
                    block_width,
                    block_height,
                    codec: Arc::new(MemCodec::new(geometry)),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            description,
            x_size,
            y_size,
            Access::Update,
            Interleave::Bsq,
            bands,
            pool,
        )
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn x_size(&self) -> usize {
        self.x_size
    }

    pub fn y_size(&self) -> usize {
        self.y_size
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Band by 1-based index
    pub fn band(&self, index: usize) -> Option<&Arc<RasterBand>> {
        index.checked_sub(1).and_then(|i| self.bands.get(i))
    }

    pub fn bands(&self) -> &[Arc<RasterBand>] {
        &self.bands
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn interleave(&self) -> Interleave {
        self.interleave
    }

    pub fn pool(&self) -> &Arc<GlobalBlockPool> {
        &self.pool
    }

    pub fn lock(&self) -> &Arc<DatasetLock> {
        &self.lock
    }

    pub fn metadata_item(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    pub fn set_metadata_item(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    /// Copy of every metadata item
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.read().clone()
    }

    /// Drop dirty blocks at close instead of writing them
    pub fn mark_suppress_on_close(&self) {
        self.suppress_on_close.store(true, Ordering::Release);
        for band in &self.bands {
            band.cache().set_discard(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Write back every band's dirty blocks
    ///
    /// Every band is flushed even if an earlier one fails; the first error
    /// is returned.
    pub fn flush_cache(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        let mut first_error = None;
        for band in &self.bands {
            if let Err(e) = band.flush_cache(false) {
                warn!(dataset = %self.description, band = band.index(), error = %e, "band flush failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Compute in-memory overviews for every band
    ///
    /// Each factor yields one level of `ceil(size / factor)` pixels; levels
    /// that already exist are kept.
    pub fn build_overviews(&self, factors: &[usize], alg: ResampleAlg) -> Result<()> {
        self.check_open()?;
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        let options = RasterIoOptions::default().with_resample_alg(alg);

        for &factor in factors {
            if factor < 2 {
                return Err(Error::invalid_argument(format!(
                    "overview factor must be at least 2, got {factor}"
                )));
            }
            let ox = self.x_size.div_ceil(factor);
            let oy = self.y_size.div_ceil(factor);
            let level_lock = Arc::new(DatasetLock::new());

            for band in &self.bands {
                let exists = (0..band.overview_count())
                    .filter_map(|i| band.overview(i))
                    .any(|o| o.x_size() == ox && o.y_size() == oy);
                if exists {
                    debug!(band = band.index(), factor, "overview level already present");
                    continue;
                }

                let (bw, bh) = band.block_size();
                let geometry = BlockGeometry::new(ox, oy, bw.min(ox), bh.min(oy), band.data_type())?;
                let overview = Arc::new(RasterBand::new(
                    band.index(),
                    geometry,
                    Arc::new(MemCodec::new(geometry)),
                    Arc::clone(&self.pool),
                    Arc::clone(&level_lock),
                    Access::Update,
                ));

                let mut pixels = vec![0u8; ox * oy * band.data_type().size_bytes()];
                band.raster_io(
                    Window::full(self.x_size, self.y_size),
                    IoBuffer::Read(&mut pixels),
                    ox,
                    oy,
                    &options,
                )?;
                overview.raster_io(
                    Window::full(ox, oy),
                    IoBuffer::Write(&pixels),
                    ox,
                    oy,
                    &RasterIoOptions::default(),
                )?;
                band.add_overview(overview)?;
            }
            info!(dataset = %self.description, factor, x_size = ox, y_size = oy, ?alg, "built overview level");
        }
        Ok(())
    }

    fn resolve_band_map(&self, band_map: &[usize]) -> Result<Vec<Arc<RasterBand>>> {
        if band_map.is_empty() {
            return Err(Error::invalid_argument("empty band map"));
        }
        band_map
            .iter()
            .map(|&i| {
                self.band(i).cloned().ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "band {i} out of range 1..={}",
                        self.bands.len()
                    ))
                })
            })
            .collect()
    }

    /// Read or write a window of several bands
    ///
    /// `band_map` lists 1-based band indices; the buffer holds
    /// `buf_x * buf_y` pixels of each, arranged per `layout`. All bands must
    /// share one data type.
    #[allow(clippy::too_many_arguments)]
    pub fn raster_io(
        &self,
        window: Window,
        mut buf: IoBuffer<'_>,
        buf_x: usize,
        buf_y: usize,
        band_map: &[usize],
        layout: BufferLayout,
        options: &RasterIoOptions<'_>,
    ) -> Result<IoStatus> {
        self.check_open()?;
        let bands = self.resolve_band_map(band_map)?;
        let data_type = bands[0].data_type();
        if bands.iter().any(|b| b.data_type() != data_type) {
            return Err(Error::invalid_argument(
                "bands in one request must share a data type",
            ));
        }
        let flag = buf.flag();
        let _guard = self.lock.enter_read_write(LockMode::from(flag))?;

        let n = bands.len();
        let elem = data_type.size_bytes();
        let spacing = |k: usize| match layout {
            BufferLayout::BandSequential => BufferSpacing {
                base: k * buf_x * buf_y * elem,
                pixel_space: elem,
                line_space: buf_x * elem,
            },
            BufferLayout::PixelInterleaved => BufferSpacing {
                base: k * elem,
                pixel_space: n * elem,
                line_space: buf_x * n * elem,
            },
        };

        let mut seen = HashSet::new();
        let irregular = !band_map.iter().all(|i| seen.insert(*i));

        let status = if !irregular && self.can_interleave_direct(&bands, flag, window, buf_x, buf_y) {
            self.interleaved_direct_io(&bands, &mut buf, window, buf_x, buf_y, &spacing)?;
            IoStatus::Completed
        } else {
            let force = irregular.then_some(IoPath::PixelByPixel);
            let mut status = IoStatus::Completed;
            for (k, band) in bands.iter().enumerate() {
                let scaled = |done: f64| {
                    options
                        .progress
                        .is_none_or(|progress| progress((k as f64 + done) / n as f64))
                };
                let band_options = RasterIoOptions {
                    resample_alg: options.resample_alg,
                    progress: Some(&scaled),
                };
                status = rasterio::band_io(
                    band,
                    &mut buf,
                    window,
                    buf_x,
                    buf_y,
                    spacing(k),
                    &band_options,
                    force,
                )?;
                if status == IoStatus::Cancelled {
                    break;
                }
            }
            status
        };

        if flag == RwFlag::Write && self.pool.needs_flush() {
            self.relieve_dirty_pressure();
        }
        Ok(status)
    }

    /// Check whether a request can copy blocks of all bands in one sweep
    fn can_interleave_direct(
        &self,
        bands: &[Arc<RasterBand>],
        flag: RwFlag,
        window: Window,
        buf_x: usize,
        buf_y: usize,
    ) -> bool {
        self.interleave == Interleave::Bip
            && bands.len() > 1
            && bands.iter().all(|b| b.geometry() == bands[0].geometry())
            && bands
                .iter()
                .all(|b| b.plan_raster_io(flag, window, buf_x, buf_y) == IoPath::Direct)
    }

    /// Visit each block once, copying every band's copy of it in turn
    fn interleaved_direct_io(
        &self,
        bands: &[Arc<RasterBand>],
        buf: &mut IoBuffer<'_>,
        window: Window,
        buf_x: usize,
        buf_y: usize,
        spacing: &dyn Fn(usize) -> BufferSpacing,
    ) -> Result<()> {
        for (k, band) in bands.iter().enumerate() {
            rasterio::validate(band, buf, window, buf_x, buf_y, spacing(k))?;
        }
        debug!(dataset = %self.description, bands = bands.len(), %window, "interleaved direct I/O");
        for addr in window_blocks(bands[0].geometry(), window) {
            for (k, band) in bands.iter().enumerate() {
                transfer_block(band, buf, addr, window, spacing(k))?;
            }
        }
        Ok(())
    }

    /// Write back this dataset's dirty blocks when the pool is under pressure
    fn relieve_dirty_pressure(&self) {
        let ids: HashSet<BandId> = self.bands.iter().map(|b| b.id()).collect();
        match self.pool.flush_dirty(|block| ids.contains(&block.key().band)) {
            Ok(written) => debug!(dataset = %self.description, written, "flushed under dirty pressure"),
            Err(e) => warn!(dataset = %self.description, error = %e, "flush under dirty pressure failed"),
        }
    }

    /// Flush and release every band
    ///
    /// Dirty blocks that cannot be written are reported as
    /// [`Error::ClosingFailure`]; the dataset is closed either way.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.lock.enter_read_write(LockMode::Write)?;
        let discard = self.suppress_on_close.load(Ordering::Acquire);

        let mut lost = 0usize;
        let mut messages = Vec::new();
        for band in &self.bands {
            match band.close(discard) {
                Ok(()) => {}
                Err(Error::ClosingFailure {
                    dirty_blocks,
                    message,
                }) => {
                    lost += dirty_blocks;
                    messages.push(format!("band {}: {message}", band.index()));
                }
                Err(e) => messages.push(format!("band {}: {e}", band.index())),
            }
        }

        if messages.is_empty() {
            info!(dataset = %self.description, discard, "closed dataset");
            return Ok(());
        }
        error!(dataset = %self.description, dirty_blocks = lost, "dataset closed with unwritten blocks");
        Err(Error::ClosingFailure {
            dirty_blocks: lost,
            message: messages.join("; "),
        })
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(dataset = %self.description, error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("description", &self.description)
            .field("x_size", &self.x_size)
            .field("y_size", &self.y_size)
            .field("bands", &self.bands.len())
            .field("interleave", &self.interleave)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::TestCodec;
    use rastercache_common::{BlockAddr, CacheConfig};
    use std::cell::RefCell;

    fn pool(max_bytes: u64) -> Arc<GlobalBlockPool> {
        Arc::new(GlobalBlockPool::new(CacheConfig::with_max_bytes(max_bytes)))
    }

    fn test_dataset(
        bands: usize,
        interleave: Interleave,
        pool: Arc<GlobalBlockPool>,
    ) -> (Dataset, Vec<Arc<TestCodec>>) {
        let codecs: Vec<Arc<TestCodec>> = (0..bands).map(|_| Arc::new(TestCodec::default())).collect();
        let specs = codecs
            .iter()
            .map(|c| BandSpec {
                data_type: DataType::Byte,
                block_width: 4,
                block_height: 4,
                codec: Arc::clone(c) as Arc<dyn BlockCodec>,
            })
            .collect();
        let ds = Dataset::new("test", 8, 8, Access::Update, interleave, specs, pool).unwrap();
        (ds, codecs)
    }

    fn io(ds: &Dataset, window: Window, buf: IoBuffer<'_>, bx: usize, by: usize, map: &[usize], layout: BufferLayout) {
        let status = ds
            .raster_io(window, buf, bx, by, map, layout, &RasterIoOptions::default())
            .unwrap();
        assert_eq!(status, IoStatus::Completed);
    }

    #[test]
    fn test_band_sequential_write_pixel_interleaved_read() {
        let ds = Dataset::create_mem("mem", 3, 2, 2, DataType::Byte, pool(1 << 20)).unwrap();
        let data = [1u8, 2, 3, 4, 5, 6, 10, 20, 30, 40, 50, 60];
        io(&ds, Window::full(3, 2), IoBuffer::Write(&data), 3, 2, &[1, 2], BufferLayout::BandSequential);

        let mut out = [0u8; 12];
        io(&ds, Window::full(3, 2), IoBuffer::Read(&mut out), 3, 2, &[1, 2], BufferLayout::PixelInterleaved);
        assert_eq!(out, [1, 10, 2, 20, 3, 30, 4, 40, 5, 50, 6, 60]);

        let mut second = [0u8; 6];
        io(&ds, Window::full(3, 2), IoBuffer::Read(&mut second), 3, 2, &[2], BufferLayout::BandSequential);
        assert_eq!(second, [10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_interleaved_dataset_visits_each_block_once_per_band() {
        let (ds, codecs) = test_dataset(3, Interleave::Bip, pool(1 << 20));
        let data: Vec<u8> = (0..192).map(|v| v as u8).collect();
        io(&ds, Window::full(8, 8), IoBuffer::Write(&data), 8, 8, &[1, 2, 3], BufferLayout::PixelInterleaved);
        ds.flush_cache().unwrap();
        for codec in &codecs {
            assert_eq!(codec.encodes(), 4);
            assert_eq!(codec.decodes(), 0);
        }

        let mut out = vec![0u8; 192];
        io(&ds, Window::full(8, 8), IoBuffer::Read(&mut out), 8, 8, &[1, 2, 3], BufferLayout::PixelInterleaved);
        assert_eq!(out, data);
    }

    #[test]
    fn test_duplicate_band_map_takes_pixel_path() {
        let (ds, _codecs) = test_dataset(2, Interleave::Bsq, pool(1 << 20));
        ds.band(2).unwrap().fill(9.0).unwrap();
        let mut out = vec![0u8; 3 * 4];
        io(&ds, Window::new(2, 2, 2, 2), IoBuffer::Read(&mut out), 2, 2, &[2, 2, 1], BufferLayout::BandSequential);
        assert_eq!(&out[..8], &[9; 8]);
        // Untouched band 1 decodes to the codec fill value: col + row of block 0,0
        assert_eq!(&out[8..], &[0; 4]);
    }

    #[test]
    fn test_bad_band_map() {
        let (ds, _codecs) = test_dataset(2, Interleave::Bsq, pool(1 << 20));
        let mut out = [0u8; 64];
        let options = RasterIoOptions::default();
        for map in [&[][..], &[0][..], &[3][..]] {
            assert!(matches!(
                ds.raster_io(Window::full(8, 8), IoBuffer::Read(&mut out), 8, 8, map, BufferLayout::BandSequential, &options),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_progress_spans_all_bands() {
        let (ds, _codecs) = test_dataset(2, Interleave::Bsq, pool(1 << 20));
        let seen = RefCell::new(Vec::new());
        let progress = |done: f64| {
            seen.borrow_mut().push(done);
            true
        };
        let options = RasterIoOptions::default().with_progress(&progress);
        let mut out = vec![0u8; 2 * 4 * 2];
        let status = ds
            .raster_io(Window::full(8, 8), IoBuffer::Read(&mut out), 4, 2, &[1, 2], BufferLayout::BandSequential, &options)
            .unwrap();
        assert_eq!(status, IoStatus::Completed);
        assert_eq!(*seen.borrow(), vec![0.25, 0.5, 0.75, 1.0]);

        let stop = |done: f64| done < 0.5;
        let options = RasterIoOptions::default().with_progress(&stop);
        let status = ds
            .raster_io(Window::full(8, 8), IoBuffer::Read(&mut out), 4, 2, &[1, 2], BufferLayout::BandSequential, &options)
            .unwrap();
        assert_eq!(status, IoStatus::Cancelled);
    }

    #[test]
    fn test_metadata() {
        let (ds, _codecs) = test_dataset(1, Interleave::Bsq, pool(1 << 20));
        assert_eq!(ds.metadata_item("wavelength_units"), None);
        ds.set_metadata_item("wavelength_units", "Nanometers");
        ds.set_metadata_item("sensor_type", "Unknown");
        assert_eq!(ds.metadata_item("wavelength_units").as_deref(), Some("Nanometers"));
        assert_eq!(ds.metadata().keys().collect::<Vec<_>>(), ["sensor_type", "wavelength_units"]);
    }

    #[test]
    fn test_close_reports_unwritten_blocks() {
        let (ds, codecs) = test_dataset(2, Interleave::Bsq, pool(1 << 20));
        codecs[1].fail_encode.lock().insert(BlockAddr::new(1, 0));
        ds.band(1).unwrap().fill(1.0).unwrap();
        ds.band(2).unwrap().fill(2.0).unwrap();

        match ds.close() {
            Err(Error::ClosingFailure { dirty_blocks, .. }) => assert_eq!(dirty_blocks, 1),
            other => panic!("expected closing failure, got {other:?}"),
        }
        assert_eq!(codecs[0].encodes(), 4);
        assert_eq!(codecs[1].encodes(), 4);
        assert_eq!(ds.pool().block_count(), 0);
        assert!(ds.close().is_ok());
        assert!(matches!(ds.flush_cache(), Err(Error::Closed)));
    }

    #[test]
    fn test_suppress_on_close_discards() {
        let (ds, codecs) = test_dataset(1, Interleave::Bsq, pool(1 << 20));
        ds.band(1).unwrap().fill(5.0).unwrap();
        ds.mark_suppress_on_close();
        ds.close().unwrap();
        assert_eq!(codecs[0].encodes(), 0);
        assert_eq!(ds.pool().dirty_bytes(), 0);
    }

    #[test]
    fn test_drop_writes_dirty_blocks() {
        let pool = pool(1 << 20);
        let (ds, codecs) = test_dataset(1, Interleave::Bsq, Arc::clone(&pool));
        ds.band(1).unwrap().write_block(0, 0, &[3u8; 16]).unwrap();
        drop(ds);
        assert_eq!(codecs[0].encodes(), 1);
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_dirty_pressure_flushes_but_keeps_blocks() {
        let config = CacheConfig {
            dirty_flush_ratio: 0.5,
            ..CacheConfig::with_max_bytes(64)
        };
        let pool = Arc::new(GlobalBlockPool::new(config));
        let (ds, codecs) = test_dataset(1, Interleave::Bsq, Arc::clone(&pool));
        let data = [7u8; 32];
        io(&ds, Window::new(0, 0, 8, 4), IoBuffer::Write(&data), 8, 4, &[1], BufferLayout::BandSequential);
        assert_eq!(codecs[0].encodes(), 2);
        assert_eq!(pool.dirty_bytes(), 0);
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_build_overviews_routes_decimated_reads() {
        let ds = Dataset::create_mem("mem", 8, 8, 1, DataType::Byte, pool(1 << 20)).unwrap();
        let data: Vec<u8> = (0..64).map(|i| if (i / 8) < 4 { 10 } else { 30 }).collect();
        io(&ds, Window::full(8, 8), IoBuffer::Write(&data), 8, 8, &[1], BufferLayout::BandSequential);

        ds.build_overviews(&[2, 4], ResampleAlg::Average).unwrap();
        ds.build_overviews(&[2], ResampleAlg::Average).unwrap();
        let band = ds.band(1).unwrap();
        assert_eq!(band.overview_count(), 2);
        assert_eq!(band.plan_raster_io(RwFlag::Read, Window::full(8, 8), 2, 2), IoPath::Overview(1));

        let mut out = [0u8; 4];
        io(&ds, Window::full(8, 8), IoBuffer::Read(&mut out), 2, 2, &[1], BufferLayout::BandSequential);
        assert_eq!(out, [10, 10, 30, 30]);

        assert!(ds.build_overviews(&[1], ResampleAlg::Nearest).is_err());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let ds = Dataset::create_mem("mem", 64, 64, 2, DataType::UInt16, pool(1 << 20)).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                for v in 1..=4u16 {
                    let data: Vec<u8> = std::iter::repeat_n(v.to_ne_bytes(), 64 * 64 * 2).flatten().collect();
                    io(&ds, Window::full(64, 64), IoBuffer::Write(&data), 64, 64, &[1, 2], BufferLayout::BandSequential);
                }
            });
            for _ in 0..3 {
                s.spawn(|| {
                    let mut out = vec![0u8; 64 * 64 * 2 * 2];
                    for _ in 0..4 {
                        io(&ds, Window::full(64, 64), IoBuffer::Read(&mut out), 64, 64, &[1, 2], BufferLayout::BandSequential);
                        // Writes hold the dataset lock, so every read sees one value
                        let first = [out[0], out[1]];
                        assert!(out.chunks_exact(2).all(|px| px == first));
                    }
                });
            }
        });
    }
}
