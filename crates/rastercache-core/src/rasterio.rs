//! Windowed raster I/O dispatcher
//!
//! A request names a source window and a caller buffer of `buf_x * buf_y`
//! pixels. The dispatcher picks the cheapest path that is correct for it:
//!
//! 1. decimated reads go to the best matching overview, if any
//! 2. 1:1 block-aligned requests copy whole blocks
//! 3. anything else samples per output pixel, decoding source blocks lazily
//! 4. requests whose working set would not fit the pool, or that the caller
//!    flags as irregular, go pixel by pixel holding one block at a time
//!
//! Paths 3 and 4 check the progress callback after every output row and
//! stop with [`IoStatus::Cancelled`] when it returns `false`.

use crate::band::{BlockRef, RasterBand};
use crate::band_cache::{BandBlockCache, BlockGeometry};
use crate::lock::LockMode;
use crate::resample::{average, footprint, interpolate, nearest_index};
use rastercache_common::{BlockAddr, Error, ResampleAlg, Result, RwFlag, Window};
use std::collections::HashMap;
use tracing::debug;

/// Overviews up to this much coarser than requested still qualify
const OVERVIEW_TOLERANCE: f64 = 1.2;

/// Caller buffer of a raster I/O request
#[derive(Debug)]
pub enum IoBuffer<'a> {
    /// Destination of a read
    Read(&'a mut [u8]),
    /// Source of a write
    Write(&'a [u8]),
}

impl IoBuffer<'_> {
    pub fn flag(&self) -> RwFlag {
        match self {
            Self::Read(_) => RwFlag::Read,
            Self::Write(_) => RwFlag::Write,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Read(b) => b.len(),
            Self::Write(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Optional knobs of a raster I/O request
#[derive(Clone, Copy, Default)]
pub struct RasterIoOptions<'a> {
    pub resample_alg: ResampleAlg,
    /// Called with the completed fraction; returning `false` cancels
    pub progress: Option<&'a dyn Fn(f64) -> bool>,
}

impl<'a> RasterIoOptions<'a> {
    #[must_use]
    pub fn with_resample_alg(mut self, alg: ResampleAlg) -> Self {
        self.resample_alg = alg;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn Fn(f64) -> bool) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, done: f64) -> Result<()> {
        match self.progress {
            Some(progress) if !progress(done) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for RasterIoOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterIoOptions")
            .field("resample_alg", &self.resample_alg)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Completed,
    /// The progress callback asked to stop; the buffer is partially done
    Cancelled,
}

/// Path chosen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPath {
    /// Served by the overview at this index
    Overview(usize),
    /// Whole-block copies
    Direct,
    /// Per-pixel sampling with lazily decoded blocks
    Resampled,
    /// Per-pixel sampling holding one block at a time
    PixelByPixel,
}

/// Byte layout of one band inside a caller buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpacing {
    /// Offset of pixel (0, 0)
    pub base: usize,
    /// Bytes between horizontally adjacent pixels
    pub pixel_space: usize,
    /// Bytes between vertically adjacent pixels
    pub line_space: usize,
}

impl BufferSpacing {
    /// Tightly packed rows of `buf_x` elements
    pub fn packed(buf_x: usize, element_size: usize) -> Self {
        Self {
            base: 0,
            pixel_space: element_size,
            line_space: buf_x * element_size,
        }
    }

    fn offset(&self, i: usize, j: usize) -> usize {
        self.base + j * self.line_space + i * self.pixel_space
    }

    /// Smallest buffer length that holds every pixel
    fn required_len(&self, buf_x: usize, buf_y: usize, element_size: usize) -> Option<usize> {
        let last_line = (buf_y - 1).checked_mul(self.line_space)?;
        let last_pixel = (buf_x - 1).checked_mul(self.pixel_space)?;
        self.base
            .checked_add(last_line)?
            .checked_add(last_pixel)?
            .checked_add(element_size)
    }
}

pub(crate) fn is_block_aligned(geometry: &BlockGeometry, window: Window) -> bool {
    let x_end = window.x_off + window.x_size;
    let y_end = window.y_off + window.y_size;
    window.x_off % geometry.block_width == 0
        && window.y_off % geometry.block_height == 0
        && (x_end % geometry.block_width == 0 || x_end == geometry.raster_width)
        && (y_end % geometry.block_height == 0 || y_end == geometry.raster_height)
}

fn best_overview(band: &RasterBand, window: Window, buf_x: usize, buf_y: usize) -> Option<usize> {
    let desired = (window.x_size as f64 / buf_x as f64).min(window.y_size as f64 / buf_y as f64);
    if desired <= 1.0 {
        return None;
    }
    let mut best: Option<(usize, f64)> = None;
    for i in 0..band.overview_count() {
        let Some(overview) = band.overview(i) else {
            continue;
        };
        let ratio = band.x_size() as f64 / overview.x_size() as f64;
        if ratio > 1.0
            && ratio <= desired * OVERVIEW_TOLERANCE
            && best.is_none_or(|(_, r)| ratio > r)
        {
            best = Some((i, ratio));
        }
    }
    best.map(|(i, _)| i)
}

/// Bytes of source blocks the resampling path keeps locked at once
fn resample_working_set(geometry: &BlockGeometry, window: Window, buf_y: usize) -> u64 {
    let first_col = window.x_off / geometry.block_width;
    let last_col = (window.x_off + window.x_size - 1) / geometry.block_width;
    let rows_per_output = (window.y_size.div_ceil(buf_y)).div_ceil(geometry.block_height) + 1;
    ((last_col - first_col + 1) as u64)
        .saturating_mul(rows_per_output as u64)
        .saturating_mul(geometry.block_bytes() as u64)
}

/// Choose the dispatcher path for a request
pub(crate) fn plan(band: &RasterBand, flag: RwFlag, window: Window, buf_x: usize, buf_y: usize) -> IoPath {
    if flag == RwFlag::Read
        && (buf_x < window.x_size || buf_y < window.y_size)
        && let Some(i) = best_overview(band, window, buf_x, buf_y)
    {
        return IoPath::Overview(i);
    }
    let geometry = band.geometry();
    if buf_x == window.x_size && buf_y == window.y_size && is_block_aligned(geometry, window) {
        return IoPath::Direct;
    }
    if resample_working_set(geometry, window, buf_y) > band.pool().max_bytes() {
        return IoPath::PixelByPixel;
    }
    IoPath::Resampled
}

/// Map a full-resolution window onto an overview
fn overview_window(band: &RasterBand, overview: &RasterBand, window: Window) -> Window {
    let rx = band.x_size() as f64 / overview.x_size() as f64;
    let ry = band.y_size() as f64 / overview.y_size() as f64;
    let scale = |off: usize, size: usize, ratio: f64, limit: usize| {
        let start = ((off as f64 / ratio).floor() as usize).min(limit - 1);
        let end = (((off + size) as f64 / ratio).round() as usize).clamp(start + 1, limit);
        (start, end - start)
    };
    let (x_off, x_size) = scale(window.x_off, window.x_size, rx, overview.x_size());
    let (y_off, y_size) = scale(window.y_off, window.y_size, ry, overview.y_size());
    Window::new(x_off, y_off, x_size, y_size)
}

/// Validate a request against a band and a buffer layout
pub(crate) fn validate(
    band: &RasterBand,
    buf: &IoBuffer<'_>,
    window: Window,
    buf_x: usize,
    buf_y: usize,
    spacing: BufferSpacing,
) -> Result<()> {
    if !window.fits_in(band.x_size(), band.y_size()) {
        return Err(Error::invalid_argument(format!(
            "window {window} outside {}x{} raster",
            band.x_size(),
            band.y_size()
        )));
    }
    if buf_x == 0 || buf_y == 0 {
        return Err(Error::invalid_argument(format!(
            "empty buffer {buf_x}x{buf_y}"
        )));
    }
    let element_size = band.data_type().size_bytes();
    let required = spacing
        .required_len(buf_x, buf_y, element_size)
        .ok_or_else(|| Error::overflow(format!("buffer {buf_x}x{buf_y} size overflows")))?;
    if buf.len() < required {
        return Err(Error::invalid_argument(format!(
            "buffer is {} bytes, request needs {required}",
            buf.len()
        )));
    }
    if buf.flag() == RwFlag::Write {
        band.ensure_writable()?;
    }
    Ok(())
}

/// Run one band's share of a request
///
/// `force` overrides the planned path; the overview step is never forced.
#[allow(clippy::too_many_arguments)]
pub(crate) fn band_io(
    band: &RasterBand,
    buf: &mut IoBuffer<'_>,
    window: Window,
    buf_x: usize,
    buf_y: usize,
    spacing: BufferSpacing,
    options: &RasterIoOptions<'_>,
    force: Option<IoPath>,
) -> Result<IoStatus> {
    validate(band, buf, window, buf_x, buf_y, spacing)?;
    let flag = buf.flag();
    let _guard = band.dataset_lock().enter_read_write(LockMode::from(flag))?;

    let path = force.unwrap_or_else(|| plan(band, flag, window, buf_x, buf_y));
    let result = match path {
        IoPath::Overview(i) => match band.overview(i) {
            Some(overview) => {
                let ov_window = overview_window(band, &overview, window);
                debug!(band = band.index(), overview = i, %window, %ov_window, "routing read to overview");
                return band_io(&overview, buf, ov_window, buf_x, buf_y, spacing, options, None);
            }
            None => sampled_io(band, buf, window, buf_x, buf_y, spacing, options, usize::MAX),
        },
        IoPath::Direct => direct_io(band, buf, window, spacing),
        IoPath::Resampled => sampled_io(band, buf, window, buf_x, buf_y, spacing, options, usize::MAX),
        IoPath::PixelByPixel => sampled_io(band, buf, window, buf_x, buf_y, spacing, options, 1),
    };

    match result {
        Ok(()) => Ok(IoStatus::Completed),
        Err(Error::Cancelled) => {
            debug!(band = band.index(), %window, "raster I/O cancelled by caller");
            Ok(IoStatus::Cancelled)
        }
        Err(e) => Err(e),
    }
}

/// Blocks of the grid touched by an aligned window, in (row, col) order
pub(crate) fn window_blocks(geometry: &BlockGeometry, window: Window) -> impl Iterator<Item = BlockAddr> {
    let c0 = window.x_off / geometry.block_width;
    let c1 = (window.x_off + window.x_size - 1) / geometry.block_width;
    let r0 = window.y_off / geometry.block_height;
    let r1 = (window.y_off + window.y_size - 1) / geometry.block_height;
    (r0..=r1).flat_map(move |row| (c0..=c1).map(move |col| BlockAddr::new(col, row)))
}

/// Copy one whole block between the cache and the caller buffer
pub(crate) fn transfer_block(
    band: &RasterBand,
    buf: &mut IoBuffer<'_>,
    addr: BlockAddr,
    window: Window,
    spacing: BufferSpacing,
) -> Result<()> {
    let geometry = band.geometry();
    let element_size = geometry.element_size();
    let (valid_w, valid_h) = geometry.valid_extent(addr);
    let x0 = addr.col * geometry.block_width;
    let y0 = addr.row * geometry.block_height;
    let block_stride = geometry.block_width * element_size;
    let contiguous = spacing.pixel_space == element_size;

    match buf {
        IoBuffer::Read(out) => {
            let block = band.get_locked_block_ref(addr.col, addr.row, false)?;
            let data = block.data();
            for line in 0..valid_h {
                let src = line * block_stride;
                let dst = spacing.offset(x0 - window.x_off, y0 + line - window.y_off);
                if contiguous {
                    let n = valid_w * element_size;
                    out[dst..dst + n].copy_from_slice(&data[src..src + n]);
                } else {
                    for x in 0..valid_w {
                        let s = src + x * element_size;
                        let d = dst + x * spacing.pixel_space;
                        out[d..d + element_size].copy_from_slice(&data[s..s + element_size]);
                    }
                }
            }
        }
        IoBuffer::Write(input) => {
            // Aligned windows cover each block's valid region entirely
            let block = band.get_locked_block_ref(addr.col, addr.row, true)?;
            block.modify(|data| {
                for line in 0..valid_h {
                    let dst = line * block_stride;
                    let src = spacing.offset(x0 - window.x_off, y0 + line - window.y_off);
                    if contiguous {
                        let n = valid_w * element_size;
                        data[dst..dst + n].copy_from_slice(&input[src..src + n]);
                    } else {
                        for x in 0..valid_w {
                            let d = dst + x * element_size;
                            let s = src + x * spacing.pixel_space;
                            data[d..d + element_size].copy_from_slice(&input[s..s + element_size]);
                        }
                    }
                }
            });
        }
    }
    Ok(())
}

fn direct_io(band: &RasterBand, buf: &mut IoBuffer<'_>, window: Window, spacing: BufferSpacing) -> Result<()> {
    for addr in window_blocks(band.geometry(), window) {
        transfer_block(band, buf, addr, window, spacing)?;
    }
    Ok(())
}

/// Locked source blocks reused across neighbouring output pixels
struct BlockCursor<'a> {
    cache: &'a BandBlockCache,
    geometry: BlockGeometry,
    held: HashMap<BlockAddr, BlockRef<'a>>,
    max_held: usize,
}

impl<'a> BlockCursor<'a> {
    fn new(band: &'a RasterBand, max_held: usize) -> Self {
        Self {
            cache: band.cache(),
            geometry: *band.geometry(),
            held: HashMap::new(),
            max_held: max_held.max(1),
        }
    }

    fn locate(&self, x: usize, y: usize) -> (BlockAddr, usize) {
        let addr = BlockAddr::new(x / self.geometry.block_width, y / self.geometry.block_height);
        let bx = x % self.geometry.block_width;
        let by = y % self.geometry.block_height;
        let offset = (by * self.geometry.block_width + bx) * self.geometry.element_size();
        (addr, offset)
    }

    fn block(&mut self, addr: BlockAddr, just_initialize: bool) -> Result<&BlockRef<'a>> {
        if !self.held.contains_key(&addr) {
            if self.held.len() >= self.max_held {
                self.held.clear();
            }
            let block = self.cache.get_locked_block_ref(addr, just_initialize)?;
            self.held.insert(addr, BlockRef::new(self.cache, block));
        }
        self.held
            .get(&addr)
            .ok_or_else(|| Error::internal(format!("block {addr} vanished from cursor")))
    }

    /// Unlock blocks whose rows lie above `row`
    fn release_above(&mut self, row: usize) {
        self.held.retain(|addr, _| addr.row >= row);
    }

    fn copy_pixel(&mut self, x: usize, y: usize, out: &mut [u8]) -> Result<()> {
        let (addr, offset) = self.locate(x, y);
        let n = out.len();
        let block = self.block(addr, false)?;
        out.copy_from_slice(&block.data()[offset..offset + n]);
        Ok(())
    }

    fn sample(&mut self, x: usize, y: usize) -> Result<f64> {
        let (addr, offset) = self.locate(x, y);
        let data_type = self.geometry.data_type;
        let block = self.block(addr, false)?;
        Ok(data_type.read_sample(&block.data()[offset..]))
    }

    fn write_pixel(&mut self, x: usize, y: usize, pixel: &[u8], covered: impl Fn(BlockAddr) -> bool) -> Result<()> {
        let (addr, offset) = self.locate(x, y);
        let just_initialize = covered(addr);
        let block = self.block(addr, just_initialize)?;
        block.modify(|data| data[offset..offset + pixel.len()].copy_from_slice(pixel));
        Ok(())
    }
}

/// Check whether the window covers a block's whole valid region
fn covers_block(geometry: &BlockGeometry, window: Window, addr: BlockAddr) -> bool {
    let (w, h) = geometry.valid_extent(addr);
    let x0 = addr.col * geometry.block_width;
    let y0 = addr.row * geometry.block_height;
    x0 >= window.x_off
        && y0 >= window.y_off
        && x0 + w <= window.x_off + window.x_size
        && y0 + h <= window.y_off + window.y_size
}

#[allow(clippy::too_many_arguments)]
fn sampled_io(
    band: &RasterBand,
    buf: &mut IoBuffer<'_>,
    window: Window,
    buf_x: usize,
    buf_y: usize,
    spacing: BufferSpacing,
    options: &RasterIoOptions<'_>,
    max_held: usize,
) -> Result<()> {
    let geometry = *band.geometry();
    let mut cursor = BlockCursor::new(band, max_held);
    match buf {
        IoBuffer::Read(out) => {
            sampled_read(&mut cursor, &geometry, out, window, buf_x, buf_y, spacing, options)
        }
        IoBuffer::Write(input) => {
            sampled_write(&mut cursor, &geometry, input, window, buf_x, buf_y, spacing, options)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sampled_read(
    cursor: &mut BlockCursor<'_>,
    geometry: &BlockGeometry,
    out: &mut [u8],
    window: Window,
    buf_x: usize,
    buf_y: usize,
    spacing: BufferSpacing,
    options: &RasterIoOptions<'_>,
) -> Result<()> {
    let data_type = geometry.data_type;
    let element_size = data_type.size_bytes();
    // Interpolating complex samples is not supported; fall back to nearest
    let alg = if data_type.is_complex() {
        ResampleAlg::Nearest
    } else {
        options.resample_alg
    };
    let rx = window.x_size as f64 / buf_x as f64;
    let ry = window.y_size as f64 / buf_y as f64;
    let x_end = window.x_off + window.x_size;
    let y_end = window.y_off + window.y_size;

    for j in 0..buf_y {
        let top = window.y_off as f64 + j as f64 * ry;
        let center_y = top + 0.5 * ry;
        let first_row = match alg {
            ResampleAlg::Nearest => nearest_index(center_y, window.y_off, y_end),
            ResampleAlg::Average => nearest_index(top, window.y_off, y_end),
            ResampleAlg::Bilinear | ResampleAlg::Cubic => {
                ((center_y - 2.0).floor().max(0.0)) as usize
            }
        };
        cursor.release_above(first_row / geometry.block_height);

        for i in 0..buf_x {
            let left = window.x_off as f64 + i as f64 * rx;
            let center_x = left + 0.5 * rx;
            let off = spacing.offset(i, j);
            let pixel = &mut out[off..off + element_size];
            match alg {
                ResampleAlg::Nearest => {
                    let x = nearest_index(center_x, window.x_off, x_end);
                    let y = nearest_index(center_y, window.y_off, y_end);
                    cursor.copy_pixel(x, y, pixel)?;
                }
                ResampleAlg::Bilinear | ResampleAlg::Cubic => {
                    let value = interpolate(
                        alg,
                        center_x,
                        center_y,
                        geometry.raster_width,
                        geometry.raster_height,
                        |x, y| cursor.sample(x, y),
                    )?;
                    data_type.write_sample(value, pixel);
                }
                ResampleAlg::Average => {
                    let (x0, x1) = footprint(left, left + rx, window.x_off, x_end);
                    let (y0, y1) = footprint(top, top + ry, window.y_off, y_end);
                    let value = average(x0, x1, y0, y1, |x, y| cursor.sample(x, y))?;
                    data_type.write_sample(value, pixel);
                }
            }
        }
        options.report((j + 1) as f64 / buf_y as f64)?;
    }
    Ok(())
}

/// Writes map every window pixel to its nearest buffer pixel
#[allow(clippy::too_many_arguments)]
fn sampled_write(
    cursor: &mut BlockCursor<'_>,
    geometry: &BlockGeometry,
    input: &[u8],
    window: Window,
    buf_x: usize,
    buf_y: usize,
    spacing: BufferSpacing,
    options: &RasterIoOptions<'_>,
) -> Result<()> {
    let element_size = geometry.element_size();
    let sx = buf_x as f64 / window.x_size as f64;
    let sy = buf_y as f64 / window.y_size as f64;
    let covered = |addr: BlockAddr| covers_block(geometry, window, addr);

    for wy in 0..window.y_size {
        let y = window.y_off + wy;
        let j = nearest_index((wy as f64 + 0.5) * sy, 0, buf_y);
        cursor.release_above(y / geometry.block_height);
        for wx in 0..window.x_size {
            let i = nearest_index((wx as f64 + 0.5) * sx, 0, buf_x);
            let off = spacing.offset(i, j);
            cursor.write_pixel(window.x_off + wx, y, &input[off..off + element_size], covered)?;
        }
        options.report((wy + 1) as f64 / window.y_size as f64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::tests::test_band;
    use crate::lock::DatasetLock;
    use crate::mem::MemCodec;
    use crate::pool::GlobalBlockPool;
    use rastercache_common::{Access, CacheConfig, DataType};
    use std::cell::Cell;
    use std::sync::Arc;

    fn read(band: &RasterBand, window: Window, bx: usize, by: usize, alg: ResampleAlg) -> Vec<u8> {
        let mut out = vec![0u8; bx * by * band.data_type().size_bytes()];
        let options = RasterIoOptions::default().with_resample_alg(alg);
        let status = band
            .raster_io(window, IoBuffer::Read(&mut out), bx, by, &options)
            .unwrap();
        assert_eq!(status, IoStatus::Completed);
        out
    }

    fn write(band: &RasterBand, window: Window, bx: usize, by: usize, data: &[u8]) {
        let status = band
            .raster_io(window, IoBuffer::Write(data), bx, by, &RasterIoOptions::default())
            .unwrap();
        assert_eq!(status, IoStatus::Completed);
    }

    fn mem_band(width: usize, height: usize, block: usize, pool: &Arc<GlobalBlockPool>) -> RasterBand {
        let geometry = BlockGeometry::new(width, height, block, block, DataType::Byte).unwrap();
        RasterBand::new(
            1,
            geometry,
            Arc::new(MemCodec::new(geometry)),
            Arc::clone(pool),
            Arc::new(DatasetLock::new()),
            Access::Update,
        )
    }

    #[test]
    fn test_plan_paths() {
        let (band, _) = test_band(64, 64, 16, DataType::Byte, 1 << 20);
        assert_eq!(band.plan_raster_io(RwFlag::Read, Window::full(64, 64), 64, 64), IoPath::Direct);
        assert_eq!(
            band.plan_raster_io(RwFlag::Read, Window::new(16, 0, 48, 16), 48, 16),
            IoPath::Direct
        );
        assert_eq!(
            band.plan_raster_io(RwFlag::Read, Window::new(1, 0, 16, 16), 16, 16),
            IoPath::Resampled
        );
        // No overview yet, so decimation samples the full band
        assert_eq!(
            band.plan_raster_io(RwFlag::Read, Window::full(64, 64), 32, 32),
            IoPath::Resampled
        );

        // A pool smaller than one block row forces the pixel path
        let (tiny, _) = test_band(64, 64, 16, DataType::Byte, 256);
        assert_eq!(
            tiny.plan_raster_io(RwFlag::Read, Window::new(1, 1, 60, 60), 30, 30),
            IoPath::PixelByPixel
        );
    }

    #[test]
    fn test_direct_round_trip_with_edge_blocks() {
        let (band, _codec) = test_band(10, 7, 4, DataType::Byte, 1 << 20);
        let data: Vec<u8> = (0..70).collect();
        write(&band, Window::full(10, 7), 10, 7, &data);
        assert_eq!(read(&band, Window::full(10, 7), 10, 7, ResampleAlg::Nearest), data);

        let part = read(&band, Window::new(4, 4, 6, 3), 6, 3, ResampleAlg::Nearest);
        assert_eq!(part, vec![44, 45, 46, 47, 48, 49, 54, 55, 56, 57, 58, 59, 64, 65, 66, 67, 68, 69]);
    }

    #[test]
    fn test_unaligned_window_read_and_write() {
        let (band, _codec) = test_band(8, 8, 4, DataType::Byte, 1 << 20);
        let data: Vec<u8> = (0..64).collect();
        write(&band, Window::full(8, 8), 8, 8, &data);

        write(&band, Window::new(3, 3, 2, 2), 2, 2, &[200, 201, 202, 203]);
        let out = read(&band, Window::new(2, 2, 4, 4), 4, 4, ResampleAlg::Nearest);
        assert_eq!(
            out,
            vec![18, 19, 20, 21, 26, 200, 201, 29, 34, 202, 203, 37, 42, 43, 44, 45]
        );
    }

    #[test]
    fn test_partial_block_write_preserves_neighbours() {
        let (band, codec) = test_band(8, 8, 4, DataType::Byte, 1 << 20);
        write(&band, Window::new(1, 1, 2, 2), 2, 2, &[9, 9, 9, 9]);
        // The block was decoded first, so untouched pixels keep stored values
        assert_eq!(codec.decodes(), 1);
        let out = read(&band, Window::new(0, 0, 4, 1), 4, 1, ResampleAlg::Nearest);
        assert_eq!(out, vec![0, 0, 0, 0]);
        let out = read(&band, Window::new(0, 1, 4, 1), 4, 1, ResampleAlg::Nearest);
        assert_eq!(out, vec![0, 9, 9, 0]);
    }

    #[test]
    fn test_decimated_read_algorithms() {
        let (band, _codec) = test_band(4, 4, 4, DataType::Byte, 1 << 20);
        #[rustfmt::skip]
        let data = vec![
            0, 10, 20, 30,
            0, 10, 20, 30,
            40, 50, 60, 70,
            40, 50, 60, 70,
        ];
        write(&band, Window::full(4, 4), 4, 4, &data);

        let avg = read(&band, Window::full(4, 4), 2, 2, ResampleAlg::Average);
        assert_eq!(avg, vec![5, 25, 45, 65]);

        let near = read(&band, Window::full(4, 4), 2, 2, ResampleAlg::Nearest);
        assert_eq!(near, vec![10, 30, 50, 70]);

        // Centers fall between pixels; bilinear averages the 2x2 neighbourhood
        let bil = read(&band, Window::full(4, 4), 2, 2, ResampleAlg::Bilinear);
        assert_eq!(bil, vec![5, 25, 45, 65]);
    }

    #[test]
    fn test_upsampled_read_nearest() {
        let (band, _codec) = test_band(2, 2, 2, DataType::Byte, 1 << 20);
        write(&band, Window::full(2, 2), 2, 2, &[1, 2, 3, 4]);
        let out = read(&band, Window::full(2, 2), 4, 4, ResampleAlg::Nearest);
        assert_eq!(out, vec![1, 1, 2, 2, 1, 1, 2, 2, 3, 3, 4, 4, 3, 3, 4, 4]);
    }

    #[test]
    fn test_downsampled_write_uses_nearest() {
        let (band, _codec) = test_band(4, 2, 4, DataType::Byte, 1 << 20);
        write(&band, Window::full(4, 2), 2, 1, &[5, 6]);
        let out = read(&band, Window::full(4, 2), 4, 2, ResampleAlg::Nearest);
        assert_eq!(out, vec![5, 5, 6, 6, 5, 5, 6, 6]);
    }

    #[test]
    fn test_pixel_path_matches_resampled_path() {
        let pool = Arc::new(GlobalBlockPool::new(CacheConfig::with_max_bytes(1 << 20)));
        let band = mem_band(32, 32, 8, &pool);
        let data: Vec<u8> = (0..1024u32).map(|v| (v * 7 % 251) as u8).collect();
        write(&band, Window::full(32, 32), 32, 32, &data);

        let window = Window::new(3, 5, 27, 22);
        let expected = read(&band, window, 9, 11, ResampleAlg::Bilinear);

        let mut out = vec![0u8; 9 * 11];
        let options = RasterIoOptions::default().with_resample_alg(ResampleAlg::Bilinear);
        let mut buf = IoBuffer::Read(&mut out);
        band_io(
            &band,
            &mut buf,
            window,
            9,
            11,
            BufferSpacing::packed(9, 1),
            &options,
            Some(IoPath::PixelByPixel),
        )
        .unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_overview_routing_skips_full_resolution() {
        let (band, codec) = test_band(64, 64, 16, DataType::Byte, 1 << 20);
        let pool = Arc::clone(band.pool());
        let overview = Arc::new(mem_band(32, 32, 16, &pool));
        overview.fill(77.0).unwrap();
        band.add_overview(Arc::clone(&overview)).unwrap();

        assert_eq!(
            band.plan_raster_io(RwFlag::Read, Window::full(64, 64), 32, 32),
            IoPath::Overview(0)
        );
        let out = read(&band, Window::full(64, 64), 32, 32, ResampleAlg::Average);
        assert!(out.iter().all(|v| *v == 77));
        assert_eq!(codec.decodes(), 0);

        // Slight decimation stays within tolerance of native resolution
        assert_eq!(
            band.plan_raster_io(RwFlag::Read, Window::full(64, 64), 60, 60),
            IoPath::Resampled
        );
        // Writes never route to overviews
        assert_eq!(
            band.plan_raster_io(RwFlag::Write, Window::full(64, 64), 32, 32),
            IoPath::Resampled
        );
    }

    #[test]
    fn test_progress_cancels_resampling() {
        let (band, _codec) = test_band(16, 16, 4, DataType::Byte, 1 << 20);
        let calls = Cell::new(0);
        let progress = |_done: f64| {
            calls.set(calls.get() + 1);
            calls.get() < 2
        };
        let options = RasterIoOptions::default().with_progress(&progress);
        let mut out = vec![0u8; 8 * 8];
        let status = band
            .raster_io(Window::full(16, 16), IoBuffer::Read(&mut out), 8, 8, &options)
            .unwrap();
        assert_eq!(status, IoStatus::Cancelled);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_invalid_requests() {
        let (band, _codec) = test_band(8, 8, 4, DataType::Int16, 1 << 20);
        let mut out = vec![0u8; 8];
        let options = RasterIoOptions::default();
        assert!(
            band.raster_io(Window::new(6, 0, 4, 1), IoBuffer::Read(&mut out), 4, 1, &options)
                .is_err()
        );
        // Four Int16 pixels need eight bytes; ask for five
        assert!(
            band.raster_io(Window::new(0, 0, 5, 1), IoBuffer::Read(&mut out), 5, 1, &options)
                .is_err()
        );
        assert!(
            band.raster_io(Window::new(0, 0, 4, 1), IoBuffer::Read(&mut out), 0, 1, &options)
                .is_err()
        );
    }

    #[test]
    fn test_random_windows_match_shadow_raster() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::sync::atomic::Ordering;

        // Room for four 8x8 blocks, so most writes evict
        let pool = Arc::new(GlobalBlockPool::new(CacheConfig::with_max_bytes(4 * 64)));
        let band = mem_band(40, 30, 8, &pool);
        let mut shadow = vec![0u8; 40 * 30];
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let x = rng.gen_range(0..40);
            let y = rng.gen_range(0..30);
            let w = rng.gen_range(1..=40 - x);
            let h = rng.gen_range(1..=30 - y);
            let data: Vec<u8> = (0..w * h).map(|_| rng.gen_range(0..=255u8)).collect();
            write(&band, Window::new(x, y, w, h), w, h, &data);
            for j in 0..h {
                let row = (y + j) * 40 + x;
                shadow[row..row + w].copy_from_slice(&data[j * w..(j + 1) * w]);
            }
        }

        for _ in 0..20 {
            let x = rng.gen_range(0..40);
            let y = rng.gen_range(0..30);
            let w = rng.gen_range(1..=40 - x);
            let h = rng.gen_range(1..=30 - y);
            let out = read(&band, Window::new(x, y, w, h), w, h, ResampleAlg::Nearest);
            for j in 0..h {
                let row = (y + j) * 40 + x;
                assert_eq!(&out[j * w..(j + 1) * w], &shadow[row..row + w]);
            }
        }
        assert!(pool.stats().evictions.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_spacing_required_len() {
        let spacing = BufferSpacing {
            base: 2,
            pixel_space: 6,
            line_space: 24,
        };
        assert_eq!(spacing.required_len(4, 2, 2), Some(2 + 24 + 18 + 2));
        assert_eq!(BufferSpacing::packed(4, 1).required_len(4, 4, 1), Some(16));
    }
}
