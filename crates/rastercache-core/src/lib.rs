//! RasterCache Core - Block cache and raster I/O
//!
//! This crate implements the shared machinery every raster format sits on:
//! - Process-wide LRU block pool with a byte budget
//! - Per-band block stores (dense array or hash map)
//! - Band and dataset facades with dirty-block write-back
//! - Reentrant per-dataset read/write lock
//! - Windowed I/O dispatcher (direct, overview, resampled, pixel by pixel)
//! - Raw interleaved layout arithmetic and positional file access

pub mod band;
pub mod band_cache;
pub mod block;
pub mod codec;
pub mod dataset;
pub mod driver;
pub mod layout;
pub mod lock;
pub mod mem;
pub mod pool;
pub mod rasterio;
pub mod raw_io;
pub mod resample;
pub mod store;

// Re-exports
pub use band::{BlockRef, RasterBand};
pub use band_cache::{BandBlockCache, BlockGeometry};
pub use block::{Block, BlockOwner, EvictOutcome};
pub use codec::BlockCodec;
pub use dataset::{BandSpec, BufferLayout, Dataset};
pub use driver::{Driver, DriverRegistry};
pub use layout::{LayoutParams, RawLayoutDescriptor, compute_layout, required_file_size};
pub use lock::{DatasetLock, DatasetLockGuard, DroppedLock, LockMode};
pub use mem::MemCodec;
pub use pool::{CacheStats, GlobalBlockPool};
pub use rasterio::{BufferSpacing, IoBuffer, IoPath, IoStatus, RasterIoOptions};
pub use raw_io::RawFile;
pub use store::{ArrayBlockStore, BlockStore, HashBlockStore};
