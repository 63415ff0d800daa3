//! Raw binary raster driver
//!
//! Reads and writes flat band-sequential, line-interleaved and
//! pixel-interleaved files whose dimensions and storage layout come from an
//! ENVI `.hdr` header next to the data file. Each band is cached one
//! scanline per block.

pub mod codec;
pub mod dataset;
pub mod header;

pub use codec::RawBandCodec;
pub use dataset::RawDriver;
pub use header::{EnviHeader, find_header_file};

use rastercache_core::DriverRegistry;
use std::sync::Arc;

/// Registry holding every driver this crate provides
pub fn default_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(RawDriver::new()));
    registry
}
