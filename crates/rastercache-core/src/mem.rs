//! In-memory block codec
//!
//! Backs overview bands and tests. Pixels live in one raster-sized buffer so
//! edge blocks only ever persist their valid region.

use crate::band_cache::BlockGeometry;
use crate::codec::BlockCodec;
use parking_lot::Mutex;
use rastercache_common::{BlockAddr, Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct MemCodec {
    geometry: BlockGeometry,
    pixels: Mutex<Vec<u8>>,
    decodes: AtomicUsize,
    encodes: AtomicUsize,
}

impl MemCodec {
    /// Zero-filled raster with the given geometry
    pub fn new(geometry: BlockGeometry) -> Self {
        let len = geometry.raster_width * geometry.raster_height * geometry.element_size();
        Self {
            geometry,
            pixels: Mutex::new(vec![0; len]),
            decodes: AtomicUsize::new(0),
            encodes: AtomicUsize::new(0),
        }
    }

    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    pub fn encode_count(&self) -> usize {
        self.encodes.load(Ordering::Relaxed)
    }

    /// Copy of the stored raster, row-major
    pub fn snapshot(&self) -> Vec<u8> {
        self.pixels.lock().clone()
    }

    fn check(&self, addr: BlockAddr, len: usize) -> Result<()> {
        if !self.geometry.contains(addr) {
            return Err(Error::invalid_argument(format!("block {addr} outside grid")));
        }
        if len != self.geometry.block_bytes() {
            return Err(Error::invalid_argument(format!(
                "block buffer is {len} bytes, expected {}",
                self.geometry.block_bytes()
            )));
        }
        Ok(())
    }

    /// Byte ranges of each valid block line: (raster offset, block offset, length)
    fn lines(&self, addr: BlockAddr) -> impl Iterator<Item = (usize, usize, usize)> {
        let g = self.geometry;
        let elem = g.element_size();
        let (valid_w, valid_h) = g.valid_extent(addr);
        let x0 = addr.col * g.block_width;
        let y0 = addr.row * g.block_height;
        (0..valid_h).map(move |line| {
            let raster = ((y0 + line) * g.raster_width + x0) * elem;
            let block = line * g.block_width * elem;
            (raster, block, valid_w * elem)
        })
    }
}

impl BlockCodec for MemCodec {
    fn decode(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        self.decodes.fetch_add(1, Ordering::Relaxed);
        let pixels = self.pixels.lock();
        for (raster, block, n) in self.lines(addr) {
            buf[block..block + n].copy_from_slice(&pixels[raster..raster + n]);
        }
        Ok(())
    }

    fn encode(&self, addr: BlockAddr, buf: &[u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        self.encodes.fetch_add(1, Ordering::Relaxed);
        let mut pixels = self.pixels.lock();
        for (raster, block, n) in self.lines(addr) {
            pixels[raster..raster + n].copy_from_slice(&buf[block..block + n]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCodec")
            .field("geometry", &self.geometry)
            .field("decodes", &self.decode_count())
            .field("encodes", &self.encode_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rastercache_common::DataType;

    #[test]
    fn test_edge_block_keeps_valid_region_only() {
        let geometry = BlockGeometry::new(5, 3, 4, 2, DataType::Byte).unwrap();
        let codec = MemCodec::new(geometry);
        codec.encode(BlockAddr::new(1, 1), &[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();

        let mut raster = vec![0u8; 15];
        raster[14] = 9;
        assert_eq!(codec.snapshot(), raster);

        let mut out = [0xffu8; 8];
        codec.decode(BlockAddr::new(1, 1), &mut out).unwrap();
        assert_eq!(out, [9, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!((codec.decode_count(), codec.encode_count()), (1, 1));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let geometry = BlockGeometry::new(4, 4, 2, 2, DataType::UInt16).unwrap();
        let codec = MemCodec::new(geometry);
        let mut buf = [0u8; 8];
        assert!(codec.decode(BlockAddr::new(2, 0), &mut buf).is_err());
        assert!(codec.decode(BlockAddr::new(0, 0), &mut buf[..4]).is_err());
        assert!(codec.decode(BlockAddr::new(1, 1), &mut buf).is_ok());
    }
}
