//! Driver hooks for moving blocks between storage and memory

use rastercache_common::{BlockAddr, Result};

/// Decodes and encodes whole blocks of one band
///
/// Buffers are `block_width * block_height` elements, row-major, native
/// byte order. Edge blocks carry the full block size; pixels past the raster
/// edge must be left untouched on decode and ignored on encode.
///
/// Both hooks may run on any thread, outside every cache lock except the
/// block's own buffer lock, so implementations serialize shared file access
/// themselves. They must not enter the owning dataset's lock.
pub trait BlockCodec: Send + Sync {
    /// Fill `buf` with the stored contents of block `addr`
    fn decode(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()>;

    /// Persist `buf` as the contents of block `addr`
    fn encode(&self, addr: BlockAddr, buf: &[u8]) -> Result<()>;

    /// Make earlier encodes durable; called after a flush sweep wrote blocks
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
