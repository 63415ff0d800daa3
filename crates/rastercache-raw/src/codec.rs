//! Scanline codec for raw interleaved files
//!
//! Each block is one full line of one band. The line's pixels are read in a
//! single positional read covering the whole span, then picked out at the
//! band's pixel stride.

use rastercache_common::{BlockAddr, ByteOrder, Error, Result};
use rastercache_core::{BlockCodec, RawFile, RawLayoutDescriptor};
use std::sync::Arc;
use tracing::trace;

pub struct RawBandCodec {
    file: Arc<RawFile>,
    layout: RawLayoutDescriptor,
    samples: usize,
    lines: usize,
}

impl RawBandCodec {
    pub fn new(file: Arc<RawFile>, layout: RawLayoutDescriptor, samples: usize, lines: usize) -> Self {
        Self {
            file,
            layout,
            samples,
            lines,
        }
    }

    pub fn layout(&self) -> &RawLayoutDescriptor {
        &self.layout
    }

    fn line_bytes(&self) -> usize {
        self.samples * self.layout.element_size()
    }

    fn check(&self, addr: BlockAddr, len: usize) -> Result<()> {
        if addr.col != 0 || addr.row >= self.lines {
            return Err(Error::invalid_argument(format!(
                "block {addr} outside {} scanlines",
                self.lines
            )));
        }
        if len != self.line_bytes() {
            return Err(Error::invalid_argument(format!(
                "scanline buffer is {len} bytes, expected {}",
                self.line_bytes()
            )));
        }
        Ok(())
    }

    /// Copy every band pixel out of a span read from the file
    fn gather(&self, span: &[u8], out: &mut [u8]) {
        let elem = self.layout.element_size();
        let stride = self.layout.pixel_stride as usize;
        for (x, pixel) in out.chunks_exact_mut(elem).enumerate() {
            let at = x * stride;
            pixel.copy_from_slice(&span[at..at + elem]);
        }
    }

    /// Place every band pixel into a span that also holds other bands
    fn scatter(&self, line: &[u8], span: &mut [u8]) {
        let elem = self.layout.element_size();
        let stride = self.layout.pixel_stride as usize;
        for (x, pixel) in line.chunks_exact(elem).enumerate() {
            let at = x * stride;
            span[at..at + elem].copy_from_slice(pixel);
        }
    }
}

impl BlockCodec for RawBandCodec {
    fn decode(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        let offset = self.layout.line_offset(addr.row);
        if self.layout.is_contiguous() {
            self.file.read_at(offset, buf)?;
        } else {
            let mut span = vec![0u8; self.layout.line_span(self.samples)];
            self.file.read_at(offset, &mut span)?;
            self.gather(&span, buf);
        }
        if self.layout.byte_order.needs_swap() {
            ByteOrder::swap_in_place(buf, self.layout.data_type);
        }
        trace!(line = addr.row, offset, "decoded scanline");
        Ok(())
    }

    fn encode(&self, addr: BlockAddr, buf: &[u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        let offset = self.layout.line_offset(addr.row);
        let mut line = buf.to_vec();
        if self.layout.byte_order.needs_swap() {
            ByteOrder::swap_in_place(&mut line, self.layout.data_type);
        }

        if self.layout.is_contiguous() {
            self.file.write_at(offset, &line)?;
        } else {
            // Other bands' pixels share the span; keep them intact
            let _rmw = self.file.lock_rmw();
            let mut span = vec![0u8; self.layout.line_span(self.samples)];
            self.file.read_at(offset, &mut span)?;
            self.scatter(&line, &mut span);
            self.file.write_at(offset, &span)?;
        }
        trace!(line = addr.row, offset, "encoded scanline");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

impl std::fmt::Debug for RawBandCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBandCodec")
            .field("file", &self.file.path())
            .field("layout", &self.layout)
            .field("samples", &self.samples)
            .field("lines", &self.lines)
            .finish()
    }
}
