//! Byte layout of raw interleaved rasters
//!
//! Translates an interleave scheme plus raster dimensions into the byte
//! offset of each band's first pixel and the strides between pixels, lines
//! and bands. All arithmetic is checked against the signed 64-bit file
//! offset range before any descriptor is handed out.

use rastercache_common::{ByteOrder, DataType, Error, Interleave, Result};

/// Where one band's pixels sit in a raw file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawLayoutDescriptor {
    /// Offset of pixel (0, 0)
    pub image_offset: u64,
    pub pixel_stride: u64,
    pub line_stride: u64,
    /// Distance between the same pixel of adjacent bands
    pub band_stride: u64,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    pub compressed: bool,
}

impl RawLayoutDescriptor {
    pub fn element_size(&self) -> usize {
        self.data_type.size_bytes()
    }

    /// Offset of the first byte of line `y`
    pub fn line_offset(&self, y: usize) -> u64 {
        self.image_offset + y as u64 * self.line_stride
    }

    /// Offset of pixel `(x, y)`
    pub fn pixel_offset(&self, x: usize, y: usize) -> u64 {
        self.line_offset(y) + x as u64 * self.pixel_stride
    }

    /// Bytes from the first to the last byte of a line of `samples` pixels
    pub fn line_span(&self, samples: usize) -> usize {
        let last = samples.saturating_sub(1) as u64 * self.pixel_stride;
        (last + self.element_size() as u64) as usize
    }

    /// Check whether the band's pixels are packed back to back
    pub fn is_contiguous(&self) -> bool {
        self.pixel_stride == self.element_size() as u64
    }
}

/// Raster dimensions and storage parameters parsed from a header
#[derive(Clone, Copy, Debug)]
pub struct LayoutParams {
    pub samples: usize,
    pub lines: usize,
    pub bands: usize,
    pub data_type: DataType,
    pub interleave: Interleave,
    pub header_offset: u64,
    pub byte_order: ByteOrder,
    pub compressed: bool,
    /// Bytes of framing before and after every line
    pub frame_offsets: Option<(u64, u64)>,
}

fn overflow(what: &str, p: &LayoutParams) -> Error {
    Error::overflow(format!(
        "{what} of {}x{}x{} {} raster exceeds the file offset range",
        p.samples, p.lines, p.bands, p.data_type
    ))
}

fn mul(a: u64, b: u64, what: &str, p: &LayoutParams) -> Result<u64> {
    a.checked_mul(b)
        .filter(|v| i64::try_from(*v).is_ok())
        .ok_or_else(|| overflow(what, p))
}

fn add(a: u64, b: u64, what: &str, p: &LayoutParams) -> Result<u64> {
    a.checked_add(b)
        .filter(|v| i64::try_from(*v).is_ok())
        .ok_or_else(|| overflow(what, p))
}

/// Compute one descriptor per band
pub fn compute_layout(p: &LayoutParams) -> Result<Vec<RawLayoutDescriptor>> {
    if p.samples == 0 || p.lines == 0 || p.bands == 0 {
        return Err(Error::configuration(format!(
            "invalid raster dimensions {}x{}x{}",
            p.samples, p.lines, p.bands
        )));
    }
    let elem = p.data_type.size_bytes() as u64;
    let samples = p.samples as u64;
    let lines = p.lines as u64;
    let bands = p.bands as u64;

    let (pixel_stride, mut line_stride, band_stride) = match p.interleave {
        Interleave::Bsq => {
            let line = mul(elem, samples, "line stride", p)?;
            (elem, line, mul(line, lines, "band stride", p)?)
        }
        Interleave::Bil => {
            let band = mul(elem, samples, "band stride", p)?;
            (elem, mul(band, bands, "line stride", p)?, band)
        }
        Interleave::Bip => {
            let pixel = mul(elem, bands, "pixel stride", p)?;
            (pixel, mul(pixel, samples, "line stride", p)?, elem)
        }
    };

    let mut header_offset = p.header_offset;
    if let Some((before, after)) = p.frame_offsets {
        header_offset = add(header_offset, before, "header offset", p)?;
        let framing = add(before, after, "line framing", p)?;
        line_stride = add(line_stride, framing, "line stride", p)?;
    }

    // The last byte of the last band must be addressable
    let last_band = mul(band_stride, bands - 1, "band offset", p)?;
    let last_line = mul(line_stride, lines - 1, "line offset", p)?;
    let last_pixel = mul(pixel_stride, samples - 1, "pixel offset", p)?;
    let end = [last_band, last_line, last_pixel, elem]
        .into_iter()
        .try_fold(header_offset, |acc, v| add(acc, v, "file extent", p))?;
    tracing::trace!(end, interleave = %p.interleave, "computed raw layout");

    (0..bands)
        .map(|band| {
            Ok(RawLayoutDescriptor {
                image_offset: add(header_offset, band * band_stride, "band offset", p)?,
                pixel_stride,
                line_stride,
                band_stride,
                data_type: p.data_type,
                byte_order: p.byte_order,
                compressed: p.compressed,
            })
        })
        .collect()
}

/// Bytes a file needs to hold every pixel of the layout
pub fn required_file_size(layouts: &[RawLayoutDescriptor], samples: usize, lines: usize) -> u64 {
    layouts
        .iter()
        .map(|l| l.line_offset(lines.saturating_sub(1)) + l.line_span(samples) as u64)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(samples: usize, lines: usize, bands: usize, data_type: DataType, interleave: Interleave) -> LayoutParams {
        LayoutParams {
            samples,
            lines,
            bands,
            data_type,
            interleave,
            header_offset: 0,
            byte_order: ByteOrder::LittleEndian,
            compressed: false,
            frame_offsets: None,
        }
    }

    #[test]
    fn test_band_sequential() {
        let layout = compute_layout(&params(4, 3, 2, DataType::Byte, Interleave::Bsq)).unwrap();
        assert_eq!(layout.len(), 2);
        let band2 = layout[1];
        assert_eq!((band2.pixel_stride, band2.line_stride, band2.band_stride), (1, 4, 12));
        assert_eq!(band2.pixel_offset(2, 1), 18);
        assert_eq!(required_file_size(&layout, 4, 3), 24);
    }

    #[test]
    fn test_pixel_interleaved() {
        let layout = compute_layout(&params(2, 5, 3, DataType::Int16, Interleave::Bip)).unwrap();
        let band = layout[0];
        assert_eq!((band.pixel_stride, band.band_stride, band.line_stride), (6, 2, 12));
        assert_eq!(layout[2].image_offset, 4);
        assert_eq!(band.line_span(2), 8);
        assert!(!band.is_contiguous());
    }

    #[test]
    fn test_line_interleaved() {
        let mut p = params(3, 2, 2, DataType::Float32, Interleave::Bil);
        p.header_offset = 100;
        let layout = compute_layout(&p).unwrap();
        assert_eq!((layout[1].pixel_stride, layout[1].line_stride, layout[1].band_stride), (4, 24, 12));
        assert_eq!(layout[1].image_offset, 112);
        assert_eq!(layout[1].pixel_offset(1, 1), 112 + 24 + 4);
    }

    #[test]
    fn test_frame_offsets_extend_lines() {
        let mut p = params(4, 2, 1, DataType::Byte, Interleave::Bsq);
        p.frame_offsets = Some((2, 3));
        let layout = compute_layout(&p).unwrap();
        assert_eq!(layout[0].image_offset, 2);
        assert_eq!(layout[0].line_stride, 9);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let p = params(usize::MAX / 2, 4, 2, DataType::CFloat64, Interleave::Bip);
        assert!(matches!(compute_layout(&p), Err(Error::Overflow(_))));

        let p = params(1 << 31, 1 << 31, 4, DataType::Float64, Interleave::Bsq);
        assert!(matches!(compute_layout(&p), Err(Error::Overflow(_))));

        assert!(matches!(
            compute_layout(&params(0, 1, 1, DataType::Byte, Interleave::Bsq)),
            Err(Error::Configuration(_))
        ));
    }
}
