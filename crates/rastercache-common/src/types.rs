//! Core type definitions for RasterCache
//!
//! This module defines the fundamental types used throughout the system
//! including identifiers, pixel data types, byte order, interleave schemes
//! and request geometry.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

static NEXT_BAND_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a raster band
///
/// Identifies a band inside cache keys; it never owns the band.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
#[display("band#{_0}")]
pub struct BandId(u64);

impl BandId {
    /// Allocate a fresh identifier
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_BAND_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BandId({})", self.0)
    }
}

/// Address of a block inside one band's block grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("({col}, {row})")]
pub struct BlockAddr {
    /// Block column
    pub col: usize,
    /// Block row
    pub row: usize,
}

impl BlockAddr {
    /// Create a new block address
    #[must_use]
    pub const fn new(col: usize, row: usize) -> Self {
        Self { col, row }
    }
}

/// Cache key: unique per band and block address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("{band}{addr}")]
pub struct BlockKey {
    /// Owning band
    pub band: BandId,
    /// Position in the band's block grid
    pub addr: BlockAddr,
}

impl BlockKey {
    /// Create a new block key
    #[must_use]
    pub const fn new(band: BandId, col: usize, row: usize) -> Self {
        Self {
            band,
            addr: BlockAddr::new(col, row),
        }
    }
}

/// Pixel element type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Byte,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
    /// Pair of `f32` (real, imaginary)
    CFloat32,
    /// Pair of `f64` (real, imaginary)
    CFloat64,
}

impl DataType {
    /// Size of one element in bytes
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::UInt64 | Self::Int64 | Self::Float64 | Self::CFloat32 => 8,
            Self::CFloat64 => 16,
        }
    }

    /// Size of one scalar component (half the element size for complex types)
    #[must_use]
    pub const fn component_size(self) -> usize {
        if self.is_complex() {
            self.size_bytes() / 2
        } else {
            self.size_bytes()
        }
    }

    /// Check if the type stores complex values
    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::CFloat32 | Self::CFloat64)
    }

    /// Check if the type is a floating point type
    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(
            self,
            Self::Float32 | Self::Float64 | Self::CFloat32 | Self::CFloat64
        )
    }

    /// Map an ENVI `data type` code to a data type
    #[must_use]
    pub const fn from_envi_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Byte),
            2 => Some(Self::Int16),
            3 => Some(Self::Int32),
            4 => Some(Self::Float32),
            5 => Some(Self::Float64),
            6 => Some(Self::CFloat32),
            9 => Some(Self::CFloat64),
            12 => Some(Self::UInt16),
            13 => Some(Self::UInt32),
            14 => Some(Self::Int64),
            15 => Some(Self::UInt64),
            _ => None,
        }
    }

    /// ENVI `data type` code for this type
    #[must_use]
    pub const fn envi_code(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Int16 => 2,
            Self::Int32 => 3,
            Self::Float32 => 4,
            Self::Float64 => 5,
            Self::CFloat32 => 6,
            Self::CFloat64 => 9,
            Self::UInt16 => 12,
            Self::UInt32 => 13,
            Self::Int64 => 14,
            Self::UInt64 => 15,
        }
    }

    /// Read one native-endian element as `f64`
    ///
    /// Complex types yield their real component.
    #[must_use]
    pub fn read_sample(self, bytes: &[u8]) -> f64 {
        macro_rules! ne {
            ($t:ty) => {{
                const N: usize = std::mem::size_of::<$t>();
                let mut raw = [0u8; N];
                raw.copy_from_slice(&bytes[..N]);
                <$t>::from_ne_bytes(raw) as f64
            }};
        }
        match self {
            Self::Byte => f64::from(bytes[0]),
            Self::UInt16 => ne!(u16),
            Self::Int16 => ne!(i16),
            Self::UInt32 => ne!(u32),
            Self::Int32 => ne!(i32),
            Self::UInt64 => ne!(u64),
            Self::Int64 => ne!(i64),
            Self::Float32 | Self::CFloat32 => ne!(f32),
            Self::Float64 | Self::CFloat64 => ne!(f64),
        }
    }

    /// Write `value` as one native-endian element
    ///
    /// Integer types round and saturate; complex types get a zero
    /// imaginary component.
    pub fn write_sample(self, value: f64, out: &mut [u8]) {
        macro_rules! put_int {
            ($t:ty) => {{
                let v = if value.is_nan() {
                    0 as $t
                } else {
                    value.round().clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t
                };
                out[..std::mem::size_of::<$t>()].copy_from_slice(&v.to_ne_bytes());
            }};
        }
        match self {
            Self::Byte => put_int!(u8),
            Self::UInt16 => put_int!(u16),
            Self::Int16 => put_int!(i16),
            Self::UInt32 => put_int!(u32),
            Self::Int32 => put_int!(i32),
            Self::UInt64 => put_int!(u64),
            Self::Int64 => put_int!(i64),
            Self::Float32 => out[..4].copy_from_slice(&(value as f32).to_ne_bytes()),
            Self::Float64 => out[..8].copy_from_slice(&value.to_ne_bytes()),
            Self::CFloat32 => {
                out[..4].copy_from_slice(&(value as f32).to_ne_bytes());
                out[4..8].fill(0);
            }
            Self::CFloat64 => {
                out[..8].copy_from_slice(&value.to_ne_bytes());
                out[8..16].fill(0);
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Byte order of stored samples
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Byte order of the running machine
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::BigEndian
        } else {
            Self::LittleEndian
        }
    }

    /// Check if samples in this order must be swapped to become native
    #[must_use]
    pub const fn needs_swap(self) -> bool {
        !matches!(
            (self, Self::native()),
            (Self::LittleEndian, Self::LittleEndian) | (Self::BigEndian, Self::BigEndian)
        )
    }

    /// Reverse the bytes of every scalar component in `buf`
    ///
    /// Complex types swap the real and imaginary parts independently.
    pub fn swap_in_place(buf: &mut [u8], data_type: DataType) {
        let width = data_type.component_size();
        if width <= 1 {
            return;
        }
        for component in buf.chunks_exact_mut(width) {
            component.reverse();
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Arrangement of band, line and pixel bytes in storage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interleave {
    /// Band sequential: each band is a contiguous image
    Bsq,
    /// Line interleaved: one line of every band, then the next line
    Bil,
    /// Pixel interleaved: all bands of one pixel are adjacent
    Bip,
}

impl Interleave {
    /// Parse a header keyword, matching case-insensitively by prefix
    ///
    /// Returns `None` for anything that is not `bsq`, `bil` or `bip`.
    #[must_use]
    pub fn parse_keyword(keyword: &str) -> Option<Self> {
        let lower = keyword.trim().to_ascii_lowercase();
        if lower.starts_with("bsq") {
            Some(Self::Bsq)
        } else if lower.starts_with("bil") {
            Some(Self::Bil)
        } else if lower.starts_with("bip") {
            Some(Self::Bip)
        } else {
            None
        }
    }

    /// Parse a header keyword, falling back to band sequential
    #[must_use]
    pub fn parse_or_bsq(keyword: &str) -> Self {
        Self::parse_keyword(keyword).unwrap_or_else(|| {
            warn!(
                keyword,
                "unset or unknown interleave keyword, assuming band sequential"
            );
            Self::Bsq
        })
    }

    /// Keyword written to headers
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Bsq => "bsq",
            Self::Bil => "bil",
            Self::Bip => "bip",
        }
    }
}

impl fmt::Display for Interleave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Direction of an I/O request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RwFlag {
    Read,
    Write,
}

/// Dataset access mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    ReadOnly,
    Update,
}

/// Resampling algorithm for non 1:1 requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResampleAlg {
    #[default]
    Nearest,
    Bilinear,
    /// Catmull-Rom cubic convolution
    Cubic,
    /// Mean of all source pixels covered by the output pixel
    Average,
}

impl FromStr for ResampleAlg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "near" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "cubic" => Ok(Self::Cubic),
            "average" => Ok(Self::Average),
            other => Err(format!("unknown resampling algorithm: {other}")),
        }
    }
}

/// Pixel window inside a raster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("{x_size}x{y_size}+{x_off}+{y_off}")]
pub struct Window {
    pub x_off: usize,
    pub y_off: usize,
    pub x_size: usize,
    pub y_size: usize,
}

impl Window {
    /// Create a new window
    #[must_use]
    pub const fn new(x_off: usize, y_off: usize, x_size: usize, y_size: usize) -> Self {
        Self {
            x_off,
            y_off,
            x_size,
            y_size,
        }
    }

    /// Window covering a whole raster
    #[must_use]
    pub const fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Check that the window is non-empty and lies inside a raster
    #[must_use]
    pub fn fits_in(&self, width: usize, height: usize) -> bool {
        self.x_size > 0
            && self.y_size > 0
            && self
                .x_off
                .checked_add(self.x_size)
                .is_some_and(|end| end <= width)
            && self
                .y_off
                .checked_add(self.y_size)
                .is_some_and(|end| end <= height)
    }
}
