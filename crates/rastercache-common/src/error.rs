//! Error types for RasterCache
//!
//! Block-scoped errors (`Decode`, `WriteBack`) never abort cache-wide
//! operations. Open-time errors (`Configuration`, `Overflow`) are fatal and
//! prevent any I/O on the dataset.

use crate::types::{BandId, BlockAddr};
use thiserror::Error;

/// Common result type for RasterCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Decode,
    WriteBack,
    Overflow,
    CancelledByCaller,
    OutOfMemory,
    ClosingFailure,
    LockConflict,
    InvalidArgument,
    Io,
    Closed,
    Internal,
}

/// Common error type for RasterCache
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid dimensions, data type or header content at open time
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("decode failed for {band} block {addr}: {message}")]
    Decode {
        band: BandId,
        addr: BlockAddr,
        message: String,
    },

    #[error("write-back failed for {band} block {addr}: {message}")]
    WriteBack {
        band: BandId,
        addr: BlockAddr,
        message: String,
    },

    /// Layout arithmetic exceeds the addressable byte range
    #[error("layout overflow: {0}")]
    Overflow(String),

    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("block cache exhausted: need {requested} bytes, budget {budget} bytes, all blocks locked")]
    OutOfMemory { requested: u64, budget: u64 },

    #[error("{dirty_blocks} dirty block(s) could not be written at close: {message}")]
    ClosingFailure { dirty_blocks: usize, message: String },

    #[error("lock conflict: {0}")]
    LockConflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset is closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an overflow error
    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::Overflow(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a decode error for one block
    pub fn decode(band: BandId, addr: BlockAddr, msg: impl ToString) -> Self {
        Self::Decode {
            band,
            addr,
            message: msg.to_string(),
        }
    }

    /// Create a write-back error for one block
    pub fn write_back(band: BandId, addr: BlockAddr, msg: impl ToString) -> Self {
        Self::WriteBack {
            band,
            addr,
            message: msg.to_string(),
        }
    }

    /// Get the structured kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::WriteBack { .. } => ErrorKind::WriteBack,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Cancelled => ErrorKind::CancelledByCaller,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::ClosingFailure { .. } => ErrorKind::ClosingFailure,
            Self::LockConflict(_) => ErrorKind::LockConflict,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Io(_) => ErrorKind::Io,
            Self::Closed => ErrorKind::Closed,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is isolated to a single block
    #[must_use]
    pub fn is_block_scoped(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::WriteBack { .. })
    }

    /// Check if this error prevents a dataset from opening
    #[must_use]
    pub fn is_fatal_at_open(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Overflow(_))
    }

    /// Check if this is a caller-requested stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
