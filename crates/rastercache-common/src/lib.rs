//! RasterCache Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and configuration
//! used across all RasterCache components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BlockStoreStrategy, CacheConfig};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
