//! Configuration types for RasterCache
//!
//! The block pool budget is process-wide and read once, on first use of the
//! global pool. Values come from a TOML document or from `RASTERCACHE_*`
//! environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Environment variable holding the cache budget
pub const ENV_CACHE_MAX: &str = "RASTERCACHE_CACHEMAX";

/// Environment variable enabling the hard cache limit
pub const ENV_HARD_LIMIT: &str = "RASTERCACHE_HARD_LIMIT";

/// Environment variable selecting the band block store strategy
pub const ENV_BLOCK_STORE: &str = "RASTERCACHE_BLOCK_STORE";

/// Default cache budget (64 MB)
pub const DEFAULT_CACHE_MAX: u64 = 64 * 1024 * 1024;

/// Largest block grid served by the array store in `Auto` mode
pub const DEFAULT_ARRAY_MAX_BLOCKS: usize = 1024 * 1024;

/// Strategy used by a band to index its cached blocks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStoreStrategy {
    /// Array for small grids, hash map otherwise
    #[default]
    Auto,
    /// Always a dense array (still subject to the size guard)
    Array,
    /// Always a hash map
    #[serde(alias = "hashset")]
    Hash,
}

impl BlockStoreStrategy {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "array" => Ok(Self::Array),
            "hash" | "hashset" => Ok(Self::Hash),
            other => Err(Error::configuration(format!(
                "unknown block store strategy: {other}"
            ))),
        }
    }
}

/// Block cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget shared by every open raster
    pub max_bytes: u64,
    /// Fail allocations instead of overrunning the budget when every
    /// cached block is locked
    pub hard_limit: bool,
    /// Band block store strategy
    pub block_store: BlockStoreStrategy,
    /// Array store size guard, in blocks
    pub array_max_blocks: usize,
    /// Fraction of the budget that, once dirty, reports flush pressure
    pub dirty_flush_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_CACHE_MAX,
            hard_limit: false,
            block_store: BlockStoreStrategy::Auto,
            array_max_blocks: DEFAULT_ARRAY_MAX_BLOCKS,
            dirty_flush_ratio: 0.8,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given byte budget
    #[must_use]
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    /// Parse a TOML document (every field optional)
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::configuration(format!("invalid cache config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read overrides from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`, starting from the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_CACHE_MAX) {
            config.max_bytes = parse_cache_max(&value)?;
        }
        if let Some(value) = lookup(ENV_HARD_LIMIT) {
            config.hard_limit = parse_bool(&value)?;
        }
        if let Some(value) = lookup(ENV_BLOCK_STORE) {
            config.block_store = BlockStoreStrategy::parse(&value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check invariants
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dirty_flush_ratio) {
            return Err(Error::configuration(format!(
                "dirty_flush_ratio must be within [0, 1], got {}",
                self.dirty_flush_ratio
            )));
        }
        Ok(())
    }
}

/// Parse a cache size
///
/// A bare number below 100,000 is megabytes, anything larger is bytes.
/// `KB`, `MB` and `GB` suffixes are accepted.
pub fn parse_cache_max(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix("GB") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024)
    } else {
        (upper.as_str(), 0)
    };

    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid cache size: {trimmed}")))?;

    let multiplier = match multiplier {
        0 if number < 100_000 => 1024 * 1024,
        0 => 1,
        m => m,
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::overflow(format!("cache size {trimmed} does not fit in u64")))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        other => Err(Error::configuration(format!("invalid boolean: {other}"))),
    }
}
