//! Store configuration.
//!
//! A `StoreConfig` names the two backing files and the sizing knobs of the
//! index file. Values can be built in code or loaded from `COWTREE_*`
//! environment variables.
//!
//! # Environment Variables
//!
//! - `COWTREE_INDEX_FILE` (required): path of the index (block) file
//! - `COWTREE_KV_FILE` (required): path of the key/value append log
//! - `COWTREE_SECTOR_SIZE`, `COWTREE_FREE_LIST_SIZE`, `COWTREE_BLOCK_SIZE`
//! - `COWTREE_MAX_LEVEL`, `COWTREE_REBALANCE_THRESHOLD`, `COWTREE_DRAIN_RATE`
//! - `COWTREE_MAX_LEAF_CACHE`, `COWTREE_MAX_KV_CACHE`, `COWTREE_APPEND_RATIO`
//! - `COWTREE_SYNC`, `COWTREE_NO_CACHE` (`true`/`false`, `1`/`0`)

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::storage::block;
use crate::storage::head::HEAD_RECORD_SIZE;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// A required environment variable is missing.
    MissingEnvVar(String),
    /// An option has an invalid value.
    InvalidValue { name: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration of one store (index file + key/value log).
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Path of the index file holding head, free list and node blocks.
    pub index_file: PathBuf,
    /// Path of the append-only key/docid/value log.
    pub kv_file: PathBuf,
    /// Size of each head copy in bytes.
    pub sector_size: u64,
    /// Size of each free-list copy in bytes.
    pub free_list_size: u64,
    /// Size of a node block in bytes.
    pub block_size: u64,
    /// Tree height budget. Sizes the free-list low watermark.
    pub max_level: usize,
    /// Occupancy under which a non-root node is rebalanced.
    /// `None` derives it from the block capacity.
    pub rebalance_threshold: Option<usize>,
    /// Number of queued changesets that triggers a drain.
    pub drain_rate: usize,
    /// Bound on cached leaf nodes.
    pub max_leaf_cache_entries: usize,
    /// Bound on cached log records.
    pub max_kv_cache_entries: usize,
    /// Fraction of free-list capacity to fill when the file is extended.
    pub append_ratio: f64,
    /// Sync both files after every flush.
    pub sync: bool,
    /// Disable the in-process node and record caches.
    pub no_cache: bool,
}

impl StoreConfig {
    pub const DEFAULT_SECTOR_SIZE: u64 = 512;
    pub const DEFAULT_FREE_LIST_SIZE: u64 = 1024 * 8;
    pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;
    pub const DEFAULT_MAX_LEVEL: usize = 6;
    pub const DEFAULT_DRAIN_RATE: usize = 100;
    pub const DEFAULT_MAX_LEAF_CACHE_ENTRIES: usize = 1000;
    pub const DEFAULT_MAX_KV_CACHE_ENTRIES: usize = 10_000;
    pub const DEFAULT_APPEND_RATIO: f64 = 0.7;

    /// Create a configuration with default sizing for the given files.
    #[must_use]
    pub fn new(index_file: impl Into<PathBuf>, kv_file: impl Into<PathBuf>) -> Self {
        Self {
            index_file: index_file.into(),
            kv_file: kv_file.into(),
            sector_size: Self::DEFAULT_SECTOR_SIZE,
            free_list_size: Self::DEFAULT_FREE_LIST_SIZE,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_level: Self::DEFAULT_MAX_LEVEL,
            rebalance_threshold: None,
            drain_rate: Self::DEFAULT_DRAIN_RATE,
            max_leaf_cache_entries: Self::DEFAULT_MAX_LEAF_CACHE_ENTRIES,
            max_kv_cache_entries: Self::DEFAULT_MAX_KV_CACHE_ENTRIES,
            append_ratio: Self::DEFAULT_APPEND_RATIO,
            sync: false,
            no_cache: false,
        }
    }

    #[must_use]
    pub const fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub const fn with_free_list_size(mut self, free_list_size: u64) -> Self {
        self.free_list_size = free_list_size;
        self
    }

    #[must_use]
    pub const fn with_rebalance_threshold(mut self, threshold: usize) -> Self {
        self.rebalance_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub const fn with_drain_rate(mut self, drain_rate: usize) -> Self {
        self.drain_rate = drain_rate;
        self
    }

    #[must_use]
    pub const fn with_max_leaf_cache_entries(mut self, entries: usize) -> Self {
        self.max_leaf_cache_entries = entries;
        self
    }

    #[must_use]
    pub const fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub const fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Load configuration from `COWTREE_*` environment variables.
    ///
    /// The file paths are required, every other option falls back to its
    /// default. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
        };

        let mut config = Self::new(required("COWTREE_INDEX_FILE")?, required("COWTREE_KV_FILE")?);

        if let Some(value) = parse_var(&lookup, "COWTREE_SECTOR_SIZE")? {
            config.sector_size = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_FREE_LIST_SIZE")? {
            config.free_list_size = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_BLOCK_SIZE")? {
            config.block_size = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_MAX_LEVEL")? {
            config.max_level = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_REBALANCE_THRESHOLD")? {
            config.rebalance_threshold = Some(value);
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_DRAIN_RATE")? {
            config.drain_rate = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_MAX_LEAF_CACHE")? {
            config.max_leaf_cache_entries = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_MAX_KV_CACHE")? {
            config.max_kv_cache_entries = value;
        }
        if let Some(value) = parse_var(&lookup, "COWTREE_APPEND_RATIO")? {
            config.append_ratio = value;
        }
        if let Some(value) = lookup("COWTREE_SYNC") {
            config.sync = parse_flag("COWTREE_SYNC", &value)?;
        }
        if let Some(value) = lookup("COWTREE_NO_CACHE") {
            config.no_cache = parse_flag("COWTREE_NO_CACHE", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the sizing options describe a usable file layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sector_size < HEAD_RECORD_SIZE as u64 {
            return Err(invalid(
                "sector_size",
                format!("must be at least {HEAD_RECORD_SIZE} bytes"),
            ));
        }
        if self.max_level == 0 {
            return Err(invalid("max_level", "must be at least 1".to_string()));
        }
        if self.free_list_size % 8 != 0 || self.free_list_size < 16 {
            return Err(invalid(
                "free_list_size",
                "must be a multiple of 8 and at least 16".to_string(),
            ));
        }
        let capacity = freelist_capacity(self.free_list_size);
        if capacity < 4 * self.max_level {
            return Err(invalid(
                "free_list_size",
                format!("holds {capacity} offsets, needs at least {}", 4 * self.max_level),
            ));
        }
        let max_keys = block::max_keys(self.block_size);
        if max_keys < 4 {
            return Err(invalid(
                "block_size",
                format!("{} bytes cannot hold 4 keys", self.block_size),
            ));
        }
        if let Some(threshold) = self.rebalance_threshold {
            let limit = max_keys * 3 / 10;
            if threshold == 0 || threshold > limit {
                return Err(invalid(
                    "rebalance_threshold",
                    format!("must be within 1..={limit} for {max_keys} keys per block"),
                ));
            }
        }
        if self.drain_rate == 0 {
            return Err(invalid("drain_rate", "must be at least 1".to_string()));
        }
        if !(self.append_ratio > 0.0 && self.append_ratio <= 1.0) {
            return Err(invalid("append_ratio", "must be within (0, 1]".to_string()));
        }
        Ok(())
    }

    /// Derive the file layout from the sizing options.
    #[must_use]
    pub fn layout(&self) -> Layout {
        let max_keys = block::max_keys(self.block_size);
        Layout {
            sector_size: self.sector_size,
            free_list_size: self.free_list_size,
            block_size: self.block_size,
            first_block_offset: 2 * self.sector_size + 2 * self.free_list_size,
            max_keys,
            rebalance_threshold: self.rebalance_threshold.unwrap_or((max_keys / 4).max(1)),
            freelist_capacity: freelist_capacity(self.free_list_size),
            max_level: self.max_level,
        }
    }
}

/// Sizes derived from a validated [`StoreConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub sector_size: u64,
    pub free_list_size: u64,
    pub block_size: u64,
    /// Offset of the first block of the pool.
    pub first_block_offset: u64,
    /// Maximum keys per node. Always even.
    pub max_keys: usize,
    pub rebalance_threshold: usize,
    /// Number of offsets one free-list copy can hold.
    pub freelist_capacity: usize,
    pub max_level: usize,
}

impl Layout {
    /// Offset of the second head copy.
    #[must_use]
    pub const fn head_copy2_offset(&self) -> u64 {
        self.sector_size
    }

    /// Offset of the first free-list copy.
    #[must_use]
    pub const fn freelist_copy1_offset(&self) -> u64 {
        2 * self.sector_size
    }

    /// Offset of the second free-list copy.
    #[must_use]
    pub const fn freelist_copy2_offset(&self) -> u64 {
        2 * self.sector_size + self.free_list_size
    }

    /// Whether `offset` names a block of the pool.
    #[must_use]
    pub const fn is_block_offset(&self, offset: u64) -> bool {
        offset >= self.first_block_offset
            && (offset - self.first_block_offset) % self.block_size == 0
    }
}

const fn freelist_capacity(free_list_size: u64) -> usize {
    ((free_list_size.saturating_sub(8)) / 8) as usize
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        Some(value) => value.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        }),
        None => Ok(None),
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}
