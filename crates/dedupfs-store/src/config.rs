//! Store configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compression::CompressionAlgorithm;
use crate::error::{StoreError, StoreResult};
use crate::fblock::FBlockId;

/// Placeholder replaced by the fblock id in [`StoreConfig::name_pattern`].
pub const ID_PLACEHOLDER: &str = "{id}";

/// Representation used for data written by whole-container replacement and
/// left behind by [`crate::BlockStore::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WritePolicy {
    /// Keep containers uncompressed; compress only under disk pressure.
    Raw,
    /// Store containers compressed once they are finished.
    #[default]
    Compressed,
}

/// Configuration for an fblock store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the fblock files.
    pub dir: PathBuf,
    /// File name pattern; `{id}` is replaced by the decimal fblock id.
    pub name_pattern: String,
    /// Maximum raw size of a single fblock in bytes (default 16MB).
    pub fblock_capacity: u64,
    /// Block size used when chunking input streams (default 64KB).
    pub block_size: usize,
    /// Codec for compressed fblocks.
    pub compression: CompressionAlgorithm,
    /// Representation policy for finished fblocks.
    pub write_policy: WritePolicy,
    /// Shortest trailing overlap worth reusing, in bytes.
    pub minimum_overlap: usize,
    /// Stride of partial-overlap candidate positions; 0 disables partial overlap.
    pub overlap_granularity: usize,
    /// Low-part width of block index keys: 16 or 24.
    pub index_low_bits: u32,
    /// Fblocks idle for more than this many access ticks are aged out.
    pub stale_after_ticks: u64,
    /// Every Nth emergency space request compresses a raw fblock.
    pub emergency_compress_every: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            name_pattern: "fblock-{id}.dat".to_string(),
            fblock_capacity: 16 * 1024 * 1024,
            block_size: 64 * 1024,
            compression: CompressionAlgorithm::default(),
            write_policy: WritePolicy::default(),
            minimum_overlap: 64,
            overlap_granularity: 1,
            index_low_bits: 16,
            stale_after_ticks: 64,
            emergency_compress_every: 4,
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the store cannot work with.
    pub fn validate(&self) -> StoreResult<()> {
        if !self.name_pattern.contains(ID_PLACEHOLDER) {
            return Err(StoreError::Config(format!(
                "name_pattern {:?} must contain {}",
                self.name_pattern, ID_PLACEHOLDER
            )));
        }
        if self.name_pattern.contains('/') {
            return Err(StoreError::Config(
                "name_pattern must be a plain file name".to_string(),
            ));
        }
        if self.fblock_capacity == 0 {
            return Err(StoreError::Config("fblock_capacity must be > 0".to_string()));
        }
        if self.block_size == 0 || self.block_size as u64 > self.fblock_capacity {
            return Err(StoreError::Config(format!(
                "block_size {} must be in 1..={}",
                self.block_size, self.fblock_capacity
            )));
        }
        if self.index_low_bits != 16 && self.index_low_bits != 24 {
            return Err(StoreError::Config(format!(
                "index_low_bits must be 16 or 24, got {}",
                self.index_low_bits
            )));
        }
        if self.emergency_compress_every == 0 {
            return Err(StoreError::Config(
                "emergency_compress_every must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the file backing fblock `id`.
    pub fn fblock_path(&self, id: FBlockId) -> PathBuf {
        self.dir
            .join(self.name_pattern.replace(ID_PLACEHOLDER, &id.0.to_string()))
    }
}
