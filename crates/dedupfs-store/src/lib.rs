#![warn(missing_docs)]

//! dedupfs block store: overlap-deduplicating fblocks with LZ4/Zstd compression
//!
//! Write path: Block → Fingerprint (BLAKE3) → Block index → Overlap search → Append to fblock
//! Read path:  Block location → Fblock (mmap or decompress) → Data

pub mod block_index;
pub mod builder;
pub mod compression;
pub mod config;
pub mod error;
pub mod fblock;
pub mod fblock_set;
pub mod fingerprint;
pub mod read_buffer;
pub mod search;

pub use block_index::BucketIndex;
pub use builder::{BlockLocation, BlockStore, BuildStats, Checkpoint};
pub use compression::CompressionAlgorithm;
pub use config::{StoreConfig, WritePolicy};
pub use error::{StoreError, StoreResult};
pub use fblock::{AccessClock, FBlock, FBlockGuard, FBlockId, Fetched, Reclaimer};
pub use fblock_set::{FBlockBackup, FBlockSet, RoomIndex, SetBackup, SetStats};
pub use fingerprint::{blake3_hash, ChunkHash};
pub use read_buffer::ReadBuffer;
pub use search::{analyze_append, AppendInfo, SearchTables};
