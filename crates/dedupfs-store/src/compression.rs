//! LZ4 and Zstd codecs for compressed fblocks

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Codec used for every compressed fblock in a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// Stored as is
    None,
    /// LZ4 block with a prepended size header
    #[default]
    Lz4,
    /// Zstandard frame
    Zstd {
        /// Compression level (1..=22)
        level: i32,
    },
}

/// Encode a whole fblock.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> StoreResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => zstd::encode_all(data, level)
            .map_err(|e| StoreError::CompressionFailed(format!("zstd level {}: {}", level, e))),
    }
}

/// Decode a whole fblock.
///
/// Any stream the codec rejects is `DecompressionFailed`; partial output is
/// never returned.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> StoreResult<Vec<u8>> {
    let decoded = match algo {
        CompressionAlgorithm::None => return Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => {
            lz4_flex::decompress_size_prepended(data).map_err(|e| e.to_string())
        }
        CompressionAlgorithm::Zstd { .. } => zstd::decode_all(data).map_err(|e| e.to_string()),
    };
    decoded.map_err(StoreError::DecompressionFailed)
}

/// Quick probe on the first KiB: false when LZ4 saves less than 5%, which
/// is typical of already-compressed or random content.
pub fn is_compressible(data: &[u8]) -> bool {
    if data.len() < 64 {
        return true;
    }
    let sample = &data[..data.len().min(1024)];
    let packed = lz4_flex::compress_prepend_size(sample);
    packed.len() * 20 < sample.len() * 19
}
