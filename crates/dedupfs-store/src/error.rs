//! Error types for the dedupfs block store.

use std::io;

use thiserror::Error;

use crate::fblock::FBlockId;

/// Result type alias for block store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// All errors that can occur while building or reading an fblock store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps I/O errors that are not resource exhaustion.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The process ran out of file descriptors and no peer could release one.
    #[error("Descriptor exhaustion on fblock {fblock}: no open fblock could be closed")]
    DescriptorExhausted {
        /// The fblock that tried to open its file.
        fblock: FBlockId,
    },

    /// The disk is full and emergency space recovery could not help.
    #[error("Disk full writing fblock {fblock}: {source}")]
    DiskFull {
        /// The fblock being written.
        fblock: FBlockId,
        /// The final write error.
        source: io::Error,
    },

    /// Compression operation failed.
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Decompression operation failed.
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// Search tables cannot be built for an empty needle.
    #[error("Cannot preprocess an empty needle")]
    EmptyNeedle,

    /// The fblock id was never allocated by this set.
    #[error("Unknown fblock: {0}")]
    UnknownFBlock(FBlockId),

    /// A block location points past the end of its fblock.
    #[error("Block out of range: fblock {fblock} offset {offset} len {len}, fblock holds {size} bytes")]
    BlockOutOfRange {
        /// The fblock holding the block.
        fblock: FBlockId,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Raw size of the fblock.
        size: u64,
    },

    /// A block cannot fit in any fblock.
    #[error("Block of {len} bytes exceeds fblock capacity {capacity}")]
    BlockTooLarge {
        /// Block length.
        len: u64,
        /// Configured fblock capacity.
        capacity: u64,
    },

    /// A backup could not be restored.
    #[error("Restore failed for fblock {fblock}: {reason}")]
    RestoreFailed {
        /// The fblock that could not be rolled back.
        fblock: FBlockId,
        /// Description of the problem.
        reason: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// True if this is an I/O error caused by a full disk or quota.
    pub fn is_disk_exhaustion(&self) -> bool {
        matches!(self, StoreError::Io(e) if classify(e) == Some(Exhaustion::Disk))
    }

    /// Turn a disk exhaustion I/O error into the fatal `DiskFull` error.
    pub(crate) fn into_disk_full(self, fblock: FBlockId) -> StoreError {
        match self {
            StoreError::Io(source) if classify(&source) == Some(Exhaustion::Disk) => {
                StoreError::DiskFull { fblock, source }
            }
            other => other,
        }
    }
}

/// Resource exhaustion class of an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Out of file descriptors (`EMFILE`, `ENFILE`).
    Descriptors,
    /// Out of disk space or quota (`ENOSPC`, `EDQUOT`).
    Disk,
}

/// Classify an I/O error as one of the recoverable exhaustion conditions.
pub fn classify(err: &io::Error) -> Option<Exhaustion> {
    match err.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) => Some(Exhaustion::Descriptors),
        Some(libc::ENOSPC) | Some(libc::EDQUOT) => Some(Exhaustion::Disk),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_descriptor_errors() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify(&err), Some(Exhaustion::Descriptors));
        let err = io::Error::from_raw_os_error(libc::ENFILE);
        assert_eq!(classify(&err), Some(Exhaustion::Descriptors));
    }

    #[test]
    fn test_classify_disk_errors() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(classify(&err), Some(Exhaustion::Disk));
        let err = io::Error::from_raw_os_error(libc::EDQUOT);
        assert_eq!(classify(&err), Some(Exhaustion::Disk));
    }

    #[test]
    fn test_classify_other_errors() {
        let err = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(classify(&err), None);
        let err = io::Error::new(io::ErrorKind::Other, "plain");
        assert_eq!(classify(&err), None);
    }

    #[test]
    fn test_disk_full_display() {
        let err = StoreError::DiskFull {
            fblock: FBlockId(7),
            source: io::Error::from_raw_os_error(libc::ENOSPC),
        };
        assert!(err.to_string().contains("fblock 7"));
    }

    #[test]
    fn test_into_disk_full_only_for_disk_errors() {
        let err = StoreError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(err.is_disk_exhaustion());
        assert!(matches!(
            err.into_disk_full(FBlockId(3)),
            StoreError::DiskFull { fblock: FBlockId(3), .. }
        ));

        let err = StoreError::Io(io::Error::from_raw_os_error(libc::EIO));
        assert!(!err.is_disk_exhaustion());
        assert!(matches!(err.into_disk_full(FBlockId(3)), StoreError::Io(_)));
    }

    #[test]
    fn test_block_out_of_range_display() {
        let err = StoreError::BlockOutOfRange {
            fblock: FBlockId(1),
            offset: 100,
            len: 10,
            size: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("offset 100"));
        assert!(msg.contains("50 bytes"));
    }
}
