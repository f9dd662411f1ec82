//! Read buffers handed out by fblocks.

use std::fs::File;
use std::io;
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use memmap2::Mmap;

/// Bytes read from an fblock: either a zero-copy view of a live mapping or an
/// owned copy produced by a positioned read.
#[derive(Debug, Clone)]
pub enum ReadBuffer {
    /// Aliases the first `len` bytes of a shared mapping.
    Mapped {
        /// The mapping; kept alive for as long as the buffer is.
        map: Arc<Mmap>,
        /// Visible length.
        len: usize,
    },
    /// Freshly allocated buffer.
    Owned(Vec<u8>),
}

impl ReadBuffer {
    /// True if the buffer aliases a mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self, ReadBuffer::Mapped { .. })
    }

    /// Take the bytes, copying only if the buffer is mapped.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            ReadBuffer::Mapped { map, len } => map[..len].to_vec(),
            ReadBuffer::Owned(data) => data,
        }
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        ReadBuffer::Owned(Vec::new())
    }
}

impl Deref for ReadBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ReadBuffer::Mapped { map, len } => &map[..*len],
            ReadBuffer::Owned(data) => data,
        }
    }
}

impl AsRef<[u8]> for ReadBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

/// Positioned read of `len` bytes from the start of `file`.
pub(crate) fn read_owned(file: &File, len: usize) -> io::Result<ReadBuffer> {
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, 0)?;
    Ok(ReadBuffer::Owned(buf))
}
