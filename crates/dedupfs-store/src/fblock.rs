//! Fblock storage: one file holding raw or compressed bytes.
//!
//! An fblock is either raw or compressed, and independently open or closed and
//! mapped or unmapped. `size` is always the current on-disk length. Whole
//! content replacement goes through a sibling temporary file that is renamed
//! over the fblock, so old content stays intact until the new content is
//! written and existing mappings stay valid. Appends are positioned writes past
//! the current end and are rolled back with a truncate if they fail.
//!
//! Descriptor and disk exhaustion are recovered here by asking the owning set
//! (through [`Reclaimer`]) to close peers or free space, then retrying.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compression::{compress, decompress, is_compressible, CompressionAlgorithm};
use crate::error::{classify, Exhaustion, StoreError, StoreResult};
use crate::read_buffer::{read_owned, ReadBuffer};
use crate::search::AppendInfo;

/// Dense fblock identifier, assigned by first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FBlockId(pub u32);

impl std::fmt::Display for FBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recovery hooks an fblock calls on its owning set when a resource runs out.
///
/// Implementations must not block on the requester's lock: the requester holds
/// it while calling.
pub trait Reclaimer: Send + Sync {
    /// Release the descriptor of some other fblock. Returns false if none could be closed.
    fn close_some(&self, requester: FBlockId) -> bool;
    /// Try to free disk space. Returns false if nothing was done.
    fn emergency_free_space(&self, requester: FBlockId) -> bool;
}

/// Logical clock ordering fblock accesses for LRU decisions.
#[derive(Debug, Default)]
pub struct AccessClock(AtomicU64);

impl AccessClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new tick.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current tick without advancing.
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Requested representations, produced by a single read of the fblock.
#[derive(Debug, Default)]
pub struct Fetched {
    /// Uncompressed content, if requested.
    pub raw: Option<ReadBuffer>,
    /// Compressed stream, if requested.
    pub compressed: Option<Vec<u8>>,
}

struct FBlockState {
    size: u64,
    compressed: bool,
    /// Uncompressed length when known; always `Some(size)` for raw fblocks.
    raw_len: Option<u64>,
    /// Bumped by every write that changes the on-disk content.
    generation: u64,
    file: Option<File>,
    writable: bool,
    map: Option<Arc<Mmap>>,
    #[cfg(test)]
    faults: faults::Faults,
}

/// A single storage container backed by one file.
pub struct FBlock {
    id: FBlockId,
    path: PathBuf,
    compression: CompressionAlgorithm,
    clock: Arc<AccessClock>,
    last_access: AtomicU64,
    reclaimer: Option<Weak<dyn Reclaimer>>,
    state: Mutex<FBlockState>,
}

impl std::fmt::Debug for FBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FBlock")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("last_access", &self.last_access())
            .finish()
    }
}

impl FBlock {
    /// Create an empty, unopened fblock. Nothing touches the disk until the
    /// first write.
    pub fn new(
        id: FBlockId,
        path: PathBuf,
        compression: CompressionAlgorithm,
        clock: Arc<AccessClock>,
        reclaimer: Option<Weak<dyn Reclaimer>>,
    ) -> Self {
        Self {
            id,
            path,
            compression,
            clock,
            last_access: AtomicU64::new(0),
            reclaimer,
            state: Mutex::new(FBlockState {
                size: 0,
                compressed: false,
                raw_len: Some(0),
                generation: 0,
                file: None,
                writable: false,
                map: None,
                #[cfg(test)]
                faults: faults::Faults::default(),
            }),
        }
    }

    /// An fblock with its own clock and nobody to ask for resources.
    pub fn standalone(id: FBlockId, path: PathBuf, compression: CompressionAlgorithm) -> Self {
        Self::new(id, path, compression, Arc::new(AccessClock::new()), None)
    }

    /// The fblock id.
    pub fn id(&self) -> FBlockId {
        self.id
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tick of the most recent lock.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Lock the fblock for exclusive use, recording the access.
    pub fn lock(&self) -> FBlockGuard<'_> {
        let state = self.state.lock();
        self.last_access.store(self.clock.tick(), Ordering::Relaxed);
        FBlockGuard { fblock: self, state }
    }

    /// Lock without recording an access.
    pub(crate) fn lock_untracked(&self) -> FBlockGuard<'_> {
        FBlockGuard {
            fblock: self,
            state: self.state.lock(),
        }
    }

    /// Lock without waiting and without recording an access. Used by the set
    /// manager when it inspects or evicts peers.
    pub fn try_lock(&self) -> Option<FBlockGuard<'_>> {
        self.state.try_lock().map(|state| FBlockGuard { fblock: self, state })
    }

    fn reclaimer(&self) -> Option<Arc<dyn Reclaimer>> {
        self.reclaimer.as_ref().and_then(Weak::upgrade)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// Exclusive access to one fblock. All storage operations live here so a
/// caller can analyze and append under the same lock.
pub struct FBlockGuard<'a> {
    fblock: &'a FBlock,
    state: MutexGuard<'a, FBlockState>,
}

impl<'a> FBlockGuard<'a> {
    /// The fblock id.
    pub fn id(&self) -> FBlockId {
        self.fblock.id
    }

    /// Current on-disk length.
    pub fn size(&self) -> u64 {
        self.state.size
    }

    /// Uncompressed length, if known.
    pub fn raw_len(&self) -> Option<u64> {
        self.state.raw_len
    }

    /// Content generation; changes whenever the on-disk bytes do.
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// True if the on-disk bytes are a compressed stream.
    pub fn is_compressed(&self) -> bool {
        self.state.compressed
    }

    /// True if a descriptor is held.
    pub fn is_open(&self) -> bool {
        self.state.file.is_some()
    }

    /// True if a mapping covering the current size is held.
    pub fn is_mapped(&self) -> bool {
        self.state
            .map
            .as_ref()
            .map(|m| m.len() as u64 == self.state.size)
            .unwrap_or(false)
    }

    /// Open the backing file, retrying after asking peers to release
    /// descriptors when the process has none left.
    pub fn ensure_open(&mut self, writing: bool, create_if_absent: bool) -> StoreResult<()> {
        if self.state.file.is_some() && (self.state.writable || !writing) {
            return Ok(());
        }
        let want_write = writing || create_if_absent;
        // a read-only descriptor is replaced, not kept alongside
        self.state.file = None;

        let mut options = OpenOptions::new();
        options.read(true);
        if want_write {
            // an empty fblock must not inherit bytes from a leftover file
            options
                .write(true)
                .create(create_if_absent)
                .truncate(create_if_absent && self.state.size == 0);
        }
        let path = self.fblock.path.clone();
        let file = self.open_with_retry(&path, &options)?;
        self.state.file = Some(file);
        self.state.writable = want_write;
        Ok(())
    }

    fn open_with_retry(&mut self, path: &Path, options: &OpenOptions) -> StoreResult<File> {
        loop {
            match self.open_file(path, options) {
                Ok(file) => return Ok(file),
                Err(e) if classify(&e) == Some(Exhaustion::Descriptors) => {
                    let closed = self
                        .fblock
                        .reclaimer()
                        .map(|r| r.close_some(self.fblock.id))
                        .unwrap_or(false);
                    if !closed {
                        warn!(fblock = %self.fblock.id, "out of descriptors, nothing left to close");
                        return Err(StoreError::DescriptorExhausted {
                            fblock: self.fblock.id,
                        });
                    }
                    debug!(fblock = %self.fblock.id, "peer descriptor released, retrying open");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn open_file(&mut self, path: &Path, options: &OpenOptions) -> io::Result<File> {
        #[cfg(test)]
        {
            if let Some(errno) = self.state.faults.open.pop_front() {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        options.open(path)
    }

    fn write_at(&mut self, file: &File, bytes: &[u8], offset: u64) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(errno) = self.state.faults.write.pop_front() {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        file.write_all_at(bytes, offset)
    }

    /// Map the file for reading if no mapping covers the current size.
    /// Returns false when mapping is impossible; callers then read buffered.
    pub fn ensure_mapped(&mut self) -> bool {
        let size = self.state.size;
        if size == 0 {
            return false;
        }
        if self.is_mapped() {
            return true;
        }
        self.state.map = None;
        if let Err(e) = self.ensure_open(false, false) {
            debug!(fblock = %self.fblock.id, error = %e, "cannot open for mapping");
            return false;
        }
        let Some(file) = self.state.file.as_ref() else {
            return false;
        };
        // SAFETY: fblock files are only ever extended in place or replaced by
        // rename, never truncated below a live mapping's length.
        match unsafe { MmapOptions::new().len(size as usize).map(file) } {
            Ok(map) => {
                self.state.map = Some(Arc::new(map));
                true
            }
            Err(e) => {
                debug!(fblock = %self.fblock.id, error = %e, "mmap failed, falling back to reads");
                false
            }
        }
    }

    /// One physical read of the on-disk bytes.
    fn read_disk(&mut self) -> StoreResult<ReadBuffer> {
        let size = self.state.size as usize;
        if size == 0 {
            return Ok(ReadBuffer::default());
        }
        if self.ensure_mapped() {
            if let Some(map) = &self.state.map {
                return Ok(ReadBuffer::Mapped {
                    map: Arc::clone(map),
                    len: size,
                });
            }
        }
        self.ensure_open(false, false)?;
        match self.state.file.as_ref() {
            Some(file) => Ok(read_owned(file, size)?),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "fblock file not open").into()),
        }
    }

    /// Return the requested representations from a single read.
    ///
    /// A compressed fblock whose stream does not decompress is re-marked raw
    /// and its on-disk bytes are served as raw content.
    pub fn get(&mut self, want_raw: bool, want_compressed: bool) -> StoreResult<Fetched> {
        let algo = self.fblock.compression;
        let disk = self.read_disk()?;

        if self.state.compressed {
            match decompress(&disk, algo) {
                Ok(raw) => {
                    self.state.raw_len = Some(raw.len() as u64);
                    return Ok(Fetched {
                        raw: want_raw.then(|| ReadBuffer::Owned(raw)),
                        compressed: want_compressed.then(|| disk.into_vec()),
                    });
                }
                Err(e) => {
                    warn!(
                        fblock = %self.fblock.id,
                        error = %e,
                        "compressed fblock does not decompress, treating as raw"
                    );
                    self.state.compressed = false;
                    self.state.raw_len = Some(self.state.size);
                }
            }
        }

        let compressed = if want_compressed {
            Some(compress(&disk, algo)?)
        } else {
            None
        };
        Ok(Fetched {
            raw: want_raw.then_some(disk),
            compressed,
        })
    }

    /// Uncompressed content.
    pub fn get_raw(&mut self) -> StoreResult<ReadBuffer> {
        Ok(self.get(true, false)?.raw.unwrap_or_default())
    }

    /// Compressed stream of the content.
    pub fn get_compressed(&mut self) -> StoreResult<Vec<u8>> {
        Ok(self.get(false, true)?.compressed.unwrap_or_default())
    }

    /// Write `bytes` to a temporary sibling and rename it over the fblock.
    fn replace_contents(&mut self, bytes: &[u8]) -> StoreResult<()> {
        let tmp = self.fblock.temp_path();
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        let file = self.open_with_retry(&tmp, &options)?;

        let written = self
            .write_at(&file, bytes, 0)
            .and_then(|_| std::fs::rename(&tmp, &self.fblock.path));
        if let Err(e) = written {
            drop(file);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        // the old mapping stays valid for readers still holding it
        self.state.map = None;
        self.state.file = Some(file);
        self.state.writable = true;
        self.state.size = bytes.len() as u64;
        self.state.generation += 1;
        Ok(())
    }

    /// Replace contents, asking the set for disk space once if the disk is full.
    fn replace_with_recovery(&mut self, bytes: &[u8], recover: bool) -> StoreResult<()> {
        let mut recovery_attempted = !recover;
        loop {
            match self.replace_contents(bytes) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_disk_exhaustion() && !recovery_attempted => {
                    recovery_attempted = true;
                    if !self.request_space() {
                        return Err(e.into_disk_full(self.fblock.id));
                    }
                    debug!(fblock = %self.fblock.id, "space freed, retrying write");
                }
                Err(e) => return Err(e.into_disk_full(self.fblock.id)),
            }
        }
    }

    fn request_space(&self) -> bool {
        self.fblock
            .reclaimer()
            .map(|r| r.emergency_free_space(self.fblock.id))
            .unwrap_or(false)
    }

    /// Overwrite with uncompressed bytes. If that write fails the same bytes
    /// are stored compressed instead; the write is never dropped.
    pub fn put_raw(&mut self, bytes: &[u8]) -> StoreResult<()> {
        match self.replace_contents(bytes) {
            Ok(()) => {
                self.state.compressed = false;
                self.state.raw_len = Some(bytes.len() as u64);
                debug!(fblock = %self.fblock.id, size = bytes.len(), "stored raw");
                Ok(())
            }
            Err(e @ StoreError::DescriptorExhausted { .. }) => Err(e),
            Err(e) => {
                warn!(fblock = %self.fblock.id, error = %e, "raw write failed, storing compressed");
                let packed = compress(bytes, self.fblock.compression)?;
                self.store_compressed(&packed, Some(bytes.len() as u64), true)
            }
        }
    }

    /// Overwrite with an already-compressed stream. A full disk triggers one
    /// emergency space request; any remaining failure is fatal.
    pub fn put_compressed(&mut self, bytes: &[u8]) -> StoreResult<()> {
        self.store_compressed(bytes, None, true)
    }

    fn store_compressed(
        &mut self,
        bytes: &[u8],
        raw_len: Option<u64>,
        recover: bool,
    ) -> StoreResult<()> {
        self.replace_with_recovery(bytes, recover)?;
        self.state.compressed = true;
        self.state.raw_len = raw_len;
        debug!(fblock = %self.fblock.id, size = bytes.len(), ?raw_len, "stored compressed");
        Ok(())
    }

    /// Overwrite in the configured-by-caller representation.
    pub fn put(&mut self, bytes: &[u8], compressed: bool) -> StoreResult<()> {
        if compressed {
            let packed = compress(bytes, self.fblock.compression)?;
            self.store_compressed(&packed, Some(bytes.len() as u64), true)
        } else {
            self.put_raw(bytes)
        }
    }

    /// Place `data` as described by `info`, which must have been computed
    /// against this fblock's current content.
    ///
    /// Covered data is a no-op. Compressed fblocks are decompressed first.
    /// Only the bytes past `old_size` are written.
    pub fn put_appended_raw(&mut self, info: &AppendInfo, data: &[u8]) -> StoreResult<()> {
        let len = data.len() as u64;
        assert!(
            info.append_base_offset <= info.appended_size,
            "append base {} beyond appended size {}",
            info.append_base_offset,
            info.appended_size
        );
        assert_eq!(
            info.appended_size,
            info.old_size.max(info.append_base_offset + len),
            "append info does not describe {} bytes of data",
            len
        );

        if info.is_covered(len) {
            if let Some(raw_len) = self.state.raw_len {
                assert_eq!(info.old_size, raw_len, "append info computed against stale fblock");
            }
            return Ok(());
        }

        if self.state.compressed {
            self.ensure_raw()?;
        }
        assert_eq!(
            info.old_size, self.state.size,
            "append info computed against stale fblock"
        );

        let suffix = &data[data.len() - info.growth() as usize..];
        self.ensure_open(true, true)?;
        let mut recovery_attempted = false;
        loop {
            let Some(file) = self.state.file.take() else {
                return Err(io::Error::new(io::ErrorKind::NotFound, "fblock file not open").into());
            };
            let result = self.write_at(&file, suffix, info.old_size);
            if result.is_err() {
                let _ = file.set_len(info.old_size);
            }
            self.state.file = Some(file);
            match result {
                Ok(()) => break,
                Err(e) if classify(&e) == Some(Exhaustion::Disk) && !recovery_attempted => {
                    recovery_attempted = true;
                    if !self.request_space() {
                        return Err(StoreError::DiskFull {
                            fblock: self.fblock.id,
                            source: e,
                        });
                    }
                    debug!(fblock = %self.fblock.id, "space freed, retrying append");
                }
                Err(e) => return Err(StoreError::from(e).into_disk_full(self.fblock.id)),
            }
        }

        self.state.size = info.appended_size;
        self.state.generation += 1;
        self.state.raw_len = Some(info.appended_size);
        debug!(
            fblock = %self.fblock.id,
            base = info.append_base_offset,
            written = suffix.len(),
            size = info.appended_size,
            "appended"
        );
        Ok(())
    }

    /// Rewrite a compressed fblock as raw. No fallback representation.
    pub fn ensure_raw(&mut self) -> StoreResult<()> {
        if !self.state.compressed {
            return Ok(());
        }
        let raw = self.get_raw()?;
        if !self.state.compressed {
            // stream was corrupt and the fblock was re-marked raw
            return Ok(());
        }
        let raw = raw.into_vec();
        self.replace_with_recovery(&raw, true)?;
        self.state.compressed = false;
        self.state.raw_len = Some(raw.len() as u64);
        debug!(fblock = %self.fblock.id, size = raw.len(), "decompressed");
        Ok(())
    }

    /// Rewrite a raw fblock compressed. Returns whether anything changed.
    pub fn ensure_compressed(&mut self) -> StoreResult<bool> {
        self.compress_in_place(true, false)
    }

    /// Compress to reclaim space on behalf of a peer. Never asks the set for
    /// space itself and skips content that does not compress.
    pub(crate) fn compress_for_space(&mut self) -> StoreResult<bool> {
        self.compress_in_place(false, true)
    }

    fn compress_in_place(&mut self, recover: bool, only_if_smaller: bool) -> StoreResult<bool> {
        if self.state.compressed || self.state.size == 0 {
            return Ok(false);
        }
        let raw = self.get_raw()?;
        if only_if_smaller && !is_compressible(&raw) {
            return Ok(false);
        }
        let packed = compress(&raw, self.fblock.compression)?;
        if only_if_smaller && packed.len() >= raw.len() {
            return Ok(false);
        }
        let raw_len = raw.len() as u64;
        drop(raw);
        self.store_compressed(&packed, Some(raw_len), recover)?;
        Ok(true)
    }

    /// Roll back to an earlier `(size, compressed, raw_len)` state captured
    /// at content `generation`.
    pub(crate) fn restore_to(
        &mut self,
        size: u64,
        compressed: bool,
        raw_len: Option<u64>,
        generation: u64,
    ) -> StoreResult<()> {
        if self.state.generation == generation {
            return Ok(());
        }
        if size == 0 {
            self.discard()?;
            return Ok(());
        }
        let target = if compressed {
            raw_len.ok_or_else(|| StoreError::RestoreFailed {
                fblock: self.fblock.id,
                reason: "uncompressed length at backup time is unknown".to_string(),
            })?
        } else {
            size
        };
        let raw = self.get_raw()?;
        if (raw.len() as u64) < target {
            return Err(StoreError::RestoreFailed {
                fblock: self.fblock.id,
                reason: format!("holds {} bytes, backup needs {}", raw.len(), target),
            });
        }
        let content = raw[..target as usize].to_vec();
        drop(raw);
        if compressed {
            let packed = compress(&content, self.fblock.compression)?;
            self.store_compressed(&packed, Some(target), true)
        } else {
            self.replace_with_recovery(&content, true)?;
            self.state.compressed = false;
            self.state.raw_len = Some(target);
            Ok(())
        }
    }

    /// Release the descriptor. Returns whether one was held.
    pub fn close(&mut self) -> bool {
        self.state.writable = false;
        self.state.file.take().is_some()
    }

    /// Drop the mapping. Returns whether one was held.
    pub fn unmap(&mut self) -> bool {
        self.state.map.take().is_some()
    }

    /// Flush written data to the device.
    pub fn sync(&mut self) -> StoreResult<()> {
        if let Some(file) = &self.state.file {
            if self.state.writable {
                file.sync_data()?;
            }
        }
        Ok(())
    }

    /// Delete the backing file and reset to empty.
    pub fn discard(&mut self) -> StoreResult<()> {
        self.close();
        self.unmap();
        match std::fs::remove_file(&self.fblock.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state.size = 0;
        self.state.generation += 1;
        self.state.compressed = false;
        self.state.raw_len = Some(0);
        debug!(fblock = %self.fblock.id, "discarded");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_open_errors(&mut self, errnos: &[i32]) {
        self.state.faults.open.extend(errnos.iter().copied());
    }

    #[cfg(test)]
    pub(crate) fn inject_write_errors(&mut self, errnos: &[i32]) {
        self.state.faults.write.extend(errnos.iter().copied());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::analyze_append;
    use std::sync::atomic::AtomicUsize;

    struct CountingReclaimer {
        closes_left: AtomicUsize,
        frees_left: AtomicUsize,
        close_calls: AtomicUsize,
        free_calls: AtomicUsize,
    }

    impl CountingReclaimer {
        fn new(closes: usize, frees: usize) -> Arc<Self> {
            Arc::new(Self {
                closes_left: AtomicUsize::new(closes),
                frees_left: AtomicUsize::new(frees),
                close_calls: AtomicUsize::new(0),
                free_calls: AtomicUsize::new(0),
            })
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl Reclaimer for CountingReclaimer {
        fn close_some(&self, _requester: FBlockId) -> bool {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Self::take(&self.closes_left)
        }
        fn emergency_free_space(&self, _requester: FBlockId) -> bool {
            self.free_calls.fetch_add(1, Ordering::SeqCst);
            Self::take(&self.frees_left)
        }
    }

    fn fblock_in(dir: &tempfile::TempDir) -> FBlock {
        FBlock::standalone(FBlockId(0), dir.path().join("fb-0"), CompressionAlgorithm::Lz4)
    }

    fn fblock_with(dir: &tempfile::TempDir, reclaimer: &Arc<CountingReclaimer>) -> FBlock {
        let strong: Arc<dyn Reclaimer> = reclaimer.clone();
        FBlock::new(
            FBlockId(0),
            dir.path().join("fb-0"),
            CompressionAlgorithm::Lz4,
            Arc::new(AccessClock::new()),
            Some(Arc::downgrade(&strong)),
        )
    }

    #[test]
    fn test_append_scenario_hello_world() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_appended_raw(&AppendInfo::new(0, 0, 5), b"HELLO").unwrap();
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLO");

        let info = AppendInfo {
            old_size: 5,
            append_base_offset: 3,
            appended_size: 10,
        };
        g.put_appended_raw(&info, b"LOWORLD").unwrap();
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLOWORLD");
        assert_eq!(g.size(), 10);
        assert_eq!(std::fs::read(dir.path().join("fb-0")).unwrap(), b"HELLOWORLD");
    }

    #[test]
    fn test_append_from_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"HELLO").unwrap();
        let hay = g.get_raw().unwrap();
        let info = analyze_append(b"LLOWORLD", 0, 1, 1, &hay);
        drop(hay);
        assert_eq!(info.append_base_offset, 2);
        g.put_appended_raw(&info, b"LLOWORLD").unwrap();
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLOWORLD");
    }

    #[test]
    fn test_covered_append_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"ABCABCABC").unwrap();
        let info = AppendInfo::new(9, 3, 3);
        g.put_appended_raw(&info, b"ABC").unwrap();
        assert_eq!(g.size(), 9);
    }

    #[test]
    #[should_panic(expected = "stale fblock")]
    fn test_stale_append_info_panics() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"HELLO").unwrap();
        g.put_appended_raw(&AppendInfo::new(3, 3, 2), b"XY").unwrap();
    }

    #[test]
    fn test_append_to_compressed_decompresses_first() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"HELLO").unwrap();
        assert!(g.ensure_compressed().unwrap());
        assert!(g.is_compressed());
        g.put_appended_raw(&AppendInfo::new(5, 5, 5), b"WORLD").unwrap();
        assert!(!g.is_compressed());
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLOWORLD");
    }

    #[test]
    fn test_compressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        let data = b"some repetitive data data data data data".repeat(20);
        let packed = compress(&data, CompressionAlgorithm::Lz4).unwrap();
        g.put_compressed(&packed).unwrap();
        assert!(g.is_compressed());
        assert_eq!(g.size(), packed.len() as u64);
        assert_eq!(g.get_raw().unwrap().into_vec(), data);
        assert_eq!(g.raw_len(), Some(data.len() as u64));
    }

    #[test]
    fn test_get_compressed_of_raw() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"plain bytes").unwrap();
        let packed = g.get_compressed().unwrap();
        assert_eq!(
            decompress(&packed, CompressionAlgorithm::Lz4).unwrap(),
            b"plain bytes"
        );
        let both = g.get(true, true).unwrap();
        assert_eq!(&both.raw.unwrap()[..], b"plain bytes");
        assert!(both.compressed.is_some());
    }

    #[test]
    fn test_raw_reads_are_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"mapped content").unwrap();
        let buf = g.get_raw().unwrap();
        assert!(buf.is_mapped());
        assert!(g.is_mapped());
    }

    #[test]
    fn test_mapping_survives_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"first version").unwrap();
        let old = g.get_raw().unwrap();
        g.put_raw(b"second").unwrap();
        assert_eq!(&old[..], b"first version");
        assert_eq!(&g.get_raw().unwrap()[..], b"second");
    }

    #[test]
    fn test_corrupt_compressed_served_as_raw() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        let garbage = [0x10u8, 0, 0, 0, 0xff, 0xff];
        g.put_compressed(&garbage).unwrap();
        let raw = g.get_raw().unwrap();
        assert_eq!(&raw[..], &garbage);
        assert!(!g.is_compressed());
    }

    #[test]
    fn test_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"abc").unwrap();
        g.unmap();
        assert!(g.close());
        assert!(!g.is_open());
        assert!(!g.close());
        assert_eq!(&g.get_raw().unwrap()[..], b"abc");
        assert!(g.is_open());
    }

    #[test]
    fn test_ensure_mapped_missing_file_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"abc").unwrap();
        g.close();
        g.unmap();
        std::fs::remove_file(dir.path().join("fb-0")).unwrap();
        assert!(!g.ensure_mapped());
    }

    #[test]
    fn test_descriptor_exhaustion_retries_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(1, 0);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.inject_open_errors(&[libc::EMFILE]);
        g.ensure_open(true, true).unwrap();
        assert!(g.is_open());
        assert_eq!(reclaimer.close_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_descriptor_exhaustion_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(1, 0);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.inject_open_errors(&[libc::EMFILE, libc::ENFILE, libc::EMFILE]);
        let err = g.ensure_open(true, true).unwrap_err();
        assert!(matches!(err, StoreError::DescriptorExhausted { .. }));
        assert_eq!(reclaimer.close_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_put_raw_falls_back_to_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.inject_write_errors(&[libc::ENOSPC]);
        g.put_raw(b"fallback fallback fallback").unwrap();
        assert!(g.is_compressed());
        assert_eq!(&g.get_raw().unwrap()[..], b"fallback fallback fallback");
    }

    #[test]
    fn test_put_compressed_retries_after_emergency() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(0, 1);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        let packed = compress(b"payload", CompressionAlgorithm::Lz4).unwrap();
        g.inject_write_errors(&[libc::ENOSPC]);
        g.put_compressed(&packed).unwrap();
        assert_eq!(reclaimer.free_calls.load(Ordering::SeqCst), 1);
        assert_eq!(&g.get_raw().unwrap()[..], b"payload");
    }

    #[test]
    fn test_put_compressed_fatal_when_nothing_freed() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(0, 0);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.inject_write_errors(&[libc::ENOSPC]);
        let err = g.put_compressed(b"x").unwrap_err();
        assert!(matches!(err, StoreError::DiskFull { .. }));
        assert!(!dir.path().join("fb-0.tmp").exists());
    }

    #[test]
    fn test_put_compressed_fatal_after_one_retry() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(0, 5);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.inject_write_errors(&[libc::ENOSPC, libc::ENOSPC]);
        let err = g.put_compressed(b"x").unwrap_err();
        assert!(matches!(err, StoreError::DiskFull { .. }));
        assert_eq!(reclaimer.free_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_append_disk_full_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(0, 0);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.put_appended_raw(&AppendInfo::new(0, 0, 5), b"HELLO").unwrap();
        g.inject_write_errors(&[libc::ENOSPC]);
        let err = g
            .put_appended_raw(&AppendInfo::new(5, 5, 5), b"WORLD")
            .unwrap_err();
        assert!(matches!(err, StoreError::DiskFull { .. }));
        assert_eq!(g.size(), 5);
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLO");
    }

    #[test]
    fn test_append_retries_after_emergency() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(0, 1);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.put_appended_raw(&AppendInfo::new(0, 0, 5), b"HELLO").unwrap();
        g.inject_write_errors(&[libc::ENOSPC]);
        g.put_appended_raw(&AppendInfo::new(5, 5, 5), b"WORLD").unwrap();
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLOWORLD");
    }

    #[test]
    fn test_append_other_io_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer = CountingReclaimer::new(0, 1);
        let fb = fblock_with(&dir, &reclaimer);
        let mut g = fb.lock();
        g.inject_write_errors(&[libc::EIO]);
        let err = g
            .put_appended_raw(&AppendInfo::new(0, 0, 5), b"HELLO")
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(reclaimer.free_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_compress_for_space_skips_incompressible() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        let mut x: u32 = 12345;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();
        g.put_raw(&noise).unwrap();
        assert!(!g.compress_for_space().unwrap());
        assert!(!g.is_compressed());
    }

    #[test]
    fn test_restore_to_truncates_appends() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"HELLO").unwrap();
        let saved = g.generation();
        g.put_appended_raw(&AppendInfo::new(5, 5, 5), b"WORLD").unwrap();
        assert_ne!(g.generation(), saved);
        g.restore_to(5, false, Some(5), saved).unwrap();
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLO");
    }

    #[test]
    fn test_restore_to_same_generation_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"HELLO").unwrap();
        let saved = g.generation();
        g.close();
        g.get_raw().unwrap();
        assert_eq!(g.generation(), saved);
        // nothing was written since `saved`, so the recorded shape is not consulted
        g.restore_to(2, true, None, saved).unwrap();
        assert_eq!(g.size(), 5);
        assert!(!g.is_compressed());
        assert_eq!(&g.get_raw().unwrap()[..], b"HELLO");
    }

    #[test]
    fn test_new_fblock_ignores_leftover_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fb-0"), b"stale content from an old run").unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_appended_raw(&AppendInfo::new(0, 0, 5), b"HELLO").unwrap();
        assert_eq!(std::fs::read(dir.path().join("fb-0")).unwrap(), b"HELLO");
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let mut g = fb.lock();
        g.put_raw(b"abc").unwrap();
        g.discard().unwrap();
        assert!(!dir.path().join("fb-0").exists());
        assert_eq!(g.size(), 0);
        assert!(g.get_raw().unwrap().is_empty());
    }

    #[test]
    fn test_lock_updates_last_access() {
        let dir = tempfile::tempdir().unwrap();
        let fb = fblock_in(&dir);
        let before = fb.last_access();
        drop(fb.lock());
        assert!(fb.last_access() > before);
        drop(fb.try_lock());
        let after = fb.last_access();
        drop(fb.try_lock());
        assert_eq!(fb.last_access(), after);
    }
}
