//! Block store builder: the write path tying the pieces together.
//!
//! Block → Fingerprint (BLAKE3) → Block index candidates → verify / overlap
//! search → append into an fblock → index the new location.

use std::io::Read;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block_index::BucketIndex;
use crate::config::{StoreConfig, WritePolicy};
use crate::error::{StoreError, StoreResult};
use crate::fblock::{FBlock, FBlockGuard, FBlockId};
use crate::fblock_set::{FBlockSet, SetBackup, SetStats};
use crate::fingerprint::blake3_hash;
use crate::search::{analyze_append, AppendInfo};

/// Idle fblocks are aged out after this many added blocks.
const MAINTENANCE_INTERVAL: u64 = 1024;

/// Where a block's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Fblock holding the bytes.
    pub fblock: FBlockId,
    /// Offset within the uncompressed fblock.
    pub offset: u64,
    /// Block length.
    pub len: u64,
}

impl BlockLocation {
    /// Location of the empty block; reading it touches no fblock.
    pub const EMPTY: BlockLocation = BlockLocation {
        fblock: FBlockId(0),
        offset: 0,
        len: 0,
    };
}

/// Counters for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    /// Blocks added.
    pub blocks: u64,
    /// Bytes handed to `add_block`.
    pub bytes_in: u64,
    /// Blocks that needed no new bytes at all.
    pub duplicate_blocks: u64,
    /// Bytes reused through partial overlaps.
    pub overlap_bytes_saved: u64,
    /// Bytes appended to fblocks.
    pub bytes_written: u64,
}

/// Build state captured by [`BlockStore::checkpoint`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    set: SetBackup,
    stats: BuildStats,
}

/// Deduplicating block store over an [`FBlockSet`].
pub struct BlockStore {
    set: FBlockSet,
    index: Mutex<BucketIndex<BlockLocation>>,
    stats: Mutex<BuildStats>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("set", &self.set)
            .field("indexed", &self.index.lock().len())
            .finish()
    }
}

impl BlockStore {
    /// Open a store with an empty set in `config.dir`.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let low_bits = config.index_low_bits;
        let set = FBlockSet::open(config)?;
        Ok(Self {
            set,
            index: Mutex::new(BucketIndex::new(low_bits)),
            stats: Mutex::new(BuildStats::default()),
        })
    }

    /// The underlying fblock set.
    pub fn set(&self) -> &FBlockSet {
        &self.set
    }

    /// Counters so far.
    pub fn stats(&self) -> BuildStats {
        self.stats.lock().clone()
    }

    fn config(&self) -> &StoreConfig {
        self.set.config()
    }

    /// Store one block and return where its bytes live.
    pub fn add_block(&self, data: &[u8]) -> StoreResult<BlockLocation> {
        if data.is_empty() {
            return Ok(BlockLocation::EMPTY);
        }
        let len = data.len() as u64;
        let capacity = self.config().fblock_capacity;
        if len > capacity {
            return Err(StoreError::BlockTooLarge { len, capacity });
        }

        let key = blake3_hash(data).index_key(64);
        let candidates: Vec<BlockLocation> =
            self.index.lock().candidates(key).copied().collect();

        // a fingerprint hit is only trusted after comparing bytes
        for cand in &candidates {
            if self.holds(cand, data)? {
                debug!(fblock = %cand.fblock, offset = cand.offset, len, "verified duplicate");
                self.record(len, 0, true);
                return Ok(*cand);
            }
        }

        let mut targets: Vec<FBlockId> = candidates.iter().map(|c| c.fblock).collect();
        if let Some(id) = self.set.find_container_with_room(len) {
            targets.push(id);
        }
        targets.sort_unstable();
        targets.dedup();

        let mut best: Option<(FBlockId, AppendInfo)> = None;
        for id in targets {
            let fb = self.set.get(id)?;
            let mut guard = fb.lock();
            let info = self.analyze(&mut guard, data)?;
            if info.appended_size > capacity {
                continue;
            }
            if best.map(|(_, b)| info.growth() < b.growth()).unwrap_or(true) {
                best = Some((id, info));
            }
        }

        let location = match best {
            Some((id, info)) => {
                let fb = self.set.get(id)?;
                match self.place(&fb, data, Some(info))? {
                    Some(location) => location,
                    None => self.place_new(data)?,
                }
            }
            None => self.place_new(data)?,
        };

        self.index.lock().insert(key, location);
        if self.stats.lock().blocks % MAINTENANCE_INTERVAL == 0 {
            self.set.free_idle_resources();
        }
        Ok(location)
    }

    /// Store a stream cut into `block_size` blocks.
    pub fn add_reader<R: Read>(&self, mut reader: R) -> StoreResult<Vec<BlockLocation>> {
        let block_size = self.config().block_size;
        let mut locations = Vec::new();
        let mut buf = vec![0u8; block_size];
        loop {
            let mut filled = 0;
            while filled < block_size {
                match reader.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if filled == 0 {
                break;
            }
            locations.push(self.add_block(&buf[..filled])?);
            if filled < block_size {
                break;
            }
        }
        Ok(locations)
    }

    /// Read a block back.
    pub fn read_block(&self, location: &BlockLocation) -> StoreResult<Bytes> {
        if location.len == 0 {
            return Ok(Bytes::new());
        }
        let fb = self.set.get(location.fblock)?;
        let mut guard = fb.lock();
        let raw = guard.get_raw()?;
        match location.offset.checked_add(location.len) {
            Some(end) if end <= raw.len() as u64 => Ok(Bytes::copy_from_slice(
                &raw[location.offset as usize..end as usize],
            )),
            _ => Err(StoreError::BlockOutOfRange {
                fblock: location.fblock,
                offset: location.offset,
                len: location.len,
                size: raw.len() as u64,
            }),
        }
    }

    /// Apply the write policy to every fblock, flush, and release descriptors
    /// and mappings.
    pub fn finish(&self) -> StoreResult<SetStats> {
        let compress = self.config().write_policy == WritePolicy::Compressed;
        for fb in self.set.fblocks() {
            let mut guard = fb.lock();
            if compress {
                guard.ensure_compressed()?;
            }
            guard.sync()?;
            guard.unmap();
            guard.close();
        }
        let stats = self.set.stats();
        info!(
            fblocks = stats.fblocks,
            compressed = stats.compressed,
            bytes_on_disk = stats.bytes_on_disk,
            "finished block store"
        );
        Ok(stats)
    }

    /// Capture the build state so a speculative step can be undone.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            set: self.set.backup(),
            stats: self.stats(),
        }
    }

    /// Undo everything since `checkpoint`, dropping index entries that point
    /// at bytes which no longer exist.
    pub fn rollback(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        // the index is pruned even if some fblock failed to roll back
        let restored = self.set.restore(&checkpoint.set);
        let saved = &checkpoint.set.fblocks;
        self.index.lock().retain(|loc| match saved.get(loc.fblock.0 as usize) {
            Some(fb) => fb
                .raw_len
                .map(|raw| loc.offset + loc.len <= raw)
                .unwrap_or(true),
            None => false,
        });
        *self.stats.lock() = checkpoint.stats.clone();
        restored
    }

    fn holds(&self, location: &BlockLocation, data: &[u8]) -> StoreResult<bool> {
        let fb = self.set.get(location.fblock)?;
        let mut guard = fb.lock();
        let raw = guard.get_raw()?;
        if location.len != data.len() as u64 {
            return Ok(false);
        }
        Ok(match location.offset.checked_add(location.len) {
            Some(end) if end <= raw.len() as u64 => {
                raw[location.offset as usize..end as usize] == *data
            }
            _ => false,
        })
    }

    fn analyze(&self, guard: &mut FBlockGuard<'_>, data: &[u8]) -> StoreResult<AppendInfo> {
        let haystack = guard.get_raw()?;
        Ok(analyze_append(
            data,
            0,
            self.config().minimum_overlap,
            self.config().overlap_granularity,
            &haystack,
        ))
    }

    /// Append into `fb`, re-analyzing if it changed since `planned` was
    /// computed. Returns `None` if the data no longer fits.
    fn place(
        &self,
        fb: &FBlock,
        data: &[u8],
        planned: Option<AppendInfo>,
    ) -> StoreResult<Option<BlockLocation>> {
        let len = data.len() as u64;
        let capacity = self.config().fblock_capacity;
        let mut guard = fb.lock();
        let info = match planned {
            Some(info) if guard.raw_len() == Some(info.old_size) => info,
            _ => self.analyze(&mut guard, data)?,
        };
        if info.appended_size > capacity {
            return Ok(None);
        }
        guard.put_appended_raw(&info, data)?;
        self.set.update_room(fb.id(), capacity - info.appended_size);
        drop(guard);

        self.record(len, info.growth(), info.is_covered(len));
        debug!(
            fblock = %fb.id(),
            offset = info.append_base_offset,
            len,
            written = info.growth(),
            "placed block"
        );
        Ok(Some(BlockLocation {
            fblock: fb.id(),
            offset: info.append_base_offset,
            len,
        }))
    }

    fn place_new(&self, data: &[u8]) -> StoreResult<BlockLocation> {
        let fb = self.set.create();
        debug!(fblock = %fb.id(), "opened new fblock");
        match self.place(&fb, data, None)? {
            Some(location) => Ok(location),
            None => Err(StoreError::BlockTooLarge {
                len: data.len() as u64,
                capacity: self.config().fblock_capacity,
            }),
        }
    }

    fn record(&self, len: u64, written: u64, duplicate: bool) {
        let mut stats = self.stats.lock();
        stats.blocks += 1;
        stats.bytes_in += len;
        stats.bytes_written += written;
        if duplicate {
            stats.duplicate_blocks += 1;
        } else {
            stats.overlap_bytes_saved += len - written;
        }
    }
}
