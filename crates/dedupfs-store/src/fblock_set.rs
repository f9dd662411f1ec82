//! The fblock set: owns every fblock, the free-space index and the
//! descriptor/disk recovery policy.
//!
//! Lock order: the set lock is never held while waiting on an fblock lock.
//! Peers are only ever try-locked from recovery paths, because the fblock
//! asking for help is holding its own lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::fblock::{AccessClock, FBlock, FBlockId, Reclaimer};

/// Sorted multi-map from free room to fblock id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomIndex {
    by_room: BTreeSet<(u64, FBlockId)>,
    room_of: HashMap<FBlockId, u64>,
}

impl RoomIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `id`. A room of zero removes it.
    pub fn update(&mut self, id: FBlockId, room: u64) {
        if let Some(old) = self.room_of.remove(&id) {
            self.by_room.remove(&(old, id));
        }
        if room > 0 {
            self.by_room.insert((room, id));
            self.room_of.insert(id, room);
        }
    }

    /// Fblock with the least room that still has at least `at_least` bytes.
    pub fn find(&self, at_least: u64) -> Option<FBlockId> {
        self.by_room
            .range((at_least, FBlockId(0))..)
            .next()
            .map(|&(_, id)| id)
    }

    /// Recorded room of `id`.
    pub fn room(&self, id: FBlockId) -> Option<u64> {
        self.room_of.get(&id).copied()
    }

    /// Drop entries for ids at or above `count`.
    fn truncate(&mut self, count: usize) {
        let stale: Vec<FBlockId> = self
            .room_of
            .keys()
            .filter(|id| id.0 as usize >= count)
            .copied()
            .collect();
        for id in stale {
            self.update(id, 0);
        }
    }

    /// Number of fblocks with room.
    pub fn len(&self) -> usize {
        self.room_of.len()
    }

    /// True if no fblock has room.
    pub fn is_empty(&self) -> bool {
        self.room_of.is_empty()
    }
}

/// State of one fblock captured by [`FBlockSet::backup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FBlockBackup {
    /// On-disk size.
    pub size: u64,
    /// Compression state.
    pub compressed: bool,
    /// Uncompressed length, if known.
    pub raw_len: Option<u64>,
    /// Content generation at backup time.
    pub generation: u64,
}

/// Snapshot of the whole set, for rolling back a speculative build step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetBackup {
    /// Per-fblock state, indexed by id.
    pub fblocks: Vec<FBlockBackup>,
    /// Free-space index at backup time.
    pub rooms: RoomIndex,
}

impl SetBackup {
    /// Number of fblocks at backup time.
    pub fn count(&self) -> usize {
        self.fblocks.len()
    }
}

/// Resource usage of the set. Busy fblocks are counted as `busy` only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStats {
    /// Number of fblocks.
    pub fblocks: usize,
    /// Fblocks holding a descriptor.
    pub open: usize,
    /// Fblocks holding a mapping.
    pub mapped: usize,
    /// Fblocks stored compressed.
    pub compressed: usize,
    /// Total on-disk bytes.
    pub bytes_on_disk: u64,
    /// Fblocks locked by someone else while collecting.
    pub busy: usize,
}

struct SetState {
    fblocks: Vec<Arc<FBlock>>,
    rooms: RoomIndex,
}

struct SetShared {
    config: StoreConfig,
    clock: Arc<AccessClock>,
    self_ref: Weak<SetShared>,
    emergency_calls: AtomicU64,
    state: Mutex<SetState>,
}

/// Owner of all fblocks in one store.
#[derive(Clone)]
pub struct FBlockSet {
    shared: Arc<SetShared>,
}

impl std::fmt::Debug for FBlockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FBlockSet")
            .field("dir", &self.shared.config.dir)
            .field("fblocks", &self.len())
            .finish()
    }
}

impl FBlockSet {
    /// Open an empty set in `config.dir`, creating the directory if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;
        info!(dir = %config.dir.display(), "opened fblock set");
        let shared = Arc::new_cyclic(|self_ref| SetShared {
            config,
            clock: Arc::new(AccessClock::new()),
            self_ref: self_ref.clone(),
            emergency_calls: AtomicU64::new(0),
            state: Mutex::new(SetState {
                fblocks: Vec::new(),
                rooms: RoomIndex::new(),
            }),
        });
        Ok(Self { shared })
    }

    /// The configuration this set was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Number of fblocks.
    pub fn len(&self) -> usize {
        self.shared.state.lock().fblocks.len()
    }

    /// True if no fblock was ever referenced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get fblock `id`, creating it and every lower id on first reference.
    pub fn fblock(&self, id: FBlockId) -> Arc<FBlock> {
        let mut state = self.shared.state.lock();
        while state.fblocks.len() <= id.0 as usize {
            let next = FBlockId(state.fblocks.len() as u32);
            let fblock = self.shared.new_fblock(next);
            state.fblocks.push(fblock);
        }
        Arc::clone(&state.fblocks[id.0 as usize])
    }

    /// Get an existing fblock.
    pub fn get(&self, id: FBlockId) -> StoreResult<Arc<FBlock>> {
        self.shared
            .state
            .lock()
            .fblocks
            .get(id.0 as usize)
            .cloned()
            .ok_or(StoreError::UnknownFBlock(id))
    }

    /// Create a new fblock with the next free id.
    pub fn create(&self) -> Arc<FBlock> {
        let mut state = self.shared.state.lock();
        let id = FBlockId(state.fblocks.len() as u32);
        let fblock = self.shared.new_fblock(id);
        state.fblocks.push(Arc::clone(&fblock));
        fblock
    }

    /// All fblocks in id order.
    pub fn fblocks(&self) -> Vec<Arc<FBlock>> {
        self.shared.state.lock().fblocks.clone()
    }

    /// Some fblock with at least `at_least` bytes of room.
    pub fn find_container_with_room(&self, at_least: u64) -> Option<FBlockId> {
        self.shared.state.lock().rooms.find(at_least)
    }

    /// Record the room left in `id`. Zero removes it from placement.
    pub fn update_room(&self, id: FBlockId, new_room: u64) {
        self.shared.state.lock().rooms.update(id, new_room);
    }

    /// Recorded room of `id`.
    pub fn room(&self, id: FBlockId) -> Option<u64> {
        self.shared.state.lock().rooms.room(id)
    }

    /// Close the least recently used open fblock other than `except`.
    pub fn close_some(&self, except: Option<FBlockId>) -> bool {
        self.shared.close_lru(except)
    }

    /// Best-effort disk space recovery on behalf of `except`.
    pub fn emergency_free_space(&self, except: Option<FBlockId>) -> bool {
        self.shared.free_space(except)
    }

    /// Unmap and close fblocks idle beyond the staleness threshold.
    /// Returns how many were aged out.
    pub fn free_idle_resources(&self) -> usize {
        self.shared.age_out(None)
    }

    /// Capture the state of every fblock and the free-space index.
    pub fn backup(&self) -> SetBackup {
        let (fblocks, rooms) = {
            let state = self.shared.state.lock();
            (state.fblocks.clone(), state.rooms.clone())
        };
        let fblocks = fblocks
            .iter()
            .map(|fb| {
                let guard = fb.lock_untracked();
                FBlockBackup {
                    size: guard.size(),
                    compressed: guard.is_compressed(),
                    raw_len: guard.raw_len(),
                    generation: guard.generation(),
                }
            })
            .collect();
        SetBackup { fblocks, rooms }
    }

    /// Roll back to `backup`: fblocks created since are discarded and the
    /// rest are cut back to their backed-up content and representation.
    ///
    /// Every fblock is attempted even after a failure, and the table and
    /// free-space index are always reset. An fblock that could not be rolled
    /// back is left out of the free-space index; the first error is returned.
    pub fn restore(&self, backup: &SetBackup) -> StoreResult<()> {
        let fblocks = self.fblocks();
        let mut first_error = None;
        let mut failed = Vec::new();
        for fb in fblocks.iter().skip(backup.count()) {
            if let Err(e) = fb.lock_untracked().discard() {
                warn!(fblock = %fb.id(), error = %e, "discard during restore failed");
                first_error.get_or_insert(e);
            }
        }
        for (fb, saved) in fblocks.iter().zip(backup.fblocks.iter()) {
            let result = fb.lock_untracked().restore_to(
                saved.size,
                saved.compressed,
                saved.raw_len,
                saved.generation,
            );
            if let Err(e) = result {
                warn!(fblock = %fb.id(), error = %e, "fblock restore failed");
                failed.push(fb.id());
                first_error.get_or_insert(e);
            }
        }

        let mut state = self.shared.state.lock();
        state.fblocks.truncate(backup.count());
        state.rooms = backup.rooms.clone();
        state.rooms.truncate(backup.count());
        for id in &failed {
            state.rooms.update(*id, 0);
        }
        drop(state);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(fblocks = backup.count(), "restored fblock set");
                Ok(())
            }
        }
    }

    /// Resource usage snapshot.
    pub fn stats(&self) -> SetStats {
        let fblocks = self.fblocks();
        let mut stats = SetStats {
            fblocks: fblocks.len(),
            ..SetStats::default()
        };
        for fb in &fblocks {
            match fb.try_lock() {
                Some(guard) => {
                    stats.open += guard.is_open() as usize;
                    stats.mapped += guard.is_mapped() as usize;
                    stats.compressed += guard.is_compressed() as usize;
                    stats.bytes_on_disk += guard.size();
                }
                None => stats.busy += 1,
            }
        }
        stats
    }

    /// Flush every fblock that holds a writable descriptor.
    pub fn sync_all(&self) -> StoreResult<()> {
        for fb in self.fblocks() {
            fb.lock_untracked().sync()?;
        }
        Ok(())
    }

    /// Delete every fblock from disk and empty the set.
    pub fn remove_all(&self) -> StoreResult<()> {
        for fb in self.fblocks() {
            fb.lock_untracked().discard()?;
        }
        let mut state = self.shared.state.lock();
        state.fblocks.clear();
        state.rooms = RoomIndex::new();
        Ok(())
    }
}

impl SetShared {
    fn new_fblock(&self, id: FBlockId) -> Arc<FBlock> {
        let path = self.config.fblock_path(id);
        if path.exists() {
            debug!(fblock = %id, path = %path.display(), "removing leftover fblock file");
            if let Err(e) = std::fs::remove_file(&path) {
                // the first writable open truncates it instead
                warn!(fblock = %id, path = %path.display(), error = %e, "cannot remove leftover fblock file");
            }
        }
        let reclaimer: Weak<dyn Reclaimer> = self.self_ref.clone();
        Arc::new(FBlock::new(
            id,
            path,
            self.config.compression,
            Arc::clone(&self.clock),
            Some(reclaimer),
        ))
    }

    /// Fblocks other than `except`, least recently used first.
    fn lru_order(&self, except: Option<FBlockId>) -> Vec<Arc<FBlock>> {
        let mut fblocks: Vec<Arc<FBlock>> = self
            .state
            .lock()
            .fblocks
            .iter()
            .filter(|fb| Some(fb.id()) != except)
            .cloned()
            .collect();
        fblocks.sort_by_key(|fb| fb.last_access());
        fblocks
    }

    fn close_lru(&self, except: Option<FBlockId>) -> bool {
        for fb in self.lru_order(except) {
            if let Some(mut guard) = fb.try_lock() {
                if guard.close() {
                    debug!(fblock = %fb.id(), last_access = fb.last_access(), "closed descriptor");
                    return true;
                }
            }
        }
        false
    }

    fn free_space(&self, except: Option<FBlockId>) -> bool {
        let call = self.emergency_calls.fetch_add(1, Ordering::Relaxed) + 1;
        let compress_turn = call % self.config.emergency_compress_every == 0;
        let acted = if compress_turn {
            self.compress_one(except) || self.age_out(except) > 0
        } else {
            self.age_out(except) > 0 || self.compress_one(except)
        };
        if acted {
            info!(call, compress_turn, "emergency space recovery took action");
        } else {
            warn!(call, "emergency space recovery found nothing to do");
        }
        acted
    }

    /// Compress the least recently used raw fblock that shrinks.
    fn compress_one(&self, except: Option<FBlockId>) -> bool {
        for fb in self.lru_order(except) {
            let Some(mut guard) = fb.try_lock() else {
                continue;
            };
            if guard.is_compressed() || guard.size() == 0 {
                continue;
            }
            let before = guard.size();
            match guard.compress_for_space() {
                Ok(true) => {
                    info!(fblock = %fb.id(), before, after = guard.size(), "compressed for space");
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!(fblock = %fb.id(), error = %e, "compression for space failed"),
            }
        }
        false
    }

    fn age_out(&self, except: Option<FBlockId>) -> usize {
        let now = self.clock.now();
        let mut aged = 0;
        for fb in self.lru_order(except) {
            if now.saturating_sub(fb.last_access()) <= self.config.stale_after_ticks {
                // sorted oldest first, the rest are fresher
                break;
            }
            if let Some(mut guard) = fb.try_lock() {
                let unmapped = guard.unmap();
                let closed = guard.close();
                if unmapped || closed {
                    aged += 1;
                }
            }
        }
        if aged > 0 {
            debug!(aged, "aged out idle fblocks");
        }
        aged
    }
}

impl Reclaimer for SetShared {
    fn close_some(&self, requester: FBlockId) -> bool {
        self.close_lru(Some(requester))
    }

    fn emergency_free_space(&self, requester: FBlockId) -> bool {
        self.free_space(Some(requester))
    }
}
