#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! ## Design
//!
//! The free-space manager is layered:
//!
//! 1. **Bitmap** ([`bitmap::PagedBitmap`]): the durable record, one bit per
//!    block, 1 = used. Its pages are metadata and go through the
//!    translation layer like tree nodes do.
//! 2. **Run index**: an in-memory ordered map of free runs
//!    `offset -> length`, rebuilt from the bitmap at mount by
//!    [`FreeSpaceManager::build_management`]. Freed runs are inserted as
//!    they are; adjacent runs are merged only by the next rebuild.
//! 3. **Accounting**: free and reserved (delayed-allocation) counters plus
//!    a live-block counter per erase block that triggers discard once an
//!    erase block empties.
//!
//! Inode numbers come from a separate bitmap, see [`inode::InodeAllocator`].

pub mod bitmap;
pub mod inode;

pub use bitmap::PagedBitmap;
pub use inode::InodeAllocator;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::{Extent, FSM_BITMAP_MAGIC};
use vdfs_types::{BlockNumber, ObjectId, Version};

/// Counter snapshot for `statfs` and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub reserved_blocks: u64,
    pub free_runs: usize,
}

#[derive(Debug)]
struct FsmState {
    bitmap: PagedBitmap,
    runs: BTreeMap<u64, u64>,
    total_blocks: u64,
    free_blocks: u64,
    reserved: u64,
    blocks_per_leb: u64,
    leb_live: Vec<u64>,
    prealloc: HashMap<ObjectId, Extent>,
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(value);
    }
    value.checked_next_multiple_of(align)
}

impl FsmState {
    fn leb_of(&self, block: u64) -> usize {
        usize::try_from(block / self.blocks_per_leb).unwrap_or(usize::MAX)
    }

    /// Pick a sub-range of a free run.
    ///
    /// Search order: the run containing `hint`, runs after it, then from
    /// block 0. When no run holds `len` aligned blocks the largest run is
    /// used partially.
    fn choose(&self, hint: u64, len: u64, align: u64) -> Option<Extent> {
        let fits = |start: u64, run_len: u64, from: u64| -> Option<Extent> {
            let begin = align_up(start.max(from), align)?;
            let end = start + run_len;
            (begin.checked_add(len)? <= end).then_some(Extent::new(begin, len))
        };
        if let Some((&start, &run_len)) = self.runs.range(..=hint).next_back() {
            if hint < start + run_len {
                if let Some(found) = fits(start, run_len, hint) {
                    return Some(found);
                }
            }
        }
        let forward = self.runs.range(hint.saturating_add(1)..);
        let wrapped = self.runs.range(..=hint);
        for (&start, &run_len) in forward.chain(wrapped) {
            if let Some(found) = fits(start, run_len, start) {
                return Some(found);
            }
        }
        let (&start, &run_len) = self.runs.iter().max_by_key(|(start, len)| (**len, u64::MAX - **start))?;
        let aligned = align_up(start, align).filter(|begin| *begin < start + run_len);
        let begin = aligned.unwrap_or(start);
        Some(Extent::new(begin, (start + run_len - begin).min(len)))
    }

    /// Remove `extent` from the run that contains it, returning the
    /// leftovers to the index.
    fn carve(&mut self, extent: Extent) -> Result<()> {
        let Some((&start, &run_len)) = self.runs.range(..=extent.begin).next_back() else {
            return Err(Fault::inconsistent(format!(
                "block {} not covered by a free run",
                extent.begin
            )));
        };
        if extent.end() > start + run_len {
            return Err(Fault::inconsistent(format!(
                "extent {}+{} overruns free run {start}+{run_len}",
                extent.begin, extent.length
            )));
        }
        self.runs.remove(&start);
        if extent.begin > start {
            self.runs.insert(start, extent.begin - start);
        }
        if extent.end() < start + run_len {
            self.runs.insert(extent.end(), start + run_len - extent.end());
        }
        Ok(())
    }

    fn uncarve(&mut self, extent: Extent) {
        // Exact inverse of `carve` for a freshly chosen extent.
        let before = self
            .runs
            .range(..extent.begin)
            .next_back()
            .filter(|(s, l)| **s + **l == extent.begin)
            .map(|(s, l)| (*s, *l));
        let after = self.runs.get(&extent.end()).copied();
        let mut start = extent.begin;
        let mut len = extent.length;
        if let Some((s, l)) = before {
            start = s;
            len += l;
        }
        if let Some(l) = after {
            self.runs.remove(&extent.end());
            len += l;
        }
        self.runs.insert(start, len);
    }

    fn overlaps_free(&self, extent: Extent) -> bool {
        let before = self
            .runs
            .range(..=extent.begin)
            .next_back()
            .is_some_and(|(s, l)| s + l > extent.begin);
        before || self.runs.range(extent.begin..extent.end()).next().is_some()
    }

    fn adjust_live(&mut self, extent: Extent, add: bool) -> Vec<usize> {
        let mut emptied = Vec::new();
        let mut block = extent.begin;
        while block < extent.end() {
            let leb = self.leb_of(block);
            let leb_end = (block / self.blocks_per_leb + 1) * self.blocks_per_leb;
            let n = leb_end.min(extent.end()) - block;
            if let Some(live) = self.leb_live.get_mut(leb) {
                if add {
                    *live += n;
                } else {
                    *live = live.saturating_sub(n);
                    if *live == 0 {
                        emptied.push(leb);
                    }
                }
            }
            block += n;
        }
        emptied
    }
}

/// Free-space manager: one mutex serializes every allocation and free
/// together with its bitmap and counter updates.
pub struct FreeSpaceManager {
    dev: Arc<dyn BlockDevice>,
    state: Mutex<FsmState>,
}

impl fmt::Debug for FreeSpaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeSpaceManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FreeSpaceManager {
    /// Lay out a new bitmap for `total_blocks` with `used` pre-marked.
    pub fn format(
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
        total_blocks: u64,
        blocks_per_leb: u64,
        used: &[Extent],
    ) -> Result<Self> {
        let block_size = dev.block_size() as usize;
        let mut bitmap = PagedBitmap::new(FSM_BITMAP_MAGIC, block_size, total_blocks, sink)?;
        bitmap.touch_all()?;
        bitmap.set_padding()?;
        for extent in used.iter().filter(|e| !e.is_empty()) {
            bitmap.set(extent.begin, extent.length)?;
        }
        let fsm = Self::with_bitmap(dev, bitmap, total_blocks, blocks_per_leb)?;
        fsm.build_management()?;
        Ok(fsm)
    }

    /// Load the bitmap through the current translation and rebuild the run
    /// index from it.
    pub fn open(
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
        total_blocks: u64,
        blocks_per_leb: u64,
    ) -> Result<Self> {
        let block_size = dev.block_size() as usize;
        let bitmap = PagedBitmap::load(FSM_BITMAP_MAGIC, block_size, total_blocks, dev.as_ref(), sink)?;
        let fsm = Self::with_bitmap(dev, bitmap, total_blocks, blocks_per_leb)?;
        fsm.build_management()?;
        Ok(fsm)
    }

    fn with_bitmap(
        dev: Arc<dyn BlockDevice>,
        bitmap: PagedBitmap,
        total_blocks: u64,
        blocks_per_leb: u64,
    ) -> Result<Self> {
        if blocks_per_leb == 0 {
            return Err(Fault::Format("erase block holds no blocks".to_owned()));
        }
        let lebs = usize::try_from(total_blocks.div_ceil(blocks_per_leb))
            .map_err(|_| Fault::Format("too many erase blocks".to_owned()))?;
        Ok(Self {
            dev,
            state: Mutex::new(FsmState {
                bitmap,
                runs: BTreeMap::new(),
                total_blocks,
                free_blocks: 0,
                reserved: 0,
                blocks_per_leb,
                leb_live: vec![0; lebs],
                prealloc: HashMap::new(),
            }),
        })
    }

    /// Rebuild the run index, free counter and erase-block live counters
    /// from the bitmap. Every maximal run of clear bits becomes one run.
    pub fn build_management(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.runs.clear();
        state.leb_live.iter_mut().for_each(|live| *live = 0);
        let total = state.total_blocks;
        let mut free = 0;
        let mut cursor = 0;
        while let Some(start) = state.bitmap.find_next(cursor, false) {
            let end = state.bitmap.find_next(start, true).unwrap_or(total).min(total);
            state.runs.insert(start, end - start);
            free += end - start;
            cursor = end;
        }
        let bpl = state.blocks_per_leb;
        for (leb, live) in state.leb_live.iter_mut().enumerate() {
            let start = leb as u64 * bpl;
            *live = state.bitmap.count_set(start, (start + bpl).min(total));
        }
        if free < state.reserved {
            return Err(Fault::inconsistent(format!(
                "{free} free blocks cannot back {} reserved",
                state.reserved
            )));
        }
        state.free_blocks = free - state.reserved;
        state.prealloc.clear();
        debug!(
            runs = state.runs.len(),
            free_blocks = state.free_blocks,
            "fsm_build_management"
        );
        Ok(())
    }

    /// Allocate up to `len` blocks near `hint`.
    ///
    /// The returned extent may be shorter than `len` when no run is long
    /// enough. With `align > 1` the start is a multiple of `align` where
    /// possible. `da` charges the blocks to an earlier
    /// [`FreeSpaceManager::reserve`] instead of the free counter.
    pub fn get_free_block(&self, hint: u64, len: u64, align: u64, da: bool) -> Result<Extent> {
        if len == 0 {
            return Err(Fault::InvalidArgument("zero-length allocation".to_owned()));
        }
        let mut state = self.state.lock();
        let Some(extent) = state.choose(hint, len, align) else {
            return Err(Fault::NoSpace);
        };
        if da && state.reserved < extent.length {
            return Err(Fault::InvalidArgument(format!(
                "delayed allocation of {} blocks exceeds {} reserved",
                extent.length, state.reserved
            )));
        }
        if !da && state.free_blocks < extent.length {
            return Err(Fault::NoSpace);
        }
        state.carve(extent)?;
        if let Err(err) = state.bitmap.set(extent.begin, extent.length) {
            state.uncarve(extent);
            return Err(err);
        }
        if da {
            state.reserved -= extent.length;
        } else {
            state.free_blocks -= extent.length;
        }
        state.adjust_live(extent, true);
        drop(state);
        trace!(
            hint,
            wanted = len,
            start = extent.begin,
            count = extent.length,
            da,
            "fsm_alloc"
        );
        Ok(extent)
    }

    /// Return `extent` to free space. Runs are inserted without merging.
    pub fn put_free_block(&self, extent: Extent, da: bool) -> Result<()> {
        if extent.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if extent.end() > state.total_blocks || state.overlaps_free(extent) {
            return Err(Fault::inconsistent(format!(
                "freeing {}+{} which is already free or out of range",
                extent.begin, extent.length
            )));
        }
        state.bitmap.clear(extent.begin, extent.length)?;
        state.runs.insert(extent.begin, extent.length);
        if da {
            state.reserved += extent.length;
        } else {
            state.free_blocks += extent.length;
        }
        let emptied = state.adjust_live(extent, false);
        let bpl = state.blocks_per_leb;
        let total = state.total_blocks;
        drop(state);
        trace!(start = extent.begin, count = extent.length, da, "fsm_free");
        for leb in emptied {
            let start = leb as u64 * bpl;
            // The last erase block may be cut short by the end of the volume.
            let count = bpl.min(total.saturating_sub(start));
            if let Err(err) = self.dev.discard(BlockNumber(start), count) {
                warn!(leb, error = %err, "leb_discard_failed");
            } else {
                debug!(leb, "leb_discard");
            }
        }
        Ok(())
    }

    /// Move `blocks` from the free counter to the reserved counter.
    pub fn reserve(&self, blocks: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.free_blocks < blocks {
            return Err(Fault::NoSpace);
        }
        state.free_blocks -= blocks;
        state.reserved += blocks;
        Ok(())
    }

    /// Undo a [`FreeSpaceManager::reserve`] that will not be allocated.
    pub fn free_reserved_space(&self, blocks: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.reserved < blocks {
            return Err(Fault::inconsistent(format!(
                "releasing {blocks} reserved blocks with only {} reserved",
                state.reserved
            )));
        }
        state.reserved -= blocks;
        state.free_blocks += blocks;
        Ok(())
    }

    /// Allocate data blocks for `ino`, over-allocating by `window` blocks and
    /// keeping the surplus as the inode's preallocation. A later request
    /// starting exactly at the preallocated range is served from it.
    pub fn alloc_for_inode(&self, ino: ObjectId, hint: u64, len: u64, window: u64) -> Result<Extent> {
        if len == 0 {
            return Err(Fault::InvalidArgument("zero-length allocation".to_owned()));
        }
        {
            let mut state = self.state.lock();
            if let Some(window_extent) = state.prealloc.get(&ino).copied() {
                if window_extent.begin == hint {
                    let take = window_extent.length.min(len);
                    let rest = Extent::new(hint + take, window_extent.length - take);
                    if rest.is_empty() {
                        state.prealloc.remove(&ino);
                    } else {
                        state.prealloc.insert(ino, rest);
                    }
                    trace!(ino = ino.0, start = hint, count = take, "prealloc_hit");
                    return Ok(Extent::new(hint, take));
                }
            }
        }
        self.discard_preallocation(ino)?;
        let extent = self.get_free_block(hint, len + window, 1, false)?;
        if extent.length <= len {
            return Ok(extent);
        }
        let rest = Extent::new(extent.begin + len, extent.length - len);
        self.state.lock().prealloc.insert(ino, rest);
        Ok(Extent::new(extent.begin, len))
    }

    /// Return the unused part of `ino`'s preallocation window.
    pub fn discard_preallocation(&self, ino: ObjectId) -> Result<()> {
        let window = self.state.lock().prealloc.remove(&ino);
        match window {
            Some(extent) => {
                trace!(ino = ino.0, start = extent.begin, count = extent.length, "prealloc_discard");
                self.put_free_block(extent, false)
            }
            None => Ok(()),
        }
    }

    pub fn discard_all_preallocations(&self) -> Result<()> {
        let windows: Vec<Extent> = self.state.lock().prealloc.drain().map(|(_, e)| e).collect();
        for extent in windows {
            self.put_free_block(extent, false)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn preallocated(&self, ino: ObjectId) -> Option<Extent> {
        self.state.lock().prealloc.get(&ino).copied()
    }

    /// Blocks held in preallocation windows across all inodes.
    #[must_use]
    pub fn preallocated_blocks(&self) -> u64 {
        self.state.lock().prealloc.values().map(|e| e.length).sum()
    }

    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        let state = self.state.lock();
        SpaceStats {
            total_blocks: state.total_blocks,
            free_blocks: state.free_blocks,
            reserved_blocks: state.reserved,
            free_runs: state.runs.len(),
        }
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.state.lock().free_blocks
    }

    /// Free runs in offset order.
    #[must_use]
    pub fn runs(&self) -> Vec<Extent> {
        self.state
            .lock()
            .runs
            .iter()
            .map(|(start, len)| Extent::new(*start, *len))
            .collect()
    }

    #[must_use]
    pub fn is_used(&self, block: u64) -> bool {
        self.state.lock().bitmap.test(block)
    }

    #[must_use]
    pub fn leb_live(&self, leb: usize) -> Option<u64> {
        self.state.lock().leb_live.get(leb).copied()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().bitmap.is_dirty()
    }

    /// Verify that the run index is exactly the complement of the bitmap
    /// and that the counters add up.
    pub fn check(&self) -> Result<()> {
        let state = self.state.lock();
        let mut expected = 0;
        let mut in_runs = 0;
        for (&start, &len) in &state.runs {
            if start < expected {
                return Err(Fault::inconsistent(format!("free run {start}+{len} overlaps")));
            }
            if let Some(used) = state.bitmap.find_next(start, true).filter(|b| *b < start + len) {
                return Err(Fault::inconsistent(format!(
                    "block {used} is inside free run {start}+{len} but marked used"
                )));
            }
            if start > expected && state.bitmap.find_next(expected, false).is_some_and(|b| b < start) {
                return Err(Fault::inconsistent(format!(
                    "clear bits before {start} are missing from the run index"
                )));
            }
            expected = start + len;
            in_runs += len;
        }
        if state.bitmap.find_next(expected, false).is_some() {
            return Err(Fault::inconsistent(format!(
                "clear bits after {expected} are missing from the run index"
            )));
        }
        if in_runs != state.free_blocks + state.reserved {
            return Err(Fault::inconsistent(format!(
                "{in_runs} blocks in free runs but counters say {} free + {} reserved",
                state.free_blocks, state.reserved
            )));
        }
        Ok(())
    }

    pub fn flush(&self, version: Version) -> Result<usize> {
        let written = self.state.lock().bitmap.flush(self.dev.as_ref(), version)?;
        if written > 0 {
            debug!(pages = written, version = %version, "fsm_flush");
        }
        Ok(written)
    }
}
