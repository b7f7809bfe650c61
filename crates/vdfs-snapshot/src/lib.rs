#![forbid(unsafe_code)]
//! Copy-on-write placement of metadata pages and the translation tables
//! that make each generation durable.
//!
//! Every tracked metadata file (the trees and the two bitmaps) is addressed
//! by logical page. The [`SnapshotManager`] maps each page to a physical
//! block inside the metadata area. The first time a page is dirtied in a
//! generation it is moved to a block that neither the durable generation nor
//! the in-progress one uses, so the durable image stays intact on disk until
//! the next table commit.
//!
//! Two bitmaps over the metadata area track that:
//!
//! - `snapshot`: blocks in use by the durable generation plus blocks handed
//!   out during this one,
//! - `next`: blocks the in-progress generation will use once committed.
//!
//! A relocation sets the new block in both and clears the old block in
//! `next` only. [`SnapshotManager::update_bitmaps`] copies `next` over
//! `snapshot` once every dirty page is on disk.
//!
//! Committing writes either a full base table or a one-block extended table
//! holding only the pages remapped in this generation; see
//! [`SnapshotManager::commit_table`]. Mount-time recovery lives in
//! [`recovery`].

pub mod recovery;

pub use recovery::{TableRecovery, TableRecoveryReport, load_base_table};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink, write_blocks};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::{BaseTable, ExtendedRecord, ExtendedSuperblock, ExtendedTable, Extent, TableSection};
use vdfs_types::{BlockNumber, Subsystem, Version};

/// Extended tables layered on one base before a new base is forced.
pub const DEFAULT_BASE_TABLE_THRESHOLD: u32 = 8;

/// One bit per metadata-area block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MetaBits {
    words: Vec<u64>,
    len: u64,
}

impl MetaBits {
    pub(crate) fn new(len: u64) -> Self {
        let words = usize::try_from(len.div_ceil(64)).unwrap_or(0);
        Self {
            words: vec![0; words],
            len,
        }
    }

    fn slot(index: u64) -> (usize, u64) {
        (usize::try_from(index / 64).unwrap_or(usize::MAX), 1 << (index % 64))
    }

    pub(crate) fn get(&self, index: u64) -> bool {
        let (word, mask) = Self::slot(index);
        index < self.len && self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    pub(crate) fn set(&mut self, index: u64) {
        let (word, mask) = Self::slot(index);
        if let Some(w) = self.words.get_mut(word) {
            *w |= mask;
        }
    }

    pub(crate) fn clear(&mut self, index: u64) {
        let (word, mask) = Self::slot(index);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !mask;
        }
    }

    fn grow(&mut self, by: u64) {
        self.len += by;
        let words = usize::try_from(self.len.div_ceil(64)).unwrap_or(0);
        self.words.resize(words, 0);
    }

    fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }
}

/// What a commit wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Base { slot: usize },
    Extended { slot: usize, index: u32 },
}

/// Metadata-area usage for `statfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaUsage {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub mapped_pages: u64,
}

#[derive(Debug)]
pub(crate) struct SnapState {
    pub(crate) exsb: ExtendedSuperblock,
    pub(crate) exsb_dirty: bool,
    /// Physical block per logical page, per subsystem; 0 = unmapped.
    pub(crate) tables: Vec<Vec<u64>>,
    pub(crate) snapshot: MetaBits,
    pub(crate) next: MetaBits,
    /// Blocks clear in both bitmaps.
    pub(crate) free_meta: u64,
    relocated: HashSet<(Subsystem, u64)>,
    staged: BTreeMap<(Subsystem, u64), u64>,
    pub(crate) use_base_table: bool,
    pub(crate) current_slot: usize,
    pub(crate) ext_count: u32,
    /// Version of the last durable table.
    pub(crate) committed: Version,
    /// Version the next commit will carry.
    pub(crate) pending: Version,
    threshold: u32,
}

impl SnapState {
    pub(crate) fn new(exsb: ExtendedSuperblock, threshold: u32) -> Self {
        let tables = Subsystem::ALL
            .iter()
            .map(|s| vec![0_u64; exsb.subsystem_pages[s.index()] as usize])
            .collect();
        let meta = exsb.meta_tbc;
        Self {
            exsb,
            exsb_dirty: false,
            tables,
            snapshot: MetaBits::new(meta),
            next: MetaBits::new(meta),
            free_meta: meta,
            relocated: HashSet::new(),
            staged: BTreeMap::new(),
            use_base_table: false,
            current_slot: 0,
            ext_count: 0,
            committed: Version::default(),
            pending: Version::default(),
            threshold: threshold.max(1),
        }
    }

    /// Mark every mapped block used in both bitmaps.
    pub(crate) fn rebuild_bitmaps(&mut self) -> Result<()> {
        let mut bits = MetaBits::new(self.exsb.meta_tbc);
        for (subsystem, table) in Subsystem::ALL.iter().zip(&self.tables) {
            for (page, &physical) in table.iter().enumerate() {
                if physical == 0 {
                    continue;
                }
                let Some(index) = self.exsb.meta_index(physical) else {
                    return Err(Fault::corrupt(
                        physical,
                        format!("{subsystem} page {page} mapped outside the metadata area"),
                    ));
                };
                if bits.get(index) {
                    return Err(Fault::corrupt(
                        physical,
                        format!("{subsystem} page {page} shares its block with another page"),
                    ));
                }
                bits.set(index);
            }
        }
        self.free_meta = self.exsb.meta_tbc - bits.count_ones();
        self.snapshot = bits.clone();
        self.next = bits;
        Ok(())
    }

    fn page_slot(&self, subsystem: Subsystem, page: u64) -> Option<usize> {
        let page = usize::try_from(page).ok()?;
        (page < self.tables[subsystem.index()].len()).then_some(page)
    }

    /// First metadata block after `from` (wrapping) free in both bitmaps.
    fn find_free_meta(&self, from: u64) -> Option<u64> {
        let total = self.exsb.meta_tbc;
        if total == 0 {
            return None;
        }
        (0..total)
            .map(|step| (from + step) % total)
            .find(|&i| !self.snapshot.get(i) && !self.next.get(i))
    }

    fn relocate(&mut self, subsystem: Subsystem, page: u64) -> Result<BlockNumber> {
        let Some(slot) = self.page_slot(subsystem, page) else {
            return Err(Fault::NoSpace);
        };
        let old = self.tables[subsystem.index()][slot];
        if self.relocated.contains(&(subsystem, page)) {
            return Ok(BlockNumber(old));
        }
        let old_index = if old == 0 {
            None
        } else {
            Some(self.exsb.meta_index(old).ok_or_else(|| {
                Fault::inconsistent(format!(
                    "{subsystem} page {page} maps to {old} outside the metadata area"
                ))
            })?)
        };
        let start = old_index.map_or(0, |i| i + 1);
        let index = self.find_free_meta(start).ok_or(Fault::NoSpace)?;
        let physical = self
            .exsb
            .meta_physical(index)
            .ok_or_else(|| Fault::inconsistent(format!("metadata index {index} has no block")))?;
        self.snapshot.set(index);
        self.next.set(index);
        self.free_meta -= 1;
        if let Some(old_index) = old_index {
            self.next.clear(old_index);
        }
        self.tables[subsystem.index()][slot] = physical;
        self.staged.insert((subsystem, page), physical);
        self.relocated.insert((subsystem, page));
        if self.staged.len() > ExtendedTable::capacity(self.block_size()) {
            self.use_base_table = true;
        }
        trace!(
            subsystem = %subsystem,
            page,
            old_block = old,
            new_block = physical,
            "meta_relocate"
        );
        Ok(BlockNumber(physical))
    }

    fn block_size(&self) -> usize {
        self.exsb.block_size().map_or(0, |bs| bs.bytes())
    }

    fn base_table(&self, version: Version) -> BaseTable {
        BaseTable {
            version,
            sections: Subsystem::ALL
                .iter()
                .zip(&self.tables)
                .map(|(subsystem, entries)| TableSection {
                    subsystem: *subsystem,
                    entries: entries.clone(),
                })
                .collect(),
        }
    }
}

/// Translation-table manager; see the crate docs.
pub struct SnapshotManager {
    dev: Arc<dyn BlockDevice>,
    state: RwLock<SnapState>,
}

impl fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SnapshotManager")
            .field("committed", &state.committed)
            .field("pending", &state.pending)
            .field("staged", &state.staged.len())
            .field("slot", &state.current_slot)
            .field("ext_count", &state.ext_count)
            .finish_non_exhaustive()
    }
}

fn encode_fault(what: &str, err: &vdfs_types::ParseError) -> Fault {
    Fault::inconsistent(format!("cannot encode {what}: {err}"))
}

impl SnapshotManager {
    /// Manager for a volume being formatted: nothing mapped, first commit
    /// is a base table in slot 0 at version `(0, 0)`.
    pub fn format(dev: Arc<dyn BlockDevice>, exsb: ExtendedSuperblock, threshold: u32) -> Arc<Self> {
        let mut state = SnapState::new(exsb, threshold);
        // The first base lands in the slot after the current one.
        state.current_slot = 1;
        state.use_base_table = true;
        state.exsb_dirty = true;
        Arc::new(Self {
            dev,
            state: RwLock::new(state),
        })
    }

    pub(crate) fn from_state(dev: Arc<dyn BlockDevice>, state: SnapState) -> Arc<Self> {
        Arc::new(Self {
            dev,
            state: RwLock::new(state),
        })
    }

    /// Start a read-write mount generation: bump the mount counter and
    /// force the next commit to write a base table and both superblocks.
    pub fn begin_mount_generation(&self) -> Version {
        let mut state = self.state.write();
        let mount = state.exsb.mount_counter.max(state.committed.mount);
        state.pending = Version::new(mount, 0).next_mount();
        let pending = state.pending;
        state.exsb.set_version(pending);
        state.use_base_table = true;
        state.exsb_dirty = true;
        drop(state);
        info!(version = %pending, "mount_generation");
        pending
    }

    /// Sink that routes `subsystem`'s pages through this manager.
    #[must_use]
    pub fn sink(self: &Arc<Self>, subsystem: Subsystem) -> Arc<dyn DirtyBlockSink> {
        Arc::new(SubsystemSink {
            manager: Arc::clone(self),
            subsystem,
        })
    }

    pub fn on_dirty(&self, subsystem: Subsystem, page: u64) -> Result<BlockNumber> {
        self.state.write().relocate(subsystem, page)
    }

    pub fn locate(&self, subsystem: Subsystem, page: u64) -> Result<Option<BlockNumber>> {
        let state = self.state.read();
        let Some(slot) = state.page_slot(subsystem, page) else {
            return Ok(None);
        };
        let physical = state.tables[subsystem.index()][slot];
        Ok((physical != 0).then_some(BlockNumber(physical)))
    }

    pub fn ensure_capacity(&self, pages: u64) -> Result<()> {
        if self.state.read().free_meta < pages {
            return Err(Fault::NoSpace);
        }
        Ok(())
    }

    /// Blocks of the metadata area free in both bitmaps.
    #[must_use]
    pub fn free_meta_blocks(&self) -> u64 {
        self.state.read().free_meta
    }

    /// Physical block right after the last metadata extent.
    #[must_use]
    pub fn meta_end(&self) -> u64 {
        let state = self.state.read();
        state
            .exsb
            .meta
            .iter()
            .rfind(|e| !e.is_empty())
            .map_or(0, Extent::end)
    }

    /// Grow the metadata area by an erase-block-aligned extent taken from
    /// free space. The extended superblock becomes dirty.
    pub fn add_meta_extent(&self, extent: Extent) -> Result<()> {
        let mut state = self.state.write();
        state
            .exsb
            .push_meta_extent(extent)
            .map_err(|_| Fault::NoSpace)?;
        state.snapshot.grow(extent.length);
        state.next.grow(extent.length);
        state.free_meta += extent.length;
        state.exsb_dirty = true;
        state.use_base_table = true;
        let meta_tbc = state.exsb.meta_tbc;
        drop(state);
        info!(
            start = extent.begin,
            count = extent.length,
            meta_tbc,
            "meta_area_grow"
        );
        Ok(())
    }

    /// Whether a commit has anything to write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        state.exsb_dirty || !state.staged.is_empty()
    }

    #[must_use]
    pub fn exsb_dirty(&self) -> bool {
        self.state.read().exsb_dirty
    }

    pub fn mark_exsb_dirty(&self) {
        let mut state = self.state.write();
        state.exsb_dirty = true;
        state.use_base_table = true;
    }

    /// Copy of the in-memory extended superblock.
    #[must_use]
    pub fn exsb(&self) -> ExtendedSuperblock {
        self.state.read().exsb.clone()
    }

    /// Update fields of the in-memory extended superblock without marking
    /// it dirty (counters travel with the next superblock write).
    pub fn with_exsb_mut<R>(&self, f: impl FnOnce(&mut ExtendedSuperblock) -> R) -> R {
        f(&mut self.state.write().exsb)
    }

    #[must_use]
    pub fn committed_version(&self) -> Version {
        self.state.read().committed
    }

    /// Version stamped on everything written by the next commit.
    #[must_use]
    pub fn pending_version(&self) -> Version {
        self.state.read().pending
    }

    /// Pages remapped in the in-progress generation.
    #[must_use]
    pub fn staged_records(&self) -> usize {
        self.state.read().staged.len()
    }

    /// The in-progress generation becomes the allocation baseline.
    pub fn update_bitmaps(&self) {
        let mut state = self.state.write();
        state.snapshot = state.next.clone();
        state.free_meta = state.exsb.meta_tbc - state.snapshot.count_ones();
        trace!(free_meta = state.free_meta, "snapshot_bitmaps_updated");
    }

    /// Write the translation table for the pending version and start the
    /// next generation.
    ///
    /// A base table is written to the other slot when one is forced (new
    /// mount, dirty superblock, staging overflow), when the extended chain
    /// reached its threshold, or when the slot has no room left. Otherwise
    /// a single extended table is appended after the current chain.
    pub fn commit_table(&self) -> Result<TableKind> {
        let mut state = self.state.write();
        let bs = state.block_size();
        let version = state.pending;
        let base = state.use_base_table
            || state.ext_count >= state.threshold
            || state.ext_count >= state.exsb.ext_table_slots
            || state.staged.len() > ExtendedTable::capacity(bs);
        let kind = if base {
            let slot = 1 - state.current_slot;
            let capacity = state.exsb.base_table_blocks as usize * bs;
            let image = state
                .base_table(version)
                .encode(capacity)
                .map_err(|e| encode_fault("base table", &e))?;
            write_blocks(
                self.dev.as_ref(),
                BlockNumber(state.exsb.tables[slot].begin),
                &image,
            )?;
            state.current_slot = slot;
            state.ext_count = 0;
            state.use_base_table = false;
            TableKind::Base { slot }
        } else {
            let slot = state.current_slot;
            let index = state.ext_count;
            let table = ExtendedTable {
                version,
                records: state
                    .staged
                    .iter()
                    .map(|(&(subsystem, page), &physical)| ExtendedRecord {
                        object_id: subsystem.object_id(),
                        table_index: page,
                        physical,
                    })
                    .collect(),
            };
            let image = table
                .encode(bs)
                .map_err(|e| encode_fault("extended table", &e))?;
            let block = state.exsb.tables[slot].begin
                + u64::from(state.exsb.base_table_blocks)
                + u64::from(index);
            self.dev.write_block(BlockNumber(block), &image)?;
            state.ext_count += 1;
            TableKind::Extended { slot, index }
        };
        let records = state.staged.len();
        state.staged.clear();
        state.relocated.clear();
        state.committed = version;
        state.pending = version.next_sync();
        drop(state);
        info!(version = %version, kind = ?kind, records, "table_commit");
        Ok(kind)
    }

    /// Serialize the in-memory extended superblock stamped with the pending
    /// version, with or without the dirty flag.
    pub fn exsb_for_write(&self, dirty_flag: bool) -> ExtendedSuperblock {
        let mut state = self.state.write();
        let pending = state.pending;
        state.exsb.set_version(pending);
        let mut exsb = state.exsb.clone();
        drop(state);
        if dirty_flag {
            exsb.flags |= vdfs_ondisk::EXSB_DIRTY;
        } else {
            exsb.flags &= !vdfs_ondisk::EXSB_DIRTY;
        }
        exsb
    }

    /// The superblock reached both copies.
    pub fn clear_exsb_dirty(&self) {
        self.state.write().exsb_dirty = false;
    }

    /// Every mapped page lies in the metadata area, no block is shared,
    /// and both bitmaps cover at least the mapped set.
    pub fn check(&self) -> Result<MetaUsage> {
        let state = self.state.read();
        let mut seen = MetaBits::new(state.exsb.meta_tbc);
        let mut mapped = 0;
        for (subsystem, table) in Subsystem::ALL.iter().zip(&state.tables) {
            for (page, &physical) in table.iter().enumerate() {
                if physical == 0 {
                    continue;
                }
                let index = state.exsb.meta_index(physical).ok_or_else(|| {
                    Fault::inconsistent(format!(
                        "{subsystem} page {page} at {physical} outside the metadata area"
                    ))
                })?;
                if seen.get(index) || !state.next.get(index) || !state.snapshot.get(index) {
                    return Err(Fault::inconsistent(format!(
                        "{subsystem} page {page} at {physical} shared or missing from snapshot bitmaps"
                    )));
                }
                seen.set(index);
                mapped += 1;
            }
        }
        Ok(MetaUsage {
            total_blocks: state.exsb.meta_tbc,
            free_blocks: state.free_meta,
            mapped_pages: mapped,
        })
    }

    #[must_use]
    pub fn usage(&self) -> MetaUsage {
        let state = self.state.read();
        MetaUsage {
            total_blocks: state.exsb.meta_tbc,
            free_blocks: state.free_meta,
            mapped_pages: state
                .tables
                .iter()
                .map(|t| t.iter().filter(|p| **p != 0).count() as u64)
                .sum(),
        }
    }

    /// Physical block of each subsystem page, for inspection tools.
    #[must_use]
    pub fn table_snapshot(&self, subsystem: Subsystem) -> Vec<u64> {
        self.state.read().tables[subsystem.index()].clone()
    }

    #[must_use]
    pub fn current_slot(&self) -> usize {
        self.state.read().current_slot
    }

    #[must_use]
    pub fn extended_tables(&self) -> u32 {
        self.state.read().ext_count
    }

    pub(crate) fn log_loaded(&self) {
        let state = self.state.read();
        debug!(
            version = %state.committed,
            slot = state.current_slot,
            ext_count = state.ext_count,
            free_meta = state.free_meta,
            "snapshot_loaded"
        );
    }
}

/// [`DirtyBlockSink`] for one subsystem.
struct SubsystemSink {
    manager: Arc<SnapshotManager>,
    subsystem: Subsystem,
}

impl DirtyBlockSink for SubsystemSink {
    fn on_dirty(&self, page: u64) -> Result<BlockNumber> {
        self.manager.on_dirty(self.subsystem, page)
    }

    fn locate(&self, page: u64) -> Result<Option<BlockNumber>> {
        self.manager.locate(self.subsystem, page)
    }

    fn ensure_capacity(&self, pages: u64) -> Result<()> {
        self.manager.ensure_capacity(pages)
    }
}
