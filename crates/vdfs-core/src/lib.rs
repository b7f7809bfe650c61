#![forbid(unsafe_code)]
//! VDFS volume engine.
//!
//! [`VolumeHandle`] owns every piece of a mounted volume: the snapshot
//! manager, free-space manager, inode bitmap, the four trees and the
//! transaction barrier. Nothing lives in statics; dropping the handle
//! without [`VolumeHandle::sync`] loses the in-progress generation and
//! leaves the last committed one on disk.
//!
//! ```ignore
//! let dev = vdfs_core::open_device(MemoryByteDevice::new(64 << 20))?;
//! VolumeHandle::format(Arc::clone(&dev), &FormatOptions::default())?;
//! let vol = VolumeHandle::mount(dev, &MountOptions::default())?;
//! let file = vol.create(ObjectId::ROOT, "a", 0o644)?;
//! vol.write_extents(&file.key, 0, 8192)?;
//! vol.sync()?;
//! ```

mod barrier;
mod check;
mod data;
mod layout;
mod namespace;
pub mod options;

pub use barrier::{Transaction, TransactionBarrier};
pub use check::CheckReport;
pub use data::MappedRange;
pub use namespace::DirEntry;
pub use options::{FormatOptions, MountOptions};
pub use vdfs_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemoryByteDevice,
};
pub use vdfs_catalog::{CatalogKey, FileHandle, Record, RecordType, Timestamp};
pub use vdfs_error::{Fault, Result};
pub use vdfs_inode::{FileType, FilesystemInode, InodeAttr, SetAttr};
pub use vdfs_ondisk::{ExtendedSuperblock, PrimarySuperblock};
pub use vdfs_snapshot::{MetaUsage, TableKind, TableRecoveryReport};
pub use vdfs_types::{Generation, ObjectId, Subsystem, Version};
pub use vdfs_xattr::SetMode;

use layout::{Layout, meta_watermark, tree_geometry};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};
use vdfs_alloc::{FreeSpaceManager, InodeAllocator};
use vdfs_block::read_superblock_region;
use vdfs_catalog::{CatalogTree, FolderRecord, HardlinkTree, IndirectIndex, ObjectMeta};
use vdfs_extent::ExtentsTree;
use vdfs_inode::InodeLockTable;
use vdfs_ondisk::{EXSB_DIRTY, Extent, LAYOUT_VERSION, SuperblockCopy, copy_offset};
use vdfs_snapshot::{DEFAULT_BASE_TABLE_THRESHOLD, SnapshotManager, TableRecovery, load_base_table};
use vdfs_types::{BlockNumber, S_IFDIR, SB_REGION_SIZE};
use vdfs_xattr::XattrTree;

/// Wrap a byte device in a block device using the block size recorded in
/// its superblock.
pub fn open_device<D: ByteDevice + 'static>(inner: D) -> Result<Arc<dyn BlockDevice>> {
    let mut region = [0_u8; SB_REGION_SIZE];
    inner.read_exact_at(0, &mut region)?;
    let copy = SuperblockCopy::parse(&region, 0)
        .or_else(|_| SuperblockCopy::parse(&region, 1))
        .map_err(|e| Fault::corrupt(0, format!("no valid superblock: {e}")))?;
    let block_size = copy
        .exsb
        .block_size()
        .map_err(|e| Fault::Format(format!("superblock block size: {e}")))?;
    Ok(Arc::new(ByteBlockDevice::new(inner, block_size.get())?))
}

/// Block device over `inner` for a volume about to be formatted.
pub fn format_device<D: ByteDevice + 'static>(
    inner: D,
    block_size: u32,
) -> Result<Arc<dyn BlockDevice>> {
    Ok(Arc::new(ByteBlockDevice::new(inner, block_size)?))
}

/// Counters and identifiers reported by [`VolumeHandle::statfs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub volume_name: String,
    pub block_size: u32,
    pub erase_block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub reserved_blocks: u64,
    pub files: u64,
    pub folders: u64,
    pub inode_capacity: u64,
    pub inodes_used: u64,
    pub meta: MetaUsage,
    /// Last durable generation.
    pub version: Version,
    pub case_insensitive: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    files: u64,
    folders: u64,
    next_generation: u32,
}

/// The paged metadata files, flushed together at commit.
#[derive(Debug)]
struct Metadata {
    fsm: FreeSpaceManager,
    inodes: InodeAllocator,
    catalog: CatalogTree,
    extents: ExtentsTree,
    hardlinks: HardlinkTree,
    xattrs: XattrTree,
}

impl Metadata {
    fn is_dirty(&self) -> bool {
        self.fsm.is_dirty()
            || self.inodes.is_dirty()
            || self.catalog.is_dirty()
            || self.extents.is_dirty()
            || self.hardlinks.is_dirty()
            || self.xattrs.is_dirty()
    }

    fn flush(&self, dev: &dyn BlockDevice, version: Version) -> Result<usize> {
        Ok(self.catalog.flush(version)?
            + self.extents.flush(version)?
            + self.hardlinks.flush(version)?
            + self.xattrs.flush(version)?
            + self.fsm.flush(version)?
            + self.inodes.flush(dev, version)?)
    }
}

fn write_superblock(
    dev: &dyn BlockDevice,
    index: usize,
    primary: &PrimarySuperblock,
    exsb: &ExtendedSuperblock,
) -> Result<()> {
    let copy = SuperblockCopy {
        primary: primary.clone(),
        exsb: exsb.clone(),
    };
    let bytes = copy
        .serialize()
        .map_err(|e| Fault::inconsistent(format!("cannot encode superblock: {e}")))?;
    let offset = copy_offset(index).map_err(|e| Fault::InvalidArgument(e.to_string()))?;
    dev.write_bytes(offset as u64, &bytes)
}

/// Make the in-progress generation durable.
///
/// 1. a dirty extended superblock goes to copy 0, flagged dirty;
/// 2. every dirty metadata page is written to its relocated block;
/// 3. the snapshot bitmaps adopt the new generation;
/// 4. the translation table (base or extended) is written;
/// 5. a dirty superblock then goes to the mirror copy, clean.
///
/// A crash before step 4 completes leaves the previous table, and the
/// mirror superblock that matches it, in charge at the next mount.
fn commit(
    dev: &dyn BlockDevice,
    primary: &PrimarySuperblock,
    snapshot: &SnapshotManager,
    metadata: &Metadata,
) -> Result<TableKind> {
    let exsb_dirty = snapshot.exsb_dirty();
    let image = snapshot.exsb_for_write(false);
    let version = image.version();
    if exsb_dirty {
        let mut marked = image.clone();
        marked.flags |= EXSB_DIRTY;
        write_superblock(dev, 0, primary, &marked)?;
    }
    let pages = metadata.flush(dev, version)?;
    dev.sync()?;
    snapshot.update_bitmaps();
    let kind = snapshot.commit_table()?;
    dev.sync()?;
    if exsb_dirty {
        write_superblock(dev, 1, primary, &image)?;
        dev.sync()?;
        snapshot.clear_exsb_dirty();
    }
    debug!(version = %version, pages, exsb = exsb_dirty, kind = ?kind, "commit");
    Ok(kind)
}

/// A mounted volume.
pub struct VolumeHandle {
    dev: Arc<dyn BlockDevice>,
    primary: PrimarySuperblock,
    options: MountOptions,
    block_size: u32,
    blocks_per_leb: u64,
    bnode_pages: u8,
    snapshot: Arc<SnapshotManager>,
    md: Metadata,
    barrier: TransactionBarrier,
    inode_locks: InodeLockTable,
    /// Catalog key of every folder, for parent lookups and rename cycle
    /// checks.
    folders: RwLock<HashMap<ObjectId, CatalogKey>>,
    counters: Mutex<Counters>,
    grow_lock: Mutex<()>,
    /// Serializes renames between folders so the ancestry check stays
    /// valid until the move lands.
    rename_lock: Mutex<()>,
    read_only: AtomicBool,
    recovery: TableRecoveryReport,
}

impl std::fmt::Debug for VolumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHandle")
            .field("volume", &self.primary.name())
            .field("block_size", &self.block_size)
            .field("version", &self.snapshot.committed_version())
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

impl VolumeHandle {
    /// Lay out a new volume on `dev`: superblocks, both table slots, the
    /// metadata area with empty trees and bitmaps, and a root folder. The
    /// result is committed as a base table at version `0:0`.
    pub fn format(dev: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<()> {
        if dev.block_size() != options.block_size {
            return Err(Fault::Format(format!(
                "device block size {} differs from requested {}",
                dev.block_size(),
                options.block_size
            )));
        }
        let layout = Layout::plan(options, dev.block_count())?;
        let exsb = &layout.exsb;
        let zero = vec![0_u8; options.block_size as usize];
        for slot in &exsb.tables {
            for block in slot.begin..slot.end() {
                dev.write_block(BlockNumber(block), &zero)?;
            }
        }

        let snapshot = SnapshotManager::format(
            Arc::clone(&dev),
            exsb.clone(),
            DEFAULT_BASE_TABLE_THRESHOLD,
        );
        let fsm = FreeSpaceManager::format(
            Arc::clone(&dev),
            snapshot.sink(Subsystem::FreeSpaceBitmap),
            exsb.total_blocks,
            exsb.blocks_per_leb(),
            &[Extent::new(0, layout.reserved_end())],
        )?;
        let inodes = InodeAllocator::format(
            options.block_size as usize,
            exsb.inode_capacity,
            snapshot.sink(Subsystem::InodeBitmap),
        )?;
        let mut root = ObjectMeta::new(ObjectId::ROOT, Generation(0), S_IFDIR | 0o755);
        root.links_count = 2;
        let catalog = CatalogTree::create(
            tree_geometry(exsb, Subsystem::CatalogTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::CatalogTree),
            options.case_insensitive,
            &FolderRecord {
                meta: root,
                total_items: 0,
            },
        )?;
        let extents = ExtentsTree::create(
            tree_geometry(exsb, Subsystem::ExtentsTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::ExtentsTree),
        )?;
        let hardlinks = HardlinkTree::create(
            tree_geometry(exsb, Subsystem::HardlinkTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::HardlinkTree),
        )?;
        let xattrs = XattrTree::create(
            tree_geometry(exsb, Subsystem::XattrTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::XattrTree),
        )?;
        let metadata = Metadata {
            fsm,
            inodes,
            catalog,
            extents,
            hardlinks,
            xattrs,
        };
        commit(dev.as_ref(), &layout.primary, &snapshot, &metadata)?;
        info!(
            name = %layout.primary.name(),
            block_size = options.block_size,
            total_blocks = exsb.total_blocks,
            meta_start = exsb.meta[0].begin,
            meta_blocks = exsb.meta_tbc,
            bnode_pages = exsb.bnode_pages,
            case_insensitive = options.case_insensitive,
            "format"
        );
        Ok(())
    }

    /// Mount the volume on `dev`.
    ///
    /// Corruption found while mounting fails the mount; broken invariants
    /// are reported as [`Fault::Corrupt`] here rather than degrading a
    /// live volume.
    pub fn mount(dev: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        Self::mount_inner(dev, options).map_err(|err| match err {
            Fault::Inconsistent { detail } => {
                error!(detail = %detail, "mount_inconsistent");
                Fault::corrupt(0, detail)
            }
            other => other,
        })
    }

    fn mount_inner(dev: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let region = read_superblock_region(dev.as_ref())?;
        let (copy, mirror, restore_primary) = match (
            SuperblockCopy::parse(&region, 0),
            SuperblockCopy::parse(&region, 1),
        ) {
            (Ok(primary), Ok(mirror)) => (primary, Some(mirror), false),
            (Ok(primary), Err(err)) => {
                warn!(error = %err, "mirror_superblock_invalid");
                (primary, None, false)
            }
            (Err(err), Ok(mirror)) => {
                warn!(error = %err, "primary_superblock_invalid");
                (mirror, None, true)
            }
            (Err(primary), Err(mirror)) => {
                error!(primary = %primary, mirror = %mirror, "no_valid_superblock");
                return Err(Fault::corrupt(
                    0,
                    format!("both superblock copies invalid: {primary}; {mirror}"),
                ));
            }
        };
        if copy.primary.layout_version != LAYOUT_VERSION {
            return Err(Fault::Format(format!(
                "layout version {} is not supported",
                copy.primary.layout_version
            )));
        }
        let block_size = copy
            .exsb
            .block_size()
            .map_err(|e| Fault::Format(format!("superblock block size: {e}")))?;
        if block_size.get() != dev.block_size() || copy.exsb.total_blocks > dev.block_count() {
            return Err(Fault::Format(format!(
                "volume of {} {}-byte blocks does not fit a device of {} {}-byte blocks",
                copy.exsb.total_blocks,
                block_size.get(),
                dev.block_count(),
                dev.block_size()
            )));
        }

        let TableRecovery {
            manager: snapshot,
            exsb,
            report,
        } = load_base_table(
            Arc::clone(&dev),
            &copy.exsb,
            mirror.as_ref().map(|m| &m.exsb),
            options.base_table_threshold,
        )?;
        let read_only = options.read_only;
        if !read_only && (report.restore_exsb || restore_primary) {
            write_superblock(dev.as_ref(), 0, &copy.primary, &exsb)?;
            dev.sync()?;
            info!(version = %exsb.version(), "superblock_restored");
        }
        if !read_only {
            snapshot.begin_mount_generation();
        }

        let bs = block_size.bytes();
        let fsm = FreeSpaceManager::open(
            Arc::clone(&dev),
            snapshot.sink(Subsystem::FreeSpaceBitmap),
            exsb.total_blocks,
            exsb.blocks_per_leb(),
        )?;
        let inodes = InodeAllocator::open(
            bs,
            exsb.inode_capacity,
            dev.as_ref(),
            snapshot.sink(Subsystem::InodeBitmap),
        )?;
        let mut catalog = CatalogTree::open(
            tree_geometry(&exsb, Subsystem::CatalogTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::CatalogTree),
            copy.primary.case_insensitive,
        )?;
        let extents = ExtentsTree::open(
            tree_geometry(&exsb, Subsystem::ExtentsTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::ExtentsTree),
        )?;
        let hardlinks = HardlinkTree::open(
            tree_geometry(&exsb, Subsystem::HardlinkTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::HardlinkTree),
        )?;
        let xattrs = XattrTree::open(
            tree_geometry(&exsb, Subsystem::XattrTree)?,
            Arc::clone(&dev),
            snapshot.sink(Subsystem::XattrTree),
        )?;

        let mut folders = HashMap::new();
        let mut files = 0_u64;
        let mut max_generation = 0_u32;
        let mut unmarked = Vec::new();
        catalog.for_each(|entry| {
            match &entry.record {
                Record::Folder(folder) => {
                    folders.insert(folder.meta.object_id, entry.key.clone());
                }
                Record::File(_) => files += 1,
                _ => {}
            }
            if let Some(meta) = entry.record.meta() {
                max_generation = max_generation.max(meta.generation.0);
                if !inodes.is_used(meta.object_id) {
                    unmarked.push(meta.object_id);
                }
            }
            Ok(())
        })?;
        hardlinks.for_each(|file| {
            files += 1;
            max_generation = max_generation.max(file.meta.generation.0);
            if !inodes.is_used(file.meta.object_id) {
                unmarked.push(file.meta.object_id);
            }
            Ok(())
        })?;
        if !folders.contains_key(&ObjectId::ROOT) {
            return Err(Fault::inconsistent("root folder record missing"));
        }
        for ino in unmarked {
            warn!(ino = ino.0, "inode_bitmap_missing_live_object");
            if !read_only {
                inodes.claim(ino)?;
            }
        }
        if options.nfs_index {
            catalog.attach_index(Arc::new(IndirectIndex::new()));
            catalog.rebuild_index(&hardlinks)?;
        }

        let counters = Counters {
            files,
            folders: folders.len() as u64,
            next_generation: exsb
                .generation_counter
                .max(max_generation.saturating_add(1)),
        };
        info!(
            name = %copy.primary.name(),
            version = %report.version,
            files,
            folders = counters.folders,
            read_only,
            nfs_index = options.nfs_index,
            "mount"
        );
        Ok(Self {
            primary: copy.primary,
            options: options.clone(),
            block_size: block_size.get(),
            blocks_per_leb: exsb.blocks_per_leb(),
            bnode_pages: exsb.bnode_pages,
            snapshot,
            md: Metadata {
                fsm,
                inodes,
                catalog,
                extents,
                hardlinks,
                xattrs,
            },
            barrier: TransactionBarrier::new(),
            inode_locks: InodeLockTable::new(),
            folders: RwLock::new(folders),
            counters: Mutex::new(counters),
            grow_lock: Mutex::new(()),
            rename_lock: Mutex::new(()),
            read_only: AtomicBool::new(read_only),
            recovery: report,
            dev,
        })
    }

    /// Commit the in-progress generation.
    ///
    /// Waits for running transactions and fails if called from inside
    /// one. A volume mounted read-only has nothing to commit; one degraded
    /// to read-only returns [`Fault::ReadOnly`]. Any failure while
    /// committing degrades the volume, leaving the previous generation on
    /// disk for the next mount.
    pub fn sync(&self) -> Result<()> {
        if self.barrier.in_transaction() {
            return Err(Fault::InvalidArgument(
                "sync called inside a transaction".to_owned(),
            ));
        }
        if self.is_read_only() {
            return if self.options.read_only {
                Ok(())
            } else {
                Err(Fault::ReadOnly)
            };
        }
        let _exclusive = self.barrier.exclusive()?;
        let result = self.sync_locked();
        if let Err(err) = &result {
            self.degrade("sync", &err.to_string());
        }
        result
    }

    fn sync_locked(&self) -> Result<()> {
        self.md.fsm.discard_all_preallocations()?;
        let space = self.md.fsm.stats();
        let counters = *self.counters.lock();
        self.snapshot.with_exsb_mut(|exsb| {
            exsb.free_blocks = space.free_blocks + space.reserved_blocks;
            exsb.files_count = counters.files;
            exsb.folders_count = counters.folders;
            exsb.generation_counter = counters.next_generation;
        });
        if !self.snapshot.is_dirty() && !self.md.is_dirty() {
            trace!("sync_clean");
            return Ok(());
        }
        let kind = commit(self.dev.as_ref(), &self.primary, &self.snapshot, &self.md)?;
        info!(
            version = %self.snapshot.committed_version(),
            kind = ?kind,
            free_blocks = space.free_blocks,
            "sync"
        );
        Ok(())
    }

    /// Sync and release the volume.
    pub fn unmount(self) -> Result<()> {
        self.sync()?;
        info!(name = %self.primary.name(), "unmount");
        Ok(())
    }

    /// Enter a transaction for a caller-driven sequence of operations.
    pub fn transaction(&self) -> Transaction<'_> {
        self.barrier.start()
    }

    /// Like [`VolumeHandle::transaction`], failing with
    /// [`Fault::Interrupted`] instead of waiting for a pending commit.
    pub fn try_transaction(&self) -> Result<Transaction<'_>> {
        self.barrier.try_start()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_case_insensitive(&self) -> bool {
        self.primary.case_insensitive
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn primary_superblock(&self) -> &PrimarySuperblock {
        &self.primary
    }

    /// In-memory extended superblock.
    #[must_use]
    pub fn superblock(&self) -> ExtendedSuperblock {
        self.snapshot.exsb()
    }

    /// How the translation table was rebuilt at mount.
    #[must_use]
    pub fn recovery_report(&self) -> &TableRecoveryReport {
        &self.recovery
    }

    #[must_use]
    pub fn committed_version(&self) -> Version {
        self.snapshot.committed_version()
    }

    /// Physical block of every page of `subsystem`, 0 where unmapped.
    #[must_use]
    pub fn translation_table(&self, subsystem: Subsystem) -> Vec<u64> {
        self.snapshot.table_snapshot(subsystem)
    }

    #[must_use]
    pub fn statfs(&self) -> VolumeStats {
        let space = self.md.fsm.stats();
        let counters = *self.counters.lock();
        let exsb = self.snapshot.exsb();
        VolumeStats {
            volume_name: self.primary.name(),
            block_size: self.block_size,
            erase_block_size: self.blocks_per_leb * u64::from(self.block_size),
            total_blocks: space.total_blocks,
            free_blocks: space.free_blocks,
            reserved_blocks: space.reserved_blocks,
            files: counters.files,
            folders: counters.folders,
            inode_capacity: exsb.inode_capacity,
            inodes_used: self.md.inodes.used(),
            meta: self.snapshot.usage(),
            version: self.snapshot.committed_version(),
            case_insensitive: self.primary.case_insensitive,
            read_only: self.is_read_only(),
        }
    }

    /// Run a metadata mutation inside a transaction.
    pub(crate) fn mutate<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.is_read_only() {
            return Err(Fault::ReadOnly);
        }
        let _txn = self.barrier.start();
        let result = self.ensure_meta_room().and_then(|()| f());
        self.note(op, result)
    }

    /// A broken invariant on a live volume stops all further writes.
    fn note<T>(&self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(Fault::Inconsistent { detail }) = &result {
            self.degrade(op, detail);
        }
        result
    }

    /// Stop all further writes. After a failed commit the in-memory
    /// snapshot bitmaps no longer describe the durable generation, so any
    /// later relocation could overwrite blocks it still uses.
    fn degrade(&self, op: &'static str, detail: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!(op, detail = %detail, "volume_degraded_read_only");
        }
    }

    /// Grow the metadata area by whole erase blocks when it runs low.
    fn ensure_meta_room(&self) -> Result<()> {
        let watermark = meta_watermark(self.bnode_pages);
        if self.snapshot.free_meta_blocks() >= watermark {
            return Ok(());
        }
        let _grow = self.grow_lock.lock();
        if self.snapshot.free_meta_blocks() >= watermark {
            return Ok(());
        }
        let bpl = self.blocks_per_leb;
        let wanted = (2 * watermark).div_ceil(bpl) * bpl;
        let extent = match self
            .md
            .fsm
            .get_free_block(self.snapshot.meta_end(), wanted, bpl, false)
        {
            Ok(extent) => extent,
            Err(Fault::NoSpace) => return self.meta_exhausted(),
            Err(err) => return Err(err),
        };
        let usable = extent.length / bpl * bpl;
        if usable == 0 || extent.begin % bpl != 0 {
            self.md.fsm.put_free_block(extent, false)?;
            return self.meta_exhausted();
        }
        if usable < extent.length {
            self.md
                .fsm
                .put_free_block(Extent::new(extent.begin + usable, extent.length - usable), false)?;
        }
        let grown = Extent::new(extent.begin, usable);
        if let Err(err) = self.snapshot.add_meta_extent(grown) {
            self.md.fsm.put_free_block(grown, false)?;
            warn!(error = %err, "meta_area_extents_exhausted");
            return self.meta_exhausted();
        }
        Ok(())
    }

    fn meta_exhausted(&self) -> Result<()> {
        if self.snapshot.free_meta_blocks() == 0 {
            return Err(Fault::NoSpace);
        }
        warn!(
            free_meta = self.snapshot.free_meta_blocks(),
            "meta_area_cannot_grow"
        );
        Ok(())
    }

    fn next_generation(&self) -> Generation {
        let mut counters = self.counters.lock();
        let generation = counters.next_generation;
        counters.next_generation = generation.wrapping_add(1).max(1);
        Generation(generation)
    }
}
