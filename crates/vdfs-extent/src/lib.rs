#![forbid(unsafe_code)]
//! Block maps of regular files.
//!
//! A file keeps its newest extents inline in its [`Fork`]. When the inline
//! array is full the oldest inline extent moves to the extents overflow
//! tree, keyed by `(object_id, iblock)`. Every extent in the tree therefore
//! maps lower logical blocks than every inline extent of the same file.
//!
//! [`ExtentsTree::insert_extent`] applies the growth policy:
//!
//! 1. extend the last inline extent if the new run continues it both
//!    logically and physically,
//! 2. otherwise add it to the inline array if there is room,
//! 3. otherwise spill the oldest inline extent to the tree and add it,
//! 4. a run below the inline range (a hole being filled) goes straight to
//!    the tree.
//!
//! The fork is only modified after every tree update succeeded, so a
//! failed insertion leaves both unchanged.

pub mod fork;

pub use fork::{FORK_LEN, Fork, ForkExtent};

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_btree::{BTree, TreeGeometry, TreeStats};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::Extent;
use vdfs_types::{ObjectId, Subsystem, Version};

const KEY_LEN: usize = 16;
const VALUE_LEN: usize = 16;

fn encode_key(object_id: ObjectId, iblock: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    key.extend_from_slice(&object_id.0.to_le_bytes());
    key.extend_from_slice(&iblock.to_le_bytes());
    key
}

fn decode_key(key: &[u8]) -> Option<(u64, u64)> {
    let object_id = u64::from_le_bytes(key.get(..8)?.try_into().ok()?);
    let iblock = u64::from_le_bytes(key.get(8..KEY_LEN)?.try_into().ok()?);
    Some((object_id, iblock))
}

fn encode_value(extent: &ForkExtent) -> Vec<u8> {
    let mut value = Vec::with_capacity(VALUE_LEN);
    value.extend_from_slice(&extent.first_block.to_le_bytes());
    value.extend_from_slice(&extent.block_count.to_le_bytes());
    value
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<(u64, ForkExtent)> {
    let bad = || Fault::inconsistent("malformed extents tree record");
    let (object_id, iblock) = decode_key(key).ok_or_else(bad)?;
    let value: [u8; VALUE_LEN] = value.try_into().map_err(|_| bad())?;
    let (first, count) = value.split_at(8);
    let first_block = u64::from_le_bytes(first.try_into().map_err(|_| bad())?);
    let block_count = u64::from_le_bytes(count.try_into().map_err(|_| bad())?);
    Ok((object_id, ForkExtent::new(first_block, iblock, block_count)))
}

/// Orders keys by object id, then logical block.
#[must_use]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (decode_key(a), decode_key(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Contiguous physical run starting at a looked-up logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub physical: u64,
    /// Blocks mapped contiguously from the looked-up block on.
    pub count: u64,
}

fn mapping_in(extent: &ForkExtent, iblock: u64) -> Mapping {
    let skip = iblock - extent.iblock;
    Mapping {
        physical: extent.first_block + skip,
        count: extent.block_count - skip,
    }
}

/// Extents overflow tree.
#[derive(Debug)]
pub struct ExtentsTree {
    tree: RwLock<BTree>,
}

impl ExtentsTree {
    pub fn create(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let tree = BTree::create(Subsystem::ExtentsTree, compare_keys, geometry, dev, sink)?;
        Ok(Self {
            tree: RwLock::new(tree),
        })
    }

    pub fn open(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let tree = BTree::open(Subsystem::ExtentsTree, compare_keys, geometry, dev, sink)?;
        Ok(Self {
            tree: RwLock::new(tree),
        })
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.tree.read().is_dirty()
    }

    pub fn flush(&self, version: Version) -> Result<usize> {
        self.tree.write().flush(version)
    }

    /// Overflow extents of one file in ascending `iblock` order.
    pub fn overflow_extents(&self, object_id: ObjectId) -> Result<Vec<ForkExtent>> {
        let tree = self.tree.read();
        collect_object(&tree, object_id)
    }

    /// Every extent of a file, overflow first, then inline.
    pub fn all_extents(&self, object_id: ObjectId, fork: &Fork) -> Result<Vec<ForkExtent>> {
        let mut extents = self.overflow_extents(object_id)?;
        extents.extend_from_slice(&fork.extents);
        Ok(extents)
    }

    /// Physical location of logical block `iblock`, or `None` for a hole.
    pub fn map_block(
        &self,
        object_id: ObjectId,
        fork: &Fork,
        iblock: u64,
    ) -> Result<Option<Mapping>> {
        if let Some(extent) = fork.extents.iter().find(|e| e.contains(iblock)) {
            return Ok(Some(mapping_in(extent, iblock)));
        }
        if fork.extents.first().is_some_and(|e| iblock >= e.iblock) {
            return Ok(None);
        }
        let found = self
            .overflow_extents(object_id)?
            .into_iter()
            .find(|e| e.contains(iblock));
        Ok(found.map(|e| mapping_in(&e, iblock)))
    }

    /// Record a freshly allocated run in the file's block map.
    ///
    /// Fails with [`Fault::InvalidArgument`] if the run overlaps an already
    /// mapped range, and with [`Fault::NoSpace`] when the tree cannot take a
    /// spilled extent; in both cases `fork` is left untouched.
    pub fn insert_extent(
        &self,
        object_id: ObjectId,
        fork: &mut Fork,
        extent: ForkExtent,
    ) -> Result<()> {
        if extent.block_count == 0 {
            return Err(Fault::InvalidArgument("empty extent".to_owned()));
        }
        let mut tree = self.tree.write();
        let overflow = collect_object(&tree, object_id)?;
        if let Some(clash) = overflow
            .iter()
            .chain(&fork.extents)
            .find(|e| e.overlaps(&extent))
        {
            return Err(Fault::InvalidArgument(format!(
                "blocks {}..{} of object {object_id} already mapped",
                clash.iblock,
                clash.iblock_end()
            )));
        }

        if let Some(last) = fork.extents.last_mut() {
            if last.is_followed_by(&extent) {
                last.block_count += extent.block_count;
                fork.total_blocks += extent.block_count;
                trace!(ino = object_id.0, iblock = extent.iblock, "extent_extend");
                return Ok(());
            }
        }

        let overflow_end = overflow.last().map_or(0, ForkExtent::iblock_end);
        let belongs_inline = match fork.extents.first() {
            Some(first) => extent.iblock > first.iblock,
            None => extent.iblock >= overflow_end,
        };
        if !belongs_inline {
            tree.insert(encode_key(object_id, extent.iblock), encode_value(&extent))?;
            fork.total_blocks += extent.block_count;
            trace!(ino = object_id.0, iblock = extent.iblock, "extent_overflow_insert");
            return Ok(());
        }

        if fork.is_full() {
            let oldest = fork.extents[0];
            tree.insert(encode_key(object_id, oldest.iblock), encode_value(&oldest))?;
            fork.extents.remove(0);
            debug!(
                ino = object_id.0,
                iblock = oldest.iblock,
                blocks = oldest.block_count,
                "extent_spill"
            );
        }
        let pos = fork.extents.partition_point(|e| e.iblock < extent.iblock);
        fork.extents.insert(pos, extent);
        fork.total_blocks += extent.block_count;
        trace!(ino = object_id.0, iblock = extent.iblock, "extent_inline_insert");
        Ok(())
    }

    /// Unmap every logical block at or past `keep_blocks`, trimming the
    /// extent that straddles it. Returns the physical runs released, in
    /// logical order, for the caller to hand back to free space.
    pub fn truncate(
        &self,
        object_id: ObjectId,
        fork: &mut Fork,
        keep_blocks: u64,
    ) -> Result<Vec<Extent>> {
        let mut released = Vec::new();
        let mut tree = self.tree.write();
        for extent in collect_object(&tree, object_id)? {
            if extent.iblock_end() <= keep_blocks {
                continue;
            }
            let key = encode_key(object_id, extent.iblock);
            if extent.iblock >= keep_blocks {
                tree.remove(&key)?;
                released.push(Extent::new(extent.first_block, extent.block_count));
            } else {
                let kept = keep_blocks - extent.iblock;
                let trimmed = ForkExtent::new(extent.first_block, extent.iblock, kept);
                tree.update(&key, encode_value(&trimmed))?;
                released.push(Extent::new(
                    extent.first_block + kept,
                    extent.block_count - kept,
                ));
            }
        }
        drop(tree);

        let mut inline = Vec::with_capacity(fork.extents.len());
        for extent in fork.extents.drain(..) {
            if extent.iblock_end() <= keep_blocks {
                inline.push(extent);
            } else if extent.iblock >= keep_blocks {
                released.push(Extent::new(extent.first_block, extent.block_count));
            } else {
                let kept = keep_blocks - extent.iblock;
                inline.push(ForkExtent::new(extent.first_block, extent.iblock, kept));
                released.push(Extent::new(
                    extent.first_block + kept,
                    extent.block_count - kept,
                ));
            }
        }
        fork.extents = inline;
        let freed: u64 = released.iter().map(|e| e.length).sum();
        fork.total_blocks = fork.total_blocks.saturating_sub(freed);
        if freed > 0 {
            debug!(ino = object_id.0, keep_blocks, freed, "extent_truncate");
        }
        Ok(released)
    }

    /// Unmap a run previously added by [`ExtentsTree::insert_extent`].
    ///
    /// The run must be a whole mapped extent or the tail of one (an
    /// insertion that extended its predecessor). Used to roll back a
    /// partially completed allocation.
    pub fn remove_extent(
        &self,
        object_id: ObjectId,
        fork: &mut Fork,
        extent: ForkExtent,
    ) -> Result<()> {
        let not_mapped = || {
            Fault::InvalidArgument(format!(
                "blocks {}..{} of object {object_id} are not a removable run",
                extent.iblock,
                extent.iblock_end()
            ))
        };
        if let Some(pos) = fork.extents.iter().position(|e| e.contains(extent.iblock)) {
            let current = fork.extents[pos];
            if current.iblock_end() != extent.iblock_end()
                || current.first_block + (extent.iblock - current.iblock) != extent.first_block
            {
                return Err(not_mapped());
            }
            if current.iblock == extent.iblock {
                fork.extents.remove(pos);
            } else {
                fork.extents[pos].block_count -= extent.block_count;
            }
        } else {
            let mut tree = self.tree.write();
            let current = collect_object(&tree, object_id)?
                .into_iter()
                .find(|e| e.contains(extent.iblock))
                .ok_or_else(not_mapped)?;
            if current.iblock_end() != extent.iblock_end()
                || current.first_block + (extent.iblock - current.iblock) != extent.first_block
            {
                return Err(not_mapped());
            }
            let key = encode_key(object_id, current.iblock);
            if current.iblock == extent.iblock {
                tree.remove(&key)?;
            } else {
                let kept = ForkExtent::new(
                    current.first_block,
                    current.iblock,
                    current.block_count - extent.block_count,
                );
                tree.update(&key, encode_value(&kept))?;
            }
        }
        fork.total_blocks = fork.total_blocks.saturating_sub(extent.block_count);
        trace!(ino = object_id.0, iblock = extent.iblock, "extent_remove");
        Ok(())
    }

    /// Structural check plus per-file ordering of the overflow records.
    pub fn check(&self) -> Result<TreeStats> {
        let tree = self.tree.read();
        let stats = tree.check()?;
        let mut prev: Option<(u64, ForkExtent)> = None;
        for record in tree.iter()? {
            let record = record?;
            let (object_id, extent) = decode_record(&record.key, &record.value)?;
            if extent.block_count == 0 {
                return Err(Fault::inconsistent(format!(
                    "object {object_id} has an empty overflow extent at {}",
                    extent.iblock
                )));
            }
            if let Some((prev_id, prev_extent)) = prev {
                if prev_id == object_id && prev_extent.iblock_end() > extent.iblock {
                    return Err(Fault::inconsistent(format!(
                        "object {object_id} overflow extents overlap at {}",
                        extent.iblock
                    )));
                }
            }
            prev = Some((object_id, extent));
        }
        Ok(stats)
    }

    /// Every overflow record in key order, for fsck.
    pub fn for_each(&self, mut f: impl FnMut(ObjectId, ForkExtent) -> Result<()>) -> Result<()> {
        let tree = self.tree.read();
        for record in tree.iter()? {
            let record = record?;
            let (object_id, extent) = decode_record(&record.key, &record.value)?;
            f(ObjectId(object_id), extent)?;
        }
        Ok(())
    }
}

fn collect_object(tree: &BTree, object_id: ObjectId) -> Result<Vec<ForkExtent>> {
    let mut extents = Vec::new();
    for record in tree.iter_from(&encode_key(object_id, 0))? {
        let record = record?;
        let (owner, extent) = decode_record(&record.key, &record.value)?;
        if owner != object_id.0 {
            break;
        }
        extents.push(extent);
    }
    Ok(extents)
}
