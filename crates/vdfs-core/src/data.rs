//! File block maps: allocation on write, truncation and mapping queries.

use crate::VolumeHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use vdfs_catalog::{CatalogKey, Timestamp};
use vdfs_error::{Fault, Result};
use vdfs_extent::{Fork, ForkExtent};
use vdfs_inode::FilesystemInode;
use vdfs_ondisk::Extent;
use vdfs_types::ObjectId;

/// A run of logical blocks and where it lives; `physical` is `None` for a
/// hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedRange {
    pub iblock: u64,
    pub physical: Option<u64>,
    pub count: u64,
}

/// Unmapped logical ranges of `[first, last)` given extents sorted by
/// logical block.
fn holes(extents: &[ForkExtent], first: u64, last: u64) -> Vec<(u64, u64)> {
    let mut holes = Vec::new();
    let mut cursor = first;
    for extent in extents {
        if extent.iblock_end() <= cursor {
            continue;
        }
        if extent.iblock >= last {
            break;
        }
        if extent.iblock > cursor {
            holes.push((cursor, extent.iblock));
        }
        cursor = extent.iblock_end();
    }
    if cursor < last {
        holes.push((cursor, last));
    }
    holes
}

impl VolumeHandle {
    fn block_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Fault::InvalidArgument("byte range overflows".to_owned()))?;
        let bs = u64::from(self.block_size);
        Ok((offset / bs, end.div_ceil(bs)))
    }

    /// Allocate blocks so that bytes `offset..offset + len` of the file are
    /// backed, and grow its size to cover them. Returns the runs that were
    /// newly mapped. Either every hole is filled or nothing changes.
    pub fn write_extents(
        &self,
        key: &CatalogKey,
        offset: u64,
        len: u64,
    ) -> Result<Vec<ForkExtent>> {
        let (first, last) = self.block_range(offset, len)?;
        self.mutate("write_extents", || {
            let ino = self.object_id(key)?;
            self.inode_locks.with(ino, || {
                let mut inode = self.load(key)?;
                let mut added = Vec::new();
                let filled = {
                    let fork = inode.fork_mut()?;
                    let mapped = self.md.extents.all_extents(ino, fork)?;
                    let holes = holes(&mapped, first, last);
                    let wanted: u64 = holes.iter().map(|(start, end)| end - start).sum();
                    let available = self.md.fsm.free_blocks()
                        + self.md.fsm.preallocated(ino).map_or(0, |e| e.length);
                    if wanted > available {
                        return Err(Fault::NoSpace);
                    }
                    self.fill_holes(ino, fork, &holes, &mut added)
                };
                if let Err(err) = filled {
                    // Spills into the overflow tree are kept; the fork is
                    // stored so it agrees with them.
                    self.unwind(ino, inode.fork_mut()?, &added)?;
                    self.store(&inode)?;
                    return Err(err);
                }
                let fork = inode.fork_mut()?;
                fork.size_in_bytes = fork.size_in_bytes.max(offset + len);
                let now = Timestamp::now();
                inode.meta.mtime = now;
                inode.meta.ctime = now;
                self.store(&inode)?;
                trace!(ino = ino.0, first, last, runs = added.len(), "write_extents");
                Ok(added)
            })
        })
    }

    fn fill_holes(
        &self,
        ino: ObjectId,
        fork: &mut Fork,
        holes: &[(u64, u64)],
        added: &mut Vec<ForkExtent>,
    ) -> Result<()> {
        for &(start, end) in holes {
            let mut iblock = start;
            while iblock < end {
                let hint = match iblock.checked_sub(1) {
                    Some(prev) => self
                        .md
                        .extents
                        .map_block(ino, fork, prev)?
                        .map_or(0, |m| m.physical + 1),
                    None => 0,
                };
                let got = self.md.fsm.alloc_for_inode(
                    ino,
                    hint,
                    end - iblock,
                    self.options.prealloc_blocks,
                )?;
                let extent = ForkExtent::new(got.begin, iblock, got.length);
                if let Err(err) = self.md.extents.insert_extent(ino, fork, extent) {
                    self.md.fsm.put_free_block(got, false)?;
                    return Err(err);
                }
                added.push(extent);
                iblock += got.length;
            }
        }
        Ok(())
    }

    /// Undo the runs a failed write mapped, newest first.
    fn unwind(&self, ino: ObjectId, fork: &mut Fork, added: &[ForkExtent]) -> Result<()> {
        for extent in added.iter().rev() {
            self.md.extents.remove_extent(ino, fork, *extent)?;
            self.md
                .fsm
                .put_free_block(Extent::new(extent.first_block, extent.block_count), false)?;
        }
        debug!(ino = ino.0, runs = added.len(), "write_extents_unwound");
        Ok(())
    }

    /// Set the file size, unmapping whole blocks past the new end. Returns
    /// the physical runs to free once the inode is stored.
    pub(crate) fn resize_fork(&self, inode: &mut FilesystemInode, size: u64) -> Result<Vec<Extent>> {
        let ino = inode.ino();
        let keep = size.div_ceil(u64::from(self.block_size));
        let fork = inode.fork_mut()?;
        let released = if size < fork.size_in_bytes || keep < fork.total_blocks {
            self.md.fsm.discard_preallocation(ino)?;
            self.md.extents.truncate(ino, fork, keep)?
        } else {
            Vec::new()
        };
        fork.size_in_bytes = size;
        Ok(released)
    }

    pub(crate) fn free_extents(&self, extents: Vec<Extent>) -> Result<()> {
        for extent in extents {
            self.md.fsm.put_free_block(extent, false)?;
        }
        Ok(())
    }

    /// Change a file's size. Shrinking frees the blocks past the new end;
    /// growing leaves a hole.
    pub fn truncate(&self, key: &CatalogKey, size: u64) -> Result<()> {
        self.mutate("truncate", || {
            let ino = self.object_id(key)?;
            let released = self.inode_locks.with(ino, || {
                let mut inode = self.load(key)?;
                let released = self.resize_fork(&mut inode, size)?;
                let now = Timestamp::now();
                inode.meta.mtime = now;
                inode.meta.ctime = now;
                self.store(&inode)?;
                Ok::<_, Fault>(released)
            })?;
            let freed: u64 = released.iter().map(|e| e.length).sum();
            self.free_extents(released)?;
            debug!(ino = ino.0, size, freed, "truncate");
            Ok(())
        })
    }

    /// Physical layout of bytes `offset..offset + len`, holes included.
    pub fn read_map(&self, key: &CatalogKey, offset: u64, len: u64) -> Result<Vec<MappedRange>> {
        let (first, last) = self.block_range(offset, len)?;
        let inode = self.load(key)?;
        let fork = inode.fork().ok_or(Fault::IsDirectory)?;
        let extents = self.md.extents.all_extents(inode.ino(), fork)?;
        let mut ranges = Vec::new();
        let mut cursor = first;
        for extent in &extents {
            if extent.iblock_end() <= cursor {
                continue;
            }
            if extent.iblock >= last {
                break;
            }
            if extent.iblock > cursor {
                ranges.push(MappedRange {
                    iblock: cursor,
                    physical: None,
                    count: extent.iblock - cursor,
                });
                cursor = extent.iblock;
            }
            let end = extent.iblock_end().min(last);
            ranges.push(MappedRange {
                iblock: cursor,
                physical: Some(extent.first_block + (cursor - extent.iblock)),
                count: end - cursor,
            });
            cursor = end;
        }
        if cursor < last {
            ranges.push(MappedRange {
                iblock: cursor,
                physical: None,
                count: last - cursor,
            });
        }
        Ok(ranges)
    }

    /// Set aside `blocks` for a later delayed allocation.
    pub fn reserve_blocks(&self, blocks: u64) -> Result<()> {
        if self.is_read_only() {
            return Err(Fault::ReadOnly);
        }
        self.md.fsm.reserve(blocks)
    }

    /// Give back reserved blocks that will not be allocated. Releasing more
    /// than was reserved means the counters are broken.
    pub fn free_reserved_space(&self, blocks: u64) -> Result<()> {
        let result = self.md.fsm.free_reserved_space(blocks);
        self.note("free_reserved_space", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn holes_between_and_around_extents() {
        let extents = [ForkExtent::new(100, 2, 3), ForkExtent::new(200, 8, 2)];
        assert_eq!(holes(&extents, 0, 12), vec![(0, 2), (5, 8), (10, 12)]);
        assert_eq!(holes(&extents, 3, 5), Vec::<(u64, u64)>::new());
        assert_eq!(holes(&extents, 4, 9), vec![(5, 8)]);
        assert_eq!(holes(&[], 1, 4), vec![(1, 4)]);
    }

    proptest! {
        #[test]
        fn holes_and_extents_tile_the_range(
            runs in proptest::collection::vec((0_u64..4, 1_u64..5), 0..8),
            first in 0_u64..20,
            span in 0_u64..40,
        ) {
            let mut extents = Vec::new();
            let mut iblock = 0;
            for (gap, len) in runs {
                iblock += gap;
                extents.push(ForkExtent::new(1000 + iblock, iblock, len));
                iblock += len;
            }
            let last = first + span;
            let mut covered = vec![0_u8; usize::try_from(last).unwrap_or(0)];
            for (start, end) in holes(&extents, first, last) {
                prop_assert!(first <= start && start < end && end <= last);
                for b in start..end {
                    covered[b as usize] += 1;
                }
            }
            for e in &extents {
                for b in e.iblock.max(first)..e.iblock_end().min(last) {
                    covered[b as usize] += 1;
                }
            }
            prop_assert!(covered[first as usize..].iter().all(|c| *c == 1));
        }
    }
}
