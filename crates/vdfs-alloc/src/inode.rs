//! Inode-number allocation over the `INOB` bitmap file.

use crate::bitmap::PagedBitmap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::INODE_BITMAP_MAGIC;
use vdfs_types::{ObjectId, Version};

#[derive(Debug)]
struct InodeState {
    bitmap: PagedBitmap,
    /// Where the next search starts.
    cursor: u64,
    used: u64,
}

/// Bit `n` set means object id `n` is in use. Ids below
/// [`ObjectId::FIRST_FILE`] are reserved and permanently set.
#[derive(Debug)]
pub struct InodeAllocator {
    state: Mutex<InodeState>,
}

impl InodeAllocator {
    /// Fresh allocator for a new volume.
    pub fn format(block_size: usize, capacity: u64, sink: Arc<dyn DirtyBlockSink>) -> Result<Self> {
        if capacity <= ObjectId::FIRST_FILE.0 {
            return Err(Fault::Format(format!(
                "inode capacity {capacity} leaves no room for files"
            )));
        }
        let mut bitmap = PagedBitmap::new(INODE_BITMAP_MAGIC, block_size, capacity, sink)?;
        bitmap.touch_all()?;
        bitmap.set_padding()?;
        bitmap.set(0, ObjectId::FIRST_FILE.0)?;
        Ok(Self {
            state: Mutex::new(InodeState {
                bitmap,
                cursor: ObjectId::FIRST_FILE.0,
                used: ObjectId::FIRST_FILE.0,
            }),
        })
    }

    pub fn open(
        block_size: usize,
        capacity: u64,
        dev: &dyn BlockDevice,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let bitmap = PagedBitmap::load(INODE_BITMAP_MAGIC, block_size, capacity, dev, sink)?;
        if (0..ObjectId::FIRST_FILE.0).any(|bit| !bitmap.test(bit)) {
            return Err(Fault::inconsistent("reserved object ids marked free"));
        }
        let used = bitmap.count_set(0, capacity);
        Ok(Self {
            state: Mutex::new(InodeState {
                bitmap,
                cursor: ObjectId::FIRST_FILE.0,
                used,
            }),
        })
    }

    /// Hand out the next free object id, searching forward from the last
    /// allocation and wrapping once.
    pub fn alloc_ino(&self) -> Result<ObjectId> {
        let mut state = self.state.lock();
        let cursor = state.cursor;
        let found = state
            .bitmap
            .find_next(cursor, false)
            .or_else(|| state.bitmap.find_next(ObjectId::FIRST_FILE.0, false))
            .ok_or(Fault::NoSpace)?;
        state.bitmap.set(found, 1)?;
        state.cursor = found + 1;
        state.used += 1;
        drop(state);
        trace!(ino = found, "ino_alloc");
        Ok(ObjectId(found))
    }

    pub fn free_ino(&self, ino: ObjectId) -> Result<()> {
        if ino < ObjectId::FIRST_FILE {
            return Err(Fault::InvalidArgument(format!(
                "object id {ino} is reserved"
            )));
        }
        let mut state = self.state.lock();
        state.bitmap.clear(ino.0, 1)?;
        state.used -= 1;
        drop(state);
        trace!(ino = ino.0, "ino_free");
        Ok(())
    }

    /// Mark a specific id used; used when a catalog scan finds an object
    /// the bitmap has not recorded.
    pub fn claim(&self, ino: ObjectId) -> Result<()> {
        let mut state = self.state.lock();
        state.bitmap.set(ino.0, 1)?;
        state.used += 1;
        Ok(())
    }

    #[must_use]
    pub fn is_used(&self, ino: ObjectId) -> bool {
        self.state.lock().bitmap.test(ino.0)
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.state.lock().bitmap.bits()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().bitmap.is_dirty()
    }

    pub fn flush(&self, dev: &dyn BlockDevice, version: Version) -> Result<usize> {
        let written = self.state.lock().bitmap.flush(dev, version)?;
        if written > 0 {
            debug!(pages = written, version = %version, "inode_bitmap_flush");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdfs_block::IdentitySink;

    fn allocator(capacity: u64) -> InodeAllocator {
        let sink = Arc::new(IdentitySink { base: 0, pages: 4 });
        InodeAllocator::format(1024, capacity, sink).expect("format")
    }

    #[test]
    fn reserved_ids_are_never_handed_out() {
        let alloc = allocator(64);
        let first = alloc.alloc_ino().expect("alloc");
        assert_eq!(first, ObjectId::FIRST_FILE);
        assert!(alloc.is_used(ObjectId::ROOT));
        assert!(matches!(
            alloc.free_ino(ObjectId::ROOT),
            Err(Fault::InvalidArgument(_))
        ));
    }

    #[test]
    fn freed_ids_are_reused_after_wrap() {
        let alloc = allocator(20);
        let ids: Vec<_> = (0..4).map(|_| alloc.alloc_ino().expect("alloc")).collect();
        assert_eq!(ids.last(), Some(&ObjectId(19)));
        assert!(matches!(alloc.alloc_ino(), Err(Fault::NoSpace)));
        alloc.free_ino(ObjectId(17)).expect("free");
        assert_eq!(alloc.alloc_ino().expect("alloc"), ObjectId(17));
        assert!(matches!(
            alloc.free_ino(ObjectId(40)),
            Err(Fault::Inconsistent { .. })
        ));
    }

    #[test]
    fn double_free_is_inconsistent() {
        let alloc = allocator(64);
        let id = alloc.alloc_ino().expect("alloc");
        alloc.free_ino(id).expect("free");
        assert!(matches!(alloc.free_ino(id), Err(Fault::Inconsistent { .. })));
        assert_eq!(alloc.used(), ObjectId::FIRST_FILE.0);
    }
}
