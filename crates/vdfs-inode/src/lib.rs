#![forbid(unsafe_code)]
//! Inode management.
//!
//! [`FilesystemInode`] is a decoded snapshot of one object: where its
//! catalog record lives, its metadata, and for files the fork. It is read
//! from the catalog (and the hardlink tree for hard-linked files) and
//! written back as a whole record; nothing aliases tree memory.
//!
//! [`InodeLockTable`] hands out the per-inode mutex that serializes fork
//! growth and truncation of one file.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use vdfs_catalog::{CatalogEntry, CatalogKey, FileRecord, FolderRecord, ObjectMeta, Record, Timestamp};
use vdfs_error::{Fault, Result};
use vdfs_extent::Fork;
use vdfs_types::{ObjectId, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// Type-specific part of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeBody {
    Folder { total_items: u64 },
    File { fork: Fork },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemInode {
    /// Catalog key the inode was looked up through.
    pub key: CatalogKey,
    pub meta: ObjectMeta,
    pub body: InodeBody,
    /// Metadata lives in the hardlink tree; the catalog holds an `Hlink`.
    pub hardlinked: bool,
}

impl FilesystemInode {
    /// Decode a catalog entry. `hardlink` must be the hardlink-tree record
    /// when the entry is an `Hlink`.
    pub fn from_entry(entry: CatalogEntry, hardlink: Option<FileRecord>) -> Result<Self> {
        let CatalogEntry { key, record } = entry;
        match record {
            Record::Folder(folder) => Ok(Self {
                key,
                meta: folder.meta,
                body: InodeBody::Folder {
                    total_items: folder.total_items,
                },
                hardlinked: false,
            }),
            Record::File(file) => Ok(Self {
                key,
                meta: file.meta,
                body: InodeBody::File { fork: file.fork },
                hardlinked: false,
            }),
            Record::Hlink { object_id } => {
                let file = hardlink.ok_or_else(|| {
                    Fault::inconsistent(format!("hard link {key} to {object_id} has no target"))
                })?;
                if file.meta.object_id != object_id {
                    return Err(Fault::inconsistent(format!(
                        "hard link {key} points at {object_id}, target is {}",
                        file.meta.object_id
                    )));
                }
                Ok(Self {
                    key,
                    meta: file.meta,
                    body: InodeBody::File { fork: file.fork },
                    hardlinked: true,
                })
            }
            other => Err(Fault::InvalidArgument(format!(
                "{key} is a {:?} record",
                other.record_type()
            ))),
        }
    }

    #[must_use]
    pub fn ino(&self) -> ObjectId {
        self.meta.object_id
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.body, InodeBody::Folder { .. })
    }

    #[must_use]
    pub fn fork(&self) -> Option<&Fork> {
        match &self.body {
            InodeBody::File { fork } => Some(fork),
            InodeBody::Folder { .. } => None,
        }
    }

    pub fn fork_mut(&mut self) -> Result<&mut Fork> {
        match &mut self.body {
            InodeBody::File { fork } => Ok(fork),
            InodeBody::Folder { .. } => Err(Fault::IsDirectory),
        }
    }

    /// Full record for the catalog (or the hardlink tree when
    /// [`Self::hardlinked`]).
    #[must_use]
    pub fn to_record(&self) -> Record {
        match &self.body {
            InodeBody::Folder { total_items } => Record::Folder(FolderRecord {
                meta: self.meta,
                total_items: *total_items,
            }),
            InodeBody::File { fork } => Record::File(FileRecord {
                meta: self.meta,
                fork: fork.clone(),
            }),
        }
    }

    /// The file record, for hardlink-tree updates.
    pub fn to_file_record(&self) -> Result<FileRecord> {
        match self.to_record() {
            Record::File(file) => Ok(file),
            _ => Err(Fault::IsDirectory),
        }
    }

    #[must_use]
    pub fn attr(&self, block_size: u32) -> InodeAttr {
        let (size, blocks) = match &self.body {
            InodeBody::File { fork } => (fork.size_in_bytes, fork.total_blocks),
            InodeBody::Folder { total_items } => (*total_items, 0),
        };
        InodeAttr {
            ino: self.meta.object_id,
            generation: self.meta.generation.0,
            kind: FileType::from_mode(self.meta.mode),
            perm: self.meta.mode & !S_IFMT,
            nlink: self.meta.links_count,
            uid: self.meta.uid,
            gid: self.meta.gid,
            size,
            blocks,
            blksize: block_size,
            atime: self.meta.atime,
            mtime: self.meta.mtime,
            ctime: self.meta.ctime,
            crtime: self.meta.crtime,
            flags: self.meta.flags,
        }
    }

    /// Apply the fields present in `set`. Changing anything updates ctime.
    /// `size` is handled by the caller's truncate path.
    pub fn apply(&mut self, set: &SetAttr) {
        let meta = &mut self.meta;
        if let Some(mode) = set.mode {
            meta.mode = (meta.mode & S_IFMT) | (mode & !S_IFMT);
        }
        if let Some(uid) = set.uid {
            meta.uid = uid;
        }
        if let Some(gid) = set.gid {
            meta.gid = gid;
        }
        if let Some(atime) = set.atime {
            meta.atime = atime;
        }
        if let Some(mtime) = set.mtime {
            meta.mtime = mtime;
        }
        if let Some(flags) = set.flags {
            meta.flags = flags;
        }
        meta.ctime = Timestamp::now();
    }
}

/// Attributes as returned by `getattr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: ObjectId,
    pub generation: u32,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Bytes for files, entries for folders.
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
    pub flags: u32,
}

/// Fields a `setattr` call may change; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
    pub flags: Option<u32>,
}

/// Per-inode mutexes, created on demand and dropped when unused.
#[derive(Debug, Default)]
pub struct InodeLockTable {
    locks: Mutex<HashMap<ObjectId, Arc<Mutex<()>>>>,
}

impl InodeLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` holding `ino`'s mutex.
    pub fn with<R>(&self, ino: ObjectId, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.locks.lock().entry(ino).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.locks.lock();
        drop(lock);
        if locks.get(&ino).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&ino);
        }
        result
    }

    /// Inodes with a lock currently allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vdfs_catalog::RecordType;
    use vdfs_types::Generation;

    fn file_entry() -> CatalogEntry {
        CatalogEntry {
            key: CatalogKey::new(ObjectId::ROOT, "f").expect("key"),
            record: Record::File(FileRecord {
                meta: ObjectMeta::new(ObjectId(20), Generation(2), S_IFREG | 0o600),
                fork: Fork {
                    size_in_bytes: 10,
                    total_blocks: 1,
                    extents: Vec::new(),
                },
            }),
        }
    }

    #[test]
    fn record_round_trips_through_inode() {
        let entry = file_entry();
        let inode = FilesystemInode::from_entry(entry.clone(), None).expect("inode");
        assert_eq!(inode.to_record(), entry.record);
        let attr = inode.attr(4096);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.size, 10);
    }

    #[test]
    fn hlink_needs_its_target() {
        let Record::File(target) = file_entry().record else {
            unreachable!()
        };
        let entry = CatalogEntry {
            key: CatalogKey::new(ObjectId::ROOT, "g").expect("key"),
            record: Record::Hlink {
                object_id: ObjectId(20),
            },
        };
        assert!(FilesystemInode::from_entry(entry.clone(), None).is_err());
        let inode = FilesystemInode::from_entry(entry, Some(target)).expect("inode");
        assert!(inode.hardlinked);
        assert_eq!(inode.to_record().record_type(), RecordType::File);
    }

    #[test]
    fn setattr_keeps_file_type() {
        let mut inode = FilesystemInode::from_entry(file_entry(), None).expect("inode");
        inode.apply(&SetAttr {
            mode: Some(S_IFDIR | 0o755),
            uid: Some(7),
            ..SetAttr::default()
        });
        assert_eq!(inode.meta.mode, S_IFREG | 0o755);
        assert_eq!(inode.meta.uid, 7);
    }

    #[test]
    fn lock_table_serializes_and_cleans_up() {
        let table = Arc::new(InodeLockTable::new());
        let inside = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        table.with(ObjectId(20), || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert!(table.is_empty());
    }
}
