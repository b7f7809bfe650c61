//! Namespace operations: everything that adds, removes or renames catalog
//! entries, plus attribute and xattr access.
//!
//! Namespace calls name their target as `(parent, name)`; calls on an
//! existing object take the [`CatalogKey`] it was looked up through, which
//! for a hard-linked file can be any of its names.

use crate::VolumeHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vdfs_catalog::{
    CatalogEntry, CatalogKey, FileHandle, FileRecord, FolderRecord, ObjectMeta, Record, Timestamp,
};
use vdfs_error::{Fault, Result};
use vdfs_extent::Fork;
use vdfs_inode::{FileType, FilesystemInode, InodeAttr, InodeBody, SetAttr};
use vdfs_types::{ObjectId, S_IFDIR, S_IFMT, S_IFREG};
use vdfs_xattr::SetMode;

/// One `readdir` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: ObjectId,
    pub kind: FileType,
}

fn object_of(entry: &CatalogEntry) -> Result<ObjectId> {
    entry.record.object_id().ok_or_else(|| {
        Fault::InvalidArgument(format!(
            "{} is a {:?} record",
            entry.key,
            entry.record.record_type()
        ))
    })
}

fn adjust(value: u64, delta: i64, what: &str, ino: ObjectId) -> Result<u64> {
    value
        .checked_add_signed(delta)
        .ok_or_else(|| Fault::inconsistent(format!("{what} of folder {ino} would leave range")))
}

impl VolumeHandle {
    /// Load the inode stored under `key`, following a hard link.
    pub(crate) fn load(&self, key: &CatalogKey) -> Result<FilesystemInode> {
        let entry = self.md.catalog.get(key)?;
        let hardlink = match &entry.record {
            Record::Hlink { object_id } => Some(self.md.hardlinks.get(*object_id)?),
            _ => None,
        };
        FilesystemInode::from_entry(entry, hardlink)
    }

    /// Write an inode back where its metadata lives.
    pub(crate) fn store(&self, inode: &FilesystemInode) -> Result<()> {
        if inode.hardlinked {
            self.md.hardlinks.update(&inode.to_file_record()?)
        } else {
            self.md.catalog.update(&inode.key, &inode.to_record())
        }
    }

    pub(crate) fn object_id(&self, key: &CatalogKey) -> Result<ObjectId> {
        object_of(&self.md.catalog.get(key)?)
    }

    /// Catalog key of folder `ino`.
    fn folder_key(&self, ino: ObjectId) -> Result<CatalogKey> {
        if let Some(key) = self.folders.read().get(&ino) {
            return Ok(key.clone());
        }
        if self.md.inodes.is_used(ino) {
            Err(Fault::NotDirectory)
        } else {
            Err(Fault::NotFound(format!("folder {ino}")))
        }
    }

    /// Insert `record` under `key`. Hard-link names are registered in the
    /// handle index here; other records index themselves on insert.
    fn insert_entry(&self, key: &CatalogKey, record: &Record) -> Result<()> {
        self.md.catalog.insert(key.parent, &key.name, record)?;
        if let Record::Hlink { object_id } = record {
            if self.md.catalog.index().is_some() {
                let generation = self.md.hardlinks.get(*object_id)?.meta.generation;
                self.md.catalog.index_name(
                    FileHandle {
                        ino: *object_id,
                        generation,
                    },
                    key.clone(),
                );
            }
        }
        Ok(())
    }

    /// Adjust a folder's item and link counts and stamp mtime/ctime. The
    /// caller holds the folder's inode lock.
    fn adjust_folder(&self, key: &CatalogKey, items: i64, links: i64) -> Result<()> {
        let mut inode = self.load(key)?;
        let ino = inode.ino();
        let InodeBody::Folder { total_items } = &mut inode.body else {
            return Err(Fault::inconsistent(format!("{key} is not a folder")));
        };
        *total_items = adjust(*total_items, items, "item count", ino)?;
        let nlink = adjust(u64::from(inode.meta.links_count), links, "link count", ino)?;
        inode.meta.links_count = u32::try_from(nlink)
            .map_err(|_| Fault::inconsistent(format!("link count of folder {ino} overflows")))?;
        let now = Timestamp::now();
        inode.meta.mtime = now;
        inode.meta.ctime = now;
        self.store(&inode)
    }

    fn touch_parent(&self, parent: ObjectId, items: i64, links: i64) -> Result<()> {
        self.inode_locks.with(parent, || {
            let key = self.folder_key(parent)?;
            self.adjust_folder(&key, items, links)
        })
    }

    fn count_object(&self, is_dir: bool, delta: i64) {
        let mut counters = self.counters.lock();
        let slot = if is_dir {
            &mut counters.folders
        } else {
            &mut counters.files
        };
        *slot = slot.saturating_add_signed(delta);
    }

    /// Whether folder `ancestor` is `dir` or one of its ancestors.
    fn is_ancestor(&self, ancestor: ObjectId, mut dir: ObjectId) -> bool {
        let folders = self.folders.read();
        for _ in 0..=folders.len() {
            if dir == ancestor {
                return true;
            }
            if dir == ObjectId::ROOT {
                return false;
            }
            match folders.get(&dir) {
                Some(key) => dir = key.parent,
                None => return false,
            }
        }
        false
    }

    /// The root folder.
    pub fn root(&self) -> Result<FilesystemInode> {
        self.load(&CatalogKey::root())
    }

    pub fn lookup(&self, parent: ObjectId, name: &str) -> Result<FilesystemInode> {
        let key = CatalogKey::new(parent, name)?;
        self.folder_key(parent)?;
        self.load(&key)
    }

    /// Walk an absolute or root-relative path.
    pub fn resolve_path(&self, path: &str) -> Result<FilesystemInode> {
        let mut current = self.root()?;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !current.is_dir() {
                return Err(Fault::NotDirectory);
            }
            current = self.lookup(current.ino(), component)?;
        }
        Ok(current)
    }

    /// Up to `limit` children of `parent` in catalog order, resuming after
    /// the name `after`.
    pub fn readdir(
        &self,
        parent: ObjectId,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DirEntry>> {
        self.folder_key(parent)?;
        self.md
            .catalog
            .readdir(parent, after, limit)?
            .into_iter()
            .map(|entry| {
                let (ino, mode) = match &entry.record {
                    Record::Hlink { object_id } => {
                        (*object_id, self.md.hardlinks.get(*object_id)?.meta.mode)
                    }
                    other => {
                        let meta = other.meta().ok_or_else(|| {
                            Fault::inconsistent(format!("{} has no metadata", entry.key))
                        })?;
                        (meta.object_id, meta.mode)
                    }
                };
                Ok(DirEntry {
                    name: entry.key.name,
                    ino,
                    kind: FileType::from_mode(mode),
                })
            })
            .collect()
    }

    /// Create a file. `mode` without type bits means a regular file.
    pub fn create(&self, parent: ObjectId, name: &str, mode: u16) -> Result<FilesystemInode> {
        let mode = if mode & S_IFMT == 0 { S_IFREG | mode } else { mode };
        if mode & S_IFMT == S_IFDIR {
            return Err(Fault::InvalidArgument(
                "folders are created with mkdir".to_owned(),
            ));
        }
        self.mutate("create", || self.new_object(parent, name, mode))
    }

    pub fn mkdir(&self, parent: ObjectId, name: &str, mode: u16) -> Result<FilesystemInode> {
        self.mutate("mkdir", || {
            self.new_object(parent, name, S_IFDIR | (mode & !S_IFMT))
        })
    }

    fn new_object(&self, parent: ObjectId, name: &str, mode: u16) -> Result<FilesystemInode> {
        let key = CatalogKey::new(parent, name)?;
        self.inode_locks.with(parent, || {
            let parent_key = self.folder_key(parent)?;
            let ino = self.md.inodes.alloc_ino()?;
            let mut meta = ObjectMeta::new(ino, self.next_generation(), mode);
            let is_dir = meta.is_dir();
            let record = if is_dir {
                meta.links_count = 2;
                Record::Folder(FolderRecord {
                    meta,
                    total_items: 0,
                })
            } else {
                Record::File(FileRecord {
                    meta,
                    fork: Fork::default(),
                })
            };
            if let Err(err) = self.md.catalog.insert(parent, name, &record) {
                self.md.inodes.free_ino(ino)?;
                return Err(err);
            }
            if let Err(err) = self.adjust_folder(&parent_key, 1, i64::from(is_dir)) {
                self.md.catalog.remove(parent, name)?;
                self.md.inodes.free_ino(ino)?;
                return Err(err);
            }
            if is_dir {
                self.folders.write().insert(ino, key.clone());
            }
            self.count_object(is_dir, 1);
            debug!(parent = parent.0, name, ino = ino.0, dir = is_dir, "create");
            FilesystemInode::from_entry(CatalogEntry { key, record }, None)
        })
    }

    /// Add the name `(new_parent, new_name)` for the file at `source`.
    ///
    /// The first extra name moves the file's metadata into the hardlink
    /// tree; every name then holds an `Hlink` record.
    pub fn link(
        &self,
        source: &CatalogKey,
        new_parent: ObjectId,
        new_name: &str,
    ) -> Result<FilesystemInode> {
        self.mutate("link", || {
            let new_key = CatalogKey::new(new_parent, new_name)?;
            self.folder_key(new_parent)?;
            let entry = self.md.catalog.get(source)?;
            if matches!(entry.record, Record::Folder(_)) {
                return Err(Fault::IsDirectory);
            }
            let ino = object_of(&entry)?;
            match self.md.catalog.get(&new_key) {
                Ok(_) => return Err(Fault::Exists),
                Err(Fault::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            let file = self.inode_locks.with(ino, || {
                let object_id = self.md.catalog.transform_into_hlink(
                    entry.key.parent,
                    &entry.key.name,
                    &self.md.hardlinks,
                )?;
                let mut file = self.md.hardlinks.adjust_links(object_id, 1)?;
                file.meta.ctime = Timestamp::now();
                self.md.hardlinks.update(&file)?;
                if let Err(err) = self.insert_entry(&new_key, &Record::Hlink { object_id }) {
                    self.md.hardlinks.adjust_links(object_id, -1)?;
                    return Err(err);
                }
                Ok(file)
            })?;
            if let Err(err) = self.touch_parent(new_parent, 1, 0) {
                self.md.catalog.remove(new_parent, new_name)?;
                self.md.hardlinks.adjust_links(ino, -1)?;
                return Err(err);
            }
            debug!(ino = ino.0, links = file.meta.links_count, name = new_name, "link");
            FilesystemInode::from_entry(
                CatalogEntry {
                    key: new_key,
                    record: Record::Hlink { object_id: ino },
                },
                Some(file),
            )
        })
    }

    /// Remove a non-folder name. The object goes away with its last name.
    pub fn unlink(&self, parent: ObjectId, name: &str) -> Result<()> {
        self.mutate("unlink", || {
            let key = CatalogKey::new(parent, name)?;
            self.folder_key(parent)?;
            let entry = self.md.catalog.get(&key)?;
            if matches!(entry.record, Record::Folder(_)) {
                return Err(Fault::IsDirectory);
            }
            let ino = object_of(&entry)?;
            self.inode_locks.with(ino, || self.drop_name(&entry.key))?;
            self.touch_parent(parent, -1, 0)?;
            debug!(parent = parent.0, name, ino = ino.0, "unlink");
            Ok(())
        })
    }

    /// Remove the catalog entry at `key` and release the object if that
    /// was its last name.
    fn drop_name(&self, key: &CatalogKey) -> Result<()> {
        let entry = self.md.catalog.remove(key.parent, &key.name)?;
        match entry.record {
            Record::File(file) => self.release(file),
            Record::Hlink { object_id } => {
                let mut file = self.md.hardlinks.adjust_links(object_id, -1)?;
                if file.meta.links_count == 0 {
                    let file = self.md.hardlinks.remove(object_id)?;
                    self.release(file)
                } else {
                    file.meta.ctime = Timestamp::now();
                    self.md.hardlinks.update(&file)
                }
            }
            other => Err(Fault::inconsistent(format!(
                "unexpected {:?} record at {key}",
                other.record_type()
            ))),
        }
    }

    /// Free everything a deleted file owned.
    fn release(&self, file: FileRecord) -> Result<()> {
        let ino = file.meta.object_id;
        let mut fork = file.fork;
        self.md.fsm.discard_preallocation(ino)?;
        for extent in self.md.extents.truncate(ino, &mut fork, 0)? {
            self.md.fsm.put_free_block(extent, false)?;
        }
        self.md.xattrs.remove_all(ino)?;
        self.md.inodes.free_ino(ino)?;
        self.count_object(false, -1);
        debug!(ino = ino.0, "release");
        Ok(())
    }

    pub fn rmdir(&self, parent: ObjectId, name: &str) -> Result<()> {
        self.mutate("rmdir", || {
            let key = CatalogKey::new(parent, name)?;
            self.folder_key(parent)?;
            let entry = self.md.catalog.get(&key)?;
            let Record::Folder(folder) = &entry.record else {
                return Err(Fault::NotDirectory);
            };
            let ino = folder.meta.object_id;
            self.inode_locks.with(ino, || self.drop_folder(&entry.key, ino))?;
            self.touch_parent(parent, -1, -1)?;
            debug!(parent = parent.0, name, ino = ino.0, "rmdir");
            Ok(())
        })
    }

    /// Remove an empty folder's entry and free its id. The caller holds
    /// the folder's inode lock.
    fn drop_folder(&self, key: &CatalogKey, ino: ObjectId) -> Result<()> {
        if self.md.catalog.has_children(ino)? {
            return Err(Fault::NotEmpty);
        }
        self.md.catalog.remove(key.parent, &key.name)?;
        self.md.xattrs.remove_all(ino)?;
        self.md.inodes.free_ino(ino)?;
        self.folders.write().remove(&ino);
        self.count_object(true, -1);
        Ok(())
    }

    /// Move `(old_parent, old_name)` to `(new_parent, new_name)`, replacing
    /// a compatible target.
    pub fn rename(
        &self,
        old_parent: ObjectId,
        old_name: &str,
        new_parent: ObjectId,
        new_name: &str,
    ) -> Result<()> {
        self.mutate("rename", || {
            let old_key = CatalogKey::new(old_parent, old_name)?;
            let new_key = CatalogKey::new(new_parent, new_name)?;
            let _moving = (old_parent != new_parent).then(|| self.rename_lock.lock());
            self.folder_key(old_parent)?;
            self.folder_key(new_parent)?;
            let source = self.md.catalog.get(&old_key)?;
            let src_ino = object_of(&source)?;
            let src_dir = matches!(source.record, Record::Folder(_));
            if src_dir && self.is_ancestor(src_ino, new_parent) {
                return Err(Fault::InvalidArgument(format!(
                    "cannot move folder {src_ino} below itself"
                )));
            }

            let target = match self.md.catalog.get(&new_key) {
                Ok(target) => Some(target),
                Err(Fault::NotFound(_)) => None,
                Err(err) => return Err(err),
            };
            if let Some(target) = &target {
                if target.key == source.key {
                    if source.key.name == new_name {
                        return Ok(());
                    }
                    // Same entry under a case-insensitive match: respell.
                    return self.inode_locks.with(src_ino, || {
                        self.move_entry(&source, &new_key).map(|_| ())
                    });
                }
                if object_of(target)? == src_ino {
                    return Ok(());
                }
                let dst_dir = matches!(target.record, Record::Folder(_));
                match (src_dir, dst_dir) {
                    (true, false) => return Err(Fault::NotDirectory),
                    (false, true) => return Err(Fault::IsDirectory),
                    _ => {}
                }
            }

            let replaced = match &target {
                Some(target) => Some(self.detach_target(target)?),
                None => None,
            };
            let moved = self
                .inode_locks
                .with(src_ino, || self.move_entry(&source, &new_key));
            if let Err(err) = moved {
                if let Some(target) = &replaced {
                    self.insert_entry(&target.key, &target.record)?;
                }
                return Err(err);
            }
            let dst_dir = replaced
                .as_ref()
                .is_some_and(|t| matches!(t.record, Record::Folder(_)));
            if let Some(target) = replaced {
                self.dispose(target)?;
            }

            let replaced_items = i64::from(target.is_some());
            if old_parent == new_parent {
                self.touch_parent(old_parent, -replaced_items, -i64::from(dst_dir))?;
            } else {
                self.touch_parent(old_parent, -1, -i64::from(src_dir))?;
                self.touch_parent(
                    new_parent,
                    1 - replaced_items,
                    i64::from(src_dir) - i64::from(dst_dir),
                )?;
            }
            debug!(
                ino = src_ino.0,
                from = %source.key,
                to = %new_key,
                replaced = target.is_some(),
                "rename"
            );
            Ok(())
        })
    }

    /// Take the rename target's entry out of the catalog, checking that a
    /// folder target is empty.
    fn detach_target(&self, target: &CatalogEntry) -> Result<CatalogEntry> {
        let ino = object_of(target)?;
        self.inode_locks.with(ino, || {
            if matches!(target.record, Record::Folder(_)) && self.md.catalog.has_children(ino)? {
                return Err(Fault::NotEmpty);
            }
            self.md.catalog.remove(target.key.parent, &target.key.name)
        })
    }

    /// Release the object behind a detached rename target.
    fn dispose(&self, target: CatalogEntry) -> Result<()> {
        let ino = object_of(&target)?;
        self.inode_locks.with(ino, || match target.record {
            Record::Folder(_) => {
                self.md.xattrs.remove_all(ino)?;
                self.md.inodes.free_ino(ino)?;
                self.folders.write().remove(&ino);
                self.count_object(true, -1);
                Ok(())
            }
            Record::File(file) => self.release(file),
            Record::Hlink { object_id } => {
                let mut file = self.md.hardlinks.adjust_links(object_id, -1)?;
                if file.meta.links_count == 0 {
                    let file = self.md.hardlinks.remove(object_id)?;
                    self.release(file)
                } else {
                    file.meta.ctime = Timestamp::now();
                    self.md.hardlinks.update(&file)
                }
            }
            other => {
                warn!(key = %target.key, kind = ?other.record_type(), "rename_dispose_unexpected");
                Ok(())
            }
        })
    }

    /// Re-key `source` to `new_key`, stamping ctime. Restores the source
    /// entry if the insert fails.
    fn move_entry(&self, source: &CatalogEntry, new_key: &CatalogKey) -> Result<CatalogKey> {
        let removed = self
            .md
            .catalog
            .remove(source.key.parent, &source.key.name)?;
        let now = Timestamp::now();
        let mut record = removed.record.clone();
        if let Some(meta) = record.meta_mut() {
            meta.ctime = now;
        }
        if let Err(err) = self.insert_entry(new_key, &record) {
            self.insert_entry(&removed.key, &removed.record)?;
            return Err(err);
        }
        match &record {
            Record::Hlink { object_id } => {
                let mut file = self.md.hardlinks.get(*object_id)?;
                file.meta.ctime = now;
                self.md.hardlinks.update(&file)?;
            }
            Record::Folder(folder) => {
                self.folders
                    .write()
                    .insert(folder.meta.object_id, new_key.clone());
            }
            _ => {}
        }
        Ok(new_key.clone())
    }

    pub fn getattr(&self, key: &CatalogKey) -> Result<InodeAttr> {
        Ok(self.load(key)?.attr(self.block_size))
    }

    /// Apply `attr`; a `size` truncates or extends the file.
    pub fn setattr(&self, key: &CatalogKey, attr: &SetAttr) -> Result<InodeAttr> {
        self.mutate("setattr", || {
            let ino = self.object_id(key)?;
            let (inode, released) = self.inode_locks.with(ino, || {
                let mut inode = self.load(key)?;
                let released = match attr.size {
                    Some(size) => self.resize_fork(&mut inode, size)?,
                    None => Vec::new(),
                };
                inode.apply(attr);
                self.store(&inode)?;
                Ok::<_, Fault>((inode, released))
            })?;
            self.free_extents(released)?;
            Ok(inode.attr(self.block_size))
        })
    }

    fn touch_ctime(&self, key: &CatalogKey, ino: ObjectId) -> Result<()> {
        self.inode_locks.with(ino, || {
            let mut inode = self.load(key)?;
            inode.meta.ctime = Timestamp::now();
            self.store(&inode)
        })
    }

    pub fn setxattr(&self, key: &CatalogKey, name: &str, value: &[u8], mode: SetMode) -> Result<()> {
        self.mutate("setxattr", || {
            let ino = self.object_id(key)?;
            self.md.xattrs.set(ino, name, value, mode)?;
            self.touch_ctime(key, ino)
        })
    }

    pub fn getxattr(&self, key: &CatalogKey, name: &str) -> Result<Vec<u8>> {
        self.md.xattrs.get(self.object_id(key)?, name)
    }

    pub fn listxattr(&self, key: &CatalogKey) -> Result<Vec<String>> {
        self.md.xattrs.list(self.object_id(key)?)
    }

    pub fn removexattr(&self, key: &CatalogKey, name: &str) -> Result<()> {
        self.mutate("removexattr", || {
            let ino = self.object_id(key)?;
            self.md.xattrs.remove(ino, name)?;
            self.touch_ctime(key, ino)
        })
    }

    /// Find an object by `(ino, generation)`. Needs a volume mounted with
    /// [`crate::MountOptions::nfs_index`]; a handle whose object was
    /// deleted or whose id was reused reports [`Fault::NotFound`].
    pub fn resolve_handle(&self, handle: FileHandle) -> Result<FilesystemInode> {
        let entry = self.md.catalog.resolve_handle(handle)?;
        let hardlink = match &entry.record {
            Record::Hlink { object_id } => Some(self.md.hardlinks.get(*object_id)?),
            _ => None,
        };
        let inode = FilesystemInode::from_entry(entry, hardlink)?;
        if inode.meta.generation != handle.generation {
            return Err(Fault::NotFound(format!(
                "stale handle {}:{}",
                handle.ino, handle.generation.0
            )));
        }
        Ok(inode)
    }
}
