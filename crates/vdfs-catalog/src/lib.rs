#![forbid(unsafe_code)]
//! Catalog tree: the namespace.
//!
//! Keys are `(parent_id, name)` ordered case-sensitively or with names
//! folded to lower case, chosen when the volume is formatted. Values are
//! tagged [`Record`]s. The root folder's own record lives under the
//! empty-name key of [`ObjectId::ROOT_PARENT`]; every other record has a
//! non-empty name.
//!
//! The catalog owns the reader/writer lock of its tree. Lookups and
//! listings share it; inserts, removals and in-place rewrites take it
//! exclusively for the duration of the single tree operation.

pub mod hardlink;
pub mod index;
pub mod key;
pub mod record;

pub use hardlink::HardlinkTree;
pub use index::{FileHandle, IndirectIndex};
pub use key::{CatalogKey, cmp_case_insensitive, cmp_case_sensitive};
pub use record::{
    FileRecord, FolderRecord, META_LEN, ObjectMeta, PackRecord, PackRoot, Record, RecordType,
    Timestamp,
};

use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;
use tracing::{debug, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_btree::{BTree, KeyCmp, RecordHandle, TreeGeometry, TreeStats};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::bnode::record_footprint;
use vdfs_types::{ObjectId, Subsystem, VDFS_FILE_NAME_LEN, Version};

/// A located catalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub key: CatalogKey,
    pub record: Record,
}

impl CatalogEntry {
    fn from_handle(handle: &RecordHandle) -> Result<Self> {
        Ok(Self {
            key: CatalogKey::decode(&handle.key)?,
            record: Record::decode(&handle.value)?,
        })
    }
}

/// Largest record footprint the catalog may need to store, for checking a
/// tree geometry at format time.
#[must_use]
pub fn max_record_footprint() -> usize {
    let key = CatalogKey {
        parent: ObjectId::ROOT,
        name: "x".repeat(VDFS_FILE_NAME_LEN),
    };
    record_footprint(&key.encode(), &Record::blank(RecordType::PackRoot))
        .max(record_footprint(&key.encode(), &Record::blank(RecordType::File)))
}

pub struct CatalogTree {
    tree: RwLock<BTree>,
    case_insensitive: bool,
    index: Option<Arc<IndirectIndex>>,
}

impl std::fmt::Debug for CatalogTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogTree")
            .field("case_insensitive", &self.case_insensitive)
            .field("indexed", &self.index.is_some())
            .finish_non_exhaustive()
    }
}

fn comparator(case_insensitive: bool) -> KeyCmp {
    if case_insensitive {
        cmp_case_insensitive
    } else {
        cmp_case_sensitive
    }
}

fn exists_on_duplicate(err: Fault) -> Fault {
    match err {
        Fault::DuplicateKey => Fault::Exists,
        other => other,
    }
}

fn not_found(key: &CatalogKey) -> Fault {
    Fault::NotFound(format!("catalog entry {key}"))
}

impl CatalogTree {
    /// Empty catalog holding only the root folder record.
    pub fn create(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
        case_insensitive: bool,
        root: &FolderRecord,
    ) -> Result<Self> {
        let mut tree = BTree::create(
            Subsystem::CatalogTree,
            comparator(case_insensitive),
            geometry,
            dev,
            sink,
        )?;
        tree.insert(
            CatalogKey::root().encode(),
            Record::Folder(root.clone()).encode()?,
        )?;
        Ok(Self {
            tree: RwLock::new(tree),
            case_insensitive,
            index: None,
        })
    }

    pub fn open(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
        case_insensitive: bool,
    ) -> Result<Self> {
        let tree = BTree::open(
            Subsystem::CatalogTree,
            comparator(case_insensitive),
            geometry,
            dev,
            sink,
        )?;
        Ok(Self {
            tree: RwLock::new(tree),
            case_insensitive,
            index: None,
        })
    }

    /// Start maintaining `index` on every insert and remove. The caller
    /// fills it from [`CatalogTree::rebuild_index`].
    pub fn attach_index(&mut self, index: Arc<IndirectIndex>) {
        self.index = Some(index);
    }

    #[must_use]
    pub fn index(&self) -> Option<&Arc<IndirectIndex>> {
        self.index.as_ref()
    }

    #[must_use]
    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.tree.read().is_dirty()
    }

    pub fn flush(&self, version: Version) -> Result<usize> {
        self.tree.write().flush(version)
    }

    /// Exact-match lookup.
    pub fn find(&self, parent: ObjectId, name: &str) -> Result<Record> {
        self.find_entry(parent, name).map(|entry| entry.record)
    }

    /// Exact-match lookup that also returns the stored key, whose name may
    /// differ in case from `name` on a case-insensitive volume.
    pub fn find_entry(&self, parent: ObjectId, name: &str) -> Result<CatalogEntry> {
        let key = CatalogKey::new(parent, name)?;
        self.get(&key)
    }

    /// Lookup by an already-built key, including the root sentinel.
    pub fn get(&self, key: &CatalogKey) -> Result<CatalogEntry> {
        match self.tree.read().find(&key.encode()) {
            Ok(handle) => CatalogEntry::from_handle(&handle),
            Err(Fault::NotFound(_)) => Err(not_found(key)),
            Err(err) => Err(err),
        }
    }

    /// The root folder's own record.
    pub fn root(&self) -> Result<FolderRecord> {
        match self.get(&CatalogKey::root())?.record {
            Record::Folder(folder) => Ok(folder),
            other => Err(Fault::inconsistent(format!(
                "root record is {:?}",
                other.record_type()
            ))),
        }
    }

    /// Smallest child of `parent`, skipping the empty-name sentinel.
    pub fn get_first_child(&self, parent: ObjectId) -> Result<CatalogEntry> {
        let tree = self.tree.read();
        let start = CatalogKey::first_of(parent);
        let mut handle = tree.seek(&start.encode())?;
        while let Some(current) = handle {
            let entry = CatalogEntry::from_handle(&current)?;
            if entry.key.parent != parent {
                break;
            }
            if !entry.key.is_sentinel() {
                return Ok(entry);
            }
            handle = tree.next_record(&current)?;
        }
        Err(Fault::NotFound(format!("children of {parent}")))
    }

    /// Children of `parent` in key order, resuming after `after` when
    /// given. At most `limit` entries are returned.
    pub fn readdir(
        &self,
        parent: ObjectId,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CatalogEntry>> {
        let tree = self.tree.read();
        let mut handle = match after {
            Some(name) => tree.seek_after(&CatalogKey::new(parent, name)?.encode())?,
            None => tree.seek(&CatalogKey::first_of(parent).encode())?,
        };
        let mut entries = Vec::new();
        while let Some(current) = handle {
            if entries.len() >= limit {
                break;
            }
            let entry = CatalogEntry::from_handle(&current)?;
            if entry.key.parent != parent {
                break;
            }
            if !entry.key.is_sentinel() {
                entries.push(entry);
            }
            handle = tree.next_record(&current)?;
        }
        Ok(entries)
    }

    /// Whether `parent` has any child.
    pub fn has_children(&self, parent: ObjectId) -> Result<bool> {
        match self.get_first_child(parent) {
            Ok(_) => Ok(true),
            Err(Fault::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Insert a blank record of `record_type` under `(parent, name)` and
    /// return a handle to fill it in.
    ///
    /// Fails with [`Fault::Exists`] if the name is taken (under the
    /// volume's case rule) and leaves the existing record untouched.
    pub fn place_record(
        &self,
        parent: ObjectId,
        name: &str,
        record_type: RecordType,
    ) -> Result<PlacedRecord<'_>> {
        let key = CatalogKey::new(parent, name)?;
        let raw = key.encode();
        let mut tree = self.tree.write();
        tree.insert(raw.clone(), Record::blank(record_type))
            .map_err(exists_on_duplicate)?;
        trace!(parent = parent.0, name, kind = ?record_type, "catalog_place");
        Ok(PlacedRecord {
            catalog: self,
            tree,
            key,
            raw,
            record_type,
            filled: false,
        })
    }

    /// [`CatalogTree::place_record`] and fill in one step.
    pub fn insert(&self, parent: ObjectId, name: &str, record: &Record) -> Result<()> {
        self.place_record(parent, name, record.record_type())?
            .fill(record)
    }

    /// Rewrite an existing record. A value of unchanged length is written
    /// in place.
    pub fn update_record(&self, parent: ObjectId, name: &str, record: &Record) -> Result<()> {
        let key = CatalogKey::new(parent, name)?;
        self.update(&key, record)
    }

    /// [`CatalogTree::update_record`] by key, including the root sentinel.
    pub fn update(&self, key: &CatalogKey, record: &Record) -> Result<()> {
        let raw = key.encode();
        let mut tree = self.tree.write();
        let mut current = match tree.find_mut(&raw) {
            Ok(current) => current,
            Err(Fault::NotFound(_)) => return Err(not_found(key)),
            Err(err) => return Err(err),
        };
        let value = if record.record_type() == RecordType::Hlink {
            record.encode_padded(current.value().len())?
        } else {
            record.encode()?
        };
        current.set_value(value)
    }

    /// Rewrite the root folder record.
    pub fn update_root(&self, root: &FolderRecord) -> Result<()> {
        self.update(&CatalogKey::root(), &Record::Folder(root.clone()))
    }

    /// Remove `(parent, name)` and return what it held.
    pub fn remove(&self, parent: ObjectId, name: &str) -> Result<CatalogEntry> {
        let key = CatalogKey::new(parent, name)?;
        let raw = key.encode();
        let (stored, value) = {
            let mut tree = self.tree.write();
            // Resolve the stored spelling first so the index sees it.
            let stored = match tree.find(&raw) {
                Ok(handle) => handle.key,
                Err(Fault::NotFound(_)) => return Err(not_found(&key)),
                Err(err) => return Err(err),
            };
            let value = tree.remove(&raw)?;
            (stored, value)
        };
        let entry = CatalogEntry {
            key: CatalogKey::decode(&stored)?,
            record: Record::decode(&value)?,
        };
        if let (Some(index), Some(ino)) = (&self.index, entry.record.object_id()) {
            index.remove(ino, &entry.key);
        }
        trace!(parent = parent.0, name, "catalog_remove");
        Ok(entry)
    }

    /// Turn the file record at `(parent, name)` into a hard-link record.
    ///
    /// The file's metadata moves to `hardlinks` and the catalog value is
    /// rewritten as an `Hlink` of the same length, so the node layout does
    /// not change. Calling it on a name that already is a hard link is a
    /// no-op. Returns the object id.
    pub fn transform_into_hlink(
        &self,
        parent: ObjectId,
        name: &str,
        hardlinks: &HardlinkTree,
    ) -> Result<ObjectId> {
        let key = CatalogKey::new(parent, name)?;
        let raw = key.encode();
        let mut tree = self.tree.write();
        let mut current = match tree.find_mut(&raw) {
            Ok(current) => current,
            Err(Fault::NotFound(_)) => return Err(not_found(&key)),
            Err(err) => return Err(err),
        };
        let file = match Record::decode(current.value())? {
            Record::File(file) => file,
            Record::Hlink { object_id } => return Ok(object_id),
            Record::Folder(_) => return Err(Fault::IsDirectory),
            other => {
                return Err(Fault::InvalidArgument(format!(
                    "cannot hard-link a {:?} record",
                    other.record_type()
                )));
            }
        };
        let object_id = file.meta.object_id;
        let length = current.value().len();
        hardlinks.insert(&file)?;
        let hlink = Record::Hlink { object_id }.encode_padded(length)?;
        if let Err(err) = current.set_value(hlink) {
            drop(tree);
            hardlinks.remove(object_id)?;
            return Err(err);
        }
        debug!(ino = object_id.0, parent = parent.0, name, "transform_into_hlink");
        Ok(object_id)
    }

    /// Rebuild the attached index from a full scan. Hard-link names are
    /// indexed under the generation stored in `hardlinks`.
    pub fn rebuild_index(&self, hardlinks: &HardlinkTree) -> Result<()> {
        let Some(index) = &self.index else {
            return Ok(());
        };
        index.clear();
        self.for_each(|entry| {
            if entry.key.is_sentinel() {
                return Ok(());
            }
            let handle = match &entry.record {
                Record::Hlink { object_id } => FileHandle {
                    ino: *object_id,
                    generation: hardlinks.get(*object_id)?.meta.generation,
                },
                other => match other.meta() {
                    Some(meta) => FileHandle {
                        ino: meta.object_id,
                        generation: meta.generation,
                    },
                    None => return Ok(()),
                },
            };
            index.insert(handle, entry.key.clone());
            Ok(())
        })?;
        debug!(handles = index.len(), "indirect_index_rebuilt");
        Ok(())
    }

    /// Register a name in the attached index.
    pub fn index_name(&self, handle: FileHandle, key: CatalogKey) {
        if let Some(index) = &self.index {
            index.insert(handle, key);
        }
    }

    /// Resolve a file handle through the attached index.
    pub fn resolve_handle(&self, handle: FileHandle) -> Result<CatalogEntry> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| Fault::InvalidArgument("indirect index not enabled".to_owned()))?;
        let key = index
            .resolve(handle)
            .ok_or_else(|| Fault::NotFound(format!("file handle {}:{}", handle.ino, handle.generation.0)))?;
        self.get(&key)
    }

    /// Every record in key order.
    pub fn for_each(&self, mut f: impl FnMut(&CatalogEntry) -> Result<()>) -> Result<()> {
        let tree = self.tree.read();
        for handle in tree.iter()? {
            f(&CatalogEntry::from_handle(&handle?)?)?;
        }
        Ok(())
    }

    /// Tree structure plus decodability and strict ordering of every
    /// record.
    pub fn check(&self) -> Result<TreeStats> {
        let tree = self.tree.read();
        let stats = tree.check()?;
        let cmp = tree.comparator();
        let mut prev: Option<Vec<u8>> = None;
        for handle in tree.iter()? {
            let handle = handle?;
            CatalogEntry::from_handle(&handle)?;
            if prev
                .as_ref()
                .is_some_and(|p| cmp(p, &handle.key) != std::cmp::Ordering::Less)
            {
                return Err(Fault::inconsistent(format!(
                    "catalog key {} out of order",
                    CatalogKey::decode(&handle.key)?
                )));
            }
            prev = Some(handle.key);
        }
        Ok(stats)
    }
}

/// Blank record just placed by [`CatalogTree::place_record`].
///
/// Holds the catalog's write lock until filled or dropped. Dropping it
/// unfilled removes the blank record again.
pub struct PlacedRecord<'a> {
    catalog: &'a CatalogTree,
    tree: RwLockWriteGuard<'a, BTree>,
    key: CatalogKey,
    raw: Vec<u8>,
    record_type: RecordType,
    filled: bool,
}

impl PlacedRecord<'_> {
    #[must_use]
    pub fn key(&self) -> &CatalogKey {
        &self.key
    }

    /// Write the record's contents. The record must be of the type it was
    /// placed with.
    pub fn fill(mut self, record: &Record) -> Result<()> {
        if record.record_type() != self.record_type {
            return Err(Fault::InvalidArgument(format!(
                "placed {:?} record filled with {:?}",
                self.record_type,
                record.record_type()
            )));
        }
        let value = record.encode()?;
        self.tree.find_mut(&self.raw)?.set_value(value)?;
        self.filled = true;
        if let (Some(index), Some(meta)) = (&self.catalog.index, record.meta()) {
            index.insert(
                FileHandle {
                    ino: meta.object_id,
                    generation: meta.generation,
                },
                self.key.clone(),
            );
        }
        Ok(())
    }
}

impl Drop for PlacedRecord<'_> {
    fn drop(&mut self) {
        if !self.filled {
            // The blank was inserted under this same guard; removal only
            // fails if the tree is already broken.
            if let Err(err) = self.tree.remove(&self.raw) {
                tracing::error!(key = %self.key, error = %err, "catalog_place_rollback_failed");
            }
        }
    }
}
