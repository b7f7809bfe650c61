//! Hardlink tree: metadata of hard-linked files keyed by object id.
//!
//! Once a file has more than one name every catalog entry for it is an
//! `Hlink` record and the real file record, with its link count, lives
//! here.

use crate::record::{FileRecord, Record};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_btree::{BTree, TreeGeometry, TreeStats};
use vdfs_error::{Fault, Result};
use vdfs_types::{ObjectId, Subsystem, Version};

fn encode_key(object_id: ObjectId) -> Vec<u8> {
    object_id.0.to_le_bytes().to_vec()
}

fn decode_key(key: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(key.try_into().ok()?))
}

/// Orders keys by object id.
#[must_use]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (decode_key(a), decode_key(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn decode_file(object_id: ObjectId, value: &[u8]) -> Result<FileRecord> {
    match Record::decode(value)? {
        Record::File(file) if file.meta.object_id == object_id => Ok(file),
        other => Err(Fault::inconsistent(format!(
            "hardlink record {object_id} holds {:?}",
            other.record_type()
        ))),
    }
}

#[derive(Debug)]
pub struct HardlinkTree {
    tree: RwLock<BTree>,
}

impl HardlinkTree {
    pub fn create(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let tree = BTree::create(Subsystem::HardlinkTree, compare_keys, geometry, dev, sink)?;
        Ok(Self {
            tree: RwLock::new(tree),
        })
    }

    pub fn open(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let tree = BTree::open(Subsystem::HardlinkTree, compare_keys, geometry, dev, sink)?;
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

    pub fn get(&self, object_id: ObjectId) -> Result<FileRecord> {
        let handle = self.tree.read().find(&encode_key(object_id))?;
        decode_file(object_id, &handle.value)
    }

    pub fn contains(&self, object_id: ObjectId) -> Result<bool> {
        match self.tree.read().find(&encode_key(object_id)) {
            Ok(_) => Ok(true),
            Err(Fault::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn insert(&self, file: &FileRecord) -> Result<()> {
        let value = Record::File(file.clone()).encode()?;
        self.tree
            .write()
            .insert(encode_key(file.meta.object_id), value)
            .map_err(|err| match err {
                Fault::DuplicateKey => Fault::Exists,
                other => other,
            })?;
        debug!(ino = file.meta.object_id.0, links = file.meta.links_count, "hardlink_insert");
        Ok(())
    }

    pub fn update(&self, file: &FileRecord) -> Result<()> {
        let value = Record::File(file.clone()).encode()?;
        let mut tree = self.tree.write();
        let mut record = tree.find_mut(&encode_key(file.meta.object_id))?;
        record.set_value(value)
    }

    pub fn remove(&self, object_id: ObjectId) -> Result<FileRecord> {
        let value = self.tree.write().remove(&encode_key(object_id))?;
        debug!(ino = object_id.0, "hardlink_remove");
        decode_file(object_id, &value)
    }

    /// Add `delta` to the link count and return the updated record.
    pub fn adjust_links(&self, object_id: ObjectId, delta: i32) -> Result<FileRecord> {
        let mut tree = self.tree.write();
        let mut record = tree.find_mut(&encode_key(object_id))?;
        let mut file = decode_file(object_id, record.value())?;
        file.meta.links_count = file
            .meta
            .links_count
            .checked_add_signed(delta)
            .ok_or_else(|| {
                Fault::inconsistent(format!(
                    "link count of {object_id} would leave range by {delta}"
                ))
            })?;
        record.set_value(Record::File(file.clone()).encode()?)?;
        Ok(file)
    }

    pub fn for_each(&self, mut f: impl FnMut(&FileRecord) -> Result<()>) -> Result<()> {
        let tree = self.tree.read();
        for record in tree.iter()? {
            let record = record?;
            let object_id = decode_key(&record.key)
                .ok_or_else(|| Fault::inconsistent("malformed hardlink key"))?;
            f(&decode_file(ObjectId(object_id), &record.value)?)?;
        }
        Ok(())
    }

    pub fn check(&self) -> Result<TreeStats> {
        let stats = self.tree.read().check()?;
        self.for_each(|file| {
            if file.meta.links_count == 0 {
                return Err(Fault::inconsistent(format!(
                    "hardlink record {} has no links",
                    file.meta.object_id
                )));
            }
            Ok(())
        })?;
        Ok(stats)
    }
}
