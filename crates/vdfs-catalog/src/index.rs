//! In-memory `(ino, generation)` to catalog key index.
//!
//! Lets a file handle that outlived a rename find the object's current
//! name. Rebuilt from a catalog scan at mount and kept current by the
//! catalog on every insert and remove.

use crate::key::CatalogKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use vdfs_types::{Generation, ObjectId};

/// Identity of an object across id reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileHandle {
    pub ino: ObjectId,
    pub generation: Generation,
}

#[derive(Debug, Default)]
pub struct IndirectIndex {
    /// A hard-linked object has one key per name.
    map: RwLock<BTreeMap<FileHandle, BTreeSet<CatalogKey>>>,
}

impl IndirectIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: FileHandle, key: CatalogKey) {
        self.map.write().entry(handle).or_default().insert(key);
    }

    /// Forget `key` for whichever generation of `ino` holds it.
    pub fn remove(&self, ino: ObjectId, key: &CatalogKey) {
        let mut map = self.map.write();
        let lo = FileHandle {
            ino,
            generation: Generation(0),
        };
        let hi = FileHandle {
            ino,
            generation: Generation(u32::MAX),
        };
        let mut emptied = Vec::new();
        for (handle, keys) in map.range_mut(lo..=hi) {
            if keys.remove(key) && keys.is_empty() {
                emptied.push(*handle);
            }
        }
        for handle in emptied {
            map.remove(&handle);
        }
    }

    /// Current name of the object, if it is still live under that
    /// generation.
    #[must_use]
    pub fn resolve(&self, handle: FileHandle) -> Option<CatalogKey> {
        self.map
            .read()
            .get(&handle)
            .and_then(|keys| keys.first().cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parent: u64, name: &str) -> CatalogKey {
        CatalogKey::new(ObjectId(parent), name).expect("key")
    }

    #[test]
    fn stale_generation_does_not_resolve() {
        let index = IndirectIndex::new();
        let old = FileHandle {
            ino: ObjectId(20),
            generation: Generation(1),
        };
        let new = FileHandle {
            generation: Generation(2),
            ..old
        };
        index.insert(old, key(1, "a"));
        index.remove(ObjectId(20), &key(1, "a"));
        index.insert(new, key(1, "b"));
        assert_eq!(index.resolve(old), None);
        assert_eq!(index.resolve(new), Some(key(1, "b")));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn hard_links_keep_the_handle_alive() {
        let index = IndirectIndex::new();
        let handle = FileHandle {
            ino: ObjectId(30),
            generation: Generation(5),
        };
        index.insert(handle, key(1, "a"));
        index.insert(handle, key(2, "c"));
        index.remove(ObjectId(30), &key(1, "a"));
        assert_eq!(index.resolve(handle), Some(key(2, "c")));
        index.remove(ObjectId(30), &key(2, "c"));
        assert!(index.is_empty());
    }
}
