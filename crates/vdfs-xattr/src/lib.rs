#![forbid(unsafe_code)]
//! Extended attributes.
//!
//! One tree for the whole volume, keyed by `(object_id, name)`:
//!
//! ```text
//! 0   object_id u64
//! 8   name_len  u8
//! 9   name      [u8; name_len]
//! ```
//!
//! All attributes of an object are adjacent in key order, so listing and
//! bulk removal are a range scan. Names carry a namespace prefix
//! (`user.`, `trusted.`, `security.`, `system.`).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_btree::{BTree, TreeGeometry, TreeStats};
use vdfs_error::{Fault, Result};
use vdfs_types::{ObjectId, Subsystem, Version};

/// Longest attribute name, namespace prefix included.
pub const XATTR_NAME_MAX: usize = 255;

const NAMESPACES: [&str; 4] = ["user.", "trusted.", "security.", "system."];

/// How [`XattrTree::set`] treats an existing attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetMode {
    /// Create or replace.
    #[default]
    Upsert,
    /// Fail with [`Fault::Exists`] if present.
    Create,
    /// Fail with [`Fault::NotFound`] if absent.
    Replace,
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() > XATTR_NAME_MAX {
        return Err(Fault::NameTooLong);
    }
    match NAMESPACES.iter().find(|ns| name.starts_with(**ns)) {
        Some(ns) if name.len() > ns.len() => Ok(()),
        _ => Err(Fault::InvalidArgument(format!(
            "xattr name {name:?} has no known namespace"
        ))),
    }
}

fn encode_key(object_id: ObjectId, name: &str) -> Vec<u8> {
    let name = name.as_bytes();
    let mut key = Vec::with_capacity(9 + name.len());
    key.extend_from_slice(&object_id.0.to_le_bytes());
    // Validated names fit in a byte.
    key.push(u8::try_from(name.len()).unwrap_or(u8::MAX));
    key.extend_from_slice(name);
    key
}

fn split(key: &[u8]) -> Option<(u64, &[u8])> {
    let object_id = u64::from_le_bytes(key.get(..8)?.try_into().ok()?);
    let len = usize::from(*key.get(8)?);
    Some((object_id, key.get(9..9 + len)?))
}

/// Object id numerically, then name bytes.
#[must_use]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (split(a), split(b)) {
        (Some((oa, na)), Some((ob, nb))) => oa.cmp(&ob).then_with(|| na.cmp(nb)),
        _ => a.cmp(b),
    }
}

fn decode_name(key: &[u8]) -> Result<(ObjectId, String)> {
    let (object_id, name) = split(key).ok_or_else(|| Fault::inconsistent("malformed xattr key"))?;
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| Fault::inconsistent(format!("xattr name of {object_id} is not UTF-8")))?;
    Ok((ObjectId(object_id), name))
}

#[derive(Debug)]
pub struct XattrTree {
    tree: RwLock<BTree>,
}

impl XattrTree {
    pub fn create(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let tree = BTree::create(Subsystem::XattrTree, compare_keys, geometry, dev, sink)?;
        Ok(Self {
            tree: RwLock::new(tree),
        })
    }

    pub fn open(
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let tree = BTree::open(Subsystem::XattrTree, compare_keys, geometry, dev, sink)?;
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

    pub fn set(&self, object_id: ObjectId, name: &str, value: &[u8], mode: SetMode) -> Result<()> {
        validate_name(name)?;
        let key = encode_key(object_id, name);
        let mut tree = self.tree.write();
        match tree.find_mut(&key) {
            Ok(mut existing) => {
                if mode == SetMode::Create {
                    return Err(Fault::Exists);
                }
                existing.set_value(value.to_vec())?;
            }
            Err(Fault::NotFound(_)) => {
                if mode == SetMode::Replace {
                    return Err(Fault::NotFound(format!("xattr {name} of {object_id}")));
                }
                tree.insert(key, value.to_vec())?;
            }
            Err(err) => return Err(err),
        }
        trace!(ino = object_id.0, name, len = value.len(), "xattr_set");
        Ok(())
    }

    pub fn get(&self, object_id: ObjectId, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        match self.tree.read().find(&encode_key(object_id, name)) {
            Ok(handle) => Ok(handle.value),
            Err(Fault::NotFound(_)) => Err(Fault::NotFound(format!("xattr {name} of {object_id}"))),
            Err(err) => Err(err),
        }
    }

    /// Names of every attribute of `object_id`, in key order.
    pub fn list(&self, object_id: ObjectId) -> Result<Vec<String>> {
        let tree = self.tree.read();
        let mut names = Vec::new();
        for handle in tree.iter_from(&encode_key(object_id, ""))? {
            let handle = handle?;
            let (owner, name) = decode_name(&handle.key)?;
            if owner != object_id {
                break;
            }
            names.push(name);
        }
        Ok(names)
    }

    pub fn remove(&self, object_id: ObjectId, name: &str) -> Result<()> {
        validate_name(name)?;
        match self.tree.write().remove(&encode_key(object_id, name)) {
            Ok(_) => {
                trace!(ino = object_id.0, name, "xattr_remove");
                Ok(())
            }
            Err(Fault::NotFound(_)) => Err(Fault::NotFound(format!("xattr {name} of {object_id}"))),
            Err(err) => Err(err),
        }
    }

    /// Drop every attribute of an object being deleted. Returns how many
    /// were removed.
    pub fn remove_all(&self, object_id: ObjectId) -> Result<usize> {
        let names = self.list(object_id)?;
        let mut tree = self.tree.write();
        for name in &names {
            tree.remove(&encode_key(object_id, name))?;
        }
        if !names.is_empty() {
            debug!(ino = object_id.0, count = names.len(), "xattr_remove_all");
        }
        Ok(names.len())
    }

    /// Every `(object_id, name)` pair, for consistency checks.
    pub fn for_each(&self, mut f: impl FnMut(ObjectId, &str, &[u8]) -> Result<()>) -> Result<()> {
        let tree = self.tree.read();
        for handle in tree.iter()? {
            let handle = handle?;
            let (object_id, name) = decode_name(&handle.key)?;
            f(object_id, &name, &handle.value)?;
        }
        Ok(())
    }

    pub fn check(&self) -> Result<TreeStats> {
        let stats = self.tree.read().check()?;
        self.for_each(|object_id, name, _| {
            validate_name(name).map_err(|_| {
                Fault::inconsistent(format!("xattr {name:?} of {object_id} has an invalid name"))
            })
        })?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use vdfs_block::{ByteBlockDevice, IdentitySink, MemoryByteDevice};

    const BS: usize = 1024;

    fn tree() -> XattrTree {
        let geometry = TreeGeometry {
            block_size: BS,
            node_pages: 1,
            capacity: 64,
        };
        let dev: Arc<dyn BlockDevice> = Arc::new(
            ByteBlockDevice::new(MemoryByteDevice::new(BS * 128), BS as u32).expect("device"),
        );
        let sink = Arc::new(IdentitySink { base: 0, pages: 64 });
        XattrTree::create(geometry, dev, sink).expect("create")
    }

    #[test]
    fn set_modes() {
        let tree = tree();
        let ino = ObjectId(20);
        assert!(matches!(
            tree.set(ino, "user.a", b"1", SetMode::Replace),
            Err(Fault::NotFound(_))
        ));
        tree.set(ino, "user.a", b"1", SetMode::Create).expect("create");
        assert!(matches!(
            tree.set(ino, "user.a", b"2", SetMode::Create),
            Err(Fault::Exists)
        ));
        tree.set(ino, "user.a", b"22", SetMode::Replace).expect("replace");
        assert_eq!(tree.get(ino, "user.a").expect("get"), b"22");
    }

    #[test]
    fn names_need_a_namespace() {
        let tree = tree();
        assert!(tree.set(ObjectId(20), "plain", b"", SetMode::Upsert).is_err());
        assert!(tree.set(ObjectId(20), "user.", b"", SetMode::Upsert).is_err());
        assert!(matches!(
            tree.set(ObjectId(20), &format!("user.{}", "n".repeat(251)), b"", SetMode::Upsert),
            Err(Fault::NameTooLong)
        ));
    }

    #[test]
    fn list_and_remove_all_stay_within_one_object() {
        let tree = tree();
        for name in ["user.b", "user.a", "security.selinux"] {
            tree.set(ObjectId(20), name, name.as_bytes(), SetMode::Upsert)
                .expect("set");
        }
        tree.set(ObjectId(21), "user.a", b"other", SetMode::Upsert)
            .expect("set");
        assert_eq!(
            tree.list(ObjectId(20)).expect("list"),
            ["security.selinux", "user.a", "user.b"]
        );
        assert_eq!(tree.remove_all(ObjectId(20)).expect("remove_all"), 3);
        assert!(tree.list(ObjectId(20)).expect("list").is_empty());
        assert_eq!(tree.get(ObjectId(21), "user.a").expect("get"), b"other");
        tree.check().expect("check");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn tree_matches_a_map(
            ops in proptest::collection::vec((16_u64..19, "[a-c]{1,2}", proptest::option::of(proptest::collection::vec(any::<u8>(), 0..40))), 1..80)
        ) {
            let tree = tree();
            let mut model: BTreeMap<(u64, String), Vec<u8>> = BTreeMap::new();
            for (ino, suffix, value) in ops {
                let name = format!("user.{suffix}");
                match value {
                    Some(value) => {
                        tree.set(ObjectId(ino), &name, &value, SetMode::Upsert).expect("set");
                        model.insert((ino, name), value);
                    }
                    None => {
                        let removed = tree.remove(ObjectId(ino), &name).is_ok();
                        prop_assert_eq!(removed, model.remove(&(ino, name)).is_some());
                    }
                }
            }
            for ((ino, name), value) in &model {
                prop_assert_eq!(&tree.get(ObjectId(*ino), name).expect("get"), value);
            }
        }
    }
}
