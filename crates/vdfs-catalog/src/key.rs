//! Catalog keys and their two orderings.
//!
//! ```text
//! 0   parent_id u64
//! 8   name_len  u16
//! 10  name      [u8; name_len]  (UTF-8)
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use vdfs_error::{Fault, Result};
use vdfs_types::{ObjectId, VDFS_FILE_NAME_LEN};

const NAME_OFFSET: usize = 10;

/// `(parent_id, name)`; unique among live catalog records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent: ObjectId,
    pub name: String,
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.parent, self.name)
    }
}

impl CatalogKey {
    /// Key for a user-visible name: non-empty, no `/`, at most
    /// [`VDFS_FILE_NAME_LEN`] bytes.
    pub fn new(parent: ObjectId, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Fault::InvalidArgument(format!("invalid name {name:?}")));
        }
        if name.len() > VDFS_FILE_NAME_LEN {
            return Err(Fault::NameTooLong);
        }
        Ok(Self {
            parent,
            name: name.to_owned(),
        })
    }

    /// Empty-name key sorting before every child of `parent`.
    #[must_use]
    pub fn first_of(parent: ObjectId) -> Self {
        Self {
            parent,
            name: String::new(),
        }
    }

    /// Key of the root folder's own record.
    #[must_use]
    pub fn root() -> Self {
        Self::first_of(ObjectId::ROOT_PARENT)
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.name.is_empty()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut buf = Vec::with_capacity(NAME_OFFSET + name.len());
        buf.extend_from_slice(&self.parent.0.to_le_bytes());
        // Names are bounded by VDFS_FILE_NAME_LEN on construction.
        buf.extend_from_slice(&u16::try_from(name.len()).unwrap_or(u16::MAX).to_le_bytes());
        buf.extend_from_slice(name);
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (parent, name) =
            split(raw).ok_or_else(|| Fault::inconsistent("malformed catalog key"))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| Fault::inconsistent(format!("catalog name under {parent} is not UTF-8")))?;
        Ok(Self {
            parent: ObjectId(parent),
            name: name.to_owned(),
        })
    }
}

fn split(raw: &[u8]) -> Option<(u64, &[u8])> {
    let parent = u64::from_le_bytes(raw.get(..8)?.try_into().ok()?);
    let len = u16::from_le_bytes(raw.get(8..NAME_OFFSET)?.try_into().ok()?);
    let name = raw.get(NAME_OFFSET..NAME_OFFSET + usize::from(len))?;
    Some((parent, name))
}

/// Parent id numerically, then name bytes; a proper prefix sorts first.
#[must_use]
pub fn cmp_case_sensitive(a: &[u8], b: &[u8]) -> Ordering {
    match (split(a), split(b)) {
        (Some((pa, na)), Some((pb, nb))) => pa.cmp(&pb).then_with(|| na.cmp(nb)),
        _ => a.cmp(b),
    }
}

/// Parent id numerically, then names folded to lower case character by
/// character; a proper prefix sorts first.
#[must_use]
pub fn cmp_case_insensitive(a: &[u8], b: &[u8]) -> Ordering {
    match (split(a), split(b)) {
        (Some((pa, na)), Some((pb, nb))) => pa.cmp(&pb).then_with(|| {
            let na = String::from_utf8_lossy(na);
            let nb = String::from_utf8_lossy(nb);
            na.chars()
                .flat_map(char::to_lowercase)
                .cmp(nb.chars().flat_map(char::to_lowercase))
        }),
        _ => a.cmp(b),
    }
}
