#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Volume layout ───────────────────────────────────────────────────────────

/// Size of one superblock descriptor slot.
pub const SB_SIZE: usize = 512;
/// Bytes at the head of the volume reserved for both superblock copies.
pub const SB_REGION_SIZE: usize = 4096;
/// Distance between the two superblock copies.
pub const SB_COPY_STRIDE: usize = 4 * SB_SIZE;
/// Offset of the extended descriptor inside one copy.
pub const EXSB_OFFSET: usize = 3 * SB_SIZE;

/// Number of extents describing the metadata area.
pub const VDFS_META_BTREE_EXTENTS: usize = 8;
/// Number of extents describing the translation-table area (one per slot).
pub const VDFS_TABLES_EXTENTS_COUNT: usize = 2;
/// Inline extents stored in a file's fork before spilling to the overflow tree.
pub const VDFS_EXTENTS_COUNT_IN_FORK: usize = 9;
/// Longest name a catalog key can hold, in bytes.
pub const VDFS_FILE_NAME_LEN: usize = 255;

/// Length of the trailing CRC on every signed block.
pub const CRC_SIZE: usize = 4;
/// Length of the version stamp that follows every magic string.
pub const VERSION_SIZE: usize = 8;

/// Smallest and largest supported block sizes.
pub const MIN_BLOCK_SIZE: u32 = 1024;
pub const MAX_BLOCK_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Catalog object identifier (inode number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Logical index of a B-tree node inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BnodeId(pub u32);

/// Inode generation, bumped whenever an object id is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u32);

impl ObjectId {
    /// Parent id used by the root folder's own catalog record.
    pub const ROOT_PARENT: Self = Self(0);
    pub const ROOT: Self = Self(1);
    /// First object id handed out to user files and folders.
    pub const FIRST_FILE: Self = Self(16);
}

impl BnodeId {
    /// Tree head node: root pointer, height, bnode bitmap.
    pub const HEAD: Self = Self(0);
}

/// Global metadata version: `(mount_counter, sync_counter)`.
///
/// Ordered lexicographically; on disk it is stored as a single
/// `mount_counter << 32 | sync_counter` word.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub mount: u32,
    pub sync: u32,
}

impl Version {
    #[must_use]
    pub fn new(mount: u32, sync: u32) -> Self {
        Self { mount, sync }
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        (u64::from(self.mount) << 32) | u64::from(self.sync)
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            mount: (raw >> 32) as u32,
            sync: raw as u32,
        }
    }

    /// The version a commit in the same mount generation produces next.
    #[must_use]
    pub fn next_sync(self) -> Self {
        Self {
            mount: self.mount,
            sync: self.sync.wrapping_add(1),
        }
    }

    /// The version a fresh read-write mount starts from.
    #[must_use]
    pub fn next_mount(self) -> Self {
        Self {
            mount: self.mount.wrapping_add(1),
            sync: 0,
        }
    }

    /// Whether `other` is the immediate successor of `self` in one mount.
    #[must_use]
    pub fn is_successor(self, other: Self) -> bool {
        other.mount == self.mount && self.sync.checked_add(1) == Some(other.sync)
    }
}

/// Metadata files whose pages go through the translation table.
///
/// The discriminant is the object id the file is known by in extended
/// table records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Subsystem {
    CatalogTree = 2,
    FreeSpaceBitmap = 3,
    ExtentsTree = 4,
    InodeBitmap = 5,
    HardlinkTree = 6,
    XattrTree = 7,
}

impl Subsystem {
    /// Base-table section order.
    pub const ALL: [Self; 6] = [
        Self::CatalogTree,
        Self::FreeSpaceBitmap,
        Self::ExtentsTree,
        Self::InodeBitmap,
        Self::HardlinkTree,
        Self::XattrTree,
    ];

    #[must_use]
    pub fn object_id(self) -> u64 {
        u64::from(self as u8)
    }

    pub fn from_object_id(id: u64) -> Result<Self, ParseError> {
        Self::ALL
            .into_iter()
            .find(|s| s.object_id() == id)
            .ok_or(ParseError::InvalidField {
                field: "object_id",
                reason: "not a tracked metadata subsystem",
            })
    }

    /// Position of this subsystem in [`Subsystem::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|s| *s == self)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_tree(self) -> bool {
        !matches!(self, Self::FreeSpaceBitmap | Self::InodeBitmap)
    }
}

/// Validated block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    pub fn from_shift(shift: u8) -> Result<Self, ParseError> {
        let value = 1_u32
            .checked_shl(u32::from(shift))
            .ok_or(ParseError::InvalidField {
                field: "log_block_size",
                reason: "shift out of range",
            })?;
        Self::new(value)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: Vec<u8>, actual: Vec<u8> },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum { stored: u32, computed: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

/// Number of `unit`-sized chunks needed to hold `len` bytes or bits.
#[must_use]
pub fn div_round_up(len: u64, unit: u64) -> u64 {
    if unit == 0 {
        return 0;
    }
    len.div_ceil(unit)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.mount, self.sync)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CatalogTree => "catalog",
            Self::FreeSpaceBitmap => "free-space-bitmap",
            Self::ExtentsTree => "extents",
            Self::InodeBitmap => "inode-bitmap",
            Self::HardlinkTree => "hardlink",
            Self::XattrTree => "xattr",
        };
        f.write_str(name)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn version_raw_round_trip() {
        let v = Version::new(3, 17);
        assert_eq!(v.to_raw(), (3_u64 << 32) | 17);
        assert_eq!(Version::from_raw(v.to_raw()), v);
    }

    #[test]
    fn version_orders_mount_before_sync() {
        assert!(Version::new(2, 0) > Version::new(1, 900));
        assert!(Version::new(2, 5) > Version::new(2, 4));
    }

    #[test]
    fn successor_requires_same_mount() {
        let v = Version::new(4, 9);
        assert!(v.is_successor(Version::new(4, 10)));
        assert!(!v.is_successor(Version::new(4, 11)));
        assert!(!v.is_successor(Version::new(5, 10)));
        assert_eq!(v.next_mount(), Version::new(5, 0));
    }

    #[test]
    fn subsystem_ids_round_trip() {
        for (i, s) in Subsystem::ALL.into_iter().enumerate() {
            assert_eq!(Subsystem::from_object_id(s.object_id()), Ok(s));
            assert_eq!(s.index(), i);
        }
        assert!(Subsystem::from_object_id(99).is_err());
        assert!(Subsystem::CatalogTree.is_tree());
        assert!(!Subsystem::InodeBitmap.is_tree());
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert_eq!(BlockSize::from_shift(12).map(BlockSize::get), Ok(4096));
        assert!(BlockSize::from_shift(40).is_err());
    }

    #[test]
    fn write_helpers_bounds_check() {
        let mut buf = [0_u8; 6];
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).expect("in bounds");
        assert_eq!(read_le_u32(&buf, 2), Ok(0xDEAD_BEEF));
        assert!(write_le_u64(&mut buf, 0, 1).is_err());
        assert!(write_le_u16(&mut buf, usize::MAX, 1).is_err());
    }

    proptest! {
        #[test]
        fn version_order_matches_raw_order(a in any::<u64>(), b in any::<u64>()) {
            let (va, vb) = (Version::from_raw(a), Version::from_raw(b));
            prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
        }
    }
}
