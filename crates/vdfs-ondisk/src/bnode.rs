//! B-tree node ("bnode") format.
//!
//! A bnode spans `bnode_pages` blocks and is signed as a single unit with
//! the codec of [`crate::codec`]:
//!
//! ```text
//! 0   magic "BNOD" + version (12 bytes)
//! 12  kind        u8   (0 leaf, 1 index, 2 head)
//! 13  reserved    u8
//! 14  level       u16  (0 for leaves)
//! 16  recs_count  u16
//! 18  reserved    u16
//! 20  free_space  u32
//! 24  node_id     u32
//! 28  prev        u32  (0 = none)
//! 32  next        u32  (0 = none)
//! 36  records: (key_len u16, record_len u16, record bytes)*
//! ..  crc32c
//! ```
//!
//! `record_len` covers key and value; the value is the tail after
//! `key_len` bytes. Index records carry a little-endian `u32` child id as
//! their value.
//!
//! The head node (id 0) uses the same header with `kind = 2` and stores the
//! root id, the tree height and the used-bnode bitmap instead of records.

use crate::codec;
use vdfs_types::{
    BnodeId, CRC_SIZE, ParseError, VERSION_SIZE, Version, read_le_u16, read_le_u32, write_le_u16,
    write_le_u32,
};

pub const BNODE_MAGIC: &[u8; 4] = b"BNOD";
pub const BNODE_MAGIC_LEN: usize = 4 + VERSION_SIZE;
pub const BNODE_HEADER_LEN: usize = 36;
pub const RECORD_PREFIX_LEN: usize = 4;

const HEAD_ROOT_OFFSET: usize = BNODE_HEADER_LEN;
const HEAD_HEIGHT_OFFSET: usize = BNODE_HEADER_LEN + 4;
const HEAD_CAPACITY_OFFSET: usize = BNODE_HEADER_LEN + 8;
const HEAD_BITMAP_OFFSET: usize = BNODE_HEADER_LEN + 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Head,
}

impl NodeKind {
    fn raw(self) -> u8 {
        match self {
            Self::Leaf => 0,
            Self::Index => 1,
            Self::Head => 2,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Leaf),
            1 => Ok(Self::Index),
            2 => Ok(Self::Head),
            _ => Err(ParseError::InvalidField {
                field: "bnode_kind",
                reason: "unknown node kind",
            }),
        }
    }
}

/// Decoded leaf or index node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bnode {
    pub kind: NodeKind,
    pub level: u16,
    pub node_id: BnodeId,
    pub prev: Option<BnodeId>,
    pub next: Option<BnodeId>,
    /// `(key, value)` pairs in comparator order.
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
}

fn link(raw: u32) -> Option<BnodeId> {
    (raw != 0).then_some(BnodeId(raw))
}

fn link_raw(id: Option<BnodeId>) -> u32 {
    id.map_or(0, |id| id.0)
}

/// Payload bytes available for records in a node of `node_size` bytes.
#[must_use]
pub fn record_space(node_size: usize) -> usize {
    node_size.saturating_sub(BNODE_HEADER_LEN + CRC_SIZE)
}

/// Bytes one record occupies on disk.
#[must_use]
pub fn record_footprint(key: &[u8], value: &[u8]) -> usize {
    RECORD_PREFIX_LEN + key.len() + value.len()
}

#[expect(clippy::too_many_arguments)]
fn write_header(
    buf: &mut [u8],
    kind: NodeKind,
    level: u16,
    count: u16,
    free_space: u32,
    node_id: BnodeId,
    prev: Option<BnodeId>,
    next: Option<BnodeId>,
) -> Result<(), ParseError> {
    buf[12] = kind.raw();
    write_le_u16(buf, 14, level)?;
    write_le_u16(buf, 16, count)?;
    write_le_u32(buf, 20, free_space)?;
    write_le_u32(buf, 24, node_id.0)?;
    write_le_u32(buf, 28, link_raw(prev))?;
    write_le_u32(buf, 32, link_raw(next))
}

/// Verify magic and CRC of a raw node image.
pub fn check_node(buf: &[u8]) -> Result<(), ParseError> {
    codec::check(buf, Some(BNODE_MAGIC), BNODE_MAGIC_LEN)
}

impl Bnode {
    #[must_use]
    pub fn new_leaf(node_id: BnodeId) -> Self {
        Self {
            kind: NodeKind::Leaf,
            level: 0,
            node_id,
            prev: None,
            next: None,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn new_index(node_id: BnodeId, level: u16) -> Self {
        Self {
            kind: NodeKind::Index,
            level,
            node_id,
            prev: None,
            next: None,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Record bytes in use, prefixes included.
    #[must_use]
    pub fn used_space(&self) -> usize {
        self.records
            .iter()
            .map(|(k, v)| record_footprint(k, v))
            .sum()
    }

    #[must_use]
    pub fn fits(&self, node_size: usize) -> bool {
        self.used_space() <= record_space(node_size)
    }

    /// Encode and sign into a buffer of exactly `node_size` bytes.
    pub fn encode(&self, node_size: usize, version: Version) -> Result<Vec<u8>, ParseError> {
        if self.kind == NodeKind::Head {
            return Err(ParseError::InvalidField {
                field: "bnode_kind",
                reason: "head node encodes through HeadNode",
            });
        }
        let used = self.used_space();
        let space = record_space(node_size);
        if used > space {
            return Err(ParseError::InsufficientData {
                needed: used,
                offset: BNODE_HEADER_LEN,
                actual: space,
            });
        }
        let count = u16::try_from(self.records.len())
            .map_err(|_| ParseError::IntegerConversion { field: "recs_count" })?;
        let free_space = u32::try_from(space - used)
            .map_err(|_| ParseError::IntegerConversion { field: "free_space" })?;

        let mut buf = vec![0_u8; node_size];
        write_header(
            &mut buf,
            self.kind,
            self.level,
            count,
            free_space,
            self.node_id,
            self.prev,
            self.next,
        )?;
        let mut offset = BNODE_HEADER_LEN;
        for (key, value) in &self.records {
            let key_len = u16::try_from(key.len())
                .map_err(|_| ParseError::IntegerConversion { field: "key_len" })?;
            let record_len = u16::try_from(key.len() + value.len())
                .map_err(|_| ParseError::IntegerConversion { field: "record_len" })?;
            write_le_u16(&mut buf, offset, key_len)?;
            write_le_u16(&mut buf, offset + 2, record_len)?;
            offset += RECORD_PREFIX_LEN;
            buf[offset..offset + key.len()].copy_from_slice(key);
            offset += key.len();
            buf[offset..offset + value.len()].copy_from_slice(value);
            offset += value.len();
        }
        codec::sign(&mut buf, BNODE_MAGIC, version)?;
        Ok(buf)
    }

    /// Decode a signed node image. The caller checks the CRC first with
    /// [`check_node`] so it can attribute the failure to a block.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let kind = NodeKind::from_raw(*buf.get(12).ok_or(ParseError::InsufficientData {
            needed: BNODE_HEADER_LEN,
            offset: 0,
            actual: buf.len(),
        })?)?;
        if kind == NodeKind::Head {
            return Err(ParseError::InvalidField {
                field: "bnode_kind",
                reason: "head node where a tree node was expected",
            });
        }
        let level = read_le_u16(buf, 14)?;
        if (kind == NodeKind::Leaf) != (level == 0) {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "leaf level must be zero and index level non-zero",
            });
        }
        let count = usize::from(read_le_u16(buf, 16)?);
        let end = buf.len().saturating_sub(CRC_SIZE);
        let mut records = Vec::with_capacity(count);
        let mut offset = BNODE_HEADER_LEN;
        for _ in 0..count {
            let key_len = usize::from(read_le_u16(buf, offset)?);
            let record_len = usize::from(read_le_u16(buf, offset + 2)?);
            offset += RECORD_PREFIX_LEN;
            if key_len > record_len || offset + record_len > end {
                return Err(ParseError::InvalidField {
                    field: "record_len",
                    reason: "record overruns node",
                });
            }
            let key = buf[offset..offset + key_len].to_vec();
            let value = buf[offset + key_len..offset + record_len].to_vec();
            records.push((key, value));
            offset += record_len;
        }
        Ok(Self {
            kind,
            level,
            node_id: BnodeId(read_le_u32(buf, 24)?),
            prev: link(read_le_u32(buf, 28)?),
            next: link(read_le_u32(buf, 32)?),
            records,
        })
    }
}

/// Tree head: root pointer, height and the used-bnode bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadNode {
    pub root: BnodeId,
    /// Number of levels; a tree with a single leaf root has height 1.
    pub height: u16,
    /// Total bnode ids, head included.
    pub capacity: u32,
    bitmap: Vec<u8>,
}

impl HeadNode {
    /// Largest bnode capacity a head node of `node_size` bytes can track.
    #[must_use]
    pub fn max_capacity(node_size: usize) -> u32 {
        let bytes = node_size.saturating_sub(HEAD_BITMAP_OFFSET + CRC_SIZE);
        u32::try_from(bytes.saturating_mul(8)).unwrap_or(u32::MAX)
    }

    /// Fresh head with only itself marked used.
    pub fn new(capacity: u32) -> Result<Self, ParseError> {
        if capacity < 2 {
            return Err(ParseError::InvalidField {
                field: "capacity",
                reason: "tree needs a head and a root node",
            });
        }
        let bytes = usize::try_from(capacity.div_ceil(8))
            .map_err(|_| ParseError::IntegerConversion { field: "capacity" })?;
        let mut head = Self {
            root: BnodeId(0),
            height: 0,
            capacity,
            bitmap: vec![0_u8; bytes],
        };
        head.mark(BnodeId::HEAD, true);
        Ok(head)
    }

    fn mark(&mut self, id: BnodeId, used: bool) {
        let byte = (id.0 / 8) as usize;
        let bit = 1_u8 << (id.0 % 8);
        if used {
            self.bitmap[byte] |= bit;
        } else {
            self.bitmap[byte] &= !bit;
        }
    }

    #[must_use]
    pub fn is_used(&self, id: BnodeId) -> bool {
        id.0 < self.capacity && self.bitmap[(id.0 / 8) as usize] & (1 << (id.0 % 8)) != 0
    }

    /// Lowest free bnode id, marked used.
    pub fn alloc(&mut self) -> Option<BnodeId> {
        let id = (1..self.capacity).map(BnodeId).find(|id| !self.is_used(*id))?;
        self.mark(id, true);
        Some(id)
    }

    /// Release a bnode id. Returns false when it was not in use.
    pub fn release(&mut self, id: BnodeId) -> bool {
        if id == BnodeId::HEAD || !self.is_used(id) {
            return false;
        }
        self.mark(id, false);
        true
    }

    #[must_use]
    pub fn used_count(&self) -> u32 {
        self.bitmap.iter().map(|b| b.count_ones()).sum()
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.capacity - self.used_count()
    }

    pub fn encode(&self, node_size: usize, version: Version) -> Result<Vec<u8>, ParseError> {
        if self.capacity > Self::max_capacity(node_size) {
            return Err(ParseError::InvalidField {
                field: "capacity",
                reason: "bnode bitmap does not fit the head node",
            });
        }
        let mut buf = vec![0_u8; node_size];
        write_header(
            &mut buf,
            NodeKind::Head,
            self.height,
            0,
            0,
            BnodeId::HEAD,
            None,
            None,
        )?;
        write_le_u32(&mut buf, HEAD_ROOT_OFFSET, self.root.0)?;
        write_le_u16(&mut buf, HEAD_HEIGHT_OFFSET, self.height)?;
        write_le_u32(&mut buf, HEAD_CAPACITY_OFFSET, self.capacity)?;
        buf[HEAD_BITMAP_OFFSET..HEAD_BITMAP_OFFSET + self.bitmap.len()]
            .copy_from_slice(&self.bitmap);
        codec::sign(&mut buf, BNODE_MAGIC, version)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.get(12).copied() != Some(NodeKind::Head.raw()) {
            return Err(ParseError::InvalidField {
                field: "bnode_kind",
                reason: "expected head node",
            });
        }
        let capacity = read_le_u32(buf, HEAD_CAPACITY_OFFSET)?;
        if capacity < 2 || capacity > Self::max_capacity(buf.len()) {
            return Err(ParseError::InvalidField {
                field: "capacity",
                reason: "out of range for node size",
            });
        }
        let bytes = capacity.div_ceil(8) as usize;
        let root = BnodeId(read_le_u32(buf, HEAD_ROOT_OFFSET)?);
        let height = read_le_u16(buf, HEAD_HEIGHT_OFFSET)?;
        let head = Self {
            root,
            height,
            capacity,
            bitmap: buf[HEAD_BITMAP_OFFSET..HEAD_BITMAP_OFFSET + bytes].to_vec(),
        };
        if height == 0 || !head.is_used(root) || root == BnodeId::HEAD {
            return Err(ParseError::InvalidField {
                field: "root",
                reason: "root bnode missing from head",
            });
        }
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: usize = 2048;

    fn leaf_with(records: &[(&[u8], &[u8])]) -> Bnode {
        let mut node = Bnode::new_leaf(BnodeId(3));
        node.prev = Some(BnodeId(2));
        node.records = records
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        node
    }

    #[test]
    fn leaf_node_decodes_after_encode() {
        let node = leaf_with(&[(b"alpha", b"1"), (b"beta", b""), (b"gamma", b"333")]);
        let buf = node.encode(NODE, Version::new(1, 4)).expect("encode");
        assert_eq!(buf.len(), NODE);
        check_node(&buf).expect("signed");
        assert_eq!(Bnode::decode(&buf).expect("decode"), node);
        assert_eq!(
            codec::stamped_version(&buf, BNODE_MAGIC_LEN),
            Ok(Version::new(1, 4))
        );
    }

    #[test]
    fn overfull_node_refuses_to_encode() {
        let big = vec![0xEE_u8; 1000];
        let node = leaf_with(&[(b"a", &big), (b"b", &big)]);
        assert!(!node.fits(NODE));
        assert!(node.encode(NODE, Version::default()).is_err());
    }

    #[test]
    fn corrupted_node_fails_check() {
        let node = leaf_with(&[(b"k", b"v")]);
        let mut buf = node.encode(NODE, Version::default()).expect("encode");
        buf[BNODE_HEADER_LEN + 4] ^= 0x10;
        assert!(check_node(&buf).is_err());
    }

    #[test]
    fn record_overrun_is_rejected() {
        let node = leaf_with(&[(b"k", b"v")]);
        let mut buf = node.encode(NODE, Version::default()).expect("encode");
        write_le_u16(&mut buf, BNODE_HEADER_LEN + 2, u16::MAX).expect("poke");
        assert!(Bnode::decode(&buf).is_err());
    }

    #[test]
    fn head_node_allocates_lowest_free_id() {
        let mut head = HeadNode::new(10).expect("head");
        assert_eq!(head.alloc(), Some(BnodeId(1)));
        assert_eq!(head.alloc(), Some(BnodeId(2)));
        assert!(head.release(BnodeId(1)));
        assert!(!head.release(BnodeId(1)));
        assert!(!head.release(BnodeId::HEAD));
        assert_eq!(head.alloc(), Some(BnodeId(1)));
        assert_eq!(head.used_count(), 3);
        assert_eq!(head.free_count(), 7);

        head.root = BnodeId(1);
        head.height = 2;
        let buf = head.encode(NODE, Version::new(0, 1)).expect("encode");
        check_node(&buf).expect("signed");
        assert_eq!(HeadNode::decode(&buf).expect("decode"), head);
        assert!(Bnode::decode(&buf).is_err());
    }

    #[test]
    fn head_capacity_exhaustion() {
        let mut head = HeadNode::new(3).expect("head");
        assert!(head.alloc().is_some());
        assert!(head.alloc().is_some());
        assert_eq!(head.alloc(), None);
        assert!(HeadNode::new(1).is_err());
        assert!(HeadNode::new(HeadNode::max_capacity(NODE) + 1)
            .expect("in-memory head")
            .encode(NODE, Version::default())
            .is_err());
    }
}
