//! Catalog record values.
//!
//! Every value starts with an 8-byte header whose first byte is the record
//! type; the rest of the layout depends on it:
//!
//! ```text
//! Folder      header | meta | total_items u64
//! File        header | meta | fork
//! Hlink       header | object_id u64 | zero padding
//! PackRoot    header | meta | image_start u64 | image_blocks u64 | inode_count u64
//! PackRecord  header | meta | pack_offset u64 | pack_len u64
//! Dummy       header | zero padding
//! ```
//!
//! `meta` is [`ObjectMeta`] in [`META_LEN`] bytes. Hard-link and dummy
//! values may be longer than their payload: a record transformed in place
//! keeps its original length.

use serde::{Deserialize, Serialize};
use vdfs_error::{Fault, Result};
use vdfs_extent::{FORK_LEN, Fork};
use vdfs_types::{
    Generation, ObjectId, ParseError, S_IFDIR, S_IFMT, read_le_u16, read_le_u32, read_le_u64,
    write_le_u16, write_le_u32, write_le_u64,
};

const HEADER_LEN: usize = 8;
/// Encoded size of [`ObjectMeta`].
pub const META_LEN: usize = 80;
const TIMESTAMP_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    Folder = 1,
    File = 2,
    Hlink = 3,
    PackRoot = 4,
    PackRecord = 5,
    Dummy = 6,
}

impl RecordType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Folder,
            2 => Self::File,
            3 => Self::Hlink,
            4 => Self::PackRoot,
            5 => Self::PackRecord,
            6 => Self::Dummy,
            _ => return None,
        })
    }

    /// Bytes a freshly placed value of this type occupies.
    #[must_use]
    pub fn value_len(self) -> usize {
        match self {
            Self::Folder => HEADER_LEN + META_LEN + 8,
            Self::File => HEADER_LEN + META_LEN + FORK_LEN,
            Self::Hlink => HEADER_LEN + 8,
            Self::PackRoot => HEADER_LEN + META_LEN + 24,
            Self::PackRecord => HEADER_LEN + META_LEN + 16,
            Self::Dummy => HEADER_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        let since = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
            nanos: since.subsec_nanos(),
        }
    }

    fn encode(self, buf: &mut [u8], offset: usize) -> std::result::Result<(), ParseError> {
        write_le_u64(buf, offset, u64::from_le_bytes(self.secs.to_le_bytes()))?;
        write_le_u32(buf, offset + 8, self.nanos)
    }

    fn decode(buf: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            secs: i64::from_le_bytes(read_le_u64(buf, offset)?.to_le_bytes()),
            nanos: read_le_u32(buf, offset + 8)?,
        })
    }
}

/// Attributes shared by every object that owns an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub object_id: ObjectId,
    pub generation: Generation,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub links_count: u32,
    pub flags: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
}

impl ObjectMeta {
    /// Fresh metadata stamped with the current time on all four clocks.
    #[must_use]
    pub fn new(object_id: ObjectId, generation: Generation, mode: u16) -> Self {
        let now = Timestamp::now();
        Self {
            object_id,
            generation,
            mode,
            uid: 0,
            gid: 0,
            links_count: 1,
            flags: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    fn encode(&self, buf: &mut [u8], offset: usize) -> std::result::Result<(), ParseError> {
        write_le_u64(buf, offset, self.object_id.0)?;
        write_le_u32(buf, offset + 8, self.generation.0)?;
        write_le_u16(buf, offset + 12, self.mode)?;
        write_le_u16(buf, offset + 14, 0)?;
        write_le_u32(buf, offset + 16, self.uid)?;
        write_le_u32(buf, offset + 20, self.gid)?;
        write_le_u32(buf, offset + 24, self.links_count)?;
        write_le_u32(buf, offset + 28, self.flags)?;
        for (i, ts) in [self.atime, self.mtime, self.ctime, self.crtime]
            .into_iter()
            .enumerate()
        {
            ts.encode(buf, offset + 32 + i * TIMESTAMP_LEN)?;
        }
        Ok(())
    }

    fn decode(buf: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        let ts = |i: usize| Timestamp::decode(buf, offset + 32 + i * TIMESTAMP_LEN);
        Ok(Self {
            object_id: ObjectId(read_le_u64(buf, offset)?),
            generation: Generation(read_le_u32(buf, offset + 8)?),
            mode: read_le_u16(buf, offset + 12)?,
            uid: read_le_u32(buf, offset + 16)?,
            gid: read_le_u32(buf, offset + 20)?,
            links_count: read_le_u32(buf, offset + 24)?,
            flags: read_le_u32(buf, offset + 28)?,
            atime: ts(0)?,
            mtime: ts(1)?,
            ctime: ts(2)?,
            crtime: ts(3)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub meta: ObjectMeta,
    /// Live children.
    pub total_items: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub meta: ObjectMeta,
    pub fork: Fork,
}

/// Root of a read-only packed image mounted into the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRoot {
    pub meta: ObjectMeta,
    pub image_start: u64,
    pub image_blocks: u64,
    pub inode_count: u64,
}

/// Object inside a packed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRecord {
    pub meta: ObjectMeta,
    pub pack_offset: u64,
    pub pack_len: u64,
}

/// Decoded catalog value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Folder(FolderRecord),
    File(FileRecord),
    /// Name of a hard-linked object whose metadata lives in the hardlink
    /// tree.
    Hlink { object_id: ObjectId },
    PackRoot(PackRoot),
    PackRecord(PackRecord),
    /// Placeholder while a record is being rewritten.
    Dummy,
}

impl Record {
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Folder(_) => RecordType::Folder,
            Self::File(_) => RecordType::File,
            Self::Hlink { .. } => RecordType::Hlink,
            Self::PackRoot(_) => RecordType::PackRoot,
            Self::PackRecord(_) => RecordType::PackRecord,
            Self::Dummy => RecordType::Dummy,
        }
    }

    /// Zero-filled value of the given type, as laid down by `place_record`.
    #[must_use]
    pub fn blank(record_type: RecordType) -> Vec<u8> {
        let mut buf = vec![0_u8; record_type.value_len()];
        buf[0] = record_type as u8;
        buf
    }

    #[must_use]
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Folder(r) => Some(r.meta.object_id),
            Self::File(r) => Some(r.meta.object_id),
            Self::Hlink { object_id } => Some(*object_id),
            Self::PackRoot(r) => Some(r.meta.object_id),
            Self::PackRecord(r) => Some(r.meta.object_id),
            Self::Dummy => None,
        }
    }

    #[must_use]
    pub fn meta(&self) -> Option<&ObjectMeta> {
        match self {
            Self::Folder(r) => Some(&r.meta),
            Self::File(r) => Some(&r.meta),
            Self::PackRoot(r) => Some(&r.meta),
            Self::PackRecord(r) => Some(&r.meta),
            Self::Hlink { .. } | Self::Dummy => None,
        }
    }

    pub fn meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        match self {
            Self::Folder(r) => Some(&mut r.meta),
            Self::File(r) => Some(&mut r.meta),
            Self::PackRoot(r) => Some(&mut r.meta),
            Self::PackRecord(r) => Some(&mut r.meta),
            Self::Hlink { .. } | Self::Dummy => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_padded(0)
    }

    /// Encode into at least `min_len` bytes. Only hard-link and dummy
    /// values may be padded.
    pub fn encode_padded(&self, min_len: usize) -> Result<Vec<u8>> {
        let record_type = self.record_type();
        let natural = record_type.value_len();
        let len = if matches!(record_type, RecordType::Hlink | RecordType::Dummy) {
            natural.max(min_len)
        } else {
            natural
        };
        let mut buf = vec![0_u8; len];
        buf[0] = record_type as u8;
        self.encode_body(&mut buf)
            .map_err(|e| Fault::inconsistent(format!("cannot encode {record_type:?} record: {e}")))?;
        Ok(buf)
    }

    fn encode_body(&self, buf: &mut [u8]) -> std::result::Result<(), ParseError> {
        let body = HEADER_LEN + META_LEN;
        match self {
            Self::Folder(r) => {
                r.meta.encode(buf, HEADER_LEN)?;
                write_le_u64(buf, body, r.total_items)
            }
            Self::File(r) => {
                r.meta.encode(buf, HEADER_LEN)?;
                let fork = buf.get_mut(body..body + FORK_LEN).ok_or(ParseError::InsufficientData {
                    needed: FORK_LEN,
                    offset: body,
                    actual: 0,
                })?;
                r.fork.encode_into(fork)
            }
            Self::Hlink { object_id } => write_le_u64(buf, HEADER_LEN, object_id.0),
            Self::PackRoot(r) => {
                r.meta.encode(buf, HEADER_LEN)?;
                write_le_u64(buf, body, r.image_start)?;
                write_le_u64(buf, body + 8, r.image_blocks)?;
                write_le_u64(buf, body + 16, r.inode_count)
            }
            Self::PackRecord(r) => {
                r.meta.encode(buf, HEADER_LEN)?;
                write_le_u64(buf, body, r.pack_offset)?;
                write_le_u64(buf, body + 8, r.pack_len)
            }
            Self::Dummy => Ok(()),
        }
    }

    pub fn decode(value: &[u8]) -> Result<Self> {
        let raw_type = *value
            .first()
            .ok_or_else(|| Fault::inconsistent("empty catalog value"))?;
        let record_type = RecordType::from_raw(raw_type)
            .ok_or_else(|| Fault::inconsistent(format!("unknown catalog record type {raw_type}")))?;
        if value.len() < record_type.value_len() {
            return Err(Fault::inconsistent(format!(
                "{record_type:?} record of {} bytes, expected {}",
                value.len(),
                record_type.value_len()
            )));
        }
        Self::decode_body(record_type, value)
            .map_err(|e| Fault::inconsistent(format!("{record_type:?} record: {e}")))
    }

    fn decode_body(
        record_type: RecordType,
        buf: &[u8],
    ) -> std::result::Result<Self, ParseError> {
        let body = HEADER_LEN + META_LEN;
        Ok(match record_type {
            RecordType::Folder => Self::Folder(FolderRecord {
                meta: ObjectMeta::decode(buf, HEADER_LEN)?,
                total_items: read_le_u64(buf, body)?,
            }),
            RecordType::File => Self::File(FileRecord {
                meta: ObjectMeta::decode(buf, HEADER_LEN)?,
                fork: Fork::decode(vdfs_types::ensure_slice(buf, body, FORK_LEN)?)?,
            }),
            RecordType::Hlink => Self::Hlink {
                object_id: ObjectId(read_le_u64(buf, HEADER_LEN)?),
            },
            RecordType::PackRoot => Self::PackRoot(PackRoot {
                meta: ObjectMeta::decode(buf, HEADER_LEN)?,
                image_start: read_le_u64(buf, body)?,
                image_blocks: read_le_u64(buf, body + 8)?,
                inode_count: read_le_u64(buf, body + 16)?,
            }),
            RecordType::PackRecord => Self::PackRecord(PackRecord {
                meta: ObjectMeta::decode(buf, HEADER_LEN)?,
                pack_offset: read_le_u64(buf, body)?,
                pack_len: read_le_u64(buf, body + 8)?,
            }),
            RecordType::Dummy => Self::Dummy,
        })
    }
}
