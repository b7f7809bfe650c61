//! Superblock region: two copies of a primary and an extended descriptor.
//!
//! The first 4 KiB of the volume hold copy 0 at byte 0 and copy 1 at byte
//! [`SB_COPY_STRIDE`]. Inside each copy the primary descriptor sits at 0 and
//! the extended descriptor at [`EXSB_OFFSET`]. Both descriptors are
//! [`SB_SIZE`] bytes and end with a CRC-32C over everything before it.

use serde::{Deserialize, Serialize};
use vdfs_types::{
    BlockSize, EXSB_OFFSET, ParseError, SB_COPY_STRIDE, SB_SIZE,
    VDFS_META_BTREE_EXTENTS, VDFS_TABLES_EXTENTS_COUNT, Version, ensure_slice, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_u16, write_le_u32, write_le_u64,
};

pub const PRIMARY_MAGIC: &[u8; 4] = b"VDFS";
pub const EXSB_MAGIC: &[u8; 4] = b"EXSB";
pub const LAYOUT_VERSION: u16 = 1;

/// Metadata has been modified since the last completed sync.
pub const EXSB_DIRTY: u32 = 1 << 0;
/// The last read-write mount finished replaying its tables.
pub const IS_MOUNT_FINISHED: u32 = 1 << 1;
const KNOWN_EXSB_FLAGS: u32 = EXSB_DIRTY | IS_MOUNT_FINISHED;

const PRIMARY_FLAG_CASE_INSENSITIVE: u16 = 1 << 0;
const CHECKSUM_OFFSET: usize = SB_SIZE - 4;

/// Number of tracked subsystems whose page capacity is fixed at format time.
pub const SUBSYSTEM_SLOTS: usize = 6;

/// Contiguous run of physical blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub begin: u64,
    pub length: u64,
}

impl Extent {
    #[must_use]
    pub fn new(begin: u64, length: u64) -> Self {
        Self { begin, length }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.begin.saturating_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, block: u64) -> bool {
        block >= self.begin && block < self.end()
    }

    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            begin: read_le_u64(data, offset)?,
            length: read_le_u64(data, offset + 8)?,
        })
    }

    fn write(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(data, offset, self.begin)?;
        write_le_u64(data, offset + 8, self.length)
    }
}

/// Format-time identity of the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimarySuperblock {
    pub layout_version: u16,
    pub case_insensitive: bool,
    pub volume_uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub creation_time: u64,
}

/// Mutable volume state: counters, geometry and the metadata-area map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedSuperblock {
    pub mount_counter: u32,
    pub sync_counter: u32,
    pub flags: u32,
    pub log_block_size: u8,
    pub log_erase_block_size: u8,
    /// Blocks per B-tree node.
    pub bnode_pages: u8,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub files_count: u64,
    pub folders_count: u64,
    /// Highest object id plus one the inode bitmap can describe.
    pub inode_capacity: u64,
    /// Total blocks currently belonging to the metadata area.
    pub meta_tbc: u64,
    /// Total blocks of the translation-table area (both slots).
    pub tables_tbc: u64,
    pub base_table_blocks: u32,
    pub ext_table_slots: u32,
    /// Logical page capacity of each subsystem, in [`vdfs_types::Subsystem::ALL`] order.
    pub subsystem_pages: [u32; SUBSYSTEM_SLOTS],
    /// Source of generation numbers for reused object ids.
    pub generation_counter: u32,
    pub meta: [Extent; VDFS_META_BTREE_EXTENTS],
    pub tables: [Extent; VDFS_TABLES_EXTENTS_COUNT],
}

/// One of the two superblock copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockCopy {
    pub primary: PrimarySuperblock,
    pub exsb: ExtendedSuperblock,
}

fn check_descriptor(desc: &[u8], magic: &[u8; 4]) -> Result<(), ParseError> {
    let head: [u8; 4] = read_fixed(desc, 0)?;
    if head != *magic {
        return Err(ParseError::InvalidMagic {
            expected: magic.to_vec(),
            actual: head.to_vec(),
        });
    }
    let stored = read_le_u32(desc, CHECKSUM_OFFSET)?;
    let computed = crc32c::crc32c(&desc[..CHECKSUM_OFFSET]);
    if stored != computed {
        return Err(ParseError::BadChecksum { stored, computed });
    }
    Ok(())
}

fn seal_descriptor(desc: &mut [u8]) -> Result<(), ParseError> {
    let crc = crc32c::crc32c(&desc[..CHECKSUM_OFFSET]);
    write_le_u32(desc, CHECKSUM_OFFSET, crc)
}

impl PrimarySuperblock {
    pub fn parse(desc: &[u8]) -> Result<Self, ParseError> {
        let desc = ensure_slice(desc, 0, SB_SIZE)?;
        check_descriptor(desc, PRIMARY_MAGIC)?;
        let layout_version = read_le_u16(desc, 4)?;
        if layout_version != LAYOUT_VERSION {
            return Err(ParseError::InvalidField {
                field: "layout_version",
                reason: "unsupported layout",
            });
        }
        let flags = read_le_u16(desc, 6)?;
        Ok(Self {
            layout_version,
            case_insensitive: flags & PRIMARY_FLAG_CASE_INSENSITIVE != 0,
            volume_uuid: read_fixed(desc, 8)?,
            volume_name: read_fixed(desc, 24)?,
            creation_time: read_le_u64(desc, 40)?,
        })
    }

    pub fn serialize(&self) -> Result<[u8; SB_SIZE], ParseError> {
        let mut desc = [0_u8; SB_SIZE];
        write_bytes(&mut desc, 0, PRIMARY_MAGIC)?;
        write_le_u16(&mut desc, 4, self.layout_version)?;
        let flags = if self.case_insensitive {
            PRIMARY_FLAG_CASE_INSENSITIVE
        } else {
            0
        };
        write_le_u16(&mut desc, 6, flags)?;
        write_bytes(&mut desc, 8, &self.volume_uuid)?;
        write_bytes(&mut desc, 24, &self.volume_name)?;
        write_le_u64(&mut desc, 40, self.creation_time)?;
        seal_descriptor(&mut desc)?;
        Ok(desc)
    }

    /// Volume label with trailing NULs stripped.
    #[must_use]
    pub fn name(&self) -> String {
        let end = self
            .volume_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.volume_name.len());
        String::from_utf8_lossy(&self.volume_name[..end]).into_owned()
    }
}

impl ExtendedSuperblock {
    pub fn parse(desc: &[u8]) -> Result<Self, ParseError> {
        let desc = ensure_slice(desc, 0, SB_SIZE)?;
        check_descriptor(desc, EXSB_MAGIC)?;

        let flags = read_le_u32(desc, 12)?;
        if flags & !KNOWN_EXSB_FLAGS != 0 {
            return Err(ParseError::InvalidField {
                field: "exsb_flags",
                reason: "unknown flag bits",
            });
        }

        let mut subsystem_pages = [0_u32; SUBSYSTEM_SLOTS];
        for (i, slot) in subsystem_pages.iter_mut().enumerate() {
            *slot = read_le_u32(desc, 84 + i * 4)?;
        }
        let mut meta = [Extent::default(); VDFS_META_BTREE_EXTENTS];
        for (i, extent) in meta.iter_mut().enumerate() {
            *extent = Extent::parse(desc, 112 + i * 16)?;
        }
        let mut tables = [Extent::default(); VDFS_TABLES_EXTENTS_COUNT];
        for (i, extent) in tables.iter_mut().enumerate() {
            *extent = Extent::parse(desc, 240 + i * 16)?;
        }

        let sb = Self {
            mount_counter: read_le_u32(desc, 4)?,
            sync_counter: read_le_u32(desc, 8)?,
            flags,
            log_block_size: desc[16],
            log_erase_block_size: desc[17],
            bnode_pages: desc[18],
            total_blocks: read_le_u64(desc, 20)?,
            free_blocks: read_le_u64(desc, 28)?,
            files_count: read_le_u64(desc, 36)?,
            folders_count: read_le_u64(desc, 44)?,
            inode_capacity: read_le_u64(desc, 52)?,
            meta_tbc: read_le_u64(desc, 60)?,
            tables_tbc: read_le_u64(desc, 68)?,
            base_table_blocks: read_le_u32(desc, 76)?,
            ext_table_slots: read_le_u32(desc, 80)?,
            subsystem_pages,
            generation_counter: read_le_u32(desc, 108)?,
            meta,
            tables,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    pub fn serialize(&self) -> Result<[u8; SB_SIZE], ParseError> {
        let mut desc = [0_u8; SB_SIZE];
        write_bytes(&mut desc, 0, EXSB_MAGIC)?;
        write_le_u32(&mut desc, 4, self.mount_counter)?;
        write_le_u32(&mut desc, 8, self.sync_counter)?;
        write_le_u32(&mut desc, 12, self.flags)?;
        desc[16] = self.log_block_size;
        desc[17] = self.log_erase_block_size;
        desc[18] = self.bnode_pages;
        write_le_u64(&mut desc, 20, self.total_blocks)?;
        write_le_u64(&mut desc, 28, self.free_blocks)?;
        write_le_u64(&mut desc, 36, self.files_count)?;
        write_le_u64(&mut desc, 44, self.folders_count)?;
        write_le_u64(&mut desc, 52, self.inode_capacity)?;
        write_le_u64(&mut desc, 60, self.meta_tbc)?;
        write_le_u64(&mut desc, 68, self.tables_tbc)?;
        write_le_u32(&mut desc, 76, self.base_table_blocks)?;
        write_le_u32(&mut desc, 80, self.ext_table_slots)?;
        for (i, pages) in self.subsystem_pages.iter().enumerate() {
            write_le_u32(&mut desc, 84 + i * 4, *pages)?;
        }
        write_le_u32(&mut desc, 108, self.generation_counter)?;
        for (i, extent) in self.meta.iter().enumerate() {
            extent.write(&mut desc, 112 + i * 16)?;
        }
        for (i, extent) in self.tables.iter().enumerate() {
            extent.write(&mut desc, 240 + i * 16)?;
        }
        seal_descriptor(&mut desc)?;
        Ok(desc)
    }

    fn validate_geometry(&self) -> Result<(), ParseError> {
        self.block_size()?;
        if self.log_erase_block_size < self.log_block_size || self.log_erase_block_size > 30 {
            return Err(ParseError::InvalidField {
                field: "log_erase_block_size",
                reason: "must be between block size and 1 GiB",
            });
        }
        if self.bnode_pages == 0 {
            return Err(ParseError::InvalidField {
                field: "bnode_pages",
                reason: "cannot be zero",
            });
        }
        if self.total_blocks == 0 || self.free_blocks > self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "empty volume or free count above total",
            });
        }
        let meta_sum: u64 = self.meta.iter().map(|e| e.length).sum();
        if meta_sum != self.meta_tbc {
            return Err(ParseError::InvalidField {
                field: "meta_tbc",
                reason: "does not match metadata extents",
            });
        }
        let all = self.meta.iter().chain(self.tables.iter());
        for extent in all {
            if extent.end() > self.total_blocks {
                return Err(ParseError::InvalidField {
                    field: "extent",
                    reason: "beyond end of volume",
                });
            }
        }
        let slot_len = u64::from(self.base_table_blocks) + u64::from(self.ext_table_slots);
        if self.base_table_blocks == 0 || self.tables.iter().any(|t| t.length < slot_len) {
            return Err(ParseError::InvalidField {
                field: "tables",
                reason: "table slot smaller than base plus extended tables",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn version(&self) -> Version {
        Version::new(self.mount_counter, self.sync_counter)
    }

    pub fn set_version(&mut self, version: Version) {
        self.mount_counter = version.mount;
        self.sync_counter = version.sync;
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::from_shift(self.log_block_size)
    }

    /// Blocks per erase block (LEB).
    #[must_use]
    pub fn blocks_per_leb(&self) -> u64 {
        1_u64 << self.log_erase_block_size.saturating_sub(self.log_block_size)
    }

    #[must_use]
    pub fn total_lebs(&self) -> u64 {
        self.total_blocks.div_ceil(self.blocks_per_leb())
    }

    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Physical block of metadata-area block `index`, walking the extents
    /// in order.
    #[must_use]
    pub fn meta_physical(&self, index: u64) -> Option<u64> {
        let mut remaining = index;
        for extent in &self.meta {
            if remaining < extent.length {
                return Some(extent.begin + remaining);
            }
            remaining -= extent.length;
        }
        None
    }

    /// Inverse of [`Self::meta_physical`].
    #[must_use]
    pub fn meta_index(&self, block: u64) -> Option<u64> {
        let mut base = 0_u64;
        for extent in &self.meta {
            if extent.contains(block) {
                return Some(base + (block - extent.begin));
            }
            base += extent.length;
        }
        None
    }

    /// Append `extent` to the metadata area, merging with the last extent
    /// when contiguous. Fails when all extent slots are taken.
    pub fn push_meta_extent(&mut self, extent: Extent) -> Result<(), ParseError> {
        let used = self.meta.iter().rposition(|e| !e.is_empty());
        if let Some(last) = used {
            if self.meta[last].end() == extent.begin {
                self.meta[last].length += extent.length;
                self.meta_tbc += extent.length;
                return Ok(());
            }
        }
        let next = used.map_or(0, |i| i + 1);
        let Some(slot) = self.meta.get_mut(next) else {
            return Err(ParseError::InvalidField {
                field: "meta",
                reason: "metadata extent slots exhausted",
            });
        };
        *slot = extent;
        self.meta_tbc += extent.length;
        Ok(())
    }
}

impl SuperblockCopy {
    /// Parse copy `index` (0 = primary, 1 = mirror) from the superblock region.
    pub fn parse(region: &[u8], index: usize) -> Result<Self, ParseError> {
        let base = copy_offset(index)?;
        let copy = ensure_slice(region, base, SB_COPY_STRIDE)?;
        Ok(Self {
            primary: PrimarySuperblock::parse(&copy[..SB_SIZE])?,
            exsb: ExtendedSuperblock::parse(&copy[EXSB_OFFSET..EXSB_OFFSET + SB_SIZE])?,
        })
    }

    /// Serialize into copy slot `index` of a superblock region buffer.
    pub fn write_into(&self, region: &mut [u8], index: usize) -> Result<(), ParseError> {
        let base = copy_offset(index)?;
        write_bytes(region, base, &self.primary.serialize()?)?;
        write_bytes(region, base + EXSB_OFFSET, &self.exsb.serialize()?)
    }

    /// Bytes of one serialized copy, ready to be written at [`copy_offset`].
    pub fn serialize(&self) -> Result<Vec<u8>, ParseError> {
        let mut copy = vec![0_u8; SB_COPY_STRIDE];
        self.write_into(&mut copy, 0)?;
        Ok(copy)
    }
}

/// Byte offset of superblock copy `index`.
pub fn copy_offset(index: usize) -> Result<usize, ParseError> {
    match index {
        0 | 1 => Ok(index * SB_COPY_STRIDE),
        _ => Err(ParseError::InvalidField {
            field: "superblock_copy",
            reason: "only copies 0 and 1 exist",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdfs_types::SB_REGION_SIZE;

    fn sample_copy() -> SuperblockCopy {
        let mut meta = [Extent::default(); VDFS_META_BTREE_EXTENTS];
        meta[0] = Extent::new(64, 128);
        let tables = [Extent::new(4, 24), Extent::new(28, 24)];
        SuperblockCopy {
            primary: PrimarySuperblock {
                layout_version: LAYOUT_VERSION,
                case_insensitive: true,
                volume_uuid: [7; 16],
                volume_name: *b"data\0\0\0\0\0\0\0\0\0\0\0\0",
                creation_time: 1_700_000_000,
            },
            exsb: ExtendedSuperblock {
                mount_counter: 3,
                sync_counter: 11,
                flags: EXSB_DIRTY,
                log_block_size: 12,
                log_erase_block_size: 17,
                bnode_pages: 2,
                total_blocks: 4096,
                free_blocks: 3000,
                files_count: 5,
                folders_count: 2,
                inode_capacity: 8192,
                meta_tbc: 128,
                tables_tbc: 48,
                base_table_blocks: 8,
                ext_table_slots: 16,
                subsystem_pages: [32, 1, 32, 1, 16, 16],
                generation_counter: 9,
                meta,
                tables,
            },
        }
    }

    #[test]
    fn both_copies_parse_back() {
        let copy = sample_copy();
        let mut region = vec![0_u8; SB_REGION_SIZE];
        copy.write_into(&mut region, 0).expect("copy 0");
        copy.write_into(&mut region, 1).expect("copy 1");
        assert_eq!(SuperblockCopy::parse(&region, 0).expect("parse 0"), copy);
        assert_eq!(SuperblockCopy::parse(&region, 1).expect("parse 1"), copy);
        assert_eq!(copy.exsb.version(), Version::new(3, 11));
        assert_eq!(copy.primary.name(), "data");
        assert!(SuperblockCopy::parse(&region, 2).is_err());
    }

    #[test]
    fn damaged_primary_leaves_mirror_intact() {
        let copy = sample_copy();
        let mut region = vec![0_u8; SB_REGION_SIZE];
        copy.write_into(&mut region, 0).expect("copy 0");
        copy.write_into(&mut region, 1).expect("copy 1");
        region[EXSB_OFFSET + 30] ^= 0x40;
        assert!(matches!(
            SuperblockCopy::parse(&region, 0),
            Err(ParseError::BadChecksum { .. })
        ));
        assert!(SuperblockCopy::parse(&region, 1).is_ok());
    }

    #[test]
    fn unknown_flags_rejected() {
        let mut copy = sample_copy();
        copy.exsb.flags = 0x80;
        let bytes = copy.exsb.serialize().expect("serialize");
        assert!(ExtendedSuperblock::parse(&bytes).is_err());
    }

    #[test]
    fn meta_area_index_mapping() {
        let mut exsb = sample_copy().exsb;
        exsb.push_meta_extent(Extent::new(192, 32)).expect("contiguous");
        assert_eq!(exsb.meta[0], Extent::new(64, 160));
        exsb.push_meta_extent(Extent::new(1024, 64)).expect("new slot");
        assert_eq!(exsb.meta[1], Extent::new(1024, 64));
        assert_eq!(exsb.meta_tbc, 224);

        assert_eq!(exsb.meta_physical(0), Some(64));
        assert_eq!(exsb.meta_physical(160), Some(1024));
        assert_eq!(exsb.meta_physical(224), None);
        assert_eq!(exsb.meta_index(1030), Some(166));
        assert_eq!(exsb.meta_index(10), None);
    }

    #[test]
    fn geometry_helpers() {
        let exsb = sample_copy().exsb;
        assert_eq!(exsb.blocks_per_leb(), 32);
        assert_eq!(exsb.total_lebs(), 128);
        assert_eq!(exsb.block_size().map(BlockSize::get), Ok(4096));
    }
}
