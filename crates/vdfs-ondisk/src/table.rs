//! Translation-table formats.
//!
//! A base table is a full snapshot of the logical→physical page map of every
//! tracked metadata file:
//!
//! ```text
//! 0   signature  "VDFSBTBL"
//! 8   mount      u32
//! 12  sync       u32
//! 16  crc_offset u32
//! 20  sections   u32
//! 24  (object_id u32, entry_count u32) * sections
//! ..  u64 physical block per logical page, sections in order (0 = unmapped)
//! crc_offset: crc32c over [0, crc_offset)
//! ```
//!
//! An extended table is a one-block delta chained after a base table:
//!
//! ```text
//! 0   signature  "VDFSETBL"
//! 8   mount      u32
//! 12  sync       u32
//! 16  crc_offset u32
//! 20  count      u32
//! 24  (object_id u64, table_index u64, physical u64) * count
//! crc_offset: crc32c over [0, crc_offset)
//! ```

use vdfs_types::{
    CRC_SIZE, ParseError, Subsystem, Version, ensure_slice, read_fixed, read_le_u32, read_le_u64,
    write_bytes, write_le_u32, write_le_u64,
};

pub const BASE_TABLE_SIGNATURE: &[u8; 8] = b"VDFSBTBL";
pub const EXT_TABLE_SIGNATURE: &[u8; 8] = b"VDFSETBL";

const HEADER_LEN: usize = 24;
const SECTION_DESC_LEN: usize = 8;
const EXT_RECORD_LEN: usize = 24;

/// Page map of one subsystem inside a base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSection {
    pub subsystem: Subsystem,
    /// Physical block per logical page; 0 means the page was never written.
    pub entries: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTable {
    pub version: Version,
    pub sections: Vec<TableSection>,
}

/// Single page remap inside an extended table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedRecord {
    pub object_id: u64,
    pub table_index: u64,
    pub physical: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedTable {
    pub version: Version,
    pub records: Vec<ExtendedRecord>,
}

fn write_header(
    buf: &mut [u8],
    signature: &[u8; 8],
    version: Version,
    crc_offset: usize,
    count: usize,
) -> Result<(), ParseError> {
    write_bytes(buf, 0, signature)?;
    write_le_u32(buf, 8, version.mount)?;
    write_le_u32(buf, 12, version.sync)?;
    write_le_u32(buf, 16, to_u32(crc_offset, "crc_offset")?)?;
    write_le_u32(buf, 20, to_u32(count, "count")?)
}

fn to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

fn to_usize(value: u32, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Check signature and CRC, returning `(version, count, crc_offset)`.
fn read_header(buf: &[u8], signature: &[u8; 8]) -> Result<(Version, usize, usize), ParseError> {
    let found: [u8; 8] = read_fixed(buf, 0)?;
    if found != *signature {
        return Err(ParseError::InvalidMagic {
            expected: signature.to_vec(),
            actual: found.to_vec(),
        });
    }
    let version = Version::new(read_le_u32(buf, 8)?, read_le_u32(buf, 12)?);
    let crc_offset = to_usize(read_le_u32(buf, 16)?, "crc_offset")?;
    if crc_offset < HEADER_LEN {
        return Err(ParseError::InvalidField {
            field: "crc_offset",
            reason: "inside table header",
        });
    }
    let stored = read_le_u32(buf, crc_offset)?;
    let computed = crc32c::crc32c(ensure_slice(buf, 0, crc_offset)?);
    if stored != computed {
        return Err(ParseError::BadChecksum { stored, computed });
    }
    let count = to_usize(read_le_u32(buf, 20)?, "count")?;
    Ok((version, count, crc_offset))
}

impl BaseTable {
    /// Bytes needed to serialize a table with the given section sizes.
    #[must_use]
    pub fn encoded_len<I: IntoIterator<Item = usize>>(section_entries: I) -> usize {
        let mut len = HEADER_LEN + CRC_SIZE;
        for entries in section_entries {
            len += SECTION_DESC_LEN + entries * 8;
        }
        len
    }

    #[must_use]
    pub fn section(&self, subsystem: Subsystem) -> Option<&TableSection> {
        self.sections.iter().find(|s| s.subsystem == subsystem)
    }

    pub fn section_mut(&mut self, subsystem: Subsystem) -> Option<&mut TableSection> {
        self.sections.iter_mut().find(|s| s.subsystem == subsystem)
    }

    /// Serialize into a zero-padded buffer of exactly `capacity` bytes.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>, ParseError> {
        let crc_offset = Self::encoded_len(self.sections.iter().map(|s| s.entries.len())) - CRC_SIZE;
        if crc_offset + CRC_SIZE > capacity {
            return Err(ParseError::InsufficientData {
                needed: crc_offset + CRC_SIZE,
                offset: 0,
                actual: capacity,
            });
        }
        let mut buf = vec![0_u8; capacity];
        write_header(
            &mut buf,
            BASE_TABLE_SIGNATURE,
            self.version,
            crc_offset,
            self.sections.len(),
        )?;
        let mut offset = HEADER_LEN;
        for section in &self.sections {
            write_le_u32(&mut buf, offset, u32::from(section.subsystem as u8))?;
            write_le_u32(
                &mut buf,
                offset + 4,
                to_u32(section.entries.len(), "entry_count")?,
            )?;
            offset += SECTION_DESC_LEN;
        }
        for section in &self.sections {
            for entry in &section.entries {
                write_le_u64(&mut buf, offset, *entry)?;
                offset += 8;
            }
        }
        let crc = crc32c::crc32c(&buf[..crc_offset]);
        write_le_u32(&mut buf, crc_offset, crc)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let (version, count, crc_offset) = read_header(buf, BASE_TABLE_SIGNATURE)?;
        let mut descs = Vec::with_capacity(count);
        let mut offset = HEADER_LEN;
        for _ in 0..count {
            let subsystem = Subsystem::from_object_id(u64::from(read_le_u32(buf, offset)?))?;
            let entries = to_usize(read_le_u32(buf, offset + 4)?, "entry_count")?;
            descs.push((subsystem, entries));
            offset += SECTION_DESC_LEN;
        }
        if Self::encoded_len(descs.iter().map(|(_, n)| *n)) - CRC_SIZE != crc_offset {
            return Err(ParseError::InvalidField {
                field: "crc_offset",
                reason: "does not match section sizes",
            });
        }
        let mut sections = Vec::with_capacity(count);
        for (subsystem, n) in descs {
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                entries.push(read_le_u64(buf, offset)?);
                offset += 8;
            }
            sections.push(TableSection { subsystem, entries });
        }
        Ok(Self { version, sections })
    }
}

impl ExtendedTable {
    /// Records one block of `block_size` bytes can carry.
    #[must_use]
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(HEADER_LEN + CRC_SIZE) / EXT_RECORD_LEN
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        if self.records.len() > Self::capacity(block_size) {
            return Err(ParseError::InvalidField {
                field: "records",
                reason: "extended table overflows one block",
            });
        }
        let crc_offset = HEADER_LEN + self.records.len() * EXT_RECORD_LEN;
        let mut buf = vec![0_u8; block_size];
        write_header(
            &mut buf,
            EXT_TABLE_SIGNATURE,
            self.version,
            crc_offset,
            self.records.len(),
        )?;
        for (i, record) in self.records.iter().enumerate() {
            let offset = HEADER_LEN + i * EXT_RECORD_LEN;
            write_le_u64(&mut buf, offset, record.object_id)?;
            write_le_u64(&mut buf, offset + 8, record.table_index)?;
            write_le_u64(&mut buf, offset + 16, record.physical)?;
        }
        let crc = crc32c::crc32c(&buf[..crc_offset]);
        write_le_u32(&mut buf, crc_offset, crc)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let (version, count, crc_offset) = read_header(buf, EXT_TABLE_SIGNATURE)?;
        if HEADER_LEN + count * EXT_RECORD_LEN != crc_offset {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "does not match crc_offset",
            });
        }
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let offset = HEADER_LEN + i * EXT_RECORD_LEN;
            records.push(ExtendedRecord {
                object_id: read_le_u64(buf, offset)?,
                table_index: read_le_u64(buf, offset + 8)?,
                physical: read_le_u64(buf, offset + 16)?,
            });
        }
        Ok(Self { version, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_base() -> BaseTable {
        BaseTable {
            version: Version::new(2, 7),
            sections: vec![
                TableSection {
                    subsystem: Subsystem::CatalogTree,
                    entries: vec![100, 101, 0, 0],
                },
                TableSection {
                    subsystem: Subsystem::InodeBitmap,
                    entries: vec![140],
                },
            ],
        }
    }

    #[test]
    fn base_table_decodes_what_it_encodes() {
        let table = sample_base();
        let buf = table.encode(1024).expect("encode");
        assert_eq!(buf.len(), 1024);
        let back = BaseTable::decode(&buf).expect("decode");
        assert_eq!(back, table);
        assert_eq!(
            back.section(Subsystem::InodeBitmap).map(|s| s.entries.clone()),
            Some(vec![140])
        );
        assert!(back.section(Subsystem::XattrTree).is_none());
    }

    #[test]
    fn base_table_too_large_for_capacity() {
        let table = sample_base();
        let needed = BaseTable::encoded_len([4, 1]);
        assert!(table.encode(needed - 1).is_err());
        assert!(table.encode(needed).is_ok());
    }

    #[test]
    fn torn_base_table_fails_crc() {
        let mut buf = sample_base().encode(512).expect("encode");
        buf[HEADER_LEN + 2 * SECTION_DESC_LEN + 3] ^= 1;
        assert!(matches!(
            BaseTable::decode(&buf),
            Err(ParseError::BadChecksum { .. })
        ));
    }

    #[test]
    fn wrong_signature_rejected() {
        let buf = sample_base().encode(512).expect("encode");
        assert!(matches!(
            ExtendedTable::decode(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
        assert!(BaseTable::decode(&[0_u8; 512]).is_err());
    }

    #[test]
    fn extended_table_capacity_and_decode() {
        assert_eq!(ExtendedTable::capacity(4096), (4096 - 28) / 24);
        let table = ExtendedTable {
            version: Version::new(2, 8),
            records: vec![
                ExtendedRecord {
                    object_id: Subsystem::CatalogTree.object_id(),
                    table_index: 3,
                    physical: 977,
                },
                ExtendedRecord {
                    object_id: Subsystem::FreeSpaceBitmap.object_id(),
                    table_index: 0,
                    physical: 978,
                },
            ],
        };
        let buf = table.encode(1024).expect("encode");
        assert_eq!(ExtendedTable::decode(&buf).expect("decode"), table);

        let full = ExtendedTable {
            version: table.version,
            records: vec![table.records[0]; ExtendedTable::capacity(1024) + 1],
        };
        assert!(full.encode(1024).is_err());
    }
}
