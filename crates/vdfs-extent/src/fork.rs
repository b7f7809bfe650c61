//! Inline fork layout carried in every file record.
//!
//! ```text
//! 0   size_in_bytes u64
//! 8   total_blocks  u64
//! 16  (first_block u64, iblock u64, block_count u64) * VDFS_EXTENTS_COUNT_IN_FORK
//! ```
//!
//! Unused slots are all zero. Used slots are packed at the front in
//! ascending `iblock` order.

use serde::{Deserialize, Serialize};
use vdfs_types::{ParseError, VDFS_EXTENTS_COUNT_IN_FORK, read_le_u64, write_le_u64};

const EXTENT_LEN: usize = 24;
const HEADER_LEN: usize = 16;

/// Encoded size of a [`Fork`].
pub const FORK_LEN: usize = HEADER_LEN + VDFS_EXTENTS_COUNT_IN_FORK * EXTENT_LEN;

/// Physical run mapped at a logical block offset of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkExtent {
    pub first_block: u64,
    pub iblock: u64,
    pub block_count: u64,
}

impl ForkExtent {
    #[must_use]
    pub fn new(first_block: u64, iblock: u64, block_count: u64) -> Self {
        Self {
            first_block,
            iblock,
            block_count,
        }
    }

    /// First logical block past this extent.
    #[must_use]
    pub fn iblock_end(&self) -> u64 {
        self.iblock.saturating_add(self.block_count)
    }

    /// First physical block past this extent.
    #[must_use]
    pub fn physical_end(&self) -> u64 {
        self.first_block.saturating_add(self.block_count)
    }

    #[must_use]
    pub fn contains(&self, iblock: u64) -> bool {
        iblock >= self.iblock && iblock < self.iblock_end()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.iblock < other.iblock_end() && other.iblock < self.iblock_end()
    }

    /// `next` starts where this extent ends, both logically and physically.
    #[must_use]
    pub fn is_followed_by(&self, next: &Self) -> bool {
        self.iblock_end() == next.iblock && self.physical_end() == next.first_block
    }
}

/// A file's size and the newest extents of its block map. Older extents
/// spill into the extents overflow tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    pub size_in_bytes: u64,
    /// Blocks mapped across the inline array and the overflow tree.
    pub total_blocks: u64,
    pub extents: Vec<ForkExtent>,
}

impl Fork {
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.extents.len() >= VDFS_EXTENTS_COUNT_IN_FORK
    }

    /// Blocks mapped inline.
    #[must_use]
    pub fn inline_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.block_count).sum()
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if self.extents.len() > VDFS_EXTENTS_COUNT_IN_FORK {
            return Err(ParseError::InvalidField {
                field: "fork_extents",
                reason: "more extents than inline slots",
            });
        }
        write_le_u64(buf, 0, self.size_in_bytes)?;
        write_le_u64(buf, 8, self.total_blocks)?;
        for slot in 0..VDFS_EXTENTS_COUNT_IN_FORK {
            let extent = self.extents.get(slot).copied().unwrap_or_default();
            let offset = HEADER_LEN + slot * EXTENT_LEN;
            write_le_u64(buf, offset, extent.first_block)?;
            write_le_u64(buf, offset + 8, extent.iblock)?;
            write_le_u64(buf, offset + 16, extent.block_count)?;
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let mut fork = Self {
            size_in_bytes: read_le_u64(buf, 0)?,
            total_blocks: read_le_u64(buf, 8)?,
            extents: Vec::new(),
        };
        for slot in 0..VDFS_EXTENTS_COUNT_IN_FORK {
            let offset = HEADER_LEN + slot * EXTENT_LEN;
            let extent = ForkExtent {
                first_block: read_le_u64(buf, offset)?,
                iblock: read_le_u64(buf, offset + 8)?,
                block_count: read_le_u64(buf, offset + 16)?,
            };
            if extent.block_count == 0 {
                break;
            }
            if fork
                .extents
                .last()
                .is_some_and(|prev| prev.iblock_end() > extent.iblock)
            {
                return Err(ParseError::InvalidField {
                    field: "fork_extents",
                    reason: "inline extents overlap or are out of order",
                });
            }
            fork.extents.push(extent);
        }
        if fork.inline_blocks() > fork.total_blocks {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "smaller than the inline extents",
            });
        }
        Ok(fork)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_packed_extents_and_stops_at_empty_slot() {
        let fork = Fork {
            size_in_bytes: 10_000,
            total_blocks: 12,
            extents: vec![ForkExtent::new(100, 0, 4), ForkExtent::new(300, 4, 6)],
        };
        let mut buf = vec![0xAA_u8; FORK_LEN];
        fork.encode_into(&mut buf).expect("encode");
        assert_eq!(Fork::decode(&buf).expect("decode"), fork);
    }

    #[test]
    fn rejects_overlapping_inline_extents() {
        let fork = Fork {
            size_in_bytes: 0,
            total_blocks: 8,
            extents: vec![ForkExtent::new(100, 0, 4), ForkExtent::new(300, 2, 4)],
        };
        let mut buf = vec![0_u8; FORK_LEN];
        fork.encode_into(&mut buf).expect("encode");
        assert!(Fork::decode(&buf).is_err());
    }

    #[test]
    fn contiguity_needs_both_axes() {
        let a = ForkExtent::new(100, 0, 4);
        assert!(a.is_followed_by(&ForkExtent::new(104, 4, 1)));
        assert!(!a.is_followed_by(&ForkExtent::new(105, 4, 1)));
        assert!(!a.is_followed_by(&ForkExtent::new(104, 5, 1)));
        assert!(a.overlaps(&ForkExtent::new(0, 3, 10)));
        assert!(!a.overlaps(&ForkExtent::new(0, 4, 10)));
    }
}
