#![forbid(unsafe_code)]
//! On-disk format encoding and decoding for VDFS.
//!
//! Pure codec crate: no I/O, no side effects. Turns byte slices into typed
//! superblock descriptors, translation tables and B-tree nodes and back.
//! Also signs and validates metadata blocks and manipulates bitmaps that are
//! split across signed blocks.

pub mod bnode;
pub mod codec;
pub mod superblock;
pub mod table;

pub use bnode::{Bnode, HeadNode, NodeKind, check_node, record_footprint, record_space};
pub use codec::{
    BITMAP_MAGIC_LEN, FSM_BITMAP_MAGIC, INODE_BITMAP_MAGIC, SMALL_AREA_BITMAP_MAGIC, bits_per_block,
    check, clear_bits, find_next_bit, set_bits, sign, stamped_version, test_bit, validate,
};
pub use superblock::{
    EXSB_DIRTY, ExtendedSuperblock, Extent, IS_MOUNT_FINISHED, LAYOUT_VERSION, PrimarySuperblock,
    SuperblockCopy, copy_offset,
};
pub use table::{BaseTable, ExtendedRecord, ExtendedTable, TableSection};
