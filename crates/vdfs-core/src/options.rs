//! Format-time and mount-time configuration.

use serde::{Deserialize, Serialize};
use vdfs_snapshot::DEFAULT_BASE_TABLE_THRESHOLD;

/// Parameters of a new volume. Everything here is fixed once the volume
/// is formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Bytes per block; must match the device.
    pub block_size: u32,
    /// Bytes per logical erase block (LEB).
    pub erase_block_size: u32,
    /// Blocks to use; defaults to the whole device.
    pub total_blocks: Option<u64>,
    /// Highest object id plus one; defaults to one id per block.
    pub inode_capacity: Option<u64>,
    /// Bnode capacity of each tree, head node included.
    pub catalog_nodes: u32,
    pub extents_nodes: u32,
    pub hardlink_nodes: u32,
    pub xattr_nodes: u32,
    /// Initial metadata-area size in blocks, rounded up to whole LEBs.
    pub meta_blocks: Option<u64>,
    /// Extended tables that fit after a base table in one slot.
    pub ext_table_slots: u32,
    /// Fold case when comparing names. Cannot be changed later.
    pub case_insensitive: bool,
    /// Up to 16 bytes.
    pub volume_name: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            erase_block_size: 128 * 1024,
            total_blocks: None,
            inode_capacity: None,
            catalog_nodes: 1024,
            extents_nodes: 256,
            hardlink_nodes: 64,
            xattr_nodes: 256,
            meta_blocks: None,
            ext_table_slots: 16,
            case_insensitive: false,
            volume_name: String::new(),
        }
    }
}

/// Per-mount behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Never write to the device. Superblock restoration is skipped too.
    pub read_only: bool,
    /// Maintain the `(ino, generation)` index used by
    /// [`crate::VolumeHandle::resolve_handle`].
    pub nfs_index: bool,
    /// Extended tables layered on one base before a new base is forced.
    pub base_table_threshold: u32,
    /// Blocks speculatively allocated past each file write.
    pub prealloc_blocks: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            nfs_index: false,
            base_table_threshold: DEFAULT_BASE_TABLE_THRESHOLD,
            prealloc_blocks: 8,
        }
    }
}
