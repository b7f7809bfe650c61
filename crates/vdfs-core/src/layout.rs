//! Placement of the superblocks, translation tables and metadata area on a
//! new volume, and the tree geometry derived from a superblock.
//!
//! ```text
//! | sb region | table slot 0 | table slot 1 | pad to LEB | metadata area | data ...
//! ```

use crate::options::FormatOptions;
use std::time::{SystemTime, UNIX_EPOCH};
use vdfs_alloc::PagedBitmap;
use vdfs_btree::TreeGeometry;
use vdfs_error::{Fault, Result};
use vdfs_ondisk::{
    BaseTable, ExtendedSuperblock, Extent, HeadNode, LAYOUT_VERSION, PrimarySuperblock,
};
use vdfs_types::{
    BlockSize, ObjectId, SB_REGION_SIZE, Subsystem, VDFS_META_BTREE_EXTENTS,
    VDFS_TABLES_EXTENTS_COUNT,
};

/// Trees each relocation may touch before the metadata area is topped up.
const META_RESERVE_NODES: u64 = 24;

/// Free metadata blocks below which the area grows.
pub(crate) fn meta_watermark(bnode_pages: u8) -> u64 {
    META_RESERVE_NODES * u64::from(bnode_pages) + 4
}

/// Geometry of one of the four trees as recorded in the superblock.
pub(crate) fn tree_geometry(exsb: &ExtendedSuperblock, subsystem: Subsystem) -> Result<TreeGeometry> {
    let block_size = exsb
        .block_size()
        .map_err(|e| Fault::Format(format!("superblock block size: {e}")))?;
    let pages = exsb.subsystem_pages[subsystem.index()];
    let node_pages = u32::from(exsb.bnode_pages);
    if !subsystem.is_tree() || node_pages == 0 || pages % node_pages != 0 {
        return Err(Fault::Format(format!(
            "{subsystem} has {pages} pages, not a multiple of {node_pages}-page bnodes"
        )));
    }
    Ok(TreeGeometry {
        block_size: block_size.bytes(),
        node_pages,
        capacity: pages / node_pages,
    })
}

fn log2_exact(value: u32, what: &str) -> Result<u8> {
    if !value.is_power_of_two() {
        return Err(Fault::Format(format!("{what} {value} is not a power of two")));
    }
    u8::try_from(value.trailing_zeros()).map_err(|_| Fault::Format(format!("{what} too large")))
}

fn pages_u32(pages: u64, what: Subsystem) -> Result<u32> {
    u32::try_from(pages).map_err(|_| Fault::Format(format!("{what} needs too many pages")))
}

fn volume_uuid(created_nanos: u128) -> [u8; 16] {
    let seed = created_nanos.to_le_bytes();
    let mut uuid = [0_u8; 16];
    for (i, chunk) in uuid.chunks_mut(4).enumerate() {
        let word = crc32c::crc32c_append(u32::try_from(i).unwrap_or(0), &seed);
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    uuid
}

/// Superblock pair describing a freshly formatted volume.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub primary: PrimarySuperblock,
    pub exsb: ExtendedSuperblock,
}

impl Layout {
    /// Blocks from 0 up to the end of the initial metadata area; all of
    /// them are in use from the start.
    pub fn reserved_end(&self) -> u64 {
        self.exsb.meta[0].end()
    }

    pub fn plan(options: &FormatOptions, device_blocks: u64) -> Result<Self> {
        let block_size = BlockSize::new(options.block_size)
            .map_err(|e| Fault::Format(format!("block size: {e}")))?;
        let bs = block_size.bytes();
        let log_block_size = log2_exact(options.block_size, "block size")?;
        let log_erase_block_size = log2_exact(options.erase_block_size, "erase block size")?;
        if options.erase_block_size < options.block_size || log_erase_block_size > 30 {
            return Err(Fault::Format(format!(
                "erase block size {} must be between the block size and 1 GiB",
                options.erase_block_size
            )));
        }
        let total_blocks = options.total_blocks.unwrap_or(device_blocks);
        if total_blocks > device_blocks {
            return Err(Fault::Format(format!(
                "{total_blocks} blocks requested on a {device_blocks}-block device"
            )));
        }
        let blocks_per_leb = u64::from(options.erase_block_size / options.block_size);
        let bnode_pages = (options.erase_block_size / 16 / options.block_size).clamp(1, 4);
        let node_size = bs * bnode_pages as usize;

        let catalog_probe = TreeGeometry {
            block_size: bs,
            node_pages: bnode_pages,
            capacity: options.catalog_nodes,
        };
        if vdfs_catalog::max_record_footprint() > catalog_probe.max_record_footprint() {
            return Err(Fault::Format(format!(
                "{node_size}-byte bnodes cannot hold the largest catalog record"
            )));
        }
        let nodes = [
            (Subsystem::CatalogTree, options.catalog_nodes),
            (Subsystem::ExtentsTree, options.extents_nodes),
            (Subsystem::HardlinkTree, options.hardlink_nodes),
            (Subsystem::XattrTree, options.xattr_nodes),
        ];
        for (subsystem, count) in nodes {
            if count < 2 || count > HeadNode::max_capacity(node_size) {
                return Err(Fault::Format(format!(
                    "{subsystem} capacity {count} outside 2..={}",
                    HeadNode::max_capacity(node_size)
                )));
            }
        }

        let inode_capacity = options.inode_capacity.unwrap_or(total_blocks.max(1024));
        if inode_capacity <= ObjectId::FIRST_FILE.0 {
            return Err(Fault::Format(format!(
                "inode capacity {inode_capacity} leaves no room for files"
            )));
        }
        let mut subsystem_pages = [0_u32; 6];
        for (subsystem, count) in nodes {
            subsystem_pages[subsystem.index()] = count
                .checked_mul(bnode_pages)
                .ok_or_else(|| Fault::Format(format!("{subsystem} needs too many pages")))?;
        }
        subsystem_pages[Subsystem::FreeSpaceBitmap.index()] = pages_u32(
            PagedBitmap::pages_for(total_blocks, bs),
            Subsystem::FreeSpaceBitmap,
        )?;
        subsystem_pages[Subsystem::InodeBitmap.index()] = pages_u32(
            PagedBitmap::pages_for(inode_capacity, bs),
            Subsystem::InodeBitmap,
        )?;

        let ext_table_slots = options.ext_table_slots.max(1);
        let base_len = BaseTable::encoded_len(subsystem_pages.iter().map(|p| *p as usize));
        let base_table_blocks = u32::try_from(base_len.div_ceil(bs))
            .map_err(|_| Fault::Format("base table too large".to_owned()))?;
        let slot_len = u64::from(base_table_blocks) + u64::from(ext_table_slots);
        let sb_blocks = (SB_REGION_SIZE as u64).div_ceil(bs as u64);
        let mut tables = [Extent::default(); VDFS_TABLES_EXTENTS_COUNT];
        for (i, slot) in tables.iter_mut().enumerate() {
            *slot = Extent::new(sb_blocks + i as u64 * slot_len, slot_len);
        }
        let tables_end = sb_blocks + VDFS_TABLES_EXTENTS_COUNT as u64 * slot_len;

        // Bitmaps are written whole at format; each tree starts with a
        // head and a root. Twice that leaves room to relocate all of it
        // once before the first commit.
        let bitmap_pages = u64::from(subsystem_pages[Subsystem::FreeSpaceBitmap.index()])
            + u64::from(subsystem_pages[Subsystem::InodeBitmap.index()]);
        let live = bitmap_pages + 8 * u64::from(bnode_pages);
        let node_pages = u8::try_from(bnode_pages).unwrap_or(4);
        let wanted = options.meta_blocks.unwrap_or_else(|| {
            (4 * blocks_per_leb).max(2 * live + 2 * meta_watermark(node_pages))
        });
        let meta_len = wanted.max(2 * live).div_ceil(blocks_per_leb) * blocks_per_leb;
        let meta_start = tables_end.div_ceil(blocks_per_leb) * blocks_per_leb;
        let meta_end = meta_start + meta_len;
        if meta_end >= total_blocks {
            return Err(Fault::Format(format!(
                "volume of {total_blocks} blocks is too small; metadata alone ends at {meta_end}"
            )));
        }
        let mut meta = [Extent::default(); VDFS_META_BTREE_EXTENTS];
        meta[0] = Extent::new(meta_start, meta_len);

        let name = options.volume_name.as_bytes();
        if name.len() > 16 {
            return Err(Fault::Format(format!(
                "volume name {:?} longer than 16 bytes",
                options.volume_name
            )));
        }
        let mut volume_name = [0_u8; 16];
        volume_name[..name.len()].copy_from_slice(name);
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let primary = PrimarySuperblock {
            layout_version: LAYOUT_VERSION,
            case_insensitive: options.case_insensitive,
            volume_uuid: volume_uuid(created.as_nanos()),
            volume_name,
            creation_time: created.as_secs(),
        };
        let exsb = ExtendedSuperblock {
            mount_counter: 0,
            sync_counter: 0,
            flags: 0,
            log_block_size,
            log_erase_block_size,
            bnode_pages: node_pages,
            total_blocks,
            free_blocks: total_blocks - meta_end,
            files_count: 0,
            folders_count: 1,
            inode_capacity,
            meta_tbc: meta_len,
            tables_tbc: VDFS_TABLES_EXTENTS_COUNT as u64 * slot_len,
            base_table_blocks,
            ext_table_slots,
            subsystem_pages,
            generation_counter: 1,
            meta,
            tables,
        };
        Ok(Self { primary, exsb })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FormatOptions {
        FormatOptions {
            block_size: 1024,
            erase_block_size: 32 * 1024,
            catalog_nodes: 128,
            extents_nodes: 32,
            hardlink_nodes: 16,
            xattr_nodes: 32,
            ..FormatOptions::default()
        }
    }

    #[test]
    fn regions_do_not_overlap_and_meta_is_leb_aligned() {
        let layout = Layout::plan(&small(), 8192).expect("plan");
        let exsb = &layout.exsb;
        assert_eq!(exsb.bnode_pages, 2);
        assert_eq!(exsb.blocks_per_leb(), 32);
        assert_eq!(exsb.tables[0].begin, 4);
        assert_eq!(exsb.tables[1].begin, exsb.tables[0].end());
        assert!(exsb.meta[0].begin >= exsb.tables[1].end());
        assert_eq!(exsb.meta[0].begin % 32, 0);
        assert_eq!(exsb.meta[0].length % 32, 0);
        assert_eq!(exsb.meta_tbc, exsb.meta[0].length);
        assert_eq!(exsb.free_blocks, 8192 - layout.reserved_end());

        // The planned superblock passes the same checks a mount applies.
        let bytes = exsb.serialize().expect("serialize");
        assert_eq!(&ExtendedSuperblock::parse(&bytes).expect("parse"), exsb);
        let geometry = tree_geometry(exsb, Subsystem::CatalogTree).expect("geometry");
        assert_eq!(geometry.capacity, 128);
        assert_eq!(geometry.node_pages, 2);
    }

    #[test]
    fn single_page_bnodes_of_small_blocks_are_rejected() {
        // 1 KiB blocks with 16 KiB erase blocks give one-page bnodes, too
        // small for a full-length file name plus its fork.
        let opts = FormatOptions {
            erase_block_size: 16 * 1024,
            ..small()
        };
        assert!(matches!(Layout::plan(&opts, 8192), Err(Fault::Format(_))));
    }

    #[test]
    fn bnode_pages_follow_erase_block_size() {
        let opts = FormatOptions {
            erase_block_size: 256 * 1024,
            ..small()
        };
        assert_eq!(Layout::plan(&opts, 1 << 16).expect("plan").exsb.bnode_pages, 4);
    }

    #[test]
    fn rejected_geometries() {
        let too_small = Layout::plan(&small(), 64);
        assert!(matches!(too_small, Err(Fault::Format(_))));

        let odd_block = FormatOptions {
            block_size: 3000,
            ..small()
        };
        assert!(matches!(Layout::plan(&odd_block, 8192), Err(Fault::Format(_))));

        let beyond_device = FormatOptions {
            total_blocks: Some(10_000),
            ..small()
        };
        assert!(matches!(Layout::plan(&beyond_device, 8192), Err(Fault::Format(_))));

        let one_node = FormatOptions {
            hardlink_nodes: 1,
            ..small()
        };
        assert!(matches!(Layout::plan(&one_node, 8192), Err(Fault::Format(_))));

        let long_name = FormatOptions {
            volume_name: "a-volume-name-of-twenty".to_owned(),
            ..small()
        };
        assert!(matches!(Layout::plan(&long_name, 8192), Err(Fault::Format(_))));
    }
}
