//! Mount-time reconstruction of the translation table.
//!
//! Candidate base tables are read from both table slots of the primary
//! superblock, and from the mirror's slots as well when the two copies
//! disagree about the metadata or table areas. The newest valid candidate
//! wins; the primary wins ties. Extended tables chained after it are
//! replayed while each one is valid and carries the immediate successor
//! version.

use crate::{SnapState, SnapshotManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vdfs_block::{BlockDevice, read_blocks};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::{BaseTable, ExtendedSuperblock, ExtendedTable};
use vdfs_types::{BlockNumber, Subsystem, Version};

/// What recovery found, for logs and `inspect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecoveryReport {
    /// Version of the base table recovery started from.
    pub base_version: Version,
    /// Version after replaying extended tables.
    pub version: Version,
    pub slot: usize,
    /// The winning table was found through the mirror superblock.
    pub from_mirror: bool,
    /// The mirror superblock should be copied over the primary.
    pub restore_exsb: bool,
    pub extended_replayed: u32,
    pub candidates_rejected: u32,
}

#[derive(Debug)]
pub struct TableRecovery {
    pub manager: Arc<SnapshotManager>,
    /// The extended superblock consistent with the recovered table.
    pub exsb: ExtendedSuperblock,
    pub report: TableRecoveryReport,
}

struct Candidate {
    table: BaseTable,
    slot: usize,
    from_mirror: bool,
}

fn read_candidate(
    dev: &dyn BlockDevice,
    exsb: &ExtendedSuperblock,
    slot: usize,
) -> Result<BaseTable> {
    let start = exsb.tables[slot].begin;
    let raw = read_blocks(dev, BlockNumber(start), u64::from(exsb.base_table_blocks))?;
    let table =
        BaseTable::decode(&raw).map_err(|e| Fault::corrupt(start, format!("base table: {e}")))?;
    for subsystem in Subsystem::ALL {
        let expected = exsb.subsystem_pages[subsystem.index()] as usize;
        let found = table.section(subsystem).map(|s| s.entries.len());
        if found != Some(expected) {
            return Err(Fault::corrupt(
                start,
                format!("base table section {subsystem} has {found:?} pages, expected {expected}"),
            ));
        }
    }
    Ok(table)
}

/// Rebuild the translation table and snapshot bitmaps from disk.
///
/// Fails with [`Fault::Corrupt`] when no base table validates.
pub fn load_base_table(
    dev: Arc<dyn BlockDevice>,
    primary: &ExtendedSuperblock,
    mirror: Option<&ExtendedSuperblock>,
    threshold: u32,
) -> Result<TableRecovery> {
    let mut sources = vec![(primary, false)];
    if let Some(mirror) = mirror {
        if mirror.meta_tbc != primary.meta_tbc || mirror.tables != primary.tables {
            sources.push((mirror, true));
        }
    }

    let mut best: Option<Candidate> = None;
    let mut rejected = 0;
    for (exsb, from_mirror) in sources {
        for slot in 0..exsb.tables.len() {
            match read_candidate(dev.as_ref(), exsb, slot) {
                Ok(table) => {
                    debug!(slot, from_mirror, version = %table.version, "table_candidate");
                    if best.as_ref().is_none_or(|b| table.version > b.table.version) {
                        best = Some(Candidate {
                            table,
                            slot,
                            from_mirror,
                        });
                    }
                }
                Err(err) => {
                    warn!(slot, from_mirror, error = %err, "table_candidate_rejected");
                    rejected += 1;
                }
            }
        }
    }
    let Some(winner) = best else {
        error!(rejected, "no_valid_translation_table");
        return Err(Fault::corrupt(
            primary.tables[0].begin,
            "no valid base translation table",
        ));
    };

    // A superblock stamped newer than the durable table was written by a
    // commit that never finished; the mirror then describes the volume.
    let mut restore_exsb = winner.from_mirror;
    let mut exsb = if winner.from_mirror {
        mirror.unwrap_or(primary).clone()
    } else {
        primary.clone()
    };
    if !restore_exsb && primary.version() > winner.table.version {
        if let Some(mirror) = mirror.filter(|m| m.version() <= winner.table.version) {
            exsb = mirror.clone();
            restore_exsb = true;
        }
    }

    let mut state = SnapState::new(exsb.clone(), threshold);
    for section in &winner.table.sections {
        state.tables[section.subsystem.index()].clone_from(&section.entries);
    }

    let mut version = winner.table.version;
    let mut replayed = 0;
    let chain_start = exsb.tables[winner.slot].begin + u64::from(exsb.base_table_blocks);
    for index in 0..exsb.ext_table_slots {
        let block = BlockNumber(chain_start + u64::from(index));
        let raw = dev.read_block(block)?;
        let table = match ExtendedTable::decode(raw.as_slice()) {
            Ok(table) => table,
            Err(err) => {
                debug!(block = block.0, error = %err, "extended_chain_end");
                break;
            }
        };
        if !version.is_successor(table.version) {
            debug!(block = block.0, found = %table.version, after = %version, "extended_chain_gap");
            break;
        }
        for record in &table.records {
            let subsystem = Subsystem::from_object_id(record.object_id)
                .map_err(|e| Fault::corrupt(block.0, format!("extended table record: {e}")))?;
            let entries = &mut state.tables[subsystem.index()];
            let Some(entry) = usize::try_from(record.table_index)
                .ok()
                .and_then(|i| entries.get_mut(i))
            else {
                return Err(Fault::corrupt(
                    block.0,
                    format!(
                        "extended table remaps {subsystem} page {} beyond its capacity",
                        record.table_index
                    ),
                ));
            };
            *entry = record.physical;
        }
        version = table.version;
        replayed += 1;
    }

    state.rebuild_bitmaps()?;
    state.current_slot = winner.slot;
    state.ext_count = replayed;
    state.committed = version;
    state.pending = version.next_sync();

    let report = TableRecoveryReport {
        base_version: winner.table.version,
        version,
        slot: winner.slot,
        from_mirror: winner.from_mirror,
        restore_exsb,
        extended_replayed: replayed,
        candidates_rejected: rejected,
    };
    info!(
        base_version = %report.base_version,
        version = %report.version,
        slot = report.slot,
        extended = replayed,
        restore_exsb,
        "table_recovered"
    );
    let manager = SnapshotManager::from_state(dev, state);
    manager.log_loaded();
    Ok(TableRecovery {
        manager,
        exsb,
        report,
    })
}
