//! Offline-style consistency check of a mounted volume.
//!
//! Every structure is verified on its own first (tree shape, bitmap against
//! run index, translation table against the metadata area); then the
//! structures are cross-checked: catalog parents, folder counters, hard-link
//! counts, block ownership and accounting, inode usage.

use crate::VolumeHandle;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use vdfs_alloc::SpaceStats;
use vdfs_catalog::{CatalogEntry, FileRecord, Record};
use vdfs_error::Result;
use vdfs_extent::Fork;
use vdfs_ondisk::Extent;
use vdfs_snapshot::MetaUsage;
use vdfs_types::ObjectId;

/// Findings of [`VolumeHandle::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub files: u64,
    pub folders: u64,
    pub hardlinked_files: u64,
    pub data_blocks: u64,
    pub overflow_extents: u64,
    pub xattrs: u64,
    pub space: SpaceStats,
    pub meta: MetaUsage,
    pub problems: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, detail: String) {
        debug!(detail = %detail, "check_problem");
        self.problems.push(detail);
    }
}

#[derive(Default)]
struct FolderTally {
    total_items: u64,
    links: u32,
    children: u64,
    subfolders: u32,
}

impl VolumeHandle {
    /// Verify the whole volume. Waits for running transactions and keeps
    /// new ones out until done. Problems are collected, not returned as
    /// errors.
    pub fn check(&self) -> Result<CheckReport> {
        let _quiet = self.barrier.exclusive()?;
        let mut report = CheckReport {
            space: self.md.fsm.stats(),
            ..CheckReport::default()
        };
        if let Err(err) = self.md.fsm.check() {
            report.problem(format!("free space: {err}"));
        }
        match self.snapshot.check() {
            Ok(meta) => report.meta = meta,
            Err(err) => report.problem(format!("translation table: {err}")),
        }
        let trees = [
            ("catalog", self.md.catalog.check()),
            ("extents overflow", self.md.extents.check()),
            ("hardlink", self.md.hardlinks.check()),
            ("xattr", self.md.xattrs.check()),
        ];
        for (name, result) in trees {
            if let Err(err) = result {
                report.problem(format!("{name} tree: {err}"));
            }
        }

        let mut entries = Vec::new();
        let mut hardlinked = HashMap::new();
        let scanned = self
            .md
            .catalog
            .for_each(|entry| {
                entries.push(entry.clone());
                Ok(())
            })
            .and_then(|()| {
                self.md.hardlinks.for_each(|file| {
                    hardlinked.insert(file.meta.object_id, file.clone());
                    Ok(())
                })
            });
        if let Err(err) = scanned {
            report.problem(format!("scan aborted: {err}"));
            return Ok(report);
        }

        let files = self.check_namespace(&entries, &hardlinked, &mut report);
        self.check_blocks(&files, &mut report);

        if report.is_clean() {
            info!(
                files = report.files,
                folders = report.folders,
                data_blocks = report.data_blocks,
                "check_clean"
            );
        } else {
            warn!(problems = report.problems.len(), "check_found_problems");
        }
        Ok(report)
    }

    /// Cross-check catalog entries, folder counters, hard links and inode
    /// usage. Returns every live file's fork for the block checks.
    fn check_namespace<'a>(
        &self,
        entries: &'a [CatalogEntry],
        hardlinked: &'a HashMap<ObjectId, FileRecord>,
        report: &mut CheckReport,
    ) -> HashMap<ObjectId, &'a Fork> {
        let mut folders: HashMap<ObjectId, FolderTally> = HashMap::new();
        for entry in entries {
            if let Record::Folder(folder) = &entry.record {
                folders.insert(
                    folder.meta.object_id,
                    FolderTally {
                        total_items: folder.total_items,
                        links: folder.meta.links_count,
                        ..FolderTally::default()
                    },
                );
            }
        }

        let mut files: HashMap<ObjectId, &Fork> = HashMap::new();
        let mut owners: HashMap<ObjectId, &CatalogEntry> = HashMap::new();
        let mut link_names: HashMap<ObjectId, u32> = HashMap::new();
        for entry in entries {
            if !entry.key.is_sentinel() {
                match folders.get_mut(&entry.key.parent) {
                    Some(tally) => {
                        tally.children += 1;
                        if matches!(entry.record, Record::Folder(_)) {
                            tally.subfolders += 1;
                        }
                    }
                    None => report.problem(format!("{} has no parent folder", entry.key)),
                }
            }
            match &entry.record {
                Record::Folder(_) | Record::File(_) => {
                    let Some(meta) = entry.record.meta() else {
                        continue;
                    };
                    if let Some(first) = owners.insert(meta.object_id, entry) {
                        report.problem(format!(
                            "object {} appears at both {} and {}",
                            meta.object_id, first.key, entry.key
                        ));
                    }
                    if let Record::File(file) = &entry.record {
                        files.insert(meta.object_id, &file.fork);
                    }
                }
                Record::Hlink { object_id } => {
                    *link_names.entry(*object_id).or_default() += 1;
                    if !hardlinked.contains_key(object_id) {
                        report.problem(format!(
                            "{} links to {object_id} which has no hardlink record",
                            entry.key
                        ));
                    }
                }
                other => report.problem(format!(
                    "{} holds an unsupported {:?} record",
                    entry.key,
                    other.record_type()
                )),
            }
        }

        for (ino, tally) in &folders {
            if tally.total_items != tally.children {
                report.problem(format!(
                    "folder {ino} counts {} items but has {}",
                    tally.total_items, tally.children
                ));
            }
            if tally.links != 2 + tally.subfolders {
                report.problem(format!(
                    "folder {ino} has link count {} with {} subfolders",
                    tally.links, tally.subfolders
                ));
            }
        }
        for (ino, file) in hardlinked {
            let names = link_names.get(ino).copied().unwrap_or(0);
            if names != file.meta.links_count {
                report.problem(format!(
                    "hard-linked file {ino} has {names} names but link count {}",
                    file.meta.links_count
                ));
            }
            if owners.contains_key(ino) {
                report.problem(format!("object {ino} is both hard-linked and a plain entry"));
            }
            files.insert(*ino, &file.fork);
        }

        let mut live = 0_u64;
        for ino in owners.keys().chain(hardlinked.keys()) {
            if !self.md.inodes.is_used(*ino) {
                report.problem(format!("object {ino} is live but free in the inode bitmap"));
            }
            if *ino >= ObjectId::FIRST_FILE {
                live += 1;
            }
        }
        let expected = ObjectId::FIRST_FILE.0 + live;
        let used = self.md.inodes.used();
        if used != expected {
            report.problem(format!(
                "{used} object ids marked used, {expected} accounted for"
            ));
        }

        report.folders = folders.len() as u64;
        report.hardlinked_files = hardlinked.len() as u64;
        report.files = files.len() as u64;
        files
    }

    /// Block ownership: every mapped block is allocated, owned once and
    /// outside the metadata area, and the free-space counters add up.
    fn check_blocks(&self, files: &HashMap<ObjectId, &Fork>, report: &mut CheckReport) {
        let exsb = self.snapshot.exsb();
        let mut runs: Vec<(Extent, ObjectId)> = Vec::new();
        for (ino, fork) in files {
            match self.md.extents.all_extents(*ino, fork) {
                Ok(extents) => {
                    let mapped: u64 = extents.iter().map(|e| e.block_count).sum();
                    if mapped != fork.total_blocks {
                        report.problem(format!(
                            "file {ino} maps {mapped} blocks but records {}",
                            fork.total_blocks
                        ));
                    }
                    runs.extend(
                        extents
                            .iter()
                            .map(|e| (Extent::new(e.first_block, e.block_count), *ino)),
                    );
                }
                Err(err) => report.problem(format!("block map of file {ino}: {err}")),
            }
        }

        let mut overflow = 0;
        let mut orphans = Vec::new();
        let walked = self.md.extents.for_each(|ino, extent| {
            overflow += 1;
            if !files.contains_key(&ino) {
                orphans.push(format!("overflow extent at {} of dead object {ino}", extent.iblock));
            }
            Ok(())
        });
        if let Err(err) = walked {
            orphans.push(format!("extents overflow scan: {err}"));
        }
        report.overflow_extents = overflow;

        let mut xattrs = 0;
        let walked = self.md.xattrs.for_each(|ino, name, _| {
            xattrs += 1;
            if !self.md.inodes.is_used(ino) {
                orphans.push(format!("xattr {name} of dead object {ino}"));
            }
            Ok(())
        });
        if let Err(err) = walked {
            orphans.push(format!("xattr scan: {err}"));
        }
        report.xattrs = xattrs;
        for orphan in orphans {
            report.problem(orphan);
        }

        let mut reserved = vec![Extent::new(0, exsb.meta[0].end())];
        reserved.extend(exsb.meta[1..].iter().copied().filter(|e| !e.is_empty()));
        runs.sort_by_key(|(extent, _)| extent.begin);
        let mut claimed: HashSet<ObjectId> = HashSet::new();
        let mut data_blocks = 0;
        for (i, (extent, ino)) in runs.iter().enumerate() {
            data_blocks += extent.length;
            if let Some((next, other)) = runs.get(i + 1) {
                if next.begin < extent.end() {
                    report.problem(format!(
                        "blocks {}..{} shared by objects {ino} and {other}",
                        next.begin,
                        extent.end().min(next.end())
                    ));
                }
            }
            if reserved
                .iter()
                .any(|r| r.begin < extent.end() && extent.begin < r.end())
            {
                report.problem(format!(
                    "object {ino} maps {}+{} inside the metadata area",
                    extent.begin, extent.length
                ));
            }
            if extent.end() > exsb.total_blocks {
                report.problem(format!(
                    "object {ino} maps {}+{} past the end of the volume",
                    extent.begin, extent.length
                ));
            } else if (extent.begin..extent.end()).any(|b| !self.md.fsm.is_used(b))
                && claimed.insert(*ino)
            {
                report.problem(format!("object {ino} maps blocks marked free"));
            }
        }
        report.data_blocks = data_blocks;

        let space = report.space;
        let used = space.total_blocks - space.free_blocks - space.reserved_blocks;
        let owned = exsb.meta[0].begin
            + exsb.meta_tbc
            + data_blocks
            + self.md.fsm.preallocated_blocks();
        if used != owned {
            report.problem(format!(
                "{used} blocks allocated but {owned} accounted for"
            ));
        }
    }
}
