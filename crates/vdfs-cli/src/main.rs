#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vdfs::{
    DirEntry, FileByteDevice, FileType, FormatOptions, InodeAttr, MetaUsage, MountOptions,
    Subsystem, TableRecoveryReport, VolumeHandle,
};

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    volume_uuid: String,
    layout_version: u16,
    creation_time: u64,
    case_insensitive: bool,
    block_size: u32,
    erase_block_size: u64,
    total_blocks: u64,
    free_blocks: u64,
    files: u64,
    folders: u64,
    inode_capacity: u64,
    inodes_used: u64,
    version: String,
    meta: MetaUsage,
    meta_extents: Vec<(u64, u64)>,
    table_slots: Vec<(u64, u64)>,
    mapped_pages: Vec<(String, usize)>,
    recovery: TableRecoveryReport,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LsOutput {
    Folder { entries: Vec<DirEntry> },
    File { attr: InodeAttr },
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(true)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logger: {err}"))
}

fn run() -> Result<()> {
    init_logging()?;
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(image) = args.next() else {
                bail!("mkfs requires <image-path> <blocks>");
            };
            let Some(blocks) = args.next() else {
                bail!("mkfs requires <image-path> <blocks>");
            };
            let blocks: u64 = blocks
                .parse()
                .with_context(|| format!("invalid block count {blocks:?}"))?;
            let options = mkfs_options(args.collect())?;
            mkfs(Path::new(&image), blocks, &options)
        }
        "inspect" => {
            let Some(image) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&image), json)
        }
        "ls" => {
            let Some(image) = args.next() else {
                bail!("ls requires <image-path> <path>");
            };
            let path = args.next().unwrap_or_else(|| "/".to_owned());
            let json = args.any(|arg| arg == "--json");
            ls(Path::new(&image), &path, json)
        }
        "fsck" => {
            let Some(image) = args.next() else {
                bail!("fsck requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            fsck(Path::new(&image), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("vdfs-cli\n");
    println!("USAGE:");
    println!("  vdfs-cli mkfs <image-path> <blocks> [--case-insensitive] [--block-size N]");
    println!("                [--erase-block-size N] [--name NAME] [--options FILE.json]");
    println!("  vdfs-cli inspect <image-path> [--json]");
    println!("  vdfs-cli ls <image-path> [path] [--json]");
    println!("  vdfs-cli fsck <image-path> [--json]");
}

fn mkfs_options(args: Vec<String>) -> Result<FormatOptions> {
    let mut options = FormatOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case-insensitive" => options.case_insensitive = true,
            "--block-size" | "--erase-block-size" | "--name" | "--options" => {
                let Some(value) = args.next() else {
                    bail!("{arg} requires a value");
                };
                match arg.as_str() {
                    "--block-size" => {
                        options.block_size = value
                            .parse()
                            .with_context(|| format!("invalid block size {value:?}"))?;
                    }
                    "--erase-block-size" => {
                        options.erase_block_size = value
                            .parse()
                            .with_context(|| format!("invalid erase block size {value:?}"))?;
                    }
                    "--name" => options.volume_name = value,
                    _ => {
                        let text = std::fs::read_to_string(&value)
                            .with_context(|| format!("read {value}"))?;
                        let case_insensitive = options.case_insensitive;
                        options = serde_json::from_str(&text)
                            .with_context(|| format!("parse format options in {value}"))?;
                        options.case_insensitive |= case_insensitive;
                    }
                }
            }
            other => bail!("unknown mkfs option: {other}"),
        }
    }
    Ok(options)
}

fn mkfs(path: &Path, blocks: u64, options: &FormatOptions) -> Result<()> {
    let len = blocks
        .checked_mul(u64::from(options.block_size))
        .context("image size overflows")?;
    let file = FileByteDevice::create(path, len)
        .with_context(|| format!("create image {}", path.display()))?;
    let dev = vdfs::format_device(file, options.block_size)?;
    VolumeHandle::format(Arc::clone(&dev), options)
        .with_context(|| format!("format {}", path.display()))?;
    info!(path = %path.display(), blocks, "mkfs");
    println!(
        "formatted {}: {blocks} blocks of {} bytes{}",
        path.display(),
        options.block_size,
        if options.case_insensitive {
            ", case-insensitive"
        } else {
            ""
        }
    );
    Ok(())
}

fn open_read_only(path: &Path) -> Result<VolumeHandle> {
    let file =
        FileByteDevice::open(path).with_context(|| format!("open image {}", path.display()))?;
    let dev = vdfs::open_device(file)
        .with_context(|| format!("no VDFS superblock in {}", path.display()))?;
    let options = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    VolumeHandle::mount(dev, &options).with_context(|| format!("mount {}", path.display()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let volume = open_read_only(path)?;
    let primary = volume.primary_superblock();
    let exsb = volume.superblock();
    let stats = volume.statfs();
    let output = InspectOutput {
        volume_name: stats.volume_name.clone(),
        volume_uuid: hex(&primary.volume_uuid),
        layout_version: primary.layout_version,
        creation_time: primary.creation_time,
        case_insensitive: stats.case_insensitive,
        block_size: stats.block_size,
        erase_block_size: stats.erase_block_size,
        total_blocks: stats.total_blocks,
        free_blocks: stats.free_blocks,
        files: stats.files,
        folders: stats.folders,
        inode_capacity: stats.inode_capacity,
        inodes_used: stats.inodes_used,
        version: stats.version.to_string(),
        meta: stats.meta,
        meta_extents: exsb
            .meta
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| (e.begin, e.length))
            .collect(),
        table_slots: exsb.tables.iter().map(|e| (e.begin, e.length)).collect(),
        mapped_pages: Subsystem::ALL
            .iter()
            .map(|s| {
                let mapped = volume
                    .translation_table(*s)
                    .iter()
                    .filter(|p| **p != 0)
                    .count();
                (s.to_string(), mapped)
            })
            .collect(),
        recovery: volume.recovery_report().clone(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("VDFS Inspector");
        println!("volume_name: {}", output.volume_name);
        println!("volume_uuid: {}", output.volume_uuid);
        println!("layout_version: {}", output.layout_version);
        println!("case_insensitive: {}", output.case_insensitive);
        println!("block_size: {}", output.block_size);
        println!("erase_block_size: {}", output.erase_block_size);
        println!("total_blocks: {}", output.total_blocks);
        println!("free_blocks: {}", output.free_blocks);
        println!("files: {}", output.files);
        println!("folders: {}", output.folders);
        println!("inodes: {}/{}", output.inodes_used, output.inode_capacity);
        println!("version: {}", output.version);
        println!(
            "meta_area: {} blocks, {} free, {} pages mapped",
            output.meta.total_blocks, output.meta.free_blocks, output.meta.mapped_pages
        );
        for (begin, length) in &output.meta_extents {
            println!("  meta_extent: {begin}+{length}");
        }
        for (slot, (begin, length)) in output.table_slots.iter().enumerate() {
            println!("  table_slot[{slot}]: {begin}+{length}");
        }
        for (subsystem, mapped) in &output.mapped_pages {
            println!("  {subsystem}: {mapped} pages");
        }
        println!(
            "recovery: slot {} base {} -> {} ({} extended, {} rejected{})",
            output.recovery.slot,
            output.recovery.base_version,
            output.recovery.version,
            output.recovery.extended_replayed,
            output.recovery.candidates_rejected,
            if output.recovery.from_mirror {
                ", from mirror"
            } else {
                ""
            }
        );
    }
    Ok(())
}

fn kind_tag(kind: FileType) -> &'static str {
    match kind {
        FileType::Directory => "d",
        FileType::RegularFile => "-",
        FileType::Symlink => "l",
        FileType::Other => "?",
    }
}

fn ls(path: &Path, target: &str, json: bool) -> Result<()> {
    let volume = open_read_only(path)?;
    let inode = volume
        .resolve_path(target)
        .with_context(|| format!("resolve {target}"))?;
    let output = if inode.is_dir() {
        let mut entries: Vec<DirEntry> = Vec::new();
        loop {
            let after = entries.last().map(|e| e.name.clone());
            let page = volume.readdir(inode.ino(), after.as_deref(), 256)?;
            if page.is_empty() {
                break;
            }
            entries.extend(page);
        }
        LsOutput::Folder { entries }
    } else {
        LsOutput::File {
            attr: volume.getattr(&inode.key)?,
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    match output {
        LsOutput::Folder { entries } => {
            for entry in entries {
                println!("{} {:>8} {}", kind_tag(entry.kind), entry.ino.0, entry.name);
            }
        }
        LsOutput::File { attr } => {
            println!(
                "{} {:>8} {:o} links={} size={} blocks={} gen={}",
                kind_tag(attr.kind),
                attr.ino.0,
                attr.perm,
                attr.nlink,
                attr.size,
                attr.blocks,
                attr.generation
            );
        }
    }
    Ok(())
}

fn fsck(path: &Path, json: bool) -> Result<()> {
    let volume = open_read_only(path)?;
    let report = volume.check()?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else {
        println!(
            "files: {} ({} hard-linked), folders: {}",
            report.files, report.hardlinked_files, report.folders
        );
        println!(
            "data blocks: {}, overflow extents: {}, xattrs: {}",
            report.data_blocks, report.overflow_extents, report.xattrs
        );
        println!(
            "free: {}/{} blocks, meta: {}/{} free",
            report.space.free_blocks,
            report.space.total_blocks,
            report.meta.free_blocks,
            report.meta.total_blocks
        );
        for problem in &report.problems {
            println!("problem: {problem}");
        }
    }
    if !report.is_clean() {
        bail!("{} problems found", report.problems.len());
    }
    if !json {
        println!("clean");
    }
    Ok(())
}
