#![forbid(unsafe_code)]

use vdfs_core::{
    CatalogKey, Fault, FileByteDevice, FileHandle, FileType, FormatOptions, MappedRange,
    MemoryByteDevice, MountOptions, ObjectId, SetAttr, SetMode, VolumeHandle, format_device,
    open_device,
};
use vdfs_ondisk::SuperblockCopy;
use vdfs_types::{SB_COPY_STRIDE, SB_REGION_SIZE};

const BLOCK_SIZE: u32 = 1024;
const BLOCKS: usize = 4096;

fn small_volume() -> FormatOptions {
    FormatOptions {
        block_size: BLOCK_SIZE,
        erase_block_size: 32 * 1024,
        catalog_nodes: 128,
        extents_nodes: 32,
        hardlink_nodes: 16,
        xattr_nodes: 32,
        volume_name: "volume-tests".to_owned(),
        ..FormatOptions::default()
    }
}

fn formatted_with(options: &FormatOptions) -> MemoryByteDevice {
    let mem = MemoryByteDevice::new(BLOCKS * BLOCK_SIZE as usize);
    let dev = format_device(mem.clone(), options.block_size).expect("block device");
    VolumeHandle::format(dev, options).expect("format");
    mem
}

fn formatted() -> MemoryByteDevice {
    formatted_with(&small_volume())
}

fn mount(mem: &MemoryByteDevice, options: &MountOptions) -> VolumeHandle {
    let dev = open_device(mem.clone()).expect("superblock");
    VolumeHandle::mount(dev, options).expect("mount")
}

fn read_only() -> MountOptions {
    MountOptions {
        read_only: true,
        ..MountOptions::default()
    }
}

fn assert_clean(volume: &VolumeHandle) {
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
}

fn names(volume: &VolumeHandle, dir: ObjectId) -> Vec<String> {
    volume
        .readdir(dir, None, 1024)
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[test]
fn fresh_volume_has_only_the_root() {
    let mem = formatted();
    let volume = mount(&mem, &read_only());
    let stats = volume.statfs();
    assert_eq!(stats.volume_name, "volume-tests");
    assert_eq!(stats.block_size, BLOCK_SIZE);
    assert_eq!(stats.erase_block_size, 32 * 1024);
    assert_eq!(stats.total_blocks, BLOCKS as u64);
    assert_eq!(stats.files, 0);
    assert_eq!(stats.folders, 1);
    assert!(stats.free_blocks > 0 && stats.free_blocks < stats.total_blocks);
    assert!(stats.read_only);
    assert!(!stats.case_insensitive);

    let root = volume.root().expect("root");
    assert!(root.is_dir());
    assert_eq!(root.ino(), ObjectId::ROOT);
    assert_eq!(root.meta.links_count, 2);
    assert!(names(&volume, ObjectId::ROOT).is_empty());
    assert_clean(&volume);
}

#[test]
fn remount_keeps_namespace_data_and_counters() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let docs = volume.mkdir(ObjectId::ROOT, "docs", 0o750).expect("mkdir");
    let notes = volume.create(docs.ino(), "notes", 0o640).expect("create");
    let mapped = volume
        .write_extents(&notes.key, 0, 3 * u64::from(BLOCK_SIZE) + 10)
        .expect("write");
    volume
        .setxattr(&notes.key, "user.origin", b"test", SetMode::Create)
        .expect("setxattr");
    volume.sync().expect("sync");
    let first_version = volume.committed_version();
    let stats = volume.statfs();
    volume.unmount().expect("unmount");

    let volume = mount(&mem, &MountOptions::default());
    assert_eq!(volume.committed_version(), first_version);
    let found = volume.resolve_path("/docs/notes").expect("resolve");
    assert_eq!(found.ino(), notes.ino());
    let attr = volume.getattr(&found.key).expect("getattr");
    assert_eq!(attr.size, 3 * u64::from(BLOCK_SIZE) + 10);
    assert_eq!(attr.blocks, 4);
    assert_eq!(attr.perm, 0o640);
    let map = volume
        .read_map(&found.key, 0, attr.size)
        .expect("read_map");
    let physical: Vec<(u64, u64)> = map
        .iter()
        .map(|r| (r.physical.expect("mapped"), r.count))
        .collect();
    let written: Vec<(u64, u64)> = mapped.iter().map(|e| (e.first_block, e.block_count)).collect();
    assert_eq!(physical, written);
    assert_eq!(
        volume.getxattr(&found.key, "user.origin").expect("getxattr"),
        b"test"
    );

    let again = volume.statfs();
    assert_eq!(again.files, stats.files);
    assert_eq!(again.folders, stats.folders);
    assert_eq!(again.inodes_used, stats.inodes_used);
    assert_eq!(again.free_blocks, stats.free_blocks);
    let docs_attr = volume.getattr(&docs.key).expect("docs attr");
    assert_eq!(docs_attr.kind, FileType::Directory);
    assert_eq!(docs_attr.size, 1);
    assert_clean(&volume);
}

#[test]
fn torn_primary_superblock_is_restored_from_the_mirror() {
    let mem = formatted();
    {
        let volume = mount(&mem, &MountOptions::default());
        volume.create(ObjectId::ROOT, "survivor", 0o644).expect("create");
        volume.unmount().expect("unmount");
    }
    let mut image = mem.snapshot();
    for byte in &mut image[SB_COPY_STRIDE - 64..SB_COPY_STRIDE] {
        *byte ^= 0x5a;
    }
    let mem = MemoryByteDevice::from_vec(image);
    assert!(SuperblockCopy::parse(&mem.snapshot()[..SB_REGION_SIZE], 0).is_err());

    let volume = mount(&mem, &MountOptions::default());
    volume.lookup(ObjectId::ROOT, "survivor").expect("lookup");
    assert_clean(&volume);
    volume.unmount().expect("unmount");

    let region = mem.snapshot();
    SuperblockCopy::parse(&region[..SB_REGION_SIZE], 0).expect("copy 0 restored");
    SuperblockCopy::parse(&region[..SB_REGION_SIZE], 1).expect("mirror intact");
}

#[test]
fn mount_fails_when_both_superblocks_are_bad() {
    let mem = formatted();
    let mut image = mem.snapshot();
    for copy in 0..2 {
        let end = (copy + 1) * SB_COPY_STRIDE;
        for byte in &mut image[end - 64..end] {
            *byte ^= 0xff;
        }
    }
    let mem = MemoryByteDevice::from_vec(image);
    assert!(open_device(mem.clone()).is_err());
    let dev = format_device(mem, BLOCK_SIZE).expect("block device");
    let err = VolumeHandle::mount(dev, &MountOptions::default()).expect_err("mount");
    assert!(err.is_corruption(), "{err:?}");
}

#[test]
fn read_only_mount_changes_nothing() {
    let mem = formatted();
    {
        let volume = mount(&mem, &MountOptions::default());
        volume.create(ObjectId::ROOT, "file", 0o644).expect("create");
        volume.unmount().expect("unmount");
    }
    let before = mem.snapshot();
    let volume = mount(&mem, &read_only());
    let file = volume.lookup(ObjectId::ROOT, "file").expect("lookup");

    assert!(matches!(
        volume.create(ObjectId::ROOT, "new", 0o644),
        Err(Fault::ReadOnly)
    ));
    assert!(matches!(
        volume.mkdir(ObjectId::ROOT, "dir", 0o755),
        Err(Fault::ReadOnly)
    ));
    assert!(matches!(
        volume.write_extents(&file.key, 0, 1),
        Err(Fault::ReadOnly)
    ));
    assert!(matches!(
        volume.setxattr(&file.key, "user.x", b"1", SetMode::Upsert),
        Err(Fault::ReadOnly)
    ));
    assert!(matches!(
        volume.rename(ObjectId::ROOT, "file", ObjectId::ROOT, "moved"),
        Err(Fault::ReadOnly)
    ));
    assert!(matches!(volume.reserve_blocks(1), Err(Fault::ReadOnly)));
    volume.sync().expect("sync is a no-op");
    volume.unmount().expect("unmount");
    assert!(before == mem.snapshot(), "read-only mount wrote to the image");
}

#[test]
fn broken_counters_stop_all_writes() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    volume.reserve_blocks(10).expect("reserve");
    assert_eq!(volume.statfs().reserved_blocks, 10);
    volume.free_reserved_space(4).expect("partial release");

    let err = volume.free_reserved_space(20).expect_err("over-release");
    assert!(matches!(err, Fault::Inconsistent { .. }), "{err:?}");
    assert!(volume.is_read_only());
    assert!(volume.statfs().read_only);
    assert!(matches!(
        volume.create(ObjectId::ROOT, "late", 0o644),
        Err(Fault::ReadOnly)
    ));
}

#[test]
fn small_metadata_area_grows_by_erase_blocks() {
    let options = FormatOptions {
        meta_blocks: Some(64),
        ..small_volume()
    };
    let mem = formatted_with(&options);
    let volume = mount(&mem, &MountOptions::default());
    let initial = volume.superblock();
    assert_eq!(initial.meta_tbc, 64);
    assert!(initial.meta[1].is_empty());

    for i in 0..40 {
        volume
            .create(ObjectId::ROOT, &format!("file-{i:03}"), 0o644)
            .expect("create");
    }
    let grown = volume.superblock();
    assert!(grown.meta_tbc > 64);
    assert_eq!((grown.meta_tbc - initial.meta_tbc) % 32, 0);
    // Contiguous growth extends the first extent; anything else takes a
    // slot of its own. Either way the added blocks are whole erase blocks.
    let first = grown.meta[0];
    assert_eq!(first.begin, initial.meta[0].begin);
    if first.end() > initial.meta[0].end() {
        assert_eq!(initial.meta[0].end() % 32, 0);
        assert_eq!(first.end() % 32, 0);
    }
    for extent in grown.meta[1..].iter().filter(|e| !e.is_empty()) {
        assert_eq!(extent.begin % 32, 0);
        assert_eq!(extent.length % 32, 0);
    }
    assert_clean(&volume);
    volume.unmount().expect("unmount");

    let volume = mount(&mem, &read_only());
    assert_eq!(volume.superblock().meta_tbc, grown.meta_tbc);
    assert_eq!(names(&volume, ObjectId::ROOT).len(), 40);
    assert_clean(&volume);
}

#[test]
fn file_handles_follow_renames_and_go_stale() {
    let mem = formatted();
    let options = MountOptions {
        nfs_index: true,
        ..MountOptions::default()
    };
    let volume = mount(&mem, &options);
    let dir = volume.mkdir(ObjectId::ROOT, "dir", 0o755).expect("mkdir");
    let file = volume.create(ObjectId::ROOT, "f", 0o644).expect("create");
    let handle = FileHandle {
        ino: file.ino(),
        generation: file.meta.generation,
    };
    assert_eq!(volume.resolve_handle(handle).expect("resolve").key, file.key);

    volume
        .rename(ObjectId::ROOT, "f", dir.ino(), "g")
        .expect("rename");
    let moved = volume.resolve_handle(handle).expect("resolve moved");
    assert_eq!(moved.key, CatalogKey::new(dir.ino(), "g").expect("key"));

    let stale = FileHandle {
        generation: vdfs_core::Generation(file.meta.generation.0 + 1000),
        ..handle
    };
    assert!(matches!(
        volume.resolve_handle(stale),
        Err(Fault::NotFound(_))
    ));
    volume.unmount().expect("unmount");

    let volume = mount(&mem, &options);
    let moved = volume.resolve_handle(handle).expect("resolve after remount");
    assert_eq!(moved.ino(), file.ino());
    volume
        .link(&moved.key, ObjectId::ROOT, "second")
        .expect("link");
    volume.unlink(dir.ino(), "g").expect("unlink first name");
    let linked = volume.resolve_handle(handle).expect("resolve through link");
    assert_eq!(linked.key, CatalogKey::new(ObjectId::ROOT, "second").expect("key"));
    volume.unlink(ObjectId::ROOT, "second").expect("unlink last name");
    assert!(matches!(
        volume.resolve_handle(handle),
        Err(Fault::NotFound(_))
    ));

    let plain = mount(&formatted(), &MountOptions::default());
    assert!(matches!(
        plain.resolve_handle(handle),
        Err(Fault::InvalidArgument(_))
    ));
}

#[test]
fn link_onto_a_taken_name_leaves_the_source_alone() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let file = volume.create(ObjectId::ROOT, "a", 0o644).expect("create a");
    volume.create(ObjectId::ROOT, "b", 0o644).expect("create b");
    let before = volume.getattr(&file.key).expect("getattr");

    assert!(matches!(
        volume.link(&file.key, ObjectId::ROOT, "b"),
        Err(Fault::Exists)
    ));

    let a = volume.lookup(ObjectId::ROOT, "a").expect("lookup a");
    assert!(!a.hardlinked);
    assert_eq!(a.meta.links_count, 1);
    assert_eq!(volume.getattr(&a.key).expect("getattr"), before);
    assert_eq!(names(&volume, ObjectId::ROOT), vec!["a", "b"]);
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert_eq!(report.hardlinked_files, 0);
}

#[test]
fn rename_refuses_bad_targets() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let a = volume.mkdir(ObjectId::ROOT, "a", 0o755).expect("mkdir a");
    let b = volume.mkdir(a.ino(), "b", 0o755).expect("mkdir b");
    volume.create(ObjectId::ROOT, "file", 0o644).expect("create");
    let full = volume.mkdir(ObjectId::ROOT, "full", 0o755).expect("mkdir full");
    volume.create(full.ino(), "inside", 0o644).expect("create inside");
    volume.mkdir(ObjectId::ROOT, "empty", 0o755).expect("mkdir empty");

    assert!(matches!(
        volume.rename(ObjectId::ROOT, "a", b.ino(), "loop"),
        Err(Fault::InvalidArgument(_))
    ));
    assert!(matches!(
        volume.rename(ObjectId::ROOT, "a", a.ino(), "self"),
        Err(Fault::InvalidArgument(_))
    ));
    assert!(matches!(
        volume.rename(ObjectId::ROOT, "file", ObjectId::ROOT, "empty"),
        Err(Fault::IsDirectory)
    ));
    assert!(matches!(
        volume.rename(ObjectId::ROOT, "empty", ObjectId::ROOT, "file"),
        Err(Fault::NotDirectory)
    ));
    assert!(matches!(
        volume.rename(ObjectId::ROOT, "a", ObjectId::ROOT, "full"),
        Err(Fault::NotEmpty)
    ));
    assert!(matches!(
        volume.rename(ObjectId::ROOT, "missing", ObjectId::ROOT, "x"),
        Err(Fault::NotFound(_))
    ));
    assert_clean(&volume);

    let folders = volume.statfs().folders;
    volume
        .rename(ObjectId::ROOT, "a", ObjectId::ROOT, "empty")
        .expect("replace empty folder");
    assert_eq!(volume.statfs().folders, folders - 1);
    let moved = volume.lookup(ObjectId::ROOT, "empty").expect("lookup");
    assert_eq!(moved.ino(), a.ino());
    assert_eq!(names(&volume, a.ino()), vec!["b".to_owned()]);
    assert_eq!(
        volume.resolve_path("/empty/b").expect("resolve").ino(),
        b.ino()
    );

    volume
        .rename(ObjectId::ROOT, "empty", full.ino(), "nested")
        .expect("move folder down");
    let root = volume.getattr(&CatalogKey::root()).expect("root");
    let full_attr = volume.getattr(&full.key).expect("full");
    assert_eq!(full_attr.size, 2);
    assert_eq!(full_attr.nlink, 3);
    assert_eq!(root.nlink, 2 + 1);
    assert_clean(&volume);
}

#[test]
fn crossing_folder_renames_never_form_a_cycle() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    for round in 0..20 {
        let left = volume
            .mkdir(ObjectId::ROOT, &format!("left-{round}"), 0o755)
            .expect("mkdir left");
        let right = volume
            .mkdir(ObjectId::ROOT, &format!("right-{round}"), 0o755)
            .expect("mkdir right");
        let start = std::sync::Barrier::new(2);
        let (first, second) = std::thread::scope(|s| {
            let first = s.spawn(|| {
                start.wait();
                volume.rename(ObjectId::ROOT, &format!("left-{round}"), right.ino(), "inner")
            });
            let second = s.spawn(|| {
                start.wait();
                volume.rename(ObjectId::ROOT, &format!("right-{round}"), left.ino(), "inner")
            });
            (
                first.join().expect("first rename thread"),
                second.join().expect("second rename thread"),
            )
        });
        assert!(
            first.is_err() || second.is_err(),
            "round {round}: both folders moved into each other"
        );
        assert!(first.is_ok() || second.is_ok(), "round {round}: both renames failed");
        let refused = if first.is_err() { first } else { second };
        assert!(
            matches!(refused, Err(Fault::InvalidArgument(_) | Fault::NotFound(_))),
            "round {round}: {refused:?}"
        );
    }
    assert_clean(&volume);
    assert_eq!(names(&volume, ObjectId::ROOT).len(), 20);
}

#[test]
fn rename_over_a_file_releases_it() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let src = volume.create(ObjectId::ROOT, "src", 0o644).expect("create src");
    let dst = volume.create(ObjectId::ROOT, "dst", 0o644).expect("create dst");
    volume
        .write_extents(&dst.key, 0, 5 * u64::from(BLOCK_SIZE))
        .expect("write dst");
    volume
        .setxattr(&dst.key, "user.doomed", b"x", SetMode::Upsert)
        .expect("setxattr");
    let used = volume.statfs().inodes_used;

    volume
        .rename(ObjectId::ROOT, "src", ObjectId::ROOT, "dst")
        .expect("rename over file");
    assert_eq!(names(&volume, ObjectId::ROOT), vec!["dst".to_owned()]);
    assert_eq!(
        volume.lookup(ObjectId::ROOT, "dst").expect("lookup").ino(),
        src.ino()
    );
    let stats = volume.statfs();
    assert_eq!(stats.inodes_used, used - 1);
    assert_eq!(stats.files, 1);
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert_eq!(report.xattrs, 0);
    assert_eq!(report.data_blocks, 0);
}

#[test]
fn case_insensitive_volume_folds_names() {
    let options = FormatOptions {
        case_insensitive: true,
        ..small_volume()
    };
    let mem = formatted_with(&options);
    let volume = mount(&mem, &MountOptions::default());
    assert!(volume.is_case_insensitive());
    let file = volume
        .create(ObjectId::ROOT, "Readme.TXT", 0o644)
        .expect("create");

    let found = volume.lookup(ObjectId::ROOT, "README.txt").expect("lookup");
    assert_eq!(found.ino(), file.ino());
    assert_eq!(found.key.name, "Readme.TXT");
    assert!(matches!(
        volume.create(ObjectId::ROOT, "readme.txt", 0o644),
        Err(Fault::Exists)
    ));

    volume
        .rename(ObjectId::ROOT, "readme.txt", ObjectId::ROOT, "README.TXT")
        .expect("respell");
    assert_eq!(names(&volume, ObjectId::ROOT), vec!["README.TXT".to_owned()]);
    assert_eq!(
        volume.lookup(ObjectId::ROOT, "readme.TXT").expect("lookup").ino(),
        file.ino()
    );
    volume.unmount().expect("unmount");

    let volume = mount(&mem, &read_only());
    assert!(volume.statfs().case_insensitive);
    volume.lookup(ObjectId::ROOT, "ReadMe.txt").expect("lookup after remount");
}

#[test]
fn folders_must_be_empty_to_go() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let dir = volume.mkdir(ObjectId::ROOT, "dir", 0o755).expect("mkdir");
    volume.create(dir.ino(), "child", 0o644).expect("create");
    volume.create(ObjectId::ROOT, "plain", 0o644).expect("create");

    assert!(matches!(
        volume.rmdir(ObjectId::ROOT, "dir"),
        Err(Fault::NotEmpty)
    ));
    assert!(matches!(
        volume.rmdir(ObjectId::ROOT, "plain"),
        Err(Fault::NotDirectory)
    ));
    assert!(matches!(
        volume.unlink(ObjectId::ROOT, "dir"),
        Err(Fault::IsDirectory)
    ));
    assert!(matches!(
        volume.create(ObjectId::ROOT, "sub", 0o040_755),
        Err(Fault::InvalidArgument(_))
    ));
    assert!(matches!(
        volume.create(ObjectId::ROOT, &"x".repeat(256), 0o644),
        Err(Fault::NameTooLong)
    ));
    assert!(matches!(
        volume.create(ObjectId(dir.ino().0 + 1000), "orphan", 0o644),
        Err(Fault::NotFound(_))
    ));

    volume.unlink(dir.ino(), "child").expect("unlink");
    volume.rmdir(ObjectId::ROOT, "dir").expect("rmdir");
    let root = volume.getattr(&CatalogKey::root()).expect("root");
    assert_eq!(root.size, 1);
    assert_eq!(root.nlink, 2);
    assert_eq!(volume.statfs().folders, 1);
    assert_clean(&volume);
}

#[test]
fn block_maps_track_holes_and_truncation() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let file = volume.create(ObjectId::ROOT, "sparse", 0o644).expect("create");
    let bs = u64::from(BLOCK_SIZE);

    volume
        .write_extents(&file.key, 4 * bs, 2 * bs)
        .expect("write middle");
    assert_eq!(volume.getattr(&file.key).expect("attr").size, 6 * bs);
    let map = volume.read_map(&file.key, 0, 8 * bs).expect("read_map");
    assert_eq!(map.len(), 3);
    assert_eq!(
        map[0],
        MappedRange {
            iblock: 0,
            physical: None,
            count: 4
        }
    );
    assert_eq!(map[1].iblock, 4);
    assert_eq!(map[1].count, 2);
    let start = map[1].physical.expect("mapped");
    assert_eq!(
        map[2],
        MappedRange {
            iblock: 6,
            physical: None,
            count: 2
        }
    );

    // The block after the first write continues its run.
    let added = volume
        .write_extents(&file.key, 6 * bs, bs)
        .expect("append");
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].first_block, start + 2);
    assert!(volume
        .write_extents(&file.key, 4 * bs, bs)
        .expect("rewrite")
        .is_empty());

    volume.truncate(&file.key, 5 * bs - 1).expect("truncate");
    let attr = volume.getattr(&file.key).expect("attr");
    assert_eq!(attr.size, 5 * bs - 1);
    assert_eq!(attr.blocks, 1);
    let map = volume.read_map(&file.key, 0, 7 * bs).expect("read_map");
    assert_eq!(
        map.iter()
            .filter(|r| r.physical.is_some())
            .map(|r| r.count)
            .sum::<u64>(),
        1
    );

    let attr = volume
        .setattr(
            &file.key,
            &SetAttr {
                size: Some(0),
                mode: Some(0o600),
                uid: Some(1000),
                ..SetAttr::default()
            },
        )
        .expect("setattr");
    assert_eq!(attr.size, 0);
    assert_eq!(attr.blocks, 0);
    assert_eq!(attr.perm, 0o600);
    assert_eq!(attr.uid, 1000);
    assert_eq!(attr.kind, FileType::RegularFile);

    let dir = volume.mkdir(ObjectId::ROOT, "dir", 0o755).expect("mkdir");
    assert!(matches!(
        volume.write_extents(&dir.key, 0, 1),
        Err(Fault::IsDirectory)
    ));
    assert_clean(&volume);
}

#[test]
fn oversized_write_is_no_space_and_changes_nothing() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let file = volume.create(ObjectId::ROOT, "big", 0o644).expect("create");
    let before = volume.statfs();
    let attr_before = volume.getattr(&file.key).expect("attr");

    let too_much = (before.free_blocks + 1) * u64::from(BLOCK_SIZE);
    assert!(matches!(
        volume.write_extents(&file.key, 0, too_much),
        Err(Fault::NoSpace)
    ));
    assert_eq!(volume.statfs().free_blocks, before.free_blocks);
    assert_eq!(volume.getattr(&file.key).expect("attr"), attr_before);
    assert!(!volume.is_read_only());
    assert_clean(&volume);
}

#[test]
fn xattrs_follow_their_object() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let file = volume.create(ObjectId::ROOT, "tagged", 0o644).expect("create");
    volume
        .setxattr(&file.key, "user.b", b"two", SetMode::Create)
        .expect("set b");
    volume
        .setxattr(&file.key, "user.a", b"one", SetMode::Create)
        .expect("set a");
    assert!(matches!(
        volume.setxattr(&file.key, "user.a", b"again", SetMode::Create),
        Err(Fault::Exists)
    ));
    assert!(matches!(
        volume.setxattr(&file.key, "user.c", b"new", SetMode::Replace),
        Err(Fault::NotFound(_))
    ));
    volume
        .setxattr(&file.key, "user.a", b"uno", SetMode::Replace)
        .expect("replace a");

    assert_eq!(
        volume.listxattr(&file.key).expect("list"),
        vec!["user.a".to_owned(), "user.b".to_owned()]
    );
    assert_eq!(volume.getxattr(&file.key, "user.a").expect("get"), b"uno");
    volume.removexattr(&file.key, "user.b").expect("remove");
    assert!(matches!(
        volume.getxattr(&file.key, "user.b"),
        Err(Fault::NotFound(_))
    ));

    volume.unlink(ObjectId::ROOT, "tagged").expect("unlink");
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert_eq!(report.xattrs, 0);
}

#[test]
fn sync_waits_outside_transactions() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    volume.create(ObjectId::ROOT, "a", 0o644).expect("create");
    {
        let _txn = volume.transaction();
        assert!(matches!(volume.sync(), Err(Fault::InvalidArgument(_))));
    }
    let version = volume.committed_version();
    volume.sync().expect("sync");
    assert!(volume.committed_version() > version);
    let synced = volume.committed_version();
    volume.sync().expect("clean sync");
    assert_eq!(volume.committed_version(), synced);
    drop(volume.try_transaction().expect("no commit pending"));
}

#[test]
fn file_backed_image_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("volume.img");
    let options = small_volume();
    {
        let file = FileByteDevice::create(&path, (BLOCKS as u64) * u64::from(BLOCK_SIZE))
            .expect("create image");
        let dev = format_device(file, BLOCK_SIZE).expect("block device");
        VolumeHandle::format(dev, &options).expect("format");
    }
    {
        let file = FileByteDevice::open(&path).expect("open image");
        let volume =
            VolumeHandle::mount(open_device(file).expect("superblock"), &MountOptions::default())
                .expect("mount");
        let dir = volume.mkdir(ObjectId::ROOT, "etc", 0o755).expect("mkdir");
        volume.create(dir.ino(), "hosts", 0o644).expect("create");
        volume.unmount().expect("unmount");
    }
    let file = FileByteDevice::open(&path).expect("reopen image");
    let volume =
        VolumeHandle::mount(open_device(file).expect("superblock"), &read_only()).expect("mount");
    let hosts = volume.resolve_path("/etc/hosts").expect("resolve");
    assert!(!hosts.is_dir());
    assert_clean(&volume);
}
