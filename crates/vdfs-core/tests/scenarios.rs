#![forbid(unsafe_code)]

use vdfs_core::{
    CatalogKey, Fault, FileType, FormatOptions, MemoryByteDevice, MountOptions, ObjectId,
    VolumeHandle, format_device, open_device,
};

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
        volume_name: "scenarios".to_owned(),
        ..FormatOptions::default()
    }
}

fn formatted() -> MemoryByteDevice {
    let mem = MemoryByteDevice::new(BLOCKS * BLOCK_SIZE as usize);
    let dev = format_device(mem.clone(), BLOCK_SIZE).expect("block device");
    VolumeHandle::format(dev, &small_volume()).expect("format");
    mem
}

fn mount(mem: &MemoryByteDevice, options: &MountOptions) -> VolumeHandle {
    let dev = open_device(mem.clone()).expect("superblock");
    VolumeHandle::mount(dev, options).expect("mount")
}

fn assert_clean(volume: &VolumeHandle) {
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
}

#[test]
fn created_file_is_found_by_name() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let created = volume.create(ObjectId::ROOT, "a", 0o644).expect("create");
    assert!(created.ino() >= ObjectId::FIRST_FILE);

    let found = volume.lookup(ObjectId::ROOT, "a").expect("lookup");
    assert_eq!(found.ino(), created.ino());
    assert_eq!(found.meta.object_id, created.ino());
    assert!(!found.is_dir());
    assert_eq!(
        volume.getattr(&found.key).expect("getattr").kind,
        FileType::RegularFile
    );
    volume.unmount().expect("unmount");

    let volume = mount(&mem, &MountOptions::default());
    let found = volume.lookup(ObjectId::ROOT, "a").expect("lookup after remount");
    assert_eq!(found.ino(), created.ino());
    assert_clean(&volume);
}

#[test]
fn second_create_of_a_name_is_exists() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let first = volume.create(ObjectId::ROOT, "a", 0o600).expect("create");
    let before = volume.getattr(&first.key).expect("getattr");

    assert!(matches!(
        volume.create(ObjectId::ROOT, "a", 0o644),
        Err(Fault::Exists)
    ));
    assert!(matches!(
        volume.mkdir(ObjectId::ROOT, "a", 0o755),
        Err(Fault::Exists)
    ));

    assert_eq!(volume.getattr(&first.key).expect("getattr"), before);
    let root = volume.getattr(&CatalogKey::root()).expect("root attr");
    assert_eq!(root.size, 1);
    assert_eq!(volume.statfs().files, 1);
    assert_clean(&volume);
}

#[test]
fn freed_file_blocks_are_handed_out_again() {
    let mem = formatted();
    let options = MountOptions {
        prealloc_blocks: 0,
        ..MountOptions::default()
    };
    let volume = mount(&mem, &options);
    let file = volume.create(ObjectId::ROOT, "data", 0o644).expect("create");
    let free_before = volume.statfs().free_blocks;

    let bytes = 100 * u64::from(BLOCK_SIZE);
    let first = volume.write_extents(&file.key, 0, bytes).expect("write");
    let mapped: u64 = first.iter().map(|e| e.block_count).sum();
    assert_eq!(mapped, 100);
    assert_eq!(volume.statfs().free_blocks, free_before - 100);

    volume.truncate(&file.key, 0).expect("truncate");
    assert_eq!(volume.statfs().free_blocks, free_before);

    let second = volume.write_extents(&file.key, 0, bytes).expect("rewrite");
    assert_eq!(first, second);
    assert_clean(&volume);
}

#[test]
fn rename_keeps_identity_and_fork() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let file = volume.create(ObjectId::ROOT, "a", 0o644).expect("create");
    volume
        .write_extents(&file.key, 0, 3 * u64::from(BLOCK_SIZE))
        .expect("write");
    let before = volume.lookup(ObjectId::ROOT, "a").expect("lookup");
    let attr_before = volume.getattr(&before.key).expect("getattr");

    volume
        .rename(ObjectId::ROOT, "a", ObjectId::ROOT, "b")
        .expect("rename");

    assert!(matches!(
        volume.lookup(ObjectId::ROOT, "a"),
        Err(Fault::NotFound(_))
    ));
    let after = volume.lookup(ObjectId::ROOT, "b").expect("lookup b");
    assert_eq!(after.ino(), before.ino());
    assert_eq!(after.body, before.body);
    let mut attr_after = volume.getattr(&after.key).expect("getattr");
    assert!(attr_after.ctime >= attr_before.ctime);
    attr_after.ctime = attr_before.ctime;
    assert_eq!(attr_after, attr_before);

    let names: Vec<String> = volume
        .readdir(ObjectId::ROOT, None, 16)
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["b".to_owned()]);
    assert_clean(&volume);
}

#[test]
fn hardlinked_file_lives_until_its_last_name() {
    let mem = formatted();
    let volume = mount(&mem, &MountOptions::default());
    let file = volume.create(ObjectId::ROOT, "a", 0o644).expect("create");
    volume
        .write_extents(&file.key, 0, 2 * u64::from(BLOCK_SIZE))
        .expect("write");
    let inodes_before = volume.statfs().inodes_used;

    let linked = volume
        .link(&file.key, ObjectId::ROOT, "c")
        .expect("link");
    assert_eq!(linked.ino(), file.ino());
    assert!(linked.hardlinked);
    assert_eq!(linked.meta.links_count, 2);

    let a = volume.lookup(ObjectId::ROOT, "a").expect("lookup a");
    let c = volume.lookup(ObjectId::ROOT, "c").expect("lookup c");
    assert_eq!(a.ino(), c.ino());
    assert_eq!(a.body, c.body);
    assert_eq!(volume.check().expect("check").hardlinked_files, 1);

    volume.unlink(ObjectId::ROOT, "a").expect("unlink a");
    let c = volume.lookup(ObjectId::ROOT, "c").expect("c survives");
    assert_eq!(c.ino(), file.ino());
    assert_eq!(c.meta.links_count, 1);
    assert!(c.hardlinked);
    assert_eq!(volume.statfs().inodes_used, inodes_before);
    assert_eq!(volume.check().expect("check").hardlinked_files, 1);

    let free_before = volume.statfs().free_blocks;
    volume.unlink(ObjectId::ROOT, "c").expect("unlink c");
    assert!(matches!(
        volume.lookup(ObjectId::ROOT, "c"),
        Err(Fault::NotFound(_))
    ));
    let stats = volume.statfs();
    assert_eq!(stats.inodes_used, inodes_before - 1);
    assert!(stats.free_blocks >= free_before + 2);
    assert_eq!(stats.files, 0);
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert_eq!(report.hardlinked_files, 0);
}
