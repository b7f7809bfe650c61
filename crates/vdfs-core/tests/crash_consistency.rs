#![forbid(unsafe_code)]

//! Power loss at every write of a sync: the remounted volume must show
//! either the generation before the sync or the one after it, never a mix.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use vdfs_core::{
    BlockDevice, Fault, FormatOptions, MemoryByteDevice, MountOptions, ObjectId, Result, SetMode,
    Subsystem, VolumeHandle, format_device, open_device,
};
use vdfs_block::BlockBuf;
use vdfs_types::BlockNumber;

const BLOCK_SIZE: u32 = 1024;
const BLOCKS: usize = 4096;
const UNLIMITED: u64 = u64::MAX;

/// Forwards writes until its budget runs out, then drops them while still
/// reporting success, like a device that lost power mid-sync.
struct CrashDevice {
    inner: Arc<dyn BlockDevice>,
    budget: AtomicU64,
    attempted: AtomicU64,
}

impl CrashDevice {
    fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self {
            inner,
            budget: AtomicU64::new(UNLIMITED),
            attempted: AtomicU64::new(0),
        }
    }

    fn arm(&self, budget: u64) {
        self.attempted.store(0, Ordering::SeqCst);
        self.budget.store(budget, Ordering::SeqCst);
    }

    fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::SeqCst)
    }

    fn admit(&self) -> bool {
        self.attempted.fetch_add(1, Ordering::SeqCst);
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                left => Some(left - 1),
            })
            .is_ok()
    }
}

impl BlockDevice for CrashDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if self.admit() {
            self.inner.write_block(block, data)
        } else {
            Ok(())
        }
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_bytes(offset, buf)
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.admit() {
            self.inner.write_bytes(offset, buf)
        } else {
            Ok(())
        }
    }
}

/// Fails every block write once its budget runs out. Superblock byte
/// writes still go through.
struct FailingDevice {
    inner: Arc<dyn BlockDevice>,
    budget: AtomicU64,
    block_writes: AtomicU64,
}

impl FailingDevice {
    fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self {
            inner,
            budget: AtomicU64::new(UNLIMITED),
            block_writes: AtomicU64::new(0),
        }
    }

    fn arm(&self, budget: u64) {
        self.block_writes.store(0, Ordering::SeqCst);
        self.budget.store(budget, Ordering::SeqCst);
    }

    fn block_writes(&self) -> u64 {
        self.block_writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for FailingDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let done = self.block_writes.fetch_add(1, Ordering::SeqCst);
        let budget = self.budget.load(Ordering::SeqCst);
        if budget != UNLIMITED && done >= budget {
            return Err(Fault::Io(std::io::Error::other(format!(
                "write of block {} failed",
                block.0
            ))));
        }
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_bytes(offset, buf)
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.write_bytes(offset, buf)
    }
}

fn small_volume() -> FormatOptions {
    FormatOptions {
        block_size: BLOCK_SIZE,
        erase_block_size: 32 * 1024,
        catalog_nodes: 128,
        extents_nodes: 32,
        hardlink_nodes: 16,
        xattr_nodes: 32,
        ext_table_slots: 4,
        ..FormatOptions::default()
    }
}

/// A formatted image holding a folder and a file.
fn base_image() -> Vec<u8> {
    let mem = MemoryByteDevice::new(BLOCKS * BLOCK_SIZE as usize);
    let dev = format_device(mem.clone(), BLOCK_SIZE).expect("block device");
    VolumeHandle::format(dev, &small_volume()).expect("format");
    let dev = open_device(mem.clone()).expect("superblock");
    let volume = VolumeHandle::mount(dev, &MountOptions::default()).expect("mount");
    let docs = volume.mkdir(ObjectId::ROOT, "docs", 0o755).expect("mkdir");
    let keep = volume.create(docs.ino(), "keep", 0o644).expect("create");
    volume
        .write_extents(&keep.key, 0, 4 * u64::from(BLOCK_SIZE))
        .expect("write");
    volume.unmount().expect("unmount");
    mem.snapshot()
}

/// Mutations committed by the `step`-th sync after mount.
fn workload(volume: &VolumeHandle, step: usize) {
    let docs = volume.lookup(ObjectId::ROOT, "docs").expect("docs");
    match step {
        0 => {
            let a = volume.create(docs.ino(), "a", 0o644).expect("create a");
            volume
                .write_extents(&a.key, 0, 6 * u64::from(BLOCK_SIZE))
                .expect("write a");
            volume
                .setxattr(&a.key, "user.tag", b"first", SetMode::Upsert)
                .expect("setxattr");
            volume.mkdir(docs.ino(), "sub", 0o755).expect("mkdir sub");
            volume.create(ObjectId::ROOT, "b", 0o600).expect("create b");
        }
        1 => {
            volume
                .rename(docs.ino(), "a", ObjectId::ROOT, "a2")
                .expect("rename");
            volume.unlink(ObjectId::ROOT, "b").expect("unlink");
            let keep = volume.lookup(docs.ino(), "keep").expect("keep");
            volume
                .link(&keep.key, ObjectId::ROOT, "keep-link")
                .expect("link");
            volume
                .truncate(&keep.key, u64::from(BLOCK_SIZE))
                .expect("truncate");
        }
        _ => unreachable!("workload has two steps"),
    }
}

/// Replay the workload on a copy of `base`, mounting through a
/// [`CrashDevice`] armed with `budget` writes for the sync of step `armed`.
/// Returns the resulting image and the writes that sync attempted.
fn replay(base: &[u8], armed: usize, budget: u64) -> (MemoryByteDevice, u64) {
    let mem = MemoryByteDevice::from_vec(base.to_vec());
    let crash = Arc::new(CrashDevice::new(open_device(mem.clone()).expect("superblock")));
    let dev: Arc<dyn BlockDevice> = Arc::clone(&crash) as Arc<dyn BlockDevice>;
    let volume = VolumeHandle::mount(dev, &MountOptions::default()).expect("mount");
    for step in 0..=armed {
        workload(&volume, step);
        if step == armed {
            crash.arm(budget);
        }
        volume.sync().expect("sync");
    }
    drop(volume);
    (mem, crash.attempted())
}

#[derive(Debug, PartialEq, Eq)]
struct Observed {
    tables: Vec<Vec<u64>>,
    tree: Vec<(String, bool)>,
}

fn walk(volume: &VolumeHandle, dir: ObjectId, prefix: &str, out: &mut Vec<(String, bool)>) {
    let mut after: Option<String> = None;
    loop {
        let page = volume.readdir(dir, after.as_deref(), 8).expect("readdir");
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.name.clone());
        for entry in page {
            let path = format!("{prefix}/{}", entry.name);
            let is_dir = volume.lookup(dir, &entry.name).expect("lookup").is_dir();
            if is_dir {
                walk(volume, entry.ino, &path, out);
            }
            out.push((path, is_dir));
        }
    }
}

/// Mount `mem` read-only, verify it and record what it holds.
fn observe(mem: &MemoryByteDevice) -> Observed {
    let options = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let dev = open_device(mem.clone()).expect("superblock");
    let volume = VolumeHandle::mount(dev, &options).expect("remount after crash");
    let report = volume.check().expect("check");
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    let mut tree = Vec::new();
    walk(&volume, ObjectId::ROOT, "", &mut tree);
    tree.sort();
    Observed {
        tables: Subsystem::ALL
            .iter()
            .map(|s| volume.translation_table(*s))
            .collect(),
        tree,
    }
}

fn assert_old_or_new(armed: usize) {
    let base = base_image();
    let before = if armed == 0 {
        MemoryByteDevice::from_vec(base.clone())
    } else {
        replay(&base, armed - 1, UNLIMITED).0
    };
    let old = observe(&before);
    let (after, writes) = replay(&base, armed, UNLIMITED);
    let new = observe(&after);
    assert_ne!(old.tables, new.tables);
    assert_ne!(old.tree, new.tree);
    assert!(writes > 0);

    let mut switched_at = None;
    for budget in 0..=writes {
        let (image, _) = replay(&base, armed, budget);
        let seen = observe(&image);
        if seen == new {
            switched_at.get_or_insert(budget);
        } else {
            assert_eq!(
                switched_at, None,
                "budget {budget} went back to the old generation"
            );
            assert_eq!(seen, old, "budget {budget} mixes generations");
        }
    }
    assert_ne!(switched_at, Some(0));
    assert!(switched_at.is_some());
}

#[test]
fn first_sync_after_mount_is_all_or_nothing() {
    assert_old_or_new(0);
}

#[test]
fn incremental_sync_is_all_or_nothing() {
    assert_old_or_new(1);
}

fn mount_failing(mem: &MemoryByteDevice) -> (Arc<FailingDevice>, VolumeHandle) {
    let failing = Arc::new(FailingDevice::new(open_device(mem.clone()).expect("superblock")));
    let dev: Arc<dyn BlockDevice> = Arc::clone(&failing) as Arc<dyn BlockDevice>;
    let volume = VolumeHandle::mount(dev, &MountOptions::default()).expect("mount");
    (failing, volume)
}

#[test]
fn failed_sync_stops_writes_and_keeps_the_durable_generation() {
    let base = base_image();
    let old = observe(&MemoryByteDevice::from_vec(base.clone()));

    let writes = {
        let mem = MemoryByteDevice::from_vec(base.clone());
        let (failing, volume) = mount_failing(&mem);
        workload(&volume, 0);
        failing.arm(UNLIMITED);
        volume.sync().expect("sync");
        failing.block_writes()
    };
    assert!(writes > 1);

    // The last budget fails only the final table block.
    for budget in 0..writes {
        let mem = MemoryByteDevice::from_vec(base.clone());
        let (failing, volume) = mount_failing(&mem);
        workload(&volume, 0);
        failing.arm(budget);

        let err = volume.sync().expect_err("block write fails");
        assert!(matches!(err, Fault::Io(_)), "budget {budget}: {err:?}");
        assert!(volume.is_read_only());
        assert!(matches!(
            volume.create(ObjectId::ROOT, "late", 0o644),
            Err(Fault::ReadOnly)
        ));
        assert!(matches!(volume.sync(), Err(Fault::ReadOnly)));
        drop(volume);

        assert_eq!(observe(&mem), old, "budget {budget} lost the durable generation");
    }
}
