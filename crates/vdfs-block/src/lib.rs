#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the byte-addressed [`ByteDevice`] used for superblock access,
//! the block-addressed [`BlockDevice`] every tree, bitmap and table goes
//! through, a file-backed device, and an in-memory device for tests and
//! tooling. [`DirtyBlockSink`] is the seam between paged metadata and the
//! component that decides where pages live.

use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use vdfs_error::{Fault, Result};
use vdfs_types::{BlockNumber, SB_REGION_SIZE};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, dev_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| Fault::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| Fault::Format(format!("{op} range overflows u64")))?;
    if end > dev_len {
        return Err(Fault::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `FileExt` is thread-safe and does not require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Fault::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed byte device.
///
/// Clones share the same backing buffer, so a test can keep one handle to
/// inspect or corrupt the image while a mounted volume owns another.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current image contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let start =
            usize::try_from(offset).map_err(|_| Fault::Format("offset overflow".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let start =
            usize::try_from(offset).map_err(|_| Fault::Format("offset overflow".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Tell the device a block range no longer holds live data.
    ///
    /// Devices without TRIM support ignore the hint.
    fn discard(&self, _start: BlockNumber, _count: u64) -> Result<()> {
        Ok(())
    }

    /// Byte-level access to the superblock region.
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Byte-level write to the superblock region.
    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// Placement capability handed to every paged metadata structure.
///
/// Trees and bitmaps address their pages by logical index. Before a page is
/// modified for the first time in a generation the owner calls
/// [`DirtyBlockSink::on_dirty`], which relocates the page and returns the
/// physical block the new contents must be written to. Repeated calls in the
/// same generation return the same block.
pub trait DirtyBlockSink: Send + Sync {
    /// Relocate `page` for the in-progress generation.
    fn on_dirty(&self, page: u64) -> Result<BlockNumber>;

    /// Physical block currently holding `page`, if it was ever written.
    fn locate(&self, page: u64) -> Result<Option<BlockNumber>>;

    /// Make sure `pages` more relocations can succeed before a multi-page
    /// mutation starts.
    fn ensure_capacity(&self, _pages: u64) -> Result<()> {
        Ok(())
    }
}

/// Sink that places page `n` at `base + n` and never relocates.
///
/// Used while a volume is laid out for the first time and by tests.
#[derive(Debug, Clone, Copy)]
pub struct IdentitySink {
    pub base: u64,
    pub pages: u64,
}

impl DirtyBlockSink for IdentitySink {
    fn on_dirty(&self, page: u64) -> Result<BlockNumber> {
        if page >= self.pages {
            return Err(Fault::NoSpace);
        }
        Ok(BlockNumber(self.base + page))
    }

    fn locate(&self, page: u64) -> Result<Option<BlockNumber>> {
        Ok((page < self.pages).then_some(BlockNumber(self.base + page)))
    }
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Fault::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(Fault::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(Fault::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| Fault::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                Fault::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| Fault::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(Fault::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        trace!(block = block.0, "block_write");
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.write_all_at(offset, buf)
    }
}

/// Read both superblock copies (the first 4 KiB of the volume).
pub fn read_superblock_region(dev: &dyn BlockDevice) -> Result<[u8; SB_REGION_SIZE]> {
    let mut buf = [0_u8; SB_REGION_SIZE];
    dev.read_bytes(0, &mut buf)?;
    Ok(buf)
}

/// Read `count` consecutive blocks starting at `start` into one buffer.
pub fn read_blocks(dev: &dyn BlockDevice, start: BlockNumber, count: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for i in 0..count {
        let buf = dev.read_block(BlockNumber(start.0 + i))?;
        out.extend_from_slice(buf.as_slice());
    }
    Ok(out)
}

/// Write a multi-block buffer to consecutive blocks starting at `start`.
pub fn write_blocks(dev: &dyn BlockDevice, start: BlockNumber, data: &[u8]) -> Result<()> {
    let bs = dev.block_size() as usize;
    if data.len() % bs != 0 {
        return Err(Fault::Format(format!(
            "write_blocks length {} is not a multiple of block size {bs}",
            data.len()
        )));
    }
    for (i, chunk) in data.chunks(bs).enumerate() {
        dev.write_block(BlockNumber(start.0 + i as u64), chunk)?;
    }
    Ok(())
}
