//! Bitmap files whose pages are individually signed and translated.
//!
//! The whole file is kept in memory. Every page touched by a mutation is
//! routed through the [`DirtyBlockSink`] first and written back to the
//! block it was assigned by [`PagedBitmap::flush`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::codec::{self, BITMAP_MAGIC_LEN};
use vdfs_types::{BlockNumber, Version, div_round_up};

pub struct PagedBitmap {
    magic: &'static [u8; 4],
    block_size: usize,
    bits: u64,
    buf: Vec<u8>,
    sink: Arc<dyn DirtyBlockSink>,
    dirty: BTreeMap<u64, BlockNumber>,
}

impl fmt::Debug for PagedBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedBitmap")
            .field("magic", &String::from_utf8_lossy(self.magic))
            .field("bits", &self.bits)
            .field("pages", &self.pages())
            .field("dirty", &self.dirty.len())
            .finish_non_exhaustive()
    }
}

fn magic_name(magic: &[u8]) -> String {
    String::from_utf8_lossy(magic).into_owned()
}

impl PagedBitmap {
    /// Pages needed to hold `bits` bits.
    #[must_use]
    pub fn pages_for(bits: u64, block_size: usize) -> u64 {
        div_round_up(bits, codec::bits_per_block(block_size, BITMAP_MAGIC_LEN))
    }

    /// All-clear bitmap. Nothing is dirty until a bit changes.
    pub fn new(
        magic: &'static [u8; 4],
        block_size: usize,
        bits: u64,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let pages = Self::pages_for(bits, block_size);
        let len = usize::try_from(pages)
            .ok()
            .and_then(|p| p.checked_mul(block_size))
            .ok_or_else(|| Fault::Format(format!("{} bitmap too large", magic_name(magic))))?;
        Ok(Self {
            magic,
            block_size,
            bits,
            buf: vec![0_u8; len],
            sink,
            dirty: BTreeMap::new(),
        })
    }

    /// Read every page through the sink's current mapping.
    pub fn load(
        magic: &'static [u8; 4],
        block_size: usize,
        bits: u64,
        dev: &dyn BlockDevice,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let mut bitmap = Self::new(magic, block_size, bits, sink)?;
        for (page, chunk) in bitmap.buf.chunks_mut(block_size).enumerate() {
            let page = page as u64;
            let Some(block) = bitmap.sink.locate(page)? else {
                return Err(Fault::inconsistent(format!(
                    "{} bitmap page {page} is unmapped",
                    magic_name(magic)
                )));
            };
            let raw = dev.read_block(block)?;
            if let Err(err) = codec::check(raw.as_slice(), Some(magic), BITMAP_MAGIC_LEN) {
                error!(
                    bitmap = %magic_name(magic),
                    page,
                    block = block.0,
                    error = %err,
                    "bitmap_page_corrupt"
                );
                return Err(Fault::corrupt(
                    block.0,
                    format!("{} bitmap page {page}: {err}", magic_name(magic)),
                ));
            }
            chunk.copy_from_slice(raw.as_slice());
        }
        trace!(bitmap = %magic_name(magic), bits, "bitmap_load");
        Ok(bitmap)
    }

    #[must_use]
    pub fn bits(&self) -> u64 {
        self.bits
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        (self.buf.len() / self.block_size) as u64
    }

    fn bits_per_page(&self) -> u64 {
        codec::bits_per_block(self.block_size, BITMAP_MAGIC_LEN)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    #[must_use]
    pub fn test(&self, bit: u64) -> bool {
        codec::test_bit(&self.buf, bit, self.block_size, BITMAP_MAGIC_LEN)
    }

    /// Next bit at or after `start` equal to `want_set`, within the
    /// logical size.
    #[must_use]
    pub fn find_next(&self, start: u64, want_set: bool) -> Option<u64> {
        codec::find_next_bit(
            &self.buf,
            start,
            self.block_size,
            BITMAP_MAGIC_LEN,
            want_set,
        )
        .filter(|bit| *bit < self.bits)
    }

    /// Number of set bits in `[start, end)`.
    #[must_use]
    pub fn count_set(&self, start: u64, end: u64) -> u64 {
        let mut count = 0;
        let mut bit = start;
        while let Some(set) = self.find_next(bit, true) {
            if set >= end {
                break;
            }
            count += 1;
            bit = set + 1;
        }
        count
    }

    fn mark_dirty(&mut self, page: u64) -> Result<()> {
        if self.dirty.contains_key(&page) {
            return Ok(());
        }
        let block = self.sink.on_dirty(page)?;
        self.dirty.insert(page, block);
        Ok(())
    }

    /// Relocate every page, so the next flush rewrites the whole file.
    pub fn touch_all(&mut self) -> Result<()> {
        for page in 0..self.pages() {
            self.mark_dirty(page)?;
        }
        Ok(())
    }

    pub fn set(&mut self, bit: u64, count: u64) -> Result<()> {
        self.change(bit, count, true)
    }

    pub fn clear(&mut self, bit: u64, count: u64) -> Result<()> {
        self.change(bit, count, false)
    }

    fn change(&mut self, bit: u64, count: u64, set: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = bit
            .checked_add(count)
            .filter(|end| *end <= self.bits)
            .ok_or_else(|| {
                Fault::inconsistent(format!(
                    "{} bitmap range {bit}+{count} beyond {} bits",
                    magic_name(self.magic),
                    self.bits
                ))
            })?;
        if let Some(bad) = (bit..end).find(|b| self.test(*b) == set) {
            return Err(Fault::inconsistent(format!(
                "{} bitmap bit {bad} already {}",
                magic_name(self.magic),
                if set { "set" } else { "clear" }
            )));
        }
        let per_page = self.bits_per_page();
        for page in bit / per_page..=(end - 1) / per_page {
            self.mark_dirty(page)?;
        }
        if set {
            codec::set_bits(&mut self.buf, bit, count, BITMAP_MAGIC_LEN, self.block_size)
        } else {
            codec::clear_bits(&mut self.buf, bit, count, BITMAP_MAGIC_LEN, self.block_size)
        }
    }

    /// Set the bits that pad the last page past the logical size, so they
    /// never look free.
    pub fn set_padding(&mut self) -> Result<()> {
        let capacity = self.pages() * self.bits_per_page();
        if (self.bits..capacity).all(|b| self.test(b)) {
            return Ok(());
        }
        self.mark_dirty(self.pages() - 1)?;
        for bit in self.bits..capacity {
            if !self.test(bit) {
                codec::set_bits(&mut self.buf, bit, 1, BITMAP_MAGIC_LEN, self.block_size)?;
            }
        }
        Ok(())
    }

    /// Sign and write every dirty page to its assigned block.
    pub fn flush(&mut self, dev: &dyn BlockDevice, version: Version) -> Result<usize> {
        for (page, block) in &self.dirty {
            let start = usize::try_from(*page)
                .map_err(|_| Fault::inconsistent("bitmap page index overflow"))?
                * self.block_size;
            let chunk = &mut self.buf[start..start + self.block_size];
            codec::sign(chunk, self.magic, version).map_err(|e| {
                Fault::inconsistent(format!("{} bitmap sign: {e}", magic_name(self.magic)))
            })?;
            dev.write_block(*block, chunk)?;
        }
        let written = self.dirty.len();
        self.dirty.clear();
        trace!(bitmap = %magic_name(self.magic), pages = written, "bitmap_flush");
        Ok(written)
    }
}
