//! Signed metadata blocks and multi-block bitmaps.
//!
//! Every metadata block starts with a magic string followed by an 8-byte
//! version stamp and ends with a CRC-32C over everything between the two.
//!
//! ```text
//! +-------+---------+---------------------------+-------+
//! | magic | version |          payload          | crc32 |
//! +-------+---------+---------------------------+-------+
//! 0       magic.len  magic_len               size-4  size
//! ```
//!
//! Bitmap files are a run of such blocks packed into one buffer; bit `n`
//! lives in the payload of block `n / bits_per_block`.

use vdfs_error::{Fault, Result};
use vdfs_types::{CRC_SIZE, ParseError, VERSION_SIZE, Version, read_le_u32, read_le_u64};

/// Free-space bitmap block magic.
pub const FSM_BITMAP_MAGIC: &[u8; 4] = b"FSMB";
/// Inode-number bitmap block magic.
pub const INODE_BITMAP_MAGIC: &[u8; 4] = b"INOB";
/// Small-area bitmap block magic (tiny/small file area, layout only).
pub const SMALL_AREA_BITMAP_MAGIC: &[u8; 4] = b"SMLB";
/// Header length of every bitmap block: magic plus version.
pub const BITMAP_MAGIC_LEN: usize = 4 + VERSION_SIZE;

fn crc_range(buf: &[u8], magic_len: usize) -> Option<(usize, usize)> {
    let end = buf.len().checked_sub(CRC_SIZE)?;
    (magic_len <= end).then_some((magic_len, end))
}

/// Stamp `magic` and `version` into the head of `buf` and the CRC into its
/// tail. The CRC covers `buf[magic.len() + 8 .. len - 4]`.
pub fn sign(buf: &mut [u8], magic: &[u8], version: Version) -> std::result::Result<(), ParseError> {
    let magic_len = magic.len() + VERSION_SIZE;
    let Some((start, end)) = crc_range(buf, magic_len) else {
        return Err(ParseError::InsufficientData {
            needed: magic_len + CRC_SIZE,
            offset: 0,
            actual: buf.len(),
        });
    };
    buf[..magic.len()].copy_from_slice(magic);
    buf[magic.len()..magic_len].copy_from_slice(&version.to_raw().to_le_bytes());
    let crc = crc32c::crc32c(&buf[start..end]);
    buf[end..].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Check the CRC of a signed block and, when `magic` is given, its magic
/// prefix. `magic_len` is the full header length (magic plus version).
#[must_use]
pub fn validate(buf: &[u8], magic: Option<&[u8]>, magic_len: usize) -> bool {
    check(buf, magic, magic_len).is_ok()
}

/// Like [`validate`], but says what was wrong.
pub fn check(
    buf: &[u8],
    magic: Option<&[u8]>,
    magic_len: usize,
) -> std::result::Result<(), ParseError> {
    let Some((start, end)) = crc_range(buf, magic_len) else {
        return Err(ParseError::InsufficientData {
            needed: magic_len + CRC_SIZE,
            offset: 0,
            actual: buf.len(),
        });
    };
    if let Some(magic) = magic {
        if magic.len() > magic_len || buf[..magic.len()] != *magic {
            return Err(ParseError::InvalidMagic {
                expected: magic.to_vec(),
                actual: buf[..magic.len().min(magic_len)].to_vec(),
            });
        }
    }
    let stored = read_le_u32(buf, end)?;
    let computed = crc32c::crc32c(&buf[start..end]);
    if stored != computed {
        return Err(ParseError::BadChecksum { stored, computed });
    }
    Ok(())
}

/// Version stamp of a signed block whose magic is `magic_len - 8` bytes.
pub fn stamped_version(buf: &[u8], magic_len: usize) -> std::result::Result<Version, ParseError> {
    let offset = magic_len
        .checked_sub(VERSION_SIZE)
        .ok_or(ParseError::InvalidField {
            field: "magic_len",
            reason: "shorter than version stamp",
        })?;
    read_le_u64(buf, offset).map(Version::from_raw)
}

/// Number of bitmap bits carried by one signed block.
#[must_use]
pub fn bits_per_block(block_size: usize, magic_len: usize) -> u64 {
    (block_size.saturating_sub(magic_len + CRC_SIZE) as u64) * 8
}

fn bit_location(bit: u64, block_size: usize, magic_len: usize) -> Option<(usize, u8)> {
    let per_block = bits_per_block(block_size, magic_len);
    if per_block == 0 {
        return None;
    }
    let block = usize::try_from(bit / per_block).ok()?;
    let in_block = bit % per_block;
    let byte = block
        .checked_mul(block_size)?
        .checked_add(magic_len)?
        .checked_add(usize::try_from(in_block / 8).ok()?)?;
    #[expect(clippy::cast_possible_truncation)]
    Some((byte, (in_block % 8) as u8))
}

fn total_bits(buf: &[u8], block_size: usize, magic_len: usize) -> u64 {
    if block_size == 0 {
        return 0;
    }
    (buf.len() / block_size) as u64 * bits_per_block(block_size, magic_len)
}

/// Read one bit. Out-of-range bits read as clear.
#[must_use]
pub fn test_bit(buf: &[u8], bit: u64, block_size: usize, magic_len: usize) -> bool {
    bit_location(bit, block_size, magic_len)
        .and_then(|(byte, shift)| buf.get(byte).map(|b| (b >> shift) & 1 == 1))
        .unwrap_or(false)
}

fn change_bits(
    buf: &mut [u8],
    bit_offset: u64,
    count: u64,
    magic_len: usize,
    block_size: usize,
    set: bool,
) -> Result<()> {
    let end = bit_offset
        .checked_add(count)
        .ok_or_else(|| Fault::inconsistent("bit range overflows u64"))?;
    if end > total_bits(buf, block_size, magic_len) {
        return Err(Fault::inconsistent(format!(
            "bit range {bit_offset}+{count} beyond bitmap of {} bits",
            total_bits(buf, block_size, magic_len)
        )));
    }
    // Verify the whole range first so a failed call leaves `buf` untouched.
    for bit in bit_offset..end {
        if test_bit(buf, bit, block_size, magic_len) == set {
            return Err(Fault::inconsistent(format!(
                "bitmap bit {bit} already {}",
                if set { "set" } else { "clear" }
            )));
        }
    }
    for bit in bit_offset..end {
        if let Some((byte, shift)) = bit_location(bit, block_size, magic_len) {
            if set {
                buf[byte] |= 1 << shift;
            } else {
                buf[byte] &= !(1 << shift);
            }
        }
    }
    Ok(())
}

/// Set `count` bits starting at `bit_offset`.
///
/// Every bit in the range must currently be clear; otherwise nothing is
/// changed and `Fault::Inconsistent` is returned.
pub fn set_bits(
    buf: &mut [u8],
    bit_offset: u64,
    count: u64,
    magic_len: usize,
    block_size: usize,
) -> Result<()> {
    change_bits(buf, bit_offset, count, magic_len, block_size, true)
}

/// Clear `count` bits starting at `bit_offset`.
///
/// Every bit in the range must currently be set; otherwise nothing is
/// changed and `Fault::Inconsistent` is returned.
pub fn clear_bits(
    buf: &mut [u8],
    bit_offset: u64,
    count: u64,
    magic_len: usize,
    block_size: usize,
) -> Result<()> {
    change_bits(buf, bit_offset, count, magic_len, block_size, false)
}

/// First bit at or after `start` whose value is `want_set`, skipping the
/// header and CRC of every embedded block.
#[must_use]
pub fn find_next_bit(
    buf: &[u8],
    start: u64,
    block_size: usize,
    magic_len: usize,
    want_set: bool,
) -> Option<u64> {
    let limit = total_bits(buf, block_size, magic_len);
    let skip_byte = if want_set { 0x00 } else { 0xFF };
    let mut bit = start;
    while bit < limit {
        let (byte, shift) = bit_location(bit, block_size, magic_len)?;
        let value = buf[byte];
        if shift == 0 && value == skip_byte {
            bit += 8;
            continue;
        }
        if ((value >> shift) & 1 == 1) == want_set {
            return Some(bit);
        }
        bit += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BS: usize = 64;

    fn bitmap(blocks: usize) -> Vec<u8> {
        vec![0_u8; BS * blocks]
    }

    #[test]
    fn sign_then_validate() {
        let mut buf = vec![0xAB_u8; 128];
        sign(&mut buf, FSM_BITMAP_MAGIC, Version::new(2, 9)).expect("sign");
        assert!(validate(&buf, Some(FSM_BITMAP_MAGIC), BITMAP_MAGIC_LEN));
        assert!(validate(&buf, None, BITMAP_MAGIC_LEN));
        assert!(!validate(&buf, Some(INODE_BITMAP_MAGIC), BITMAP_MAGIC_LEN));
        assert_eq!(
            stamped_version(&buf, BITMAP_MAGIC_LEN),
            Ok(Version::new(2, 9))
        );
    }

    #[test]
    fn sign_rejects_tiny_buffer() {
        let mut buf = [0_u8; 10];
        assert!(sign(&mut buf, FSM_BITMAP_MAGIC, Version::default()).is_err());
        assert!(!validate(&buf, None, BITMAP_MAGIC_LEN));
    }

    #[test]
    fn bit_layout_skips_header_and_crc() {
        let per_block = bits_per_block(BS, BITMAP_MAGIC_LEN);
        assert_eq!(per_block, ((BS - BITMAP_MAGIC_LEN - CRC_SIZE) * 8) as u64);

        let mut buf = bitmap(2);
        set_bits(&mut buf, per_block - 1, 2, BITMAP_MAGIC_LEN, BS).expect("set");
        // Last payload byte of block 0 and first payload byte of block 1.
        assert_eq!(buf[BS - CRC_SIZE - 1], 0x80);
        assert_eq!(buf[BS + BITMAP_MAGIC_LEN], 0x01);
        assert!(buf[..BITMAP_MAGIC_LEN].iter().all(|b| *b == 0));
        assert!(buf[BS - CRC_SIZE..BS].iter().all(|b| *b == 0));
    }

    #[test]
    fn double_set_is_inconsistent_and_atomic() {
        let mut buf = bitmap(1);
        set_bits(&mut buf, 5, 1, BITMAP_MAGIC_LEN, BS).expect("set");
        let before = buf.clone();
        let err = set_bits(&mut buf, 3, 4, BITMAP_MAGIC_LEN, BS).unwrap_err();
        assert!(matches!(err, Fault::Inconsistent { .. }));
        assert_eq!(buf, before);
    }

    #[test]
    fn clear_of_clear_bit_is_inconsistent() {
        let mut buf = bitmap(1);
        let err = clear_bits(&mut buf, 0, 1, BITMAP_MAGIC_LEN, BS).unwrap_err();
        assert!(matches!(err, Fault::Inconsistent { .. }));
    }

    #[test]
    fn range_beyond_bitmap_is_inconsistent() {
        let mut buf = bitmap(1);
        let per_block = bits_per_block(BS, BITMAP_MAGIC_LEN);
        assert!(set_bits(&mut buf, per_block, 1, BITMAP_MAGIC_LEN, BS).is_err());
    }

    #[test]
    fn find_next_bit_both_polarities() {
        let mut buf = bitmap(2);
        let per_block = bits_per_block(BS, BITMAP_MAGIC_LEN);
        assert_eq!(find_next_bit(&buf, 0, BS, BITMAP_MAGIC_LEN, true), None);
        assert_eq!(find_next_bit(&buf, 7, BS, BITMAP_MAGIC_LEN, false), Some(7));

        set_bits(&mut buf, 0, per_block + 3, BITMAP_MAGIC_LEN, BS).expect("set");
        assert_eq!(
            find_next_bit(&buf, 0, BS, BITMAP_MAGIC_LEN, false),
            Some(per_block + 3)
        );
        assert_eq!(
            find_next_bit(&buf, 10, BS, BITMAP_MAGIC_LEN, true),
            Some(10)
        );
        set_bits(&mut buf, per_block + 3, per_block - 3, BITMAP_MAGIC_LEN, BS).expect("fill");
        assert_eq!(find_next_bit(&buf, 0, BS, BITMAP_MAGIC_LEN, false), None);
    }

    proptest! {
        #[test]
        fn any_single_bit_flip_breaks_validation(
            payload in proptest::collection::vec(any::<u8>(), 48..200),
            flip in any::<prop::sample::Index>(),
            mount in any::<u32>(),
            sync in any::<u32>(),
        ) {
            let mut buf = payload;
            sign(&mut buf, INODE_BITMAP_MAGIC, Version::new(mount, sync)).unwrap();
            prop_assert!(validate(&buf, Some(INODE_BITMAP_MAGIC), BITMAP_MAGIC_LEN));

            // Only the CRC-covered payload and the CRC itself are protected.
            let protected = buf.len() - BITMAP_MAGIC_LEN;
            let bit = flip.index(protected * 8);
            let byte = BITMAP_MAGIC_LEN + bit / 8;
            buf[byte] ^= 1 << (bit % 8);
            prop_assert!(!validate(&buf, Some(INODE_BITMAP_MAGIC), BITMAP_MAGIC_LEN));
        }

        #[test]
        fn set_then_clear_restores_buffer(
            start in 0_u64..300,
            count in 1_u64..100,
        ) {
            let mut buf = bitmap(8);
            let before = buf.clone();
            set_bits(&mut buf, start, count, BITMAP_MAGIC_LEN, BS).unwrap();
            for bit in start..start + count {
                prop_assert!(test_bit(&buf, bit, BS, BITMAP_MAGIC_LEN));
            }
            prop_assert_eq!(find_next_bit(&buf, 0, BS, BITMAP_MAGIC_LEN, true), Some(start));
            clear_bits(&mut buf, start, count, BITMAP_MAGIC_LEN, BS).unwrap();
            prop_assert_eq!(buf, before);
        }
    }
}
