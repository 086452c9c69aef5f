//! On-flash layout and the page checksum.
//!
//! A config page is `[magic u8][item count u16][checksum u16][items…]` with
//! all multi-byte fields little-endian. Each item is
//! `[id u16][byte count u16][data…]`, packed back to back. Unused trailing
//! bytes of a page are never zeroed; they hold whatever the serializer's
//! buffer held and are folded into the checksum like any other byte.

use strum::FromRepr;

pub(crate) const OFFSET_PAGE_MAGIC: usize = 0;
pub(crate) const OFFSET_PAGE_COUNT: usize = OFFSET_PAGE_MAGIC + size_of::<u8>();
pub(crate) const OFFSET_PAGE_CHECKSUM: usize = OFFSET_PAGE_COUNT + size_of::<u16>();
pub(crate) const OFFSET_PAGE_ITEMS: usize = OFFSET_PAGE_CHECKSUM + size_of::<u16>();

pub(crate) const OFFSET_ITEM_ID: usize = 0;
pub(crate) const OFFSET_ITEM_COUNT: usize = OFFSET_ITEM_ID + size_of::<u16>();
pub(crate) const OFFSET_ITEM_DATA: usize = OFFSET_ITEM_COUNT + size_of::<u16>();

/// Marks unused fields and the first unassignable item id.
pub(crate) const UNUSED_VALUE: u16 = 0xFFFF;

/// First byte of every page. Anything not listed reads as corrupt.
#[derive(FromRepr, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum Magic {
    Config = 0x00,
    Erased = 0xFF,
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

const CHECKSUM_XOR: u8 = 0x5A;
const PRIME_COUNT: usize = 16;
const PRIME_MASK: usize = PRIME_COUNT - 1;
const PRIME_TABLE: [u16; PRIME_COUNT] = [
    0x049D, 0x0C07, 0x1591, 0x1ACF, 0x1D4B, 0x202D, 0x2507, 0x2B4B, 0x34A5, 0x38C5, 0x3D3F,
    0x4445, 0x4D0F, 0x538F, 0x5FB3, 0x6BBF,
];

/// 16-bit checksum over a whole page, skipping the two checksum-slot bytes.
///
/// The XOR mask keeps the all-0xFF and all-0x00 pages from summing to a
/// trivial value; the prime multiply spreads a single flipped bit across the
/// full 16-bit result. The table index advances only for bytes actually
/// folded in, so the byte after the slot multiplies `PRIME_TABLE[3]`. Stored
/// pages depend on this exact sequence.
pub(crate) fn page_checksum(page: &[u8]) -> u16 {
    let mut sum = 0u16;
    let mut prime = 0usize;
    for &byte in &page[..OFFSET_PAGE_CHECKSUM] {
        sum = sum.wrapping_add(((byte ^ CHECKSUM_XOR) as u16).wrapping_mul(PRIME_TABLE[prime]));
        prime = (prime + 1) & PRIME_MASK;
    }
    for &byte in &page[OFFSET_PAGE_ITEMS..] {
        sum = sum.wrapping_add(((byte ^ CHECKSUM_XOR) as u16).wrapping_mul(PRIME_TABLE[prime]));
        prime = (prime + 1) & PRIME_MASK;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 256;

    #[test]
    fn golden_vectors() {
        assert_eq!(page_checksum(&[0x00; PAGE]), 0x956C);
        assert_eq!(page_checksum(&[0xFF; PAGE]), 0xE746);

        let mut ascending = [0u8; PAGE];
        for (i, byte) in ascending.iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(page_checksum(&ascending), 0xBCEF);
    }

    #[test]
    fn slot_bytes_are_ignored() {
        let mut page = [0x00; PAGE];
        page[OFFSET_PAGE_CHECKSUM] = 0xAB;
        page[OFFSET_PAGE_CHECKSUM + 1] = 0xCD;
        assert_eq!(page_checksum(&page), page_checksum(&[0x00; PAGE]));
    }

    #[test]
    fn every_non_slot_bit_flip_changes_the_sum() {
        let mut page = [0u8; PAGE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        let reference = page_checksum(&page);
        for index in 0..PAGE {
            if index == OFFSET_PAGE_CHECKSUM || index == OFFSET_PAGE_CHECKSUM + 1 {
                continue;
            }
            for bit in 0..8 {
                let mut flipped = page;
                flipped[index] ^= 1 << bit;
                assert_ne!(
                    page_checksum(&flipped),
                    reference,
                    "flip at byte {index} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn field_round_trip() {
        let mut buf = [0u8; 8];
        put_u16(&mut buf, 3, 0xBEEF);
        assert_eq!(get_u16(&buf, 3), 0xBEEF);
        assert_eq!(buf[3], 0xEF);
        assert_eq!(buf[4], 0xBE);
    }
}
