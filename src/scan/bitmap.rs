//! Run-length extraction over allocation bitmaps
//!
//! ext2/3/4 block bitmaps and the NTFS `$Bitmap` share a layout: one bit
//! per allocation unit, least significant bit first, set when the unit is
//! in use.

use crate::core::extent::Run;

/// Lazy iterator over the maximal clear-bit runs of a bitmap
///
/// Runs come out in ascending order and never overlap. Bit `i` describes
/// allocation unit `first_unit + i`, and each unit spans `sectors_per_unit`
/// sectors.
#[derive(Debug, Clone)]
pub struct BitmapRuns {
    bitmap: Vec<u8>,
    bit_count: u64,
    pos: u64,
    first_unit: u64,
    sectors_per_unit: u64,
}

impl BitmapRuns {
    /// # Panics
    ///
    /// Panics if `bitmap` holds fewer than `bit_count` bits.
    pub fn new(bitmap: Vec<u8>, bit_count: u64, first_unit: u64, sectors_per_unit: u64) -> Self {
        assert!(
            bitmap.len() as u64 * 8 >= bit_count,
            "bitmap shorter than its bit count"
        );
        BitmapRuns {
            bitmap,
            bit_count,
            pos: 0,
            first_unit,
            sectors_per_unit,
        }
    }

    fn is_set(&self, bit: u64) -> bool {
        self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    /// Advance `pos` while bits equal `value`, skipping whole bytes where possible
    fn skip_while(&mut self, value: bool) {
        let full_byte = if value { 0xFF } else { 0x00 };
        while self.pos < self.bit_count {
            if self.pos % 8 == 0
                && self.pos + 8 <= self.bit_count
                && self.bitmap[(self.pos / 8) as usize] == full_byte
            {
                self.pos += 8;
            } else if self.is_set(self.pos) == value {
                self.pos += 1;
            } else {
                break;
            }
        }
    }
}

impl Iterator for BitmapRuns {
    type Item = Run;

    fn next(&mut self) -> Option<Run> {
        self.skip_while(true);
        if self.pos >= self.bit_count {
            return None;
        }

        let start = self.pos;
        self.skip_while(false);

        Some(Run::from_units(
            self.first_unit + start,
            self.pos - start,
            self.sectors_per_unit,
        ))
    }
}

/// Mark `count` bits starting at `start` as in use
pub(crate) fn set_bits(bitmap: &mut [u8], start: u64, count: u64) {
    for bit in start..start + count {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
}
