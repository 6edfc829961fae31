//! Knitting rows and their bit-packed wire representation

use super::NEEDLE_COUNT;

/// Number of bytes holding one bit per needle
pub const BITMAP_LEN: usize = (NEEDLE_COUNT as usize + 7) / 8;

/// One bit per needle, needle 0 in bit 0 of byte 0
pub type NeedleBitmap = [u8; BITMAP_LEN];

/// One row of needle activation states, as produced by a row source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnitRow {
    needles: Vec<bool>,
}

impl KnitRow {
    /// Create a row of `size` inactive needles
    pub fn new(size: usize) -> Self {
        Self {
            needles: vec![false; size],
        }
    }

    pub fn from_needles(needles: Vec<bool>) -> Self {
        Self { needles }
    }

    /// Set a pixel, ignoring positions outside the row
    pub fn set(&mut self, pixel: usize, active: bool) {
        if let Some(needle) = self.needles.get_mut(pixel) {
            *needle = active;
        }
    }

    pub fn get(&self, pixel: usize) -> bool {
        self.needles.get(pixel).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.needles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn needles(&self) -> &[bool] {
        &self.needles
    }

    /// `X` for active, `.` for inactive needles
    pub fn to_ascii(&self) -> String {
        self.needles
            .iter()
            .map(|active| if *active { 'X' } else { '.' })
            .collect()
    }
}

/// Pack a row into the needle bitmap.
///
/// The carriage reads the row in the opposite direction, so pixel
/// `size-1-i` goes to needle `first_needle + i`. Needles beyond the bed are dropped.
pub fn pack_row(row: &KnitRow, first_needle: u16) -> NeedleBitmap {
    let mut bitmap = [0u8; BITMAP_LEN];
    let size = row.len();
    for i in 0..size {
        if !row.needles[size - 1 - i] {
            continue;
        }
        let needle = first_needle as usize + i;
        if needle >= NEEDLE_COUNT as usize {
            break;
        }
        bitmap[needle >> 3] |= 1 << (needle & 0x07);
    }
    bitmap
}

/// Inverse of [`pack_row`] for a row of `row_size` pixels starting at `first_needle`
pub fn unpack_row(bitmap: &NeedleBitmap, first_needle: u16, row_size: usize) -> KnitRow {
    let mut row = KnitRow::new(row_size);
    for i in 0..row_size {
        let needle = first_needle as usize + i;
        if needle >= NEEDLE_COUNT as usize {
            break;
        }
        if bitmap[needle >> 3] & (1 << (needle & 0x07)) != 0 {
            row.set(row_size - 1 - i, true);
        }
    }
    row
}
