#![forbid(unsafe_code)]
//! Name collation for catalog and attribute keys.
//!
//! Case-folding trees sort names with a fixed per-code-unit folding table,
//! not a locale collation. Names are compared as UTF-16 code units after
//! folding; units that fold to zero are ignorable and skipped, and `0x0000`
//! itself folds to `0xFFFF` so an embedded NUL sorts after everything else.
//!
//! The folding table has the classic two-level layout: 256 high-byte slots
//! holding either 0 (no mapping for that row) or the index of a 256-entry
//! subtable. Precomposed letters that carry a canonical decomposition (é,
//! Ä, ...) are deliberately left unfolded, because names are stored
//! decomposed.

use hfs_types::{KEY_COMPARE_BINARY, ParseError, ensure_slice, read_be_u16};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// How names inside keys are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collation {
    /// Case-insensitive ordering through the folding table.
    #[default]
    CaseFolding,
    /// Plain code-unit ordering (case-sensitive HFSX volumes).
    Binary,
}

impl Collation {
    /// Select the collation named by a header record's `keyCompareType`.
    #[must_use]
    pub fn from_key_compare_type(raw: u8) -> Self {
        if raw == KEY_COMPARE_BINARY {
            Self::Binary
        } else {
            Self::CaseFolding
        }
    }

    #[must_use]
    pub fn compare(self, a: &[u16], b: &[u16]) -> Ordering {
        match self {
            Self::CaseFolding => fast_unicode_compare(a, b),
            Self::Binary => binary_compare(a, b),
        }
    }
}

const SUBTABLE_ROWS: [u16; 10] = [0x00, 0x01, 0x03, 0x04, 0x05, 0x10, 0x20, 0x21, 0xFE, 0xFF];
const TABLE_LEN: usize = 256 * (SUBTABLE_ROWS.len() + 1);

static LOWER_CASE_TABLE: [u16; TABLE_LEN] = build_lower_case_table();

const fn set(table: &mut [u16; TABLE_LEN], code: u16, folded: u16) {
    let row = table[(code >> 8) as usize] as usize;
    table[row + (code & 0xFF) as usize] = folded;
}

const fn offset_range(table: &mut [u16; TABLE_LEN], first: u16, last: u16, delta: u16) {
    let mut code = first;
    while code <= last {
        set(table, code, code + delta);
        code += 1;
    }
}

/// Map each even code in `first..=last` to the following odd code.
const fn pair_range(table: &mut [u16; TABLE_LEN], first: u16, last: u16) {
    let mut code = first;
    while code <= last {
        set(table, code, code + 1);
        code += 2;
    }
}

const fn ignore_range(table: &mut [u16; TABLE_LEN], first: u16, last: u16) {
    let mut code = first;
    while code <= last {
        set(table, code, 0);
        code += 1;
    }
}

#[allow(clippy::too_many_lines)]
const fn build_lower_case_table() -> [u16; TABLE_LEN] {
    let mut table = [0_u16; TABLE_LEN];

    // Row index and identity subtables.
    let mut slot = 0;
    while slot < SUBTABLE_ROWS.len() {
        let high = SUBTABLE_ROWS[slot];
        let base = (slot + 1) * 256;
        table[high as usize] = base as u16;
        let mut low = 0;
        while low < 256 {
            table[base + low] = (high << 8) | low as u16;
            low += 1;
        }
        slot += 1;
    }

    // Basic Latin and Latin-1.
    set(&mut table, 0x0000, 0xFFFF);
    offset_range(&mut table, 0x0041, 0x005A, 0x20);
    set(&mut table, 0x00C6, 0x00E6);
    set(&mut table, 0x00D0, 0x00F0);
    set(&mut table, 0x00D8, 0x00F8);
    set(&mut table, 0x00DE, 0x00FE);

    // Latin Extended-A/B, letters without canonical decompositions.
    set(&mut table, 0x0110, 0x0111);
    set(&mut table, 0x0126, 0x0127);
    set(&mut table, 0x0132, 0x0133);
    set(&mut table, 0x013F, 0x0140);
    set(&mut table, 0x0141, 0x0142);
    set(&mut table, 0x014A, 0x014B);
    set(&mut table, 0x0152, 0x0153);
    set(&mut table, 0x0166, 0x0167);
    set(&mut table, 0x0181, 0x0253);
    set(&mut table, 0x0182, 0x0183);
    set(&mut table, 0x0184, 0x0185);
    set(&mut table, 0x0186, 0x0254);
    set(&mut table, 0x0187, 0x0188);
    set(&mut table, 0x0189, 0x0256);
    set(&mut table, 0x018A, 0x0257);
    set(&mut table, 0x018B, 0x018C);
    set(&mut table, 0x018E, 0x01DD);
    set(&mut table, 0x018F, 0x0259);
    set(&mut table, 0x0190, 0x025B);
    set(&mut table, 0x0191, 0x0192);
    set(&mut table, 0x0193, 0x0260);
    set(&mut table, 0x0194, 0x0263);
    set(&mut table, 0x0196, 0x0269);
    set(&mut table, 0x0197, 0x0268);
    set(&mut table, 0x0198, 0x0199);
    set(&mut table, 0x019C, 0x026F);
    set(&mut table, 0x019D, 0x0272);
    set(&mut table, 0x019F, 0x0275);
    set(&mut table, 0x01A2, 0x01A3);
    set(&mut table, 0x01A4, 0x01A5);
    set(&mut table, 0x01A7, 0x01A8);
    set(&mut table, 0x01A9, 0x0283);
    set(&mut table, 0x01AC, 0x01AD);
    set(&mut table, 0x01AE, 0x0288);
    set(&mut table, 0x01B1, 0x028A);
    set(&mut table, 0x01B2, 0x028B);
    set(&mut table, 0x01B3, 0x01B4);
    set(&mut table, 0x01B5, 0x01B6);
    set(&mut table, 0x01B7, 0x0292);
    set(&mut table, 0x01B8, 0x01B9);
    set(&mut table, 0x01BC, 0x01BD);
    set(&mut table, 0x01C4, 0x01C6);
    set(&mut table, 0x01C5, 0x01C6);
    set(&mut table, 0x01C7, 0x01C9);
    set(&mut table, 0x01C8, 0x01C9);
    set(&mut table, 0x01CA, 0x01CC);
    set(&mut table, 0x01CB, 0x01CC);
    set(&mut table, 0x01E4, 0x01E5);
    set(&mut table, 0x01F1, 0x01F3);
    set(&mut table, 0x01F2, 0x01F3);

    // Greek and Coptic.
    offset_range(&mut table, 0x0391, 0x03A1, 0x20);
    offset_range(&mut table, 0x03A3, 0x03A9, 0x20);
    pair_range(&mut table, 0x03E2, 0x03EE);

    // Cyrillic.
    set(&mut table, 0x0402, 0x0452);
    offset_range(&mut table, 0x0404, 0x0406, 0x50);
    offset_range(&mut table, 0x0408, 0x040B, 0x50);
    set(&mut table, 0x040F, 0x045F);
    offset_range(&mut table, 0x0410, 0x0418, 0x20);
    offset_range(&mut table, 0x041A, 0x042F, 0x20);
    pair_range(&mut table, 0x0460, 0x0474);
    pair_range(&mut table, 0x0478, 0x0480);
    pair_range(&mut table, 0x0490, 0x04BE);
    set(&mut table, 0x04C3, 0x04C4);
    set(&mut table, 0x04C7, 0x04C8);
    set(&mut table, 0x04CB, 0x04CC);

    // Armenian, Georgian.
    offset_range(&mut table, 0x0531, 0x0556, 0x30);
    offset_range(&mut table, 0x10A0, 0x10C5, 0x30);

    // Zero-width joiners and directional formatting marks are ignorable.
    ignore_range(&mut table, 0x200C, 0x200F);
    ignore_range(&mut table, 0x202A, 0x202E);
    ignore_range(&mut table, 0x206A, 0x206F);

    // Roman numerals.
    offset_range(&mut table, 0x2160, 0x216F, 0x10);

    // Byte order mark.
    set(&mut table, 0xFEFF, 0x0000);

    // Fullwidth Latin capitals.
    offset_range(&mut table, 0xFF21, 0xFF3A, 0x20);

    table
}

/// Fold one UTF-16 code unit. Returns 0 for ignorable units.
#[must_use]
pub fn fold_code_unit(unit: u16) -> u16 {
    let row = LOWER_CASE_TABLE[usize::from(unit >> 8)];
    if row == 0 {
        unit
    } else {
        LOWER_CASE_TABLE[usize::from(row) + usize::from(unit & 0xFF)]
    }
}

/// Next non-ignorable folded unit, or 0 once the name is exhausted.
fn next_folded(units: &mut std::slice::Iter<'_, u16>) -> u16 {
    for &unit in units.by_ref() {
        let folded = fold_code_unit(unit);
        if folded != 0 {
            return folded;
        }
    }
    0
}

/// Case-folding comparison of two UTF-16 names.
#[must_use]
pub fn fast_unicode_compare(a: &[u16], b: &[u16]) -> Ordering {
    let mut left = a.iter();
    let mut right = b.iter();
    loop {
        let c1 = next_folded(&mut left);
        let c2 = next_folded(&mut right);
        if c1 != c2 {
            return c1.cmp(&c2);
        }
        if c1 == 0 {
            return Ordering::Equal;
        }
    }
}

/// Code-unit-wise comparison; a proper prefix sorts first.
#[must_use]
pub fn binary_compare(a: &[u16], b: &[u16]) -> Ordering {
    a.cmp(b)
}

/// A length-prefixed UTF-16 name as stored inside keys (at most 255 units).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HfsName {
    units: Vec<u16>,
}

impl HfsName {
    pub const MAX_UNITS: usize = 255;

    #[must_use]
    pub fn from_units(units: Vec<u16>) -> Self {
        Self { units }
    }

    #[must_use]
    pub fn units(&self) -> &[u16] {
        &self.units
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Decode `length:u16` followed by `length` big-endian code units.
    ///
    /// Returns the name and the number of bytes consumed.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let len = usize::from(read_be_u16(bytes, offset)?);
        if len > Self::MAX_UNITS {
            return Err(ParseError::InvalidField {
                field: "name_length",
                reason: "exceeds 255 code units",
            });
        }
        let raw = ensure_slice(bytes, offset + 2, len * 2)?;
        let units = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok((Self { units }, 2 + len * 2))
    }
}

impl From<&str> for HfsName {
    fn from(value: &str) -> Self {
        Self {
            units: value.encode_utf16().collect(),
        }
    }
}

impl fmt::Display for HfsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf16_lossy(&self.units))
    }
}
