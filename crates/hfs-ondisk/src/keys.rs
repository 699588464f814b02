#![forbid(unsafe_code)]
//! Keys of the catalog, extents-overflow and attributes trees.
//!
//! Every key starts with a 16-bit length that excludes the length field
//! itself. Decoding reports `key_length + 2` bytes consumed, unpadded;
//! callers round up to even before reading a trailing fixed-size field.

use crate::unicode::{Collation, HfsName};
use hfs_types::{
    CatalogNodeId, ForkType, ParseError, ensure_slice, read_be_u16, read_be_u32, read_u8,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Key stored in a B-tree node.
///
/// Implementations define a strict total order that matches the order in
/// which records were written to disk; search depends on nothing else.
pub trait BTreeKey: Clone + fmt::Debug + Send + Sync + Sized {
    /// Short name used in diagnostics.
    const KIND: &'static str;

    /// Decode a key at `offset`, returning it with the unpadded number of
    /// bytes consumed (`key_length + 2`).
    fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError>;

    /// Order two keys; `collation` applies to embedded names only.
    fn compare_with(&self, other: &Self, collation: Collation) -> Ordering;
}

/// Read the key length prefix and check the whole key lies within `bytes`.
fn key_body(bytes: &[u8], offset: usize, min_len: u16) -> Result<usize, ParseError> {
    let key_len = read_be_u16(bytes, offset)?;
    if key_len < min_len {
        return Err(ParseError::InvalidField {
            field: "key_length",
            reason: "shorter than the fixed key fields",
        });
    }
    let consumed = usize::from(key_len) + 2;
    ensure_slice(bytes, offset, consumed)?;
    Ok(consumed)
}

/// Catalog key: parent folder id, then node name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: HfsName,
}

impl CatalogKey {
    const FIXED_LEN: u16 = 6;

    #[must_use]
    pub fn new(parent_id: CatalogNodeId, name: impl Into<HfsName>) -> Self {
        Self {
            parent_id,
            name: name.into(),
        }
    }
}

impl BTreeKey for CatalogKey {
    const KIND: &'static str = "catalog";

    fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let consumed = key_body(bytes, offset, Self::FIXED_LEN)?;
        let parent_id = CatalogNodeId(read_be_u32(bytes, offset + 2)?);
        let (name, name_len) = HfsName::parse(bytes, offset + 6)?;
        if 4 + name_len > consumed - 2 {
            return Err(ParseError::InvalidField {
                field: "key_length",
                reason: "catalog name overruns key",
            });
        }
        Ok((Self { parent_id, name }, consumed))
    }

    fn compare_with(&self, other: &Self, collation: Collation) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| collation.compare(self.name.units(), other.name.units()))
    }
}

/// Extents-overflow key: file id, fork, first logical block of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentKey {
    pub file_id: CatalogNodeId,
    pub fork_type: ForkType,
    pub start_block: u32,
}

impl ExtentKey {
    const FIXED_LEN: u16 = 10;

    #[must_use]
    pub fn new(file_id: CatalogNodeId, fork_type: ForkType, start_block: u32) -> Self {
        Self {
            file_id,
            fork_type,
            start_block,
        }
    }
}

impl BTreeKey for ExtentKey {
    const KIND: &'static str = "extents";

    fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let consumed = key_body(bytes, offset, Self::FIXED_LEN)?;
        Ok((
            Self {
                fork_type: ForkType::from_raw(read_u8(bytes, offset + 2)?)?,
                file_id: CatalogNodeId(read_be_u32(bytes, offset + 4)?),
                start_block: read_be_u32(bytes, offset + 8)?,
            },
            consumed,
        ))
    }

    fn compare_with(&self, other: &Self, _collation: Collation) -> Ordering {
        self.cmp(other)
    }
}

impl Ord for ExtentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then_with(|| self.fork_type.to_raw().cmp(&other.fork_type.to_raw()))
            .then_with(|| self.start_block.cmp(&other.start_block))
    }
}

impl PartialOrd for ExtentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Attributes key: file id, attribute name, then the record's first block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeKey {
    pub file_id: CatalogNodeId,
    pub start_block: u32,
    pub name: HfsName,
}

impl AttributeKey {
    const FIXED_LEN: u16 = 12;

    #[must_use]
    pub fn new(file_id: CatalogNodeId, name: impl Into<HfsName>) -> Self {
        Self {
            file_id,
            start_block: 0,
            name: name.into(),
        }
    }
}

impl BTreeKey for AttributeKey {
    const KIND: &'static str = "attributes";

    fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let consumed = key_body(bytes, offset, Self::FIXED_LEN)?;
        let file_id = CatalogNodeId(read_be_u32(bytes, offset + 4)?);
        let start_block = read_be_u32(bytes, offset + 8)?;
        let (name, name_len) = HfsName::parse(bytes, offset + 12)?;
        if 10 + name_len > consumed - 2 {
            return Err(ParseError::InvalidField {
                field: "key_length",
                reason: "attribute name overruns key",
            });
        }
        Ok((
            Self {
                file_id,
                start_block,
                name,
            },
            consumed,
        ))
    }

    fn compare_with(&self, other: &Self, collation: Collation) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then_with(|| collation.compare(self.name.units(), other.name.units()))
            .then_with(|| self.start_block.cmp(&other.start_block))
    }
}

macro_rules! collated_ord {
    ($key:ty) => {
        impl PartialEq for $key {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == Ordering::Equal
            }
        }

        impl Eq for $key {}

        impl Ord for $key {
            fn cmp(&self, other: &Self) -> Ordering {
                self.compare_with(other, Collation::CaseFolding)
            }
        }

        impl PartialOrd for $key {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}

collated_ord!(CatalogKey);
collated_ord!(AttributeKey);

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.parent_id, self.name.to_string())
    }
}

impl fmt::Display for ExtentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.file_id, self.fork_type, self.start_block)
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {:?}, {})",
            self.file_id,
            self.name.to_string(),
            self.start_block
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn catalog_bytes(parent: u32, name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let key_len = 6 + 2 * units.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(key_len as u16).to_be_bytes());
        out.extend_from_slice(&parent.to_be_bytes());
        out.extend_from_slice(&(units.len() as u16).to_be_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_be_bytes());
        }
        out
    }

    fn extent_bytes(file_id: u32, fork: u8, start_block: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&10_u16.to_be_bytes());
        out.push(fork);
        out.push(0);
        out.extend_from_slice(&file_id.to_be_bytes());
        out.extend_from_slice(&start_block.to_be_bytes());
        out
    }

    fn attribute_bytes(file_id: u32, name: &str, start_block: u32) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let key_len = 12 + 2 * units.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(key_len as u16).to_be_bytes());
        out.extend_from_slice(&0_u16.to_be_bytes());
        out.extend_from_slice(&file_id.to_be_bytes());
        out.extend_from_slice(&start_block.to_be_bytes());
        out.extend_from_slice(&(units.len() as u16).to_be_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_be_bytes());
        }
        out
    }

    #[test]
    fn catalog_key_decodes_at_offset() {
        let mut bytes = vec![0xAA, 0xBB, 0xCC];
        bytes.extend(catalog_bytes(2, "Docs"));
        let (key, consumed) = CatalogKey::decode(&bytes, 3).unwrap();
        assert_eq!(key.parent_id, CatalogNodeId(2));
        assert_eq!(key.name.to_string(), "Docs");
        assert_eq!(consumed, 2 + 6 + 8);
    }

    #[test]
    fn catalog_key_with_odd_length_is_not_prepadded() {
        // Thread-record style key with a length field that is odd.
        let mut bytes = catalog_bytes(7, "");
        bytes[0..2].copy_from_slice(&7_u16.to_be_bytes());
        bytes.push(0);
        let (_, consumed) = CatalogKey::decode(&bytes, 0).unwrap();
        assert_eq!(consumed, 9);
        assert_eq!(hfs_types::round_up_even(consumed), 10);
    }

    #[test]
    fn catalog_key_rejects_name_overrunning_length() {
        let mut bytes = catalog_bytes(2, "abcdef");
        bytes[0..2].copy_from_slice(&8_u16.to_be_bytes());
        assert!(matches!(
            CatalogKey::decode(&bytes, 0),
            Err(ParseError::InvalidField {
                field: "key_length",
                ..
            })
        ));
    }

    #[test]
    fn truncated_key_is_insufficient_data() {
        let bytes = catalog_bytes(2, "abc");
        assert!(matches!(
            CatalogKey::decode(&bytes[..bytes.len() - 1], 0),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn extent_key_round_trips_fields() {
        let bytes = extent_bytes(42, 0xFF, 96);
        let (key, consumed) = ExtentKey::decode(&bytes, 0).unwrap();
        assert_eq!(consumed, 12);
        assert_eq!(key, ExtentKey::new(CatalogNodeId(42), ForkType::Resource, 96));
        assert!(ExtentKey::decode(&extent_bytes(42, 0x01, 0), 0).is_err());
    }

    #[test]
    fn extent_key_order_is_file_fork_block() {
        let a = ExtentKey::new(CatalogNodeId(5), ForkType::Resource, 0);
        let b = ExtentKey::new(CatalogNodeId(6), ForkType::Data, 0);
        let c = ExtentKey::new(CatalogNodeId(6), ForkType::Data, 10);
        let d = ExtentKey::new(CatalogNodeId(6), ForkType::Resource, 0);
        let mut keys = vec![d, c, b, a];
        keys.sort();
        assert_eq!(keys, vec![a, b, c, d]);
    }

    #[test]
    fn catalog_key_orders_parent_then_folded_name() {
        let a = CatalogKey::new(CatalogNodeId(2), "apple");
        let b = CatalogKey::new(CatalogNodeId(2), "Banana");
        let c = CatalogKey::new(CatalogNodeId(2), "cherry");
        let d = CatalogKey::new(CatalogNodeId(3), "Aardvark");
        assert!(a < b && b < c && c < d);
        assert_eq!(
            CatalogKey::new(CatalogNodeId(2), "APPLE"),
            CatalogKey::new(CatalogNodeId(2), "apple")
        );
        assert_eq!(
            b.compare_with(&a, Collation::Binary),
            Ordering::Less,
            "binary order puts uppercase first"
        );
    }

    #[test]
    fn attribute_key_decodes_and_orders() {
        let bytes = attribute_bytes(30, "com.apple.FinderInfo", 0);
        let (key, consumed) = AttributeKey::decode(&bytes, 0).unwrap();
        assert_eq!(key.file_id, CatalogNodeId(30));
        assert_eq!(key.name.to_string(), "com.apple.FinderInfo");
        assert_eq!(consumed, bytes.len());

        let lower = AttributeKey::new(CatalogNodeId(30), "com.apple.finderinfo");
        assert_eq!(key, lower);
        let other = AttributeKey::new(CatalogNodeId(30), "com.apple.quarantine");
        assert!(key < other);
        let next_file = AttributeKey::new(CatalogNodeId(31), "a");
        assert!(other < next_file);
    }

    fn catalog_key_strategy() -> impl Strategy<Value = CatalogKey> {
        (0_u32..4, "[a-dA-D]{0,4}")
            .prop_map(|(parent, name)| CatalogKey::new(CatalogNodeId(parent), name.as_str()))
    }

    fn extent_key_strategy() -> impl Strategy<Value = ExtentKey> {
        (0_u32..4, any::<bool>(), 0_u32..16).prop_map(|(file, resource, block)| {
            let fork = if resource { ForkType::Resource } else { ForkType::Data };
            ExtentKey::new(CatalogNodeId(file), fork, block)
        })
    }

    fn attribute_key_strategy() -> impl Strategy<Value = AttributeKey> {
        (0_u32..4, "[a-dA-D]{0,4}", 0_u32..4).prop_map(|(file, name, block)| AttributeKey {
            start_block: block,
            ..AttributeKey::new(CatalogNodeId(file), name.as_str())
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn catalog_order_is_antisymmetric_and_transitive(
            a in catalog_key_strategy(),
            b in catalog_key_strategy(),
            c in catalog_key_strategy(),
        ) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn catalog_ord_matches_case_folding_collation(
            a in catalog_key_strategy(),
            b in catalog_key_strategy(),
        ) {
            prop_assert_eq!(a.cmp(&b), a.compare_with(&b, Collation::CaseFolding));
            prop_assert_eq!(a == b, a.compare_with(&b, Collation::CaseFolding).is_eq());
        }

        #[test]
        fn attribute_order_is_antisymmetric_and_transitive(
            a in attribute_key_strategy(),
            b in attribute_key_strategy(),
            c in attribute_key_strategy(),
        ) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn attribute_ord_matches_case_folding_collation(
            a in attribute_key_strategy(),
            b in attribute_key_strategy(),
        ) {
            prop_assert_eq!(a.cmp(&b), a.compare_with(&b, Collation::CaseFolding));
            prop_assert_eq!(a == b, a.compare_with(&b, Collation::CaseFolding).is_eq());
        }

        #[test]
        fn attribute_start_block_breaks_name_ties(
            file in 0_u32..4,
            name in "[a-dA-D]{0,4}",
            lo in 0_u32..8,
            hi in 8_u32..16,
        ) {
            let first = AttributeKey {
                start_block: lo,
                ..AttributeKey::new(CatalogNodeId(file), name.to_lowercase().as_str())
            };
            let second = AttributeKey {
                start_block: hi,
                ..AttributeKey::new(CatalogNodeId(file), name.to_uppercase().as_str())
            };
            prop_assert!(first < second);
        }

        #[test]
        fn extent_order_is_antisymmetric_and_transitive(
            a in extent_key_strategy(),
            b in extent_key_strategy(),
            c in extent_key_strategy(),
        ) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }
    }
}
