#![forbid(unsafe_code)]
//! Shared vocabulary for the HFS+ B-tree engine.
//!
//! Unit-carrying newtypes (node ids, catalog node ids, allocation block
//! sizes), the parse-layer error type, and bounds-checked big-endian byte
//! readers. Everything here is pure: no I/O, no logging.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of the node descriptor at the start of every B-tree node.
pub const NODE_DESCRIPTOR_SIZE: usize = 14;
/// Size of the header record stored as record 0 of the header node.
pub const HEADER_RECORD_SIZE: usize = 106;
/// Size of the user-data record stored as record 1 of the header node.
pub const USER_DATA_RECORD_SIZE: usize = 128;
/// Bytes needed to learn the node size before the first full-page read.
pub const HEADER_PROBE_SIZE: usize = NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE;

pub const MIN_NODE_SIZE: u32 = 512;
pub const MAX_NODE_SIZE: u32 = 32 * 1024;

/// Deepest tree the format allows.
pub const BTREE_MAX_DEPTH: u16 = 8;

/// Extent descriptors carried inline in a fork's metadata.
pub const INLINE_EXTENT_COUNT: usize = 8;
/// On-disk size of one extent descriptor (start block + block count).
pub const EXTENT_DESCRIPTOR_SIZE: usize = 8;
/// On-disk size of a fork data record (sizes + 8 inline extents).
pub const FORK_DATA_SIZE: usize = 80;

/// Header record `keyCompareType` for case-folding name comparison.
pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
/// Header record `keyCompareType` for binary name comparison (HFSX).
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

/// Zero-based index of a node (page) within a B-tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The header node always lives at index 0.
    pub const HEADER: Self = Self(0);

    /// `0` in a link or root field means "no node".
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Catalog node id: the file/folder identifier used as a key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogNodeId(pub u32);

impl CatalogNodeId {
    pub const ROOT_PARENT: Self = Self(1);
    pub const ROOT_FOLDER: Self = Self(2);
    pub const EXTENTS_FILE: Self = Self(3);
    pub const CATALOG_FILE: Self = Self(4);
    pub const BAD_BLOCKS_FILE: Self = Self(5);
    pub const ALLOCATION_FILE: Self = Self(6);
    pub const STARTUP_FILE: Self = Self(7);
    pub const ATTRIBUTES_FILE: Self = Self(8);
}

/// Which of a file's two byte streams an extent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ForkType {
    Data,
    Resource,
}

impl ForkType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Resource => "resource",
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::Resource => 0xFF,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0x00 => Ok(Self::Data),
            0xFF => Ok(Self::Resource),
            _ => Err(ParseError::InvalidField {
                field: "fork_type",
                reason: "must be 0x00 (data) or 0xFF (resource)",
            }),
        }
    }
}

/// Validated allocation block size (power of two, at least 512 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationBlockSize(u32);

impl AllocationBlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || value < 512 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two >= 512",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Allocation block containing `byte_offset`.
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> u64 {
        byte_offset >> self.0.trailing_zeros()
    }

    /// Byte offset of the start of `block`, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: u64) -> Option<u64> {
        block.checked_mul(self.as_u64())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Round a byte count up to the next even boundary.
///
/// Records pad their keys to 2-byte alignment before any trailing field.
#[must_use]
pub fn round_up_even(len: usize) -> usize {
    len + (len & 1)
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CatalogNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ForkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AllocationBlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_readers_respect_bounds() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        assert_eq!(read_be_u16(&data, 0).unwrap(), 0x1234);
        assert_eq!(read_be_u32(&data, 2).unwrap(), 0x5678_9ABC);
        assert_eq!(read_be_u64(&data, 0).unwrap(), 0x1234_5678_9ABC_DEF0);
        assert_eq!(read_u8(&data, 7).unwrap(), 0xF0);

        let err = read_be_u32(&data, 6).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 6,
                actual: 2,
            }
        );
    }

    #[test]
    fn ensure_slice_rejects_overflowing_offsets() {
        let err = ensure_slice(&[0_u8; 4], usize::MAX, 2).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "offset", .. }));
    }

    #[test]
    fn fork_type_round_trips_known_values_only() {
        assert_eq!(ForkType::from_raw(0x00).unwrap(), ForkType::Data);
        assert_eq!(ForkType::from_raw(0xFF).unwrap(), ForkType::Resource);
        assert_eq!(ForkType::Resource.to_raw(), 0xFF);
        assert!(ForkType::from_raw(0x01).is_err());
    }

    #[test]
    fn allocation_block_size_validation() {
        assert!(AllocationBlockSize::new(4096).is_ok());
        assert!(AllocationBlockSize::new(512).is_ok());
        assert!(AllocationBlockSize::new(256).is_err());
        assert!(AllocationBlockSize::new(3000).is_err());

        let bs = AllocationBlockSize::new(4096).unwrap();
        assert_eq!(bs.byte_to_block(8191), 1);
        assert_eq!(bs.byte_to_block(8192), 2);
        assert_eq!(bs.block_to_byte(3), Some(12_288));
        assert_eq!(bs.block_to_byte(u64::MAX), None);
    }

    #[test]
    fn round_up_even_pads_odd_lengths() {
        assert_eq!(round_up_even(0), 0);
        assert_eq!(round_up_even(7), 8);
        assert_eq!(round_up_even(12), 12);
    }

    #[test]
    fn empty_node_links() {
        assert!(NodeId(0).is_none());
        assert!(!NodeId(5).is_none());
        assert_eq!(NodeId::HEADER, NodeId(0));
    }
}
