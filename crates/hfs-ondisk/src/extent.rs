#![forbid(unsafe_code)]

use hfs_types::{
    EXTENT_DESCRIPTOR_SIZE, FORK_DATA_SIZE, INLINE_EXTENT_COUNT, ParseError, ensure_slice,
    read_be_u32, read_be_u64,
};
use serde::{Deserialize, Serialize};

/// A run of contiguous allocation blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    #[must_use]
    pub fn new(start_block: u32, block_count: u32) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.block_count == 0
    }

    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            start_block: read_be_u32(bytes, offset)?,
            block_count: read_be_u32(bytes, offset + 4)?,
        })
    }
}

/// Decode a packed array of extent descriptors (an extents-overflow leaf
/// payload). Trailing bytes short of a whole descriptor are rejected.
pub fn parse_extent_record(payload: &[u8]) -> Result<Vec<ExtentDescriptor>, ParseError> {
    if payload.len() % EXTENT_DESCRIPTOR_SIZE != 0 {
        return Err(ParseError::InvalidField {
            field: "extent_record",
            reason: "length is not a multiple of 8",
        });
    }
    (0..payload.len() / EXTENT_DESCRIPTOR_SIZE)
        .map(|i| ExtentDescriptor::parse(payload, i * EXTENT_DESCRIPTOR_SIZE))
        .collect()
}

/// Size and inline extents of one fork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; INLINE_EXTENT_COUNT],
}

impl ForkData {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, FORK_DATA_SIZE)?;
        let mut extents = [ExtentDescriptor::default(); INLINE_EXTENT_COUNT];
        for (i, slot) in extents.iter_mut().enumerate() {
            *slot = ExtentDescriptor::parse(bytes, 16 + i * EXTENT_DESCRIPTOR_SIZE)?;
        }
        Ok(Self {
            logical_size: read_be_u64(bytes, 0)?,
            clump_size: read_be_u32(bytes, 8)?,
            total_blocks: read_be_u32(bytes, 12)?,
            extents,
        })
    }

    /// Blocks covered by the inline slots alone.
    #[must_use]
    pub fn inline_blocks(&self) -> u64 {
        self.extents
            .iter()
            .map(|ext| u64::from(ext.block_count))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_record_parses_packed_descriptors() {
        let mut payload = Vec::new();
        for (start, count) in [(20_u32, 8_u32), (100, 2), (0, 0)] {
            payload.extend_from_slice(&start.to_be_bytes());
            payload.extend_from_slice(&count.to_be_bytes());
        }
        let extents = parse_extent_record(&payload).unwrap();
        assert_eq!(
            extents,
            vec![
                ExtentDescriptor::new(20, 8),
                ExtentDescriptor::new(100, 2),
                ExtentDescriptor::new(0, 0),
            ]
        );
        assert!(extents[2].is_empty());
        assert!(parse_extent_record(&payload[..20]).is_err());
        assert!(parse_extent_record(&[]).unwrap().is_empty());
    }

    #[test]
    fn fork_data_parses_sizes_and_inline_slots() {
        let mut bytes = vec![0_u8; FORK_DATA_SIZE];
        bytes[0..8].copy_from_slice(&40_000_u64.to_be_bytes());
        bytes[8..12].copy_from_slice(&4096_u32.to_be_bytes());
        bytes[12..16].copy_from_slice(&10_u32.to_be_bytes());
        bytes[16..20].copy_from_slice(&0_u32.to_be_bytes());
        bytes[20..24].copy_from_slice(&4_u32.to_be_bytes());
        bytes[24..28].copy_from_slice(&10_u32.to_be_bytes());
        bytes[28..32].copy_from_slice(&6_u32.to_be_bytes());

        let fork = ForkData::parse(&bytes).unwrap();
        assert_eq!(fork.logical_size, 40_000);
        assert_eq!(fork.clump_size, 4096);
        assert_eq!(fork.total_blocks, 10);
        assert_eq!(fork.extents[0], ExtentDescriptor::new(0, 4));
        assert_eq!(fork.extents[1], ExtentDescriptor::new(10, 6));
        assert!(fork.extents[2..].iter().all(|e| e.is_empty()));
        assert_eq!(fork.inline_blocks(), 10);

        assert!(ForkData::parse(&bytes[..79]).is_err());
    }
}
