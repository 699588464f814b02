#![forbid(unsafe_code)]
//! B-tree node layout: descriptor, record offset table, header node.
//!
//! ```text
//! +----------------------+  offset 0
//! | node descriptor (14) |
//! +----------------------+
//! | record 0             |  offset[0]
//! | record 1             |  offset[1]
//! | ...                  |
//! | free space           |  offset[n]
//! +----------------------+
//! | offset[n] ... off[0] |  u16 BE each, read backward from the last 2 bytes
//! +----------------------+  node_size
//! ```
//!
//! Record boundaries come only from the offset table, never from record
//! content.

use hfs_types::{
    HEADER_RECORD_SIZE, MAX_NODE_SIZE, MIN_NODE_SIZE, NODE_DESCRIPTOR_SIZE, NodeId, ParseError,
    USER_DATA_RECORD_SIZE, ensure_slice, read_be_u16, read_be_u32, read_u8,
};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Header attribute: the tree was not closed cleanly.
pub const ATTR_BAD_CLOSE: u32 = 0x0000_0001;
/// Header attribute: key length fields are 16-bit.
pub const ATTR_BIG_KEYS: u32 = 0x0000_0002;
/// Header attribute: index keys are variable length.
pub const ATTR_VARIABLE_INDEX_KEYS: u32 = 0x0000_0004;

/// Node kind byte (signed on disk: leaf is -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0xFF => Ok(Self::Leaf),
            0x00 => Ok(Self::Index),
            0x01 => Ok(Self::Header),
            0x02 => Ok(Self::Map),
            _ => Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "unknown node kind",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Leaf => 0xFF,
            Self::Index => 0x00,
            Self::Header => 0x01,
            Self::Map => 0x02,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Leaf => "leaf",
            Self::Index => "index",
            Self::Header => "header",
            Self::Map => "map",
        }
    }
}

/// Fixed 14-byte prefix of every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub forward_link: NodeId,
    pub backward_link: NodeId,
    pub kind: NodeKind,
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

impl NodeDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, NODE_DESCRIPTOR_SIZE)?;
        Ok(Self {
            forward_link: NodeId(read_be_u32(bytes, 0)?),
            backward_link: NodeId(read_be_u32(bytes, 4)?),
            kind: NodeKind::from_raw(read_u8(bytes, 8)?)?,
            height: read_u8(bytes, 9)?,
            num_records: read_be_u16(bytes, 10)?,
            reserved: read_be_u16(bytes, 12)?,
        })
    }
}

/// Read the `num_records + 1` trailing offsets of a node, in record order.
pub fn parse_record_offsets(page: &[u8], num_records: u16) -> Result<Vec<u16>, ParseError> {
    let count = usize::from(num_records) + 1;
    let table_len = count * 2;
    let table_start = page
        .len()
        .checked_sub(table_len)
        .filter(|start| *start >= NODE_DESCRIPTOR_SIZE)
        .ok_or(ParseError::InvalidField {
            field: "num_records",
            reason: "record offset table does not fit in node",
        })?;

    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(read_be_u16(page, page.len() - 2 * (i + 1))?);
    }

    if usize::from(offsets[0]) < NODE_DESCRIPTOR_SIZE {
        return Err(ParseError::InvalidField {
            field: "record_offset",
            reason: "first record overlaps node descriptor",
        });
    }
    if offsets.windows(2).any(|pair| pair[0] > pair[1]) {
        return Err(ParseError::InvalidField {
            field: "record_offset",
            reason: "record offsets not ascending",
        });
    }
    if usize::from(offsets[count - 1]) > table_start {
        return Err(ParseError::InvalidField {
            field: "record_offset",
            reason: "records overlap offset table",
        });
    }
    Ok(offsets)
}

/// Byte range of every record: `offset[i]..offset[i + 1]`.
pub fn record_ranges(page: &[u8], num_records: u16) -> Result<Vec<Range<usize>>, ParseError> {
    let offsets = parse_record_offsets(page, num_records)?;
    Ok(offsets
        .windows(2)
        .map(|pair| usize::from(pair[0])..usize::from(pair[1]))
        .collect())
}

/// Descriptor plus record ranges of a raw node.
pub fn parse_node(page: &[u8]) -> Result<(NodeDescriptor, Vec<Range<usize>>), ParseError> {
    let descriptor = NodeDescriptor::parse(page)?;
    let ranges = record_ranges(page, descriptor.num_records)?;
    Ok((descriptor, ranges))
}

/// Tree-wide metadata: record 0 of the header node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub tree_depth: u16,
    pub root_node: NodeId,
    pub leaf_records: u32,
    pub first_leaf_node: NodeId,
    pub last_leaf_node: NodeId,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl HeaderRecord {
    /// Parse the fixed header record body.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, HEADER_RECORD_SIZE)?;
        let header = Self {
            tree_depth: read_be_u16(bytes, 0)?,
            root_node: NodeId(read_be_u32(bytes, 2)?),
            leaf_records: read_be_u32(bytes, 6)?,
            first_leaf_node: NodeId(read_be_u32(bytes, 10)?),
            last_leaf_node: NodeId(read_be_u32(bytes, 14)?),
            node_size: read_be_u16(bytes, 18)?,
            max_key_length: read_be_u16(bytes, 20)?,
            total_nodes: read_be_u32(bytes, 22)?,
            free_nodes: read_be_u32(bytes, 26)?,
            clump_size: read_be_u32(bytes, 32)?,
            btree_type: read_u8(bytes, 36)?,
            key_compare_type: read_u8(bytes, 37)?,
            attributes: read_be_u32(bytes, 38)?,
        };
        header.validate()?;
        Ok(header)
    }

    /// Parse the header record out of the first bytes of node 0.
    ///
    /// Needs only [`hfs_types::HEADER_PROBE_SIZE`] bytes, so the node size
    /// can be learned before any full-node read.
    pub fn parse_probe(probe: &[u8]) -> Result<Self, ParseError> {
        let descriptor = NodeDescriptor::parse(probe)?;
        if descriptor.kind != NodeKind::Header {
            return Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "node 0 is not a header node",
            });
        }
        Self::parse(ensure_slice(probe, NODE_DESCRIPTOR_SIZE, HEADER_RECORD_SIZE)?)
    }

    fn validate(&self) -> Result<(), ParseError> {
        let node_size = u32::from(self.node_size);
        if !node_size.is_power_of_two() || !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&node_size) {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be power of two in 512..=32768",
            });
        }
        if self.free_nodes > self.total_nodes {
            return Err(ParseError::InvalidField {
                field: "free_nodes",
                reason: "exceeds total_nodes",
            });
        }
        if self.root_node.is_none() != (self.tree_depth == 0) {
            return Err(ParseError::InvalidField {
                field: "tree_depth",
                reason: "depth and root node disagree about an empty tree",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root_node.is_none()
    }

    #[must_use]
    pub fn has_attribute(&self, mask: u32) -> bool {
        self.attributes & mask != 0
    }
}

/// Parsed node 0: header record, user-data record, map record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNode {
    pub descriptor: NodeDescriptor,
    pub header: HeaderRecord,
    pub user_data: Vec<u8>,
    pub map: Vec<u8>,
}

impl HeaderNode {
    pub fn parse(page: &[u8]) -> Result<Self, ParseError> {
        let (descriptor, ranges) = parse_node(page)?;
        if descriptor.kind != NodeKind::Header {
            return Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "node 0 is not a header node",
            });
        }
        if descriptor.height != 0 {
            return Err(ParseError::InvalidField {
                field: "height",
                reason: "header node must have height 0",
            });
        }
        if ranges.len() < 3 {
            return Err(ParseError::InvalidField {
                field: "num_records",
                reason: "header node needs header, user-data and map records",
            });
        }
        if ranges[0].len() < HEADER_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_RECORD_SIZE,
                offset: ranges[0].start,
                actual: ranges[0].len(),
            });
        }
        if ranges[1].len() != USER_DATA_RECORD_SIZE {
            return Err(ParseError::InvalidField {
                field: "user_data_record",
                reason: "must be 128 bytes",
            });
        }

        let header = HeaderRecord::parse(&page[ranges[0].clone()])?;
        if usize::from(header.node_size) != page.len() {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "header node size differs from page length",
            });
        }
        Ok(Self {
            descriptor,
            header,
            user_data: page[ranges[1].clone()].to_vec(),
            map: page[ranges[2].clone()].to_vec(),
        })
    }
}

/// A map node: one record holding a continuation of the allocation bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapNode {
    pub descriptor: NodeDescriptor,
    pub bitmap: Vec<u8>,
}

impl MapNode {
    pub fn parse(page: &[u8]) -> Result<Self, ParseError> {
        let (descriptor, ranges) = parse_node(page)?;
        if descriptor.kind != NodeKind::Map {
            return Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "expected map node",
            });
        }
        let Some(first) = ranges.first() else {
            return Err(ParseError::InvalidField {
                field: "num_records",
                reason: "map node has no bitmap record",
            });
        };
        Ok(Self {
            descriptor,
            bitmap: page[first.clone()].to_vec(),
        })
    }
}
