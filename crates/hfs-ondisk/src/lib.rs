#![forbid(unsafe_code)]
//! On-disk format parsing for HFS+ B-tree files.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! node descriptors, record offset tables, header and map nodes, the three
//! key families (catalog, extents-overflow, attributes) with their
//! collation, and extent/fork descriptors.

pub mod extent;
pub mod keys;
pub mod node;
pub mod unicode;

pub use extent::{ExtentDescriptor, ForkData, parse_extent_record};
pub use keys::{AttributeKey, BTreeKey, CatalogKey, ExtentKey};
pub use node::{
    ATTR_BAD_CLOSE, ATTR_BIG_KEYS, ATTR_VARIABLE_INDEX_KEYS, HeaderNode, HeaderRecord, MapNode,
    NodeDescriptor, NodeKind, parse_node, parse_record_offsets, record_ranges,
};
pub use unicode::{Collation, HfsName, binary_compare, fast_unicode_compare, fold_code_unit};
