#![forbid(unsafe_code)]
//! Read-only B-tree engine for HFS+ style catalog, extents-overflow and
//! attributes trees.
//!
//! A tree is opened over any [`ByteDevice`](hfs_block::ByteDevice). Pages
//! are re-read on every access; wrap the device in
//! [`hfs_block::PageCache`] if repeated lookups matter.

pub mod node;
pub mod store;
pub mod tree;

use hfs_ondisk::{AttributeKey, CatalogKey, ExtentKey};

pub use node::{IndexNode, IndexRecord, LeafNode, LeafRecord, Node};
pub use store::NodeStore;
pub use tree::{BTree, NodeUsage, TreeOptions};

pub type CatalogTree = BTree<CatalogKey>;
pub type ExtentsTree = BTree<ExtentKey>;
pub type AttributesTree = BTree<AttributeKey>;
