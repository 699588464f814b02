#![forbid(unsafe_code)]
//! Read-only access to HFS+ B-tree files and file forks.
//!
//! Re-exports the engine crates through one stable interface and adds a few
//! conveniences built on range visits. This is the crate downstream
//! consumers (the CLI, catalog decoders) depend on.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

pub use hfs_block::{ByteDevice, CacheConfig, CacheStats, FileByteDevice, MemByteDevice, PageCache};
pub use hfs_btree::{
    AttributesTree, BTree, CatalogTree, ExtentsTree, IndexNode, IndexRecord, LeafNode, LeafRecord,
    Node, NodeStore, NodeUsage, TreeOptions,
};
pub use hfs_error::{HfsError, Result};
pub use hfs_extent::{ForkReader, ResolvedExtent};
pub use hfs_ondisk::{
    AttributeKey, BTreeKey, CatalogKey, Collation, ExtentDescriptor, ExtentKey, ForkData,
    HeaderNode, HeaderRecord, HfsName, MapNode, NodeDescriptor, NodeKind,
};
pub use hfs_types::{AllocationBlockSize, CatalogNodeId, ForkType, NodeId, ParseError};

/// Open a B-tree stored in a plain file, optionally behind a page cache.
pub fn open_tree_file<K: BTreeKey>(
    path: impl AsRef<Path>,
    cache: Option<CacheConfig>,
) -> Result<BTree<K>> {
    let file = FileByteDevice::open(path)?;
    let dev: Arc<dyn ByteDevice> = match cache {
        Some(config) => Arc::new(PageCache::new(file, config)?),
        None => Arc::new(file),
    };
    BTree::open(dev)
}

/// Every catalog record whose key names `parent_id` as its parent, in key
/// order. A folder's own thread record (keyed by the folder id with an
/// empty name) comes first.
pub fn list_folder(
    catalog: &CatalogTree,
    parent_id: CatalogNodeId,
) -> Result<Vec<(CatalogKey, Vec<u8>)>> {
    let mut out = Vec::new();
    catalog.visit_range(&mut |key: &CatalogKey, payload: Option<&[u8]>| {
        let ord = key.parent_id.cmp(&parent_id);
        if ord == Ordering::Equal {
            if let Some(payload) = payload {
                out.push((key.clone(), payload.to_vec()));
            }
        }
        ord
    })?;
    Ok(out)
}

/// Every attribute record of `file_id`, in key order.
pub fn list_attributes(
    attributes: &AttributesTree,
    file_id: CatalogNodeId,
) -> Result<Vec<(AttributeKey, Vec<u8>)>> {
    let mut out = Vec::new();
    attributes.visit_range(&mut |key: &AttributeKey, payload: Option<&[u8]>| {
        let ord = key.file_id.cmp(&file_id);
        if ord == Ordering::Equal {
            if let Some(payload) = payload {
                out.push((key.clone(), payload.to_vec()));
            }
        }
        ord
    })?;
    Ok(out)
}
