#![forbid(unsafe_code)]
//! Tree façade: bootstrap from the header node, point lookup, range visit,
//! leaf-chain walk and node-map accounting.

use crate::node::{IndexNode, LeafNode, Node};
use crate::store::NodeStore;
use hfs_block::ByteDevice;
use hfs_error::{HfsError, Result};
use hfs_ondisk::{BTreeKey, Collation, HeaderNode, HeaderRecord, NodeDescriptor, NodeKind};
use hfs_types::{BTREE_MAX_DEPTH, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Tunables for an open tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Deepest descent allowed; deeper headers are rejected at open.
    pub max_depth: u16,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_depth: BTREE_MAX_DEPTH,
        }
    }
}

impl TreeOptions {
    fn validate(self) -> Result<Self> {
        if self.max_depth == 0 {
            return Err(HfsError::InvalidArgument(
                "max_depth must be at least 1".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Node allocation as declared by the header versus the node map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUsage {
    pub total_nodes: u32,
    pub free_nodes_declared: u32,
    pub used_nodes_in_map: u32,
}

impl NodeUsage {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total_nodes.saturating_sub(self.free_nodes_declared) == self.used_nodes_in_map
    }
}

/// A read-only B-tree keyed by `K`.
///
/// Only the header record is held; every other page is re-read on each
/// access.
pub struct BTree<K> {
    store: NodeStore,
    header_node: HeaderNode,
    collation: Collation,
    options: TreeOptions,
    _key: PhantomData<fn() -> K>,
}

impl<K: BTreeKey> BTree<K> {
    pub fn open(dev: Arc<dyn ByteDevice>) -> Result<Self> {
        Self::open_with_options(dev, TreeOptions::default())
    }

    /// Probe node 0 for the node size, then parse the full header node.
    pub fn open_with_options(dev: Arc<dyn ByteDevice>, options: TreeOptions) -> Result<Self> {
        let options = options.validate()?;
        let probe = NodeStore::read_probe(&*dev).map_err(open_error("header probe"))?;
        let probed = HeaderRecord::parse_probe(&probe)
            .map_err(|err| HfsError::Format(format!("{} tree header: {err}", K::KIND)))?;

        let store = NodeStore::new(dev, u32::from(probed.node_size))?;
        let page = store
            .read_page(NodeId::HEADER)
            .map_err(open_error("header node"))?;
        let header_node = HeaderNode::parse(&page)
            .map_err(|err| HfsError::Format(format!("{} header node: {err}", K::KIND)))?;
        let header = header_node.header;
        if header.tree_depth > options.max_depth {
            return Err(HfsError::Format(format!(
                "tree depth {} exceeds limit {}",
                header.tree_depth, options.max_depth
            )));
        }
        let collation = Collation::from_key_compare_type(header.key_compare_type);

        debug!(
            kind = K::KIND,
            node_size = header.node_size,
            root = header.root_node.0,
            depth = header.tree_depth,
            leaf_records = header.leaf_records,
            ?collation,
            "opened b-tree"
        );
        Ok(Self {
            store,
            header_node,
            collation,
            options,
            _key: PhantomData,
        })
    }

    #[must_use]
    pub fn header(&self) -> &HeaderRecord {
        &self.header_node.header
    }

    #[must_use]
    pub fn header_node(&self) -> &HeaderNode {
        &self.header_node
    }

    #[must_use]
    pub fn collation(&self) -> Collation {
        self.collation
    }

    #[must_use]
    pub fn node_size(&self) -> u32 {
        self.store.node_size()
    }

    #[must_use]
    pub fn options(&self) -> TreeOptions {
        self.options
    }

    /// Read and decode one node.
    pub fn read_node(&self, id: NodeId) -> Result<Node<K>> {
        if id.0 >= self.header().total_nodes {
            return Err(HfsError::Corruption {
                node: id.0,
                detail: format!("node id beyond total_nodes={}", self.header().total_nodes),
            });
        }
        let page = self.store.read_page(id)?;
        Node::parse(&page, id)
    }

    /// Point lookup from the root. Returns the leaf payload of an exact
    /// match, or `None`.
    pub fn find(&self, target: &K) -> Result<Option<Vec<u8>>> {
        let header = self.header();
        if header.is_empty() {
            return Ok(None);
        }
        let mut id = header.root_node;
        let mut expected_height = None;
        for level in 0..self.options.max_depth {
            trace!(kind = K::KIND, node = id.0, level, "find: visit node");
            match self.read_node(id)? {
                Node::Index(index) => {
                    let child_height = self.check_index(id, &index, expected_height)?;
                    match index.route(target, self.collation) {
                        Some(child) => {
                            id = child;
                            expected_height = Some(child_height);
                        }
                        None => return Ok(None),
                    }
                }
                Node::Leaf(leaf) => {
                    check_height(id, &leaf.descriptor, expected_height)?;
                    return Ok(leaf.find(target, self.collation).map(<[u8]>::to_vec));
                }
                other => return Err(unexpected_kind(id, other.kind())),
            }
        }
        Err(self.too_deep(id))
    }

    /// Visit records in key order, pruning subtrees the visitor places
    /// outside its range.
    ///
    /// The visitor returns `Less` for keys before the range, `Equal`
    /// inside it and `Greater` after it. Index keys are offered with no
    /// payload; leaf records with theirs.
    pub fn visit_range<F>(&self, visitor: &mut F) -> Result<()>
    where
        F: FnMut(&K, Option<&[u8]>) -> Ordering,
    {
        let header = self.header();
        if header.is_empty() {
            return Ok(());
        }
        self.visit_node(header.root_node, None, 0, visitor)?;
        Ok(())
    }

    fn visit_node<F>(
        &self,
        id: NodeId,
        expected_height: Option<u8>,
        level: u16,
        visitor: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&K, Option<&[u8]>) -> Ordering,
    {
        if level >= self.options.max_depth {
            return Err(self.too_deep(id));
        }
        trace!(kind = K::KIND, node = id.0, level, "visit: visit node");
        match self.read_node(id)? {
            Node::Index(index) => {
                let child_height = self.check_index(id, &index, expected_height)?;
                index.visit_range(visitor, |child, visitor| {
                    self.visit_node(child, Some(child_height), level + 1, visitor)
                })
            }
            Node::Leaf(leaf) => {
                check_height(id, &leaf.descriptor, expected_height)?;
                Ok(leaf.visit_range(visitor))
            }
            other => Err(unexpected_kind(id, other.kind())),
        }
    }

    /// Iterate every leaf record through the sibling chain starting at
    /// `first_leaf_node`. Returns the number of records visited.
    pub fn walk_leaves<F>(&self, mut visitor: F) -> Result<usize>
    where
        F: FnMut(&K, &[u8]),
    {
        let header = self.header();
        let mut seen = HashSet::new();
        let mut id = header.first_leaf_node;
        let mut previous = NodeId(0);
        let mut count = 0_usize;
        while !id.is_none() {
            if !seen.insert(id) {
                return Err(HfsError::Corruption {
                    node: id.0,
                    detail: "cycle detected in leaf sibling chain".to_owned(),
                });
            }
            let leaf = match self.read_node(id)? {
                Node::Leaf(leaf) => leaf,
                other => return Err(unexpected_kind(id, other.kind())),
            };
            if leaf.descriptor.backward_link != previous {
                warn!(
                    kind = K::KIND,
                    node = id.0,
                    backward_link = leaf.descriptor.backward_link.0,
                    expected = previous.0,
                    "leaf backward link disagrees with chain"
                );
            }
            count += visit_leaf_records(&leaf, &mut visitor);
            previous = id;
            id = leaf.descriptor.forward_link;
        }
        if previous != header.last_leaf_node {
            warn!(
                kind = K::KIND,
                last = previous.0,
                declared = header.last_leaf_node.0,
                "leaf chain ends away from declared last leaf"
            );
        }
        if u64::try_from(count).ok() != Some(u64::from(header.leaf_records)) {
            warn!(
                kind = K::KIND,
                walked = count,
                declared = header.leaf_records,
                "leaf record count disagrees with header"
            );
        }
        Ok(count)
    }

    /// Count allocated nodes in the header map record and any chained map
    /// nodes, bounded by `total_nodes`.
    pub fn node_usage(&self) -> Result<NodeUsage> {
        let header = self.header();
        let total = header.total_nodes;
        let mut used = 0_u32;
        let mut covered = 0_u32;
        count_map_bits(&self.header_node.map, total, &mut covered, &mut used);

        let mut seen = HashSet::new();
        let mut id = self.header_node.descriptor.forward_link;
        while !id.is_none() && covered < total {
            if !seen.insert(id) {
                return Err(HfsError::Corruption {
                    node: id.0,
                    detail: "cycle detected in map node chain".to_owned(),
                });
            }
            let map = match self.read_node(id)? {
                Node::Map(map) => map,
                other => return Err(unexpected_kind(id, other.kind())),
            };
            count_map_bits(&map.bitmap, total, &mut covered, &mut used);
            id = map.descriptor.forward_link;
        }

        let usage = NodeUsage {
            total_nodes: total,
            free_nodes_declared: header.free_nodes,
            used_nodes_in_map: used,
        };
        if !usage.is_consistent() {
            warn!(
                kind = K::KIND,
                total_nodes = total,
                free_nodes = header.free_nodes,
                used_in_map = used,
                "free node count disagrees with node map"
            );
        }
        Ok(usage)
    }

    /// Validate an index node's height and return the height its children
    /// must carry.
    fn check_index(&self, id: NodeId, index: &IndexNode<K>, expected: Option<u8>) -> Result<u8> {
        check_height(id, &index.descriptor, expected)?;
        index.descriptor.height.checked_sub(1).ok_or_else(|| HfsError::Corruption {
            node: id.0,
            detail: format!("index node at height 0 in {} tree", K::KIND),
        })
    }

    fn too_deep(&self, id: NodeId) -> HfsError {
        HfsError::Corruption {
            node: id.0,
            detail: format!("descent exceeds max_depth={}", self.options.max_depth),
        }
    }
}

fn visit_leaf_records<K, F>(leaf: &LeafNode<K>, visitor: &mut F) -> usize
where
    F: FnMut(&K, &[u8]),
{
    for record in &leaf.records {
        visitor(&record.key, &record.payload);
    }
    leaf.records.len()
}

fn check_height(id: NodeId, descriptor: &NodeDescriptor, expected: Option<u8>) -> Result<()> {
    match expected {
        Some(height) if descriptor.height != height => Err(HfsError::Corruption {
            node: id.0,
            detail: format!("height {} where {height} expected", descriptor.height),
        }),
        _ => Ok(()),
    }
}

fn unexpected_kind(id: NodeId, kind: NodeKind) -> HfsError {
    HfsError::Corruption {
        node: id.0,
        detail: format!("unexpected {} node during traversal", kind.name()),
    }
}

/// Range errors while bootstrapping mean the file is too short to be a
/// tree; report them as format errors.
fn open_error(what: &'static str) -> impl FnOnce(HfsError) -> HfsError {
    move |err| match err {
        HfsError::OutOfRange { .. } => HfsError::Format(format!("{what}: {err}")),
        other => other,
    }
}

/// Add the set bits among the next `bitmap.len() * 8` node slots, never
/// counting past `total`.
fn count_map_bits(bitmap: &[u8], total: u32, covered: &mut u32, used: &mut u32) {
    for byte in bitmap {
        let remaining = total.saturating_sub(*covered);
        if remaining == 0 {
            return;
        }
        let masked = if remaining >= 8 {
            *byte
        } else {
            // Keep only the `remaining` most significant bits.
            *byte & !(0xFF_u8 >> remaining)
        };
        *used += masked.count_ones();
        *covered += remaining.min(8);
    }
}

impl<K> fmt::Debug for BTree<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("store", &self.store)
            .field("header", &self.header_node.header)
            .field("collation", &self.collation)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
