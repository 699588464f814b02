#![forbid(unsafe_code)]
//! Typed node variants and the per-node search and range-visit steps.
//!
//! A node is decoded once from its kind byte into a closed enum; callers
//! match exhaustively rather than downcasting.

use hfs_error::{HfsError, Result};
use hfs_ondisk::{BTreeKey, Collation, HeaderNode, MapNode, NodeDescriptor, NodeKind, parse_node};
use hfs_types::{NodeId, ParseError, read_be_u32, round_up_even};
use std::cmp::Ordering;
use std::ops::Range;

/// Attach the node id to a parse failure found while traversing.
pub(crate) fn corrupt(node: NodeId) -> impl FnOnce(ParseError) -> HfsError {
    move |err| HfsError::Corruption {
        node: node.0,
        detail: err.to_string(),
    }
}

/// Routing record of an index node: keys `>= key` live under `child`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord<K> {
    pub key: K,
    pub child: NodeId,
}

/// Data record of a leaf node. The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord<K> {
    pub key: K,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IndexNode<K> {
    pub descriptor: NodeDescriptor,
    pub records: Vec<IndexRecord<K>>,
}

#[derive(Debug, Clone)]
pub struct LeafNode<K> {
    pub descriptor: NodeDescriptor,
    pub records: Vec<LeafRecord<K>>,
}

/// A decoded node of any kind.
#[derive(Debug, Clone)]
pub enum Node<K> {
    Header(HeaderNode),
    Index(IndexNode<K>),
    Leaf(LeafNode<K>),
    Map(MapNode),
}

impl<K: BTreeKey> Node<K> {
    /// Decode a raw page read from node `id`.
    pub fn parse(page: &[u8], id: NodeId) -> Result<Self> {
        let (descriptor, ranges) = parse_node(page).map_err(corrupt(id))?;
        match descriptor.kind {
            NodeKind::Header => Ok(Self::Header(HeaderNode::parse(page).map_err(corrupt(id))?)),
            NodeKind::Map => Ok(Self::Map(MapNode::parse(page).map_err(corrupt(id))?)),
            NodeKind::Index => {
                let records = ranges
                    .into_iter()
                    .map(|range| decode_index_record(page, range))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(corrupt(id))?;
                Ok(Self::Index(IndexNode {
                    descriptor,
                    records,
                }))
            }
            NodeKind::Leaf => {
                let records = ranges
                    .into_iter()
                    .map(|range| decode_leaf_record(page, range))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(corrupt(id))?;
                Ok(Self::Leaf(LeafNode {
                    descriptor,
                    records,
                }))
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Header(_) => NodeKind::Header,
            Self::Index(_) => NodeKind::Index,
            Self::Leaf(_) => NodeKind::Leaf,
            Self::Map(_) => NodeKind::Map,
        }
    }
}

/// Decode a key at the start of `range`, returning it with the padded
/// offset just past it (relative to the page).
fn decode_key<K: BTreeKey>(page: &[u8], range: &Range<usize>) -> std::result::Result<(K, usize), ParseError> {
    let record = &page[range.clone()];
    let (key, consumed) = K::decode(record, 0)?;
    let padded = round_up_even(consumed);
    if padded > record.len() {
        return Err(ParseError::InvalidField {
            field: "key_length",
            reason: "key overruns its record",
        });
    }
    Ok((key, range.start + padded))
}

fn decode_index_record<K: BTreeKey>(
    page: &[u8],
    range: Range<usize>,
) -> std::result::Result<IndexRecord<K>, ParseError> {
    let (key, child_at) = decode_key(page, &range)?;
    if child_at + 4 > range.end {
        return Err(ParseError::InvalidField {
            field: "index_record",
            reason: "child pointer overruns record",
        });
    }
    Ok(IndexRecord {
        key,
        child: NodeId(read_be_u32(page, child_at)?),
    })
}

fn decode_leaf_record<K: BTreeKey>(
    page: &[u8],
    range: Range<usize>,
) -> std::result::Result<LeafRecord<K>, ParseError> {
    let (key, payload_at) = decode_key(page, &range)?;
    Ok(LeafRecord {
        key,
        payload: page[payload_at..range.end].to_vec(),
    })
}

impl<K: BTreeKey> IndexNode<K> {
    /// Pick the only child that can hold `target`.
    ///
    /// The child of record `i` covers keys in `[key_i, key_(i+1))`. Returns
    /// `None` as soon as a record key exceeds the target: sorted order rules
    /// out every later subtree.
    #[must_use]
    pub fn route(&self, target: &K, collation: Collation) -> Option<NodeId> {
        let mut next = self
            .records
            .first()
            .map(|rec| rec.key.compare_with(target, collation));
        for (i, record) in self.records.iter().enumerate() {
            let current = next?;
            next = self
                .records
                .get(i + 1)
                .map(|rec| rec.key.compare_with(target, collation));
            if current == Ordering::Greater {
                return None;
            }
            if next.unwrap_or(Ordering::Greater) == Ordering::Greater {
                return Some(record.child);
            }
        }
        None
    }

    /// Range-visit step for an index node.
    ///
    /// `visitor` sees each record key with no payload. A child is entered
    /// (through `descend`) when the following boundary is not "too early";
    /// the scan stops once the current boundary is past the range or a
    /// child reports that the visitor stopped.
    ///
    /// Returns `Ok(false)` if the visitor stopped the scan.
    pub fn visit_range<F, D>(&self, visitor: &mut F, mut descend: D) -> Result<bool>
    where
        F: FnMut(&K, Option<&[u8]>) -> Ordering,
        D: FnMut(NodeId, &mut F) -> Result<bool>,
    {
        let Some(first) = self.records.first() else {
            return Ok(true);
        };
        let mut next = visitor(&first.key, None);
        for (i, record) in self.records.iter().enumerate() {
            let current = next;
            next = match self.records.get(i + 1) {
                Some(following) => visitor(&following.key, None),
                None => Ordering::Greater,
            };
            if current == Ordering::Greater {
                return Ok(false);
            }
            if next != Ordering::Less && !descend(record.child, visitor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<K: BTreeKey> LeafNode<K> {
    /// Exact-match lookup; stops at the first key past `target`.
    #[must_use]
    pub fn find(&self, target: &K, collation: Collation) -> Option<&[u8]> {
        for record in &self.records {
            match target.compare_with(&record.key, collation) {
                Ordering::Equal => return Some(&record.payload),
                Ordering::Less => return None,
                Ordering::Greater => {}
            }
        }
        None
    }

    /// Feed records to `visitor` until it returns `Greater`.
    ///
    /// Returns `false` if the visitor stopped the scan.
    pub fn visit_range<F>(&self, visitor: &mut F) -> bool
    where
        F: FnMut(&K, Option<&[u8]>) -> Ordering,
    {
        for record in &self.records {
            if visitor(&record.key, Some(&record.payload)) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_harness::{NodeBuilder, extent_key_bytes};
    use hfs_ondisk::ExtentKey;
    use hfs_types::{CatalogNodeId, ForkType};

    fn ek(file: u32, block: u32) -> ExtentKey {
        ExtentKey::new(CatalogNodeId(file), ForkType::Data, block)
    }

    fn index_node(entries: &[(u32, u32)]) -> IndexNode<ExtentKey> {
        let mut builder = NodeBuilder::new(512, NodeKind::Index, 2);
        for (file, child) in entries {
            builder.push_index(&extent_key_bytes(*file, 0x00, 0), *child);
        }
        match Node::<ExtentKey>::parse(&builder.finish(), NodeId(1)).unwrap() {
            Node::Index(index) => index,
            other => panic!("expected index node, got {:?}", other.kind()),
        }
    }

    fn leaf_node(files: &[u32]) -> LeafNode<ExtentKey> {
        let mut builder = NodeBuilder::new(512, NodeKind::Leaf, 1);
        for file in files {
            builder.push_leaf(&extent_key_bytes(*file, 0x00, 0), &file.to_be_bytes());
        }
        match Node::<ExtentKey>::parse(&builder.finish(), NodeId(2)).unwrap() {
            Node::Leaf(leaf) => leaf,
            other => panic!("expected leaf node, got {:?}", other.kind()),
        }
    }

    #[test]
    fn index_records_decode_child_after_padded_key() {
        let index = index_node(&[(10, 3), (20, 4)]);
        assert_eq!(index.records.len(), 2);
        assert_eq!(index.records[0].key, ek(10, 0));
        assert_eq!(index.records[0].child, NodeId(3));
        assert_eq!(index.records[1].child, NodeId(4));
    }

    #[test]
    fn route_picks_covering_child() {
        let index = index_node(&[(10, 3), (20, 4), (30, 5)]);
        let c = Collation::CaseFolding;
        assert_eq!(index.route(&ek(10, 0), c), Some(NodeId(3)));
        assert_eq!(index.route(&ek(15, 0), c), Some(NodeId(3)));
        assert_eq!(index.route(&ek(20, 0), c), Some(NodeId(4)));
        assert_eq!(index.route(&ek(29, 7), c), Some(NodeId(4)));
        assert_eq!(index.route(&ek(30, 0), c), Some(NodeId(5)));
        assert_eq!(index.route(&ek(999, 0), c), Some(NodeId(5)));
    }

    #[test]
    fn route_short_circuits_before_first_key() {
        let index = index_node(&[(10, 3), (20, 4), (30, 5)]);
        assert_eq!(index.route(&ek(5, 0), Collation::CaseFolding), None);
    }

    #[test]
    fn route_on_empty_index_finds_nothing() {
        let index = index_node(&[]);
        assert_eq!(index.route(&ek(5, 0), Collation::CaseFolding), None);
    }

    #[test]
    fn leaf_find_matches_exactly_and_stops_early() {
        let leaf = leaf_node(&[10, 20, 30]);
        let c = Collation::CaseFolding;
        for file in [10_u32, 20, 30] {
            assert_eq!(leaf.find(&ek(file, 0), c), Some(&file.to_be_bytes()[..]));
        }
        assert_eq!(leaf.find(&ek(5, 0), c), None);
        assert_eq!(leaf.find(&ek(25, 0), c), None);
        assert_eq!(leaf.find(&ek(35, 0), c), None);
    }

    #[test]
    fn leaf_visit_stops_at_first_greater() {
        let leaf = leaf_node(&[10, 20, 30, 40]);
        let mut seen = Vec::new();
        let completed = leaf.visit_range(&mut |key: &ExtentKey, payload: Option<&[u8]>| {
            if key.file_id.0 > 25 {
                return Ordering::Greater;
            }
            assert!(payload.is_some());
            seen.push(key.file_id.0);
            Ordering::Equal
        });
        assert!(!completed);
        assert_eq!(seen, vec![10, 20]);
    }

    #[test]
    fn index_visit_descends_only_into_candidate_children() {
        let index = index_node(&[(10, 3), (20, 4), (30, 5), (40, 6)]);
        // Range [22, 31]: child 4 covers [20, 30), child 5 covers [30, 40).
        let mut visitor = |key: &ExtentKey, _: Option<&[u8]>| {
            let file = key.file_id.0;
            if file < 22 {
                Ordering::Less
            } else if file > 31 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        };
        let mut entered = Vec::new();
        index
            .visit_range(&mut visitor, |child, _| {
                entered.push(child.0);
                Ok(true)
            })
            .unwrap();
        assert_eq!(entered, vec![4, 5]);
    }

    #[test]
    fn index_visit_with_match_all_enters_every_child() {
        let index = index_node(&[(10, 3), (20, 4), (30, 5)]);
        let mut visitor = |_: &ExtentKey, _: Option<&[u8]>| Ordering::Equal;
        let mut entered = Vec::new();
        index
            .visit_range(&mut visitor, |child, _| {
                entered.push(child.0);
                Ok(true)
            })
            .unwrap();
        assert_eq!(entered, vec![3, 4, 5]);
    }

    #[test]
    fn index_visit_stops_when_child_stops() {
        let index = index_node(&[(10, 3), (20, 4), (30, 5), (40, 6)]);
        let mut offered = Vec::new();
        let mut visitor = |key: &ExtentKey, _: Option<&[u8]>| {
            offered.push(key.file_id.0);
            Ordering::Equal
        };
        let mut entered = Vec::new();
        let completed = index
            .visit_range(&mut visitor, |child, _| {
                entered.push(child.0);
                Ok(child.0 != 4)
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(entered, vec![3, 4]);
        // Boundaries past the stopping child are never offered.
        assert_eq!(offered, vec![10, 20, 30]);
    }

    #[test]
    fn key_overrunning_record_is_corruption() {
        let mut builder = NodeBuilder::new(512, NodeKind::Leaf, 1);
        // Record holds only half of a 12-byte extent key.
        builder.push_raw(&extent_key_bytes(1, 0x00, 0)[..6]);
        let err = Node::<ExtentKey>::parse(&builder.finish(), NodeId(9)).unwrap_err();
        assert!(matches!(err, HfsError::Corruption { node: 9, .. }));
    }

    #[test]
    fn index_record_without_child_pointer_is_corruption() {
        let mut builder = NodeBuilder::new(512, NodeKind::Index, 2);
        builder.push_raw(&extent_key_bytes(1, 0x00, 0));
        let err = Node::<ExtentKey>::parse(&builder.finish(), NodeId(4)).unwrap_err();
        assert!(matches!(err, HfsError::Corruption { node: 4, .. }));
    }
}
