#![forbid(unsafe_code)]
//! Builders for synthetic HFS+ B-tree files, shared by the unit and
//! integration tests of the engine crates.

use hfs_ondisk::{ATTR_BIG_KEYS, ATTR_VARIABLE_INDEX_KEYS, NodeKind};
use hfs_types::{
    HEADER_RECORD_SIZE, KEY_COMPARE_CASE_FOLDING, NODE_DESCRIPTOR_SIZE, NodeId,
    USER_DATA_RECORD_SIZE, round_up_even,
};

/// Raw extents-overflow key: `fork_raw` is 0x00 (data) or 0xFF (resource).
#[must_use]
pub fn extent_key_bytes(file_id: u32, fork_raw: u8, start_block: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&10_u16.to_be_bytes());
    out.push(fork_raw);
    out.push(0);
    out.extend_from_slice(&file_id.to_be_bytes());
    out.extend_from_slice(&start_block.to_be_bytes());
    out
}

/// Raw catalog key with a UTF-16BE name.
#[must_use]
pub fn catalog_key_bytes(parent_id: u32, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let key_len = u16::try_from(6 + 2 * units.len()).unwrap_or(u16::MAX);
    let mut out = Vec::new();
    out.extend_from_slice(&key_len.to_be_bytes());
    out.extend_from_slice(&parent_id.to_be_bytes());
    push_name(&mut out, &units);
    out
}

/// Raw attributes key with a UTF-16BE name.
#[must_use]
pub fn attribute_key_bytes(file_id: u32, name: &str, start_block: u32) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let key_len = u16::try_from(12 + 2 * units.len()).unwrap_or(u16::MAX);
    let mut out = Vec::new();
    out.extend_from_slice(&key_len.to_be_bytes());
    out.extend_from_slice(&0_u16.to_be_bytes());
    out.extend_from_slice(&file_id.to_be_bytes());
    out.extend_from_slice(&start_block.to_be_bytes());
    push_name(&mut out, &units);
    out
}

fn push_name(out: &mut Vec<u8>, units: &[u16]) {
    let len = u16::try_from(units.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
}

/// Lays out one node: descriptor, records packed from offset 14, offset
/// table at the tail.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node_size: usize,
    kind: NodeKind,
    height: u8,
    forward: u32,
    backward: u32,
    records: Vec<Vec<u8>>,
}

impl NodeBuilder {
    #[must_use]
    pub fn new(node_size: usize, kind: NodeKind, height: u8) -> Self {
        Self {
            node_size,
            kind,
            height,
            forward: 0,
            backward: 0,
            records: Vec::new(),
        }
    }

    pub fn links(&mut self, forward: u32, backward: u32) -> &mut Self {
        self.forward = forward;
        self.backward = backward;
        self
    }

    pub fn push_raw(&mut self, record: &[u8]) -> &mut Self {
        self.records.push(record.to_vec());
        self
    }

    pub fn push_index(&mut self, key: &[u8], child: u32) -> &mut Self {
        let mut record = padded(key);
        record.extend_from_slice(&child.to_be_bytes());
        self.records.push(record);
        self
    }

    pub fn push_leaf(&mut self, key: &[u8], payload: &[u8]) -> &mut Self {
        let mut record = padded(key);
        record.extend_from_slice(payload);
        self.records.push(record);
        self
    }

    /// Serialize the node.
    ///
    /// # Panics
    ///
    /// Panics if the records do not fit in the node.
    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let mut page = vec![0_u8; self.node_size];
        page[0..4].copy_from_slice(&self.forward.to_be_bytes());
        page[4..8].copy_from_slice(&self.backward.to_be_bytes());
        page[8] = self.kind.to_raw();
        page[9] = self.height;
        let count = u16::try_from(self.records.len()).expect("record count fits u16");
        page[10..12].copy_from_slice(&count.to_be_bytes());

        let mut offsets = Vec::with_capacity(self.records.len() + 1);
        let mut at = NODE_DESCRIPTOR_SIZE;
        for record in &self.records {
            offsets.push(at);
            page[at..at + record.len()].copy_from_slice(record);
            at += record.len();
        }
        offsets.push(at);
        let table_start = self.node_size - 2 * offsets.len();
        assert!(at <= table_start, "records overflow a {}-byte node", self.node_size);
        write_offsets(&mut page, &offsets);
        page
    }
}

fn padded(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.resize(round_up_even(key.len()), 0);
    out
}

fn write_offsets(page: &mut [u8], offsets: &[usize]) {
    let len = page.len();
    for (i, off) in offsets.iter().enumerate() {
        let at = len - 2 * (i + 1);
        let off = u16::try_from(*off).expect("offset fits u16");
        page[at..at + 2].copy_from_slice(&off.to_be_bytes());
    }
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 0x80 >> (bit % 8);
}

/// A finished tree file and where things landed in it.
#[derive(Debug, Clone)]
pub struct TreeImage {
    pub bytes: Vec<u8>,
    pub node_size: usize,
    pub root: NodeId,
    pub depth: u16,
    pub leaves: Vec<NodeId>,
    pub map_nodes: Vec<NodeId>,
    pub used_nodes: u32,
    pub total_nodes: u32,
}

impl TreeImage {
    /// Byte offset of node `id` in the image.
    #[must_use]
    pub fn node_offset(&self, id: NodeId) -> usize {
        id.0 as usize * self.node_size
    }

    /// Mutable view of one node, for corrupting it in place.
    pub fn node_mut(&mut self, id: NodeId) -> &mut [u8] {
        let start = self.node_offset(id);
        &mut self.bytes[start..start + self.node_size]
    }
}

/// Builds a complete tree file bottom-up from records already in key
/// order: header node, linked leaves, index levels, optional map nodes.
#[derive(Debug, Clone)]
pub struct TreeImageBuilder {
    node_size: usize,
    key_compare_type: u8,
    leaf_capacity: usize,
    fanout: usize,
    total_nodes: Option<u32>,
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TreeImageBuilder {
    #[must_use]
    pub fn new(node_size: usize) -> Self {
        Self {
            node_size,
            key_compare_type: KEY_COMPARE_CASE_FOLDING,
            leaf_capacity: 4,
            fanout: 4,
            total_nodes: None,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn key_compare_type(mut self, raw: u8) -> Self {
        self.key_compare_type = raw;
        self
    }

    #[must_use]
    pub fn leaf_capacity(mut self, records_per_leaf: usize) -> Self {
        self.leaf_capacity = records_per_leaf.max(1);
        self
    }

    #[must_use]
    pub fn fanout(mut self, children_per_index: usize) -> Self {
        self.fanout = children_per_index.max(2);
        self
    }

    /// Declare more nodes than are used; the rest are free and zeroed.
    #[must_use]
    pub fn total_nodes(mut self, total: u32) -> Self {
        self.total_nodes = Some(total);
        self
    }

    /// Append a record; callers supply records in ascending key order.
    #[must_use]
    pub fn record(mut self, key: Vec<u8>, payload: Vec<u8>) -> Self {
        self.records.push((key, payload));
        self
    }

    #[must_use]
    pub fn records(mut self, records: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Self {
        self.records.extend(records);
        self
    }

    /// # Panics
    ///
    /// Panics if records overflow a node or the declared node count is too
    /// small for the tree.
    #[must_use]
    pub fn build(&self) -> TreeImage {
        let mut pages: Vec<Vec<u8>> = vec![Vec::new()];

        let leaf_chunks: Vec<&[(Vec<u8>, Vec<u8>)]> =
            self.records.chunks(self.leaf_capacity).collect();
        let first_leaf = 1_u32;
        let leaf_ids: Vec<u32> = (0..leaf_chunks.len())
            .map(|i| first_leaf + u32::try_from(i).expect("leaf count"))
            .collect();
        let mut level: Vec<(Vec<u8>, u32)> = Vec::new();
        for (i, chunk) in leaf_chunks.iter().enumerate() {
            let mut node = NodeBuilder::new(self.node_size, NodeKind::Leaf, 1);
            let forward = leaf_ids.get(i + 1).copied().unwrap_or(0);
            let backward = if i == 0 { 0 } else { leaf_ids[i - 1] };
            node.links(forward, backward);
            for (key, payload) in *chunk {
                node.push_leaf(key, payload);
            }
            pages.push(node.finish());
            level.push((chunk[0].0.clone(), leaf_ids[i]));
        }

        let mut height = 1_u8;
        while level.len() > 1 {
            height += 1;
            let mut next_level = Vec::new();
            for group in level.chunks(self.fanout) {
                let id = u32::try_from(pages.len()).expect("node count");
                let mut node = NodeBuilder::new(self.node_size, NodeKind::Index, height);
                for (key, child) in group {
                    node.push_index(key, *child);
                }
                pages.push(node.finish());
                next_level.push((group[0].0.clone(), id));
            }
            level = next_level;
        }
        let (root, depth) = match level.first() {
            Some((_, id)) => (*id, u16::from(height)),
            None => (0, 0),
        };

        let header_map_len =
            self.node_size - NODE_DESCRIPTOR_SIZE - HEADER_RECORD_SIZE - USER_DATA_RECORD_SIZE - 8;
        let map_node_len = self.node_size - NODE_DESCRIPTOR_SIZE - 4;
        let tree_nodes = u32::try_from(pages.len()).expect("node count");
        let total_nodes = self.total_nodes.unwrap_or(tree_nodes);
        let mut covered = header_map_len * 8;
        let mut map_count = 0_u32;
        while covered < total_nodes as usize {
            covered += map_node_len * 8;
            map_count += 1;
        }
        let map_ids: Vec<u32> = (0..map_count).map(|i| tree_nodes + i).collect();
        let used_nodes = tree_nodes + map_count;
        assert!(used_nodes <= total_nodes, "total_nodes too small for tree");

        let mut bitmap = vec![0_u8; covered / 8];
        for node in 0..used_nodes as usize {
            set_bit(&mut bitmap, node);
        }
        let (header_bits, mut rest) = bitmap.split_at(header_map_len);
        for (i, id) in map_ids.iter().enumerate() {
            let (chunk, tail) = rest.split_at(map_node_len);
            rest = tail;
            let forward = map_ids.get(i + 1).copied().unwrap_or(0);
            let mut node = NodeBuilder::new(self.node_size, NodeKind::Map, 0);
            node.links(forward, 0).push_raw(chunk);
            debug_assert_eq!(pages.len(), *id as usize);
            pages.push(node.finish());
        }

        let header = self.header_record(HeaderFields {
            depth,
            root,
            first_leaf: leaf_ids.first().copied().unwrap_or(0),
            last_leaf: leaf_ids.last().copied().unwrap_or(0),
            total_nodes,
            free_nodes: total_nodes - used_nodes,
        });
        let mut header_node = NodeBuilder::new(self.node_size, NodeKind::Header, 0);
        header_node
            .links(map_ids.first().copied().unwrap_or(0), 0)
            .push_raw(&header)
            .push_raw(&[0_u8; USER_DATA_RECORD_SIZE])
            .push_raw(header_bits);
        pages[0] = header_node.finish();

        let mut bytes = vec![0_u8; total_nodes as usize * self.node_size];
        for (i, page) in pages.iter().enumerate() {
            bytes[i * self.node_size..(i + 1) * self.node_size].copy_from_slice(page);
        }
        TreeImage {
            bytes,
            node_size: self.node_size,
            root: NodeId(root),
            depth,
            leaves: leaf_ids.into_iter().map(NodeId).collect(),
            map_nodes: map_ids.into_iter().map(NodeId).collect(),
            used_nodes,
            total_nodes,
        }
    }

    fn header_record(&self, fields: HeaderFields) -> Vec<u8> {
        let mut rec = vec![0_u8; HEADER_RECORD_SIZE];
        let leaf_records = u32::try_from(self.records.len()).expect("record count");
        let node_size = u16::try_from(self.node_size).expect("node size fits u16");
        rec[0..2].copy_from_slice(&fields.depth.to_be_bytes());
        rec[2..6].copy_from_slice(&fields.root.to_be_bytes());
        rec[6..10].copy_from_slice(&leaf_records.to_be_bytes());
        rec[10..14].copy_from_slice(&fields.first_leaf.to_be_bytes());
        rec[14..18].copy_from_slice(&fields.last_leaf.to_be_bytes());
        rec[18..20].copy_from_slice(&node_size.to_be_bytes());
        rec[20..22].copy_from_slice(&516_u16.to_be_bytes());
        rec[22..26].copy_from_slice(&fields.total_nodes.to_be_bytes());
        rec[26..30].copy_from_slice(&fields.free_nodes.to_be_bytes());
        rec[32..36].copy_from_slice(&(u32::from(node_size) * 4).to_be_bytes());
        rec[37] = self.key_compare_type;
        rec[38..42].copy_from_slice(&(ATTR_BIG_KEYS | ATTR_VARIABLE_INDEX_KEYS).to_be_bytes());
        rec
    }
}

struct HeaderFields {
    depth: u16,
    root: u32,
    first_leaf: u32,
    last_leaf: u32,
    total_nodes: u32,
    free_nodes: u32,
}
