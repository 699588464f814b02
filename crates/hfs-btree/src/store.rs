#![forbid(unsafe_code)]
//! Paged node store: fixed-size node reads from a byte device.

use hfs_block::ByteDevice;
use hfs_error::{HfsError, Result};
use hfs_types::{HEADER_PROBE_SIZE, MAX_NODE_SIZE, MIN_NODE_SIZE, NodeId};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Reads node `n` as bytes `[n * node_size, (n + 1) * node_size)`.
///
/// Nothing is retained between calls.
#[derive(Clone)]
pub struct NodeStore {
    dev: Arc<dyn ByteDevice>,
    node_size: u32,
}

impl NodeStore {
    pub fn new(dev: Arc<dyn ByteDevice>, node_size: u32) -> Result<Self> {
        if !node_size.is_power_of_two() || !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&node_size) {
            return Err(HfsError::Format(format!(
                "invalid node_size={node_size} (must be power of two in 512..=32768)"
            )));
        }
        Ok(Self { dev, node_size })
    }

    /// Read the first bytes of node 0, enough to decode the header record.
    pub fn read_probe(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
        dev.read_vec_at(0, HEADER_PROBE_SIZE)
    }

    #[must_use]
    pub fn node_size(&self) -> u32 {
        self.node_size
    }

    /// Number of whole nodes the device can hold.
    #[must_use]
    pub fn node_capacity(&self) -> u64 {
        self.dev.len_bytes() / u64::from(self.node_size)
    }

    pub fn read_page(&self, node: NodeId) -> Result<Vec<u8>> {
        let offset = u64::from(node.0)
            .checked_mul(u64::from(self.node_size))
            .ok_or_else(|| HfsError::OutOfRange {
                offset: u64::MAX,
                len: u64::from(self.node_size),
                size: self.dev.len_bytes(),
            })?;
        let len = usize::try_from(self.node_size)
            .map_err(|_| HfsError::Format(format!("node_size={} exceeds usize", self.node_size)))?;
        trace!(node = node.0, offset, "read node");
        self.dev.read_vec_at(offset, len)
    }
}

impl fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStore")
            .field("node_size", &self.node_size)
            .field("len_bytes", &self.dev.len_bytes())
            .finish()
    }
}
