//! Static key placement
//!
//! Every log key has exactly one primary, the only node allowed to assign
//! offsets for it. The primary is derived from the key with domain-separated
//! BLAKE3 over the sorted cluster membership, so every node computes the same
//! answer from its `init` message alone.

use crate::error::{Error, Result};
use crate::types::NodeId;
use blake3::Hasher;

/// Domain prefix for key placement
pub const DOMAIN_PLACEMENT: &[u8] = b"glomers-placement-v1:";

/// Sorted cluster membership used to place keys.
#[derive(Clone, Debug)]
pub struct Placement {
    nodes: Vec<NodeId>,
}

impl Placement {
    /// Build a placement over the given nodes. Order and duplicates are ignored.
    pub fn new(mut nodes: Vec<NodeId>) -> Result<Self> {
        nodes.sort();
        nodes.dedup();
        if nodes.is_empty() {
            return Err(Error::EmptyCluster);
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node that assigns offsets for `key`.
    pub fn primary_for(&self, key: &str) -> &NodeId {
        let slot = key_slot(key) % self.nodes.len() as u64;
        &self.nodes[slot as usize]
    }

    /// Every node except the primary for `key`.
    pub fn replicas_for<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a NodeId> + 'a {
        let primary = self.primary_for(key).clone();
        self.nodes.iter().filter(move |n| **n != primary)
    }
}

/// `BLAKE3("glomers-placement-v1:" || key)`, first 8 bytes little-endian.
pub fn key_slot(key: &str) -> u64 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PLACEMENT);
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}
