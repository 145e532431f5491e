//! Node identity and neighbor topology
//!
//! Identity and membership come from `init`; the neighbor list is fixed once,
//! either up front (mesh, tree) or from the first `topology` message.

use crate::config::TopologyStrategy;
use glomers_core::placement::Placement;
use glomers_core::ErrorCode;
use glomers_core::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

/// Topology errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Local node {0} is not part of the cluster")]
    UnknownLocalNode(NodeId),
    #[error("Placement error: {0}")]
    Placement(#[from] glomers_core::Error),
}

impl TopologyError {
    /// Wire code for a rejected `init`.
    pub fn code(&self) -> ErrorCode {
        match self {
            TopologyError::UnknownLocalNode(_) => ErrorCode::MalformedRequest,
            TopologyError::Placement(e) => e.code(),
        }
    }
}

/// Static identity plus the gossip neighbor list
pub struct Topology {
    local: NodeId,
    placement: Placement,
    strategy: TopologyStrategy,
    /// `None` until the neighbor list is settled
    neighbors: RwLock<Option<Vec<NodeId>>>,
}

impl Topology {
    /// Create the topology from the `init` handshake
    pub fn new(
        local: NodeId,
        node_ids: Vec<NodeId>,
        strategy: TopologyStrategy,
        branching: usize,
    ) -> Result<Self, TopologyError> {
        let placement = Placement::new(node_ids)?;
        if !placement.nodes().contains(&local) {
            return Err(TopologyError::UnknownLocalNode(local));
        }

        let neighbors = match strategy {
            TopologyStrategy::Provided => None,
            TopologyStrategy::Mesh => Some(mesh_neighbors(&local, placement.nodes())),
            TopologyStrategy::Tree => Some(tree_neighbors(&local, placement.nodes(), branching)),
        };

        Ok(Self {
            local,
            placement,
            strategy,
            neighbors: RwLock::new(neighbors),
        })
    }

    /// This node's id
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Every cluster member except this node
    pub fn peers(&self) -> Vec<NodeId> {
        mesh_neighbors(&self.local, self.placement.nodes())
    }

    /// Current gossip neighbors (empty until settled)
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.read().clone().unwrap_or_default()
    }

    /// Apply the harness topology. Only the first call under the `provided`
    /// strategy changes anything; returns whether the neighbor list changed.
    pub fn apply(&self, provided: &HashMap<NodeId, Vec<NodeId>>) -> bool {
        let mut neighbors = self.neighbors.write();
        if neighbors.is_some() {
            info!(
                "[{}] Keeping {:?} neighbors, ignoring harness topology",
                self.local, self.strategy
            );
            return false;
        }

        let chosen = match provided.get(&self.local) {
            Some(list) => {
                let mut list: Vec<NodeId> = list
                    .iter()
                    .filter(|n| **n != self.local && self.placement.nodes().contains(n))
                    .cloned()
                    .collect();
                list.sort();
                list.dedup();
                list
            }
            None => {
                warn!(
                    "[{}] Harness topology does not mention this node, falling back to mesh",
                    self.local
                );
                mesh_neighbors(&self.local, self.placement.nodes())
            }
        };

        info!("[{}] Neighbors: {:?}", self.local, chosen);
        *neighbors = Some(chosen);
        true
    }
}

/// All nodes but `local`
pub fn mesh_neighbors(local: &NodeId, nodes: &[NodeId]) -> Vec<NodeId> {
    nodes.iter().filter(|n| *n != local).cloned().collect()
}

/// Parent and children of `local` in a k-ary tree laid over `nodes` in order.
pub fn tree_neighbors(local: &NodeId, nodes: &[NodeId], branching: usize) -> Vec<NodeId> {
    let branching = branching.max(1);
    let Some(index) = nodes.iter().position(|n| n == local) else {
        return Vec::new();
    };

    let mut neighbors = Vec::new();
    if index > 0 {
        neighbors.push(nodes[(index - 1) / branching].clone());
    }
    let first_child = index * branching + 1;
    for child in first_child..first_child + branching {
        if let Some(node) = nodes.get(child) {
            neighbors.push(node.clone());
        }
    }
    neighbors
}
