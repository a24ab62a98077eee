//! Consistent hash ring over virtual nodes.
//!
//! Each physical node occupies a configurable number of positions on a
//! 64-bit ring, derived by hashing `"<node_id>:<vnode_index>"`. A key is
//! owned by the first position strictly clockwise of its hash; replica sets
//! continue the walk, collecting distinct physical nodes. Because positions
//! come from MurmurHash3, every node in the cluster computes the same ring
//! from the same membership.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::hash::hash64;

/// Identity and address of one physical node. Referenced by both the ring
/// and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: u32,
    pub address: String,
}

#[derive(Debug, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, NodeInfo>,
    nodes: HashMap<u32, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `num_vnodes` positions for a node. Position collisions are
    /// logged and the colliding vnode is skipped.
    pub fn add_node(&mut self, node_id: u32, address: &str, num_vnodes: u32) {
        self.nodes.insert(node_id, address.to_string());

        for vnode in 0..num_vnodes {
            let position = hash64(format!("{node_id}:{vnode}").as_bytes());
            if self.ring.contains_key(&position) {
                tracing::warn!(
                    position,
                    node_id,
                    vnode,
                    "hash collision on ring position, skipping vnode"
                );
                continue;
            }
            self.ring.insert(
                position,
                NodeInfo {
                    node_id,
                    address: address.to_string(),
                },
            );
        }
    }

    /// Erase every position bound to `node_id`.
    pub fn remove_node(&mut self, node_id: u32) {
        self.ring.retain(|_, info| info.node_id != node_id);
        self.nodes.remove(&node_id);
    }

    /// Owner of `key`: the first position strictly greater than the key's
    /// hash, wrapping to the smallest position. `None` on an empty ring.
    pub fn get_node(&self, key: &[u8]) -> Option<NodeInfo> {
        let hash = hash64(key);
        self.ring
            .range((Bound::Excluded(hash), Bound::Unbounded))
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, info)| info.clone())
    }

    /// Walk clockwise from the key's position collecting up to `count`
    /// distinct physical nodes. Fewer are returned if the ring has fewer
    /// physical nodes.
    pub fn get_replica_nodes(&self, key: &[u8], count: usize) -> Vec<NodeInfo> {
        let count = count.min(self.nodes.len());
        let mut result: Vec<NodeInfo> = Vec::with_capacity(count);
        if count == 0 {
            return result;
        }

        let hash = hash64(key);
        // Visit every position exactly once: clockwise from the key's hash,
        // then wrapped around from the start of the ring.
        let walk = self
            .ring
            .range((Bound::Excluded(hash), Bound::Unbounded))
            .chain(self.ring.range(..=hash));

        for (_, info) in walk {
            if result.iter().any(|n| n.node_id == info.node_id) {
                continue;
            }
            result.push(info.clone());
            if result.len() == count {
                break;
            }
        }

        result
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of occupied ring positions (virtual nodes).
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
