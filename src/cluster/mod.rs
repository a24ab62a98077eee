//! Cluster Topology Module
//!
//! Everything a node knows about its peers:
//!
//! - **`topology`**: parser for the cluster membership file and node-id
//!   derivation from member names.
//! - **`ring`**: consistent hash ring over virtual nodes; maps each key to
//!   its replica set. Built once at boot and treated as immutable for the
//!   process lifetime.
//! - **`pool`**: per-peer pool of persistent TCP connections with send and
//!   receive timeouts, used for all inter-node traffic.
//! - **`heartbeat`**: periodic PING-based failure detector; when a peer
//!   transitions from down back to up, pending hints are replayed to it.

pub mod heartbeat;
pub mod pool;
pub mod ring;
pub mod topology;

pub use ring::{HashRing, NodeInfo};
