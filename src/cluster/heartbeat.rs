//! Heartbeat failure detector.
//!
//! A dedicated thread sends each peer a `PING` over the connection pool
//! every `interval`. A peer with no successful `PONG` for longer than
//! `timeout` is marked down. When a down peer answers again, the detector
//! notifies the coordinator so that any hints queued for that peer are
//! replayed.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cluster::pool::ConnectionPool;
use crate::cluster::ring::NodeInfo;
use crate::coordinator::Coordinator;

/// Health bookkeeping for one peer.
#[derive(Debug, Clone, Copy)]
struct PeerHealth {
    up: bool,
    last_ok: Instant,
}

/// Pure state machine behind the heartbeat loop: feed it per-peer probe
/// outcomes, it reports up/down transitions.
#[derive(Debug)]
pub struct FailureDetector {
    timeout: Duration,
    peers: HashMap<u32, PeerHealth>,
}

impl FailureDetector {
    /// All peers start up: a node that was never reached is indistinguishable
    /// from one that is slow to boot, and marking it down first means the
    /// down→up transition (and hint replay) still fires once it answers.
    pub fn new(peer_ids: impl IntoIterator<Item = u32>, timeout: Duration, now: Instant) -> Self {
        let peers = peer_ids
            .into_iter()
            .map(|id| (id, PeerHealth { up: true, last_ok: now }))
            .collect();
        Self { timeout, peers }
    }

    /// Record a successful probe. Returns true on a down→up transition.
    pub fn record_success(&mut self, node_id: u32, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(&node_id) else {
            return false;
        };
        peer.last_ok = now;
        let recovered = !peer.up;
        peer.up = true;
        recovered
    }

    /// Record a failed probe. Returns true on an up→down transition, which
    /// happens once the peer has been silent for longer than the timeout.
    pub fn record_failure(&mut self, node_id: u32, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(&node_id) else {
            return false;
        };
        if peer.up && now.duration_since(peer.last_ok) > self.timeout {
            peer.up = false;
            return true;
        }
        false
    }

    pub fn is_up(&self, node_id: u32) -> bool {
        self.peers.get(&node_id).map_or(false, |peer| peer.up)
    }
}

pub struct Heartbeat {
    coordinator: Arc<Coordinator>,
    pool: Arc<ConnectionPool>,
    peers: Vec<NodeInfo>,
    interval: Duration,
    timeout: Duration,
}

impl Heartbeat {
    pub fn new(
        coordinator: Arc<Coordinator>,
        pool: Arc<ConnectionPool>,
        peers: Vec<NodeInfo>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            pool,
            peers,
            interval,
            timeout,
        }
    }

    /// Probe loop; runs on its own thread for the life of the process. Each
    /// probe is a blocking exchange bounded by the pool's socket timeouts.
    pub fn run(self) {
        let mut detector = FailureDetector::new(
            self.peers.iter().map(|peer| peer.node_id),
            self.timeout,
            Instant::now(),
        );

        loop {
            thread::sleep(self.interval);

            for peer in &self.peers {
                let pong = self
                    .pool
                    .request(&peer.address, b"PING\n")
                    .map_or(false, |reply| &reply[..] == b"+PONG\n");
                let now = Instant::now();

                if pong {
                    if detector.record_success(peer.node_id, now) {
                        tracing::info!(
                            node_id = peer.node_id,
                            address = %peer.address,
                            "peer is reachable again, replaying hints"
                        );
                        self.coordinator
                            .replay_hints_for(peer.node_id, &peer.address);
                    }
                } else if detector.record_failure(peer.node_id, now) {
                    tracing::warn!(
                        node_id = peer.node_id,
                        address = %peer.address,
                        "peer marked down"
                    );
                }
            }
        }
    }
}
