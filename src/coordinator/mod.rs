//! Request Coordinator
//!
//! Every client command enters here. The coordinator resolves the key's
//! replica set on the hash ring and acts as the scatter-gather point:
//!
//! - **Writes** (SET/DEL): one version `(now_ms, node_id)` is chosen up
//!   front and sent to all N replicas in parallel as RSET/RDEL, so every
//!   replica stores identical LWW metadata. The client gets `+OK` once W
//!   replicas acknowledge; failed replica writes become hints.
//! - **Reads** (GET): R replicas are queried in parallel; the response with
//!   the newest version wins. Replicas that returned older data (or none)
//!   are repaired in the background with the winning value.
//! - **Replica commands** (RSET/RDEL/RGET) and forwarded frames (FWD) are
//!   executed locally — the sending coordinator already routed them.
//!
//! A quorum operation parallelizes its fanout with one short-lived thread
//! per replica, joined before replying; read repair runs on a detached
//! thread so the client response is never delayed. Local mutations go
//! through the WAL before the engine, and every WAL-writing mutation ticks
//! the snapshot counter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};

use crate::cluster::pool::{ConnectionPool, PeerError};
use crate::cluster::ring::{HashRing, NodeInfo};
use crate::protocol::{self, Command, ParseOutcome, VersionedRead};
use crate::replication::hints::{Hint, HintStore};
use crate::storage::engine::StorageEngine;
use crate::storage::snapshot;
use crate::storage::types::{now_ms, Version};
use crate::storage::wal::{OpType, Wal};

#[cfg(test)]
mod tests;

/// Everything configurable about a coordinator besides its collaborators.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub node_id: u32,
    /// N — total replicas per key.
    pub replication_factor: usize,
    /// W — acks required for a successful write.
    pub write_quorum: usize,
    /// R — replicas queried on a read.
    pub read_quorum: usize,
    /// `None` disables snapshotting.
    pub snapshot_dir: Option<PathBuf>,
    /// WAL-writing mutations between snapshots (0 disables).
    pub snapshot_interval: u64,
    /// `None` keeps hints in memory only.
    pub hints_dir: Option<PathBuf>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            node_id: 1,
            replication_factor: 1,
            write_quorum: 1,
            read_quorum: 1,
            snapshot_dir: None,
            snapshot_interval: 100_000,
            hints_dir: None,
        }
    }
}

pub struct Coordinator {
    engine: Arc<StorageEngine>,
    ring: Arc<HashRing>,
    pool: Arc<ConnectionPool>,
    /// `None` means in-memory only (no durability).
    wal: Option<Arc<Wal>>,
    hints: HintStore,
    node_id: u32,
    replication_factor: usize,
    write_quorum: usize,
    read_quorum: usize,
    snapshot_dir: Option<PathBuf>,
    snapshot_interval: u64,
    ops_since_snapshot: AtomicU64,
}

/// Outcome of a remote RGET: `ok` distinguishes an unreachable replica from
/// a reachable one that simply had nothing.
#[derive(Debug, Default)]
struct ReplicaRead {
    ok: bool,
    read: VersionedRead,
}

impl Coordinator {
    pub fn new(
        engine: Arc<StorageEngine>,
        ring: Arc<HashRing>,
        pool: Arc<ConnectionPool>,
        wal: Option<Arc<Wal>>,
        options: CoordinatorOptions,
    ) -> Self {
        let hints = HintStore::new(options.hints_dir);
        // Recover any hints persisted before a previous crash.
        hints.load();

        Self {
            engine,
            ring,
            pool,
            wal,
            hints,
            node_id: options.node_id,
            replication_factor: options.replication_factor,
            write_quorum: options.write_quorum,
            read_quorum: options.read_quorum,
            snapshot_dir: options.snapshot_dir,
            snapshot_interval: options.snapshot_interval,
            ops_since_snapshot: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn hints(&self) -> &HintStore {
        &self.hints
    }

    /// Execute one parsed command and produce its wire response.
    pub fn handle(self: &Arc<Self>, command: Command) -> Bytes {
        match command {
            Command::Ping => protocol::format_pong(),

            // A forwarded frame is executed here — this node was the routing
            // target. FWD is single-use: the inner command is never
            // forwarded again, the TTL only guards against loops.
            Command::Fwd {
                hops_remaining,
                inner_line,
            } => {
                if hops_remaining == 0 {
                    return protocol::format_error("ROUTING_LOOP");
                }
                let mut framed = BytesMut::with_capacity(inner_line.len() + 1);
                framed.extend_from_slice(&inner_line);
                framed.extend_from_slice(b"\n");
                match protocol::try_parse(&framed) {
                    ParseOutcome::Ok { command, .. } => self.execute_local(command),
                    _ => protocol::format_error("MALFORMED_FWD"),
                }
            }

            // Internal replication commands: the sending coordinator already
            // selected this node as a replica.
            Command::RSet { .. } | Command::RDel { .. } | Command::RGet { .. } => {
                self.execute_local(command)
            }

            Command::Set { key, value } => self.quorum_write(key, value, false),
            Command::Del { key } => self.quorum_write(key, Bytes::new(), true),
            Command::Get { key } => self.quorum_read(key),
        }
    }

    /// Apply a command against the local engine (and WAL). Client SET/DEL
    /// arriving here (via FWD) mint a fresh version; RSET/RDEL carry the
    /// version their coordinator chose.
    fn execute_local(&self, command: Command) -> Bytes {
        match command {
            Command::Ping => protocol::format_pong(),

            Command::Get { key } => match self.engine.get(&key) {
                Some((value, _)) => protocol::format_value(&value),
                None => protocol::format_not_found(),
            },

            Command::Set { key, value } => {
                let version = Version::new(now_ms(), self.node_id);
                self.wal_append(OpType::Set, &key, &value, version.timestamp_ms);
                self.engine.set(key, value, version);
                self.maybe_snapshot();
                protocol::format_ok()
            }

            Command::Del { key } => {
                let version = Version::new(now_ms(), self.node_id);
                self.wal_append(OpType::Del, &key, b"", version.timestamp_ms);
                self.engine.del(key, version);
                self.maybe_snapshot();
                protocol::format_ok()
            }

            Command::RSet {
                key,
                value,
                version,
            } => {
                self.wal_append(OpType::Set, &key, &value, version.timestamp_ms);
                self.engine.set(key, value, version);
                self.maybe_snapshot();
                protocol::format_ok()
            }

            Command::RDel { key, version } => {
                self.wal_append(OpType::Del, &key, b"", version.timestamp_ms);
                self.engine.del(key, version);
                self.maybe_snapshot();
                protocol::format_ok()
            }

            // RGET answers with the version so the querying coordinator can
            // compare replicas.
            Command::RGet { key } => match self.engine.get(&key) {
                Some((value, version)) => protocol::format_versioned_value(&value, version),
                None => protocol::format_not_found(),
            },

            Command::Fwd { .. } => protocol::format_error("INTERNAL"),
        }
    }

    // ── Quorum write ────────────────────────────────────────────────────────

    fn quorum_write(self: &Arc<Self>, key: Bytes, value: Bytes, is_del: bool) -> Bytes {
        let replicas = self
            .ring
            .get_replica_nodes(&key, self.replication_factor);
        if replicas.is_empty() {
            return protocol::format_error("EMPTY_RING");
        }

        // One version shared by the whole replica set, so every replica
        // stores identical LWW metadata.
        let version = Version::new(now_ms(), self.node_id);

        // Scatter to all N replicas, one thread each, and join for acks.
        let acks = thread::scope(|scope| {
            let writers: Vec<_> = replicas
                .iter()
                .map(|replica| {
                    let key = key.clone();
                    let value = value.clone();
                    scope.spawn(move || -> bool {
                        if replica.node_id == self.node_id {
                            let command = if is_del {
                                Command::RDel { key, version }
                            } else {
                                Command::RSet {
                                    key,
                                    value,
                                    version,
                                }
                            };
                            self.execute_local(command) == protocol::format_ok()
                        } else {
                            let delivered = self.send_replication_write(
                                &replica.address,
                                &key,
                                &value,
                                is_del,
                                version,
                            );
                            if !delivered {
                                // Queue for hinted handoff; replayed when
                                // the heartbeat sees the peer again.
                                self.hints.store(Hint {
                                    target_node_id: replica.node_id,
                                    target_address: replica.address.clone(),
                                    key,
                                    value,
                                    is_del,
                                    version,
                                });
                            }
                            delivered
                        }
                    })
                })
                .collect();

            writers
                .into_iter()
                .map(|writer| writer.join().unwrap_or(false))
                .filter(|delivered| *delivered)
                .count()
        });

        if acks >= self.write_quorum {
            protocol::format_ok()
        } else {
            tracing::warn!(
                acks,
                required = self.write_quorum,
                "write quorum not reached"
            );
            protocol::format_error("QUORUM_FAILED")
        }
    }

    /// Send RSET/RDEL to one replica and wait for `+OK`.
    fn send_replication_write(
        &self,
        address: &str,
        key: &[u8],
        value: &[u8],
        is_del: bool,
        version: Version,
    ) -> bool {
        let frame = if is_del {
            protocol::frame_rdel(key, version)
        } else {
            protocol::frame_rset(key, value, version)
        };
        matches!(self.pool.request(address, &frame), Ok(reply) if &reply[..] == b"+OK\n")
    }

    // ── Quorum read ─────────────────────────────────────────────────────────

    fn quorum_read(self: &Arc<Self>, key: Bytes) -> Bytes {
        let replicas = self.ring.get_replica_nodes(&key, self.read_quorum);
        if replicas.is_empty() {
            return protocol::format_error("EMPTY_RING");
        }

        // Query all R replicas in parallel; join preserves replica order.
        let responses: Vec<ReplicaRead> = thread::scope(|scope| {
            let readers: Vec<_> = replicas
                .iter()
                .map(|replica| {
                    let key = key.clone();
                    scope.spawn(move || {
                        if replica.node_id == self.node_id {
                            let read = match self.engine.get(&key) {
                                Some((value, version)) => VersionedRead {
                                    found: true,
                                    value,
                                    version,
                                },
                                None => VersionedRead::default(),
                            };
                            ReplicaRead { ok: true, read }
                        } else {
                            self.send_replication_read(&replica.address, &key)
                        }
                    })
                })
                .collect();

            readers
                .into_iter()
                .map(|reader| reader.join().unwrap_or_default())
                .collect()
        });

        let ok_count = responses.iter().filter(|r| r.ok).count();
        if ok_count == 0 {
            return protocol::format_error("QUORUM_FAILED");
        }

        // LWW winner across the reachable replicas that had the key.
        let best = responses
            .iter()
            .filter(|r| r.ok && r.read.found)
            .max_by_key(|r| r.read.version);
        let Some(best) = best else {
            return protocol::format_not_found();
        };

        // Replicas that answered but are behind the winner get repaired in
        // the background; the client response is not delayed.
        let stale: Vec<NodeInfo> = replicas
            .iter()
            .zip(&responses)
            .filter(|(_, r)| {
                r.ok && (!r.read.found || best.read.version.is_newer_than(&r.read.version))
            })
            .map(|(replica, _)| replica.clone())
            .collect();
        if !stale.is_empty() {
            self.spawn_read_repair(
                key,
                best.read.value.clone(),
                best.read.version,
                stale,
            );
        }

        protocol::format_value(&best.read.value)
    }

    /// Send RGET to one replica and parse the versioned reply.
    fn send_replication_read(&self, address: &str, key: &[u8]) -> ReplicaRead {
        let frame = protocol::frame_rget(key);
        match self.pool.request(address, &frame) {
            Ok(reply) => ReplicaRead {
                ok: true,
                read: protocol::parse_versioned_response(&reply),
            },
            Err(PeerError::Unavailable | PeerError::Timeout) => ReplicaRead::default(),
        }
    }

    /// Fire-and-forget: push the winning version to stale replicas on a
    /// detached thread.
    fn spawn_read_repair(
        self: &Arc<Self>,
        key: Bytes,
        value: Bytes,
        version: Version,
        stale: Vec<NodeInfo>,
    ) {
        let this = Arc::clone(self);
        thread::spawn(move || {
            for replica in stale {
                if replica.node_id == this.node_id {
                    this.execute_local(Command::RSet {
                        key: key.clone(),
                        value: value.clone(),
                        version,
                    });
                } else if !this.send_replication_write(
                    &replica.address,
                    &key,
                    &value,
                    false,
                    version,
                ) {
                    tracing::debug!(
                        node_id = replica.node_id,
                        "read repair delivery failed"
                    );
                }
            }
        });
    }

    // ── Forwarding (single-owner routing path) ──────────────────────────────

    /// Wrap `inner_line` in a FWD frame and relay it to `address`, returning
    /// the remote response verbatim.
    pub fn forward_to(&self, address: &str, inner_line: &[u8], hops: u32) -> Bytes {
        let frame = protocol::format_forward(hops, inner_line);
        match self.pool.request(address, &frame) {
            Ok(response) => response,
            Err(PeerError::Unavailable) => protocol::format_error("NODE_UNAVAILABLE"),
            Err(PeerError::Timeout) => protocol::format_error("NODE_TIMEOUT"),
        }
    }

    // ── Hinted handoff replay ───────────────────────────────────────────────

    /// Re-send every hint queued for `target_node_id`. Invoked by the
    /// heartbeat once the peer answers pings again. All deliveries must
    /// succeed for the hints to be cleared; otherwise they are kept for the
    /// next trigger.
    pub fn replay_hints_for(&self, target_node_id: u32, target_address: &str) {
        let pending = self.hints.hints_for(target_node_id);
        if pending.is_empty() {
            return;
        }

        tracing::info!(
            target_node_id,
            target_address,
            count = pending.len(),
            "replaying hints"
        );

        let mut all_delivered = true;
        for hint in &pending {
            // Prefer the caller's current address; the peer may have come
            // back under a new one.
            let address = if target_address.is_empty() {
                &hint.target_address
            } else {
                target_address
            };
            let delivered = self.send_replication_write(
                address,
                &hint.key,
                &hint.value,
                hint.is_del,
                hint.version,
            );
            if !delivered {
                tracing::warn!(target_node_id, "hint replay delivery failed");
                all_delivered = false;
            }
        }

        if all_delivered {
            self.hints.clear_hints_for(target_node_id);
            tracing::info!(target_node_id, "all hints replayed and cleared");
        }
    }

    // ── Durability helpers ──────────────────────────────────────────────────

    /// Append to the WAL if durability is enabled. Append failures are
    /// logged and do not fail the client operation.
    fn wal_append(&self, op: OpType, key: &[u8], value: &[u8], timestamp_ms: u64) {
        if let Some(wal) = &self.wal {
            if let Err(err) = wal.append(op, key, value, timestamp_ms) {
                tracing::error!("WAL append failed: {err}");
            }
        }
    }

    /// Count one WAL-writing mutation; every `snapshot_interval` of them,
    /// fsync the WAL and write a snapshot. Runs on the worker executing the
    /// mutation; failures are logged, never fatal.
    fn maybe_snapshot(&self) {
        let (Some(wal), Some(snapshot_dir)) = (&self.wal, &self.snapshot_dir) else {
            return;
        };
        if self.snapshot_interval == 0 {
            return;
        }

        let ops = self.ops_since_snapshot.fetch_add(1, Ordering::AcqRel) + 1;
        if ops < self.snapshot_interval {
            return;
        }
        self.ops_since_snapshot.store(0, Ordering::Release);

        let seq_no = wal.current_seq_no();
        if let Err(err) = wal.sync() {
            tracing::error!("WAL fsync before snapshot failed: {err}");
        }

        match snapshot::save(&self.engine, seq_no, snapshot_dir) {
            Ok(path) => tracing::info!("snapshot saved at {}", path.display()),
            Err(err) => tracing::error!("snapshot failed: {err}"),
        }
    }
}
