use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use super::{Coordinator, CoordinatorOptions};
use crate::cluster::pool::ConnectionPool;
use crate::cluster::ring::HashRing;
use crate::protocol::Command;
use crate::replication::hints::Hint;
use crate::storage::engine::StorageEngine;
use crate::storage::types::Version;

fn b(data: &'static str) -> Bytes {
    Bytes::from_static(data.as_bytes())
}

fn build(ring: HashRing, options: CoordinatorOptions) -> (Arc<Coordinator>, Arc<StorageEngine>) {
    let engine = Arc::new(StorageEngine::new());
    let pool = Arc::new(ConnectionPool::new(2, Duration::from_millis(200)));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&engine),
        Arc::new(ring),
        pool,
        None,
        options,
    ));
    (coordinator, engine)
}

fn single_node_ring() -> HashRing {
    let mut ring = HashRing::new();
    ring.add_node(1, "127.0.0.1:9", 16);
    ring
}

/// A replica that acknowledges every write and answers RGET with a canned
/// reply. Good enough to stand in for a remote peer in routing tests.
fn spawn_replica_stub(rget_reply: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf: Vec<u8> = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut chunk) else { return };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = buf.iter().position(|&byte| byte == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let reply: &[u8] = if line.starts_with(b"RGET") {
                            rget_reply
                        } else {
                            b"+OK\n"
                        };
                        if stream.write_all(reply).is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    address
}

#[test]
fn test_ping_is_local() {
    let (coordinator, _) = build(HashRing::new(), CoordinatorOptions::default());
    assert_eq!(&coordinator.handle(Command::Ping)[..], b"+PONG\n");
}

#[test]
fn test_empty_ring_rejects_client_commands() {
    let (coordinator, _) = build(HashRing::new(), CoordinatorOptions::default());

    let response = coordinator.handle(Command::Set {
        key: b("k"),
        value: b("v"),
    });
    assert_eq!(&response[..], b"-ERR EMPTY_RING\n");

    let response = coordinator.handle(Command::Get { key: b("k") });
    assert_eq!(&response[..], b"-ERR EMPTY_RING\n");
}

#[test]
fn test_single_node_quorum_round_trip() {
    let (coordinator, engine) = build(single_node_ring(), CoordinatorOptions::default());

    let response = coordinator.handle(Command::Set {
        key: b("mykey"),
        value: b("myvalue"),
    });
    assert_eq!(&response[..], b"+OK\n");
    assert_eq!(engine.get(b"mykey").unwrap().0, b("myvalue"));

    let response = coordinator.handle(Command::Get { key: b("mykey") });
    assert_eq!(&response[..], b"$7 myvalue\n");

    let response = coordinator.handle(Command::Del { key: b("mykey") });
    assert_eq!(&response[..], b"+OK\n");

    let response = coordinator.handle(Command::Get { key: b("mykey") });
    assert_eq!(&response[..], b"-NOT_FOUND\n");
}

#[test]
fn test_replica_commands_respect_carried_versions() {
    let (coordinator, engine) = build(single_node_ring(), CoordinatorOptions::default());

    let response = coordinator.handle(Command::RSet {
        key: b("k"),
        value: b("v1"),
        version: Version::new(100, 2),
    });
    assert_eq!(&response[..], b"+OK\n");

    let response = coordinator.handle(Command::RGet { key: b("k") });
    assert_eq!(&response[..], b"$V 2 v1 100 2\n");

    let response = coordinator.handle(Command::RDel {
        key: b("k"),
        version: Version::new(200, 2),
    });
    assert_eq!(&response[..], b"+OK\n");
    assert!(engine.get(b"k").is_none());

    // A stale resurrecting write acks (replica commands always do) but LWW
    // keeps the tombstone in place.
    let response = coordinator.handle(Command::RSet {
        key: b("k"),
        value: b("zombie"),
        version: Version::new(50, 2),
    });
    assert_eq!(&response[..], b"+OK\n");
    assert!(engine.get(b"k").is_none());
}

#[test]
fn test_quorum_failure_when_sole_replica_unreachable() {
    // The only replica for every key is node 2, which nothing listens for.
    let mut ring = HashRing::new();
    ring.add_node(2, "127.0.0.1:1", 16);
    let (coordinator, _) = build(ring, CoordinatorOptions::default());

    let response = coordinator.handle(Command::Get { key: b("k") });
    assert_eq!(&response[..], b"-ERR QUORUM_FAILED\n");

    let response = coordinator.handle(Command::Set {
        key: b("k"),
        value: b("v"),
    });
    assert_eq!(&response[..], b"-ERR QUORUM_FAILED\n");

    // The failed replica write left a hint behind for node 2.
    let pending = coordinator.hints().hints_for(2);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, b("k"));
    assert!(!pending[0].is_del);
}

#[test]
fn test_fwd_dispatch() {
    let (coordinator, engine) = build(single_node_ring(), CoordinatorOptions::default());

    let response = coordinator.handle(Command::Fwd {
        hops_remaining: 0,
        inner_line: b("PING"),
    });
    assert_eq!(&response[..], b"-ERR ROUTING_LOOP\n");

    let response = coordinator.handle(Command::Fwd {
        hops_remaining: 2,
        inner_line: b("PING"),
    });
    assert_eq!(&response[..], b"+PONG\n");

    let response = coordinator.handle(Command::Fwd {
        hops_remaining: 2,
        inner_line: b("NOT A FRAME"),
    });
    assert_eq!(&response[..], b"-ERR MALFORMED_FWD\n");

    // A forwarded SET executes locally with a fresh version.
    let response = coordinator.handle(Command::Fwd {
        hops_remaining: 1,
        inner_line: b("SET 1 k 1 v"),
    });
    assert_eq!(&response[..], b"+OK\n");
    assert_eq!(engine.get(b"k").unwrap().0, b("v"));
}

#[test]
fn test_quorum_write_scatters_to_remote_replica() {
    let replica = spawn_replica_stub(b"-NOT_FOUND\n");
    let mut ring = HashRing::new();
    ring.add_node(1, "127.0.0.1:9", 16);
    ring.add_node(2, &replica, 16);

    let (coordinator, engine) = build(
        ring,
        CoordinatorOptions {
            replication_factor: 2,
            write_quorum: 2,
            ..CoordinatorOptions::default()
        },
    );

    let response = coordinator.handle(Command::Set {
        key: b("k"),
        value: b("v"),
    });
    assert_eq!(&response[..], b"+OK\n");
    assert_eq!(engine.get(b"k").unwrap().0, b("v"));
    // Both replicas acked: nothing was hinted.
    assert_eq!(coordinator.hints().total(), 0);
}

#[test]
fn test_quorum_write_hints_failed_replica_but_meets_quorum() {
    let mut ring = HashRing::new();
    ring.add_node(1, "127.0.0.1:9", 16);
    ring.add_node(2, "127.0.0.1:1", 16); // unreachable

    let (coordinator, _) = build(
        ring,
        CoordinatorOptions {
            replication_factor: 2,
            write_quorum: 1,
            ..CoordinatorOptions::default()
        },
    );

    // W=1 is met by the local replica even though node 2 is down...
    let response = coordinator.handle(Command::Set {
        key: b("k"),
        value: b("v"),
    });
    assert_eq!(&response[..], b"+OK\n");
    // ...and the missed replica still got a hint for later repair.
    assert_eq!(coordinator.hints().hints_for(2).len(), 1);
}

#[test]
fn test_quorum_read_prefers_newest_version_and_repairs_local() {
    // The remote replica holds the newer version of the key.
    let replica = spawn_replica_stub(b"$V 5 v_new 200 2\n");
    let mut ring = HashRing::new();
    ring.add_node(1, "127.0.0.1:9", 16);
    ring.add_node(2, &replica, 16);

    let (coordinator, engine) = build(
        ring,
        CoordinatorOptions {
            replication_factor: 2,
            write_quorum: 1,
            read_quorum: 2,
            ..CoordinatorOptions::default()
        },
    );
    engine.set(b("k"), b("v_old"), Version::new(100, 1));

    let response = coordinator.handle(Command::Get { key: b("k") });
    assert_eq!(&response[..], b"$5 v_new\n");

    // Read repair runs in the background and upgrades the stale local copy.
    thread::sleep(Duration::from_millis(100));
    let (value, version) = engine.get(b"k").unwrap();
    assert_eq!(value, b("v_new"));
    assert_eq!(version, Version::new(200, 2));
}

#[test]
fn test_quorum_read_serves_local_winner_when_remote_missing() {
    let replica = spawn_replica_stub(b"-NOT_FOUND\n");
    let mut ring = HashRing::new();
    ring.add_node(1, "127.0.0.1:9", 16);
    ring.add_node(2, &replica, 16);

    let (coordinator, engine) = build(
        ring,
        CoordinatorOptions {
            replication_factor: 2,
            write_quorum: 1,
            read_quorum: 2,
            ..CoordinatorOptions::default()
        },
    );
    engine.set(b("k"), b("local"), Version::new(100, 1));

    let response = coordinator.handle(Command::Get { key: b("k") });
    assert_eq!(&response[..], b"$5 local\n");

    let response = coordinator.handle(Command::Get { key: b("gone") });
    assert_eq!(&response[..], b"-NOT_FOUND\n");
}

#[test]
fn test_replay_hints_clears_only_on_full_success() {
    let (coordinator, _) = build(single_node_ring(), CoordinatorOptions::default());

    let hint = Hint {
        target_node_id: 2,
        target_address: String::new(),
        key: b("k"),
        value: b("v"),
        is_del: false,
        version: Version::new(100, 1),
    };
    coordinator.hints().store(hint.clone());

    // Peer still down: hints must survive the failed replay.
    coordinator.replay_hints_for(2, "127.0.0.1:1");
    assert_eq!(coordinator.hints().hints_for(2).len(), 1);

    // Peer back up: replay delivers and clears.
    let replica = spawn_replica_stub(b"-NOT_FOUND\n");
    coordinator.replay_hints_for(2, &replica);
    assert!(coordinator.hints().hints_for(2).is_empty());

    // Replaying with no pending hints is a no-op.
    coordinator.replay_hints_for(2, &replica);
}

#[test]
fn test_forward_to_error_mapping() {
    let (coordinator, _) = build(single_node_ring(), CoordinatorOptions::default());

    // Connection refused maps to NODE_UNAVAILABLE.
    let response = coordinator.forward_to("127.0.0.1:1", b"PING", 2);
    assert_eq!(&response[..], b"-ERR NODE_UNAVAILABLE\n");

    // A peer that accepts but never answers maps to NODE_TIMEOUT.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            held.push(stream);
        }
    });
    let response = coordinator.forward_to(&address, b"PING", 2);
    assert_eq!(&response[..], b"-ERR NODE_TIMEOUT\n");

    // A live peer relays its response verbatim.
    let replica = spawn_replica_stub(b"-NOT_FOUND\n");
    let response = coordinator.forward_to(&replica, b"SET 1 k 1 v", 2);
    assert_eq!(&response[..], b"+OK\n");
}
