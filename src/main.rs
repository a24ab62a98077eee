use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use dkv::cluster::heartbeat::Heartbeat;
use dkv::cluster::pool::ConnectionPool;
use dkv::cluster::ring::{HashRing, NodeInfo};
use dkv::cluster::topology;
use dkv::config::{self, ArgsOutcome};
use dkv::coordinator::{Coordinator, CoordinatorOptions};
use dkv::server::{ExecutionMode, TcpServer};
use dkv::storage::engine::StorageEngine;
use dkv::storage::recovery;
use dkv::storage::wal::Wal;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match config::parse_args(&args) {
        ArgsOutcome::Help => {
            print!("{}", config::usage());
            return Ok(());
        }
        ArgsOutcome::Run(config) => *config,
    };

    if let Err(err) = config.validate() {
        eprintln!("[ERROR] {err}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    config.log_summary();

    // ── Storage: WAL (with its fsync thread) + snapshot recovery ────────────
    let engine = Arc::new(StorageEngine::new());
    let wal = Wal::open(
        &config.wal_dir,
        config.fsync_interval_ms,
        config.fsync_batch_ops,
    )?;
    recovery::bootstrap(&engine, &wal, &config.snapshot_dir, config.node_id)?;

    // ── Cluster topology ────────────────────────────────────────────────────
    let members = topology::parse_cluster_config(&config.cluster_conf);
    info!(
        "loaded {} cluster members from {}",
        members.len(),
        config.cluster_conf.display()
    );

    let mode = if members.is_empty() {
        warn!("no cluster members configured, running in single-node mode");
        ExecutionMode::SingleNode {
            engine: Arc::clone(&engine),
            node_id: config.node_id,
        }
    } else {
        let mut ring = HashRing::new();
        let mut peers: Vec<NodeInfo> = Vec::new();
        for member in &members {
            let node_id = member.derive_node_id();
            let address = member.address();
            ring.add_node(node_id, &address, config.vnodes);
            info!(name = %member.name, node_id, address = %address, "ring member");
            if node_id != config.node_id {
                peers.push(NodeInfo { node_id, address });
            }
        }
        info!(
            "hash ring ready: {} physical nodes, {} virtual nodes",
            ring.node_count(),
            ring.len()
        );

        let pool = Arc::new(ConnectionPool::default());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&engine),
            Arc::new(ring),
            Arc::clone(&pool),
            Some(Arc::clone(&wal)),
            CoordinatorOptions {
                node_id: config.node_id,
                replication_factor: config.replication_factor,
                write_quorum: config.write_quorum,
                read_quorum: config.read_quorum,
                snapshot_dir: Some(config.snapshot_dir.clone()),
                snapshot_interval: config.snapshot_interval,
                hints_dir: Some(config.wal_dir.clone()),
            },
        ));
        info!(
            "cluster mode: N={} W={} R={}",
            config.replication_factor, config.write_quorum, config.read_quorum
        );

        if !peers.is_empty() {
            let heartbeat = Heartbeat::new(
                Arc::clone(&coordinator),
                pool,
                peers,
                Duration::from_millis(config.heartbeat_interval_ms.max(1)),
                Duration::from_millis(config.heartbeat_timeout_ms),
            );
            thread::Builder::new()
                .name("heartbeat".into())
                .spawn(move || heartbeat.run())?;
        }

        ExecutionMode::Cluster(coordinator)
    };

    // ── Serve until SIGINT/SIGTERM invokes stop ─────────────────────────────
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let server = TcpServer::bind(addr, mode, config.worker_threads)?;
    let handle = server.handle();

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new().name("signals".into()).spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "shutdown signal received");
            handle.stop();
        }
    })?;

    server.run()?;

    // Graceful shutdown: make everything appended so far durable.
    wal.sync()?;
    wal.close()?;
    info!("WAL flushed and closed");

    Ok(())
}
