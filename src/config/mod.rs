//! Node Configuration
//!
//! Command-line flag parsing into a [`Config`]. Unknown flags are warned
//! about on stderr and ignored; a flag with a value that does not parse
//! keeps its default, also with a warning. The quorum invariant `W + R > N`
//! is validated separately so the caller controls the exit path.

use std::path::PathBuf;

use thiserror::Error;


/// All configurable runtime parameters for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Identity
    pub node_id: u32,
    pub port: u16,
    pub cluster_conf: PathBuf,

    // Replication
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,

    // Hash ring
    pub vnodes: u32,

    // WAL & snapshots
    pub wal_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub snapshot_interval: u64,
    pub fsync_interval_ms: u64,
    pub fsync_batch_ops: u32,

    // Threading
    pub worker_threads: usize,

    // Cluster health
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            port: 7001,
            cluster_conf: PathBuf::from("cluster.conf"),
            replication_factor: 3,
            write_quorum: 2,
            read_quorum: 2,
            vnodes: 128,
            wal_dir: PathBuf::from("./data/wal"),
            snapshot_dir: PathBuf::from("./data/snapshots"),
            snapshot_interval: 100_000,
            fsync_interval_ms: 10,
            fsync_batch_ops: 100,
            worker_threads: 4,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("quorum invariant violated: W({write_quorum}) + R({read_quorum}) must be > N({replication_factor})")]
    QuorumInvariant {
        replication_factor: usize,
        write_quorum: usize,
        read_quorum: usize,
    },
}

/// What the argument parser decided.
#[derive(Debug, PartialEq, Eq)]
pub enum ArgsOutcome {
    Run(Box<Config>),
    Help,
}

impl Config {
    /// Enforce `W + R > N`: every read quorum must overlap every write
    /// quorum or reads can miss acknowledged writes entirely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_quorum + self.read_quorum <= self.replication_factor {
            return Err(ConfigError::QuorumInvariant {
                replication_factor: self.replication_factor,
                write_quorum: self.write_quorum,
                read_quorum: self.read_quorum,
            });
        }
        Ok(())
    }

    /// Log the active configuration at boot.
    pub fn log_summary(&self) {
        tracing::info!(
            node_id = self.node_id,
            port = self.port,
            cluster_conf = %self.cluster_conf.display(),
            "node configuration"
        );
        tracing::info!(
            replication_factor = self.replication_factor,
            write_quorum = self.write_quorum,
            read_quorum = self.read_quorum,
            vnodes = self.vnodes,
            "replication configuration"
        );
        tracing::info!(
            wal_dir = %self.wal_dir.display(),
            snapshot_dir = %self.snapshot_dir.display(),
            snapshot_interval = self.snapshot_interval,
            fsync_interval_ms = self.fsync_interval_ms,
            "durability configuration"
        );
    }
}

/// Parse command-line arguments (without the program name).
pub fn parse_args(args: &[String]) -> ArgsOutcome {
    let mut config = Config::default();

    const KNOWN_FLAGS: &[&str] = &[
        "--port",
        "--node-id",
        "--cluster-conf",
        "--replication-factor",
        "--write-quorum",
        "--read-quorum",
        "--vnodes",
        "--wal-dir",
        "--snapshot-dir",
        "--snapshot-interval",
        "--fsync-interval-ms",
        "--fsync-batch-ops",
        "--worker-threads",
        "--heartbeat-interval-ms",
        "--heartbeat-timeout-ms",
    ];

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();

        if flag == "-h" || flag == "--help" {
            return ArgsOutcome::Help;
        }

        if !KNOWN_FLAGS.contains(&flag) {
            eprintln!("[WARN] unknown flag: {flag}");
            i += 1;
            continue;
        }

        // Every known flag takes a value.
        let Some(value) = args.get(i + 1) else {
            eprintln!("[WARN] flag {flag} needs a value, ignoring");
            i += 1;
            continue;
        };

        match flag {
            "--port" => set_numeric(flag, value, &mut config.port),
            "--node-id" => set_numeric(flag, value, &mut config.node_id),
            "--cluster-conf" => config.cluster_conf = PathBuf::from(value),
            "--replication-factor" => {
                set_numeric(flag, value, &mut config.replication_factor)
            }
            "--write-quorum" => set_numeric(flag, value, &mut config.write_quorum),
            "--read-quorum" => set_numeric(flag, value, &mut config.read_quorum),
            "--vnodes" => set_numeric(flag, value, &mut config.vnodes),
            "--wal-dir" => config.wal_dir = PathBuf::from(value),
            "--snapshot-dir" => config.snapshot_dir = PathBuf::from(value),
            "--snapshot-interval" => set_numeric(flag, value, &mut config.snapshot_interval),
            "--fsync-interval-ms" => set_numeric(flag, value, &mut config.fsync_interval_ms),
            "--fsync-batch-ops" => set_numeric(flag, value, &mut config.fsync_batch_ops),
            "--worker-threads" => set_numeric(flag, value, &mut config.worker_threads),
            "--heartbeat-interval-ms" => {
                set_numeric(flag, value, &mut config.heartbeat_interval_ms)
            }
            "--heartbeat-timeout-ms" => {
                set_numeric(flag, value, &mut config.heartbeat_timeout_ms)
            }
            _ => unreachable!("flag {flag} is in KNOWN_FLAGS"),
        }

        i += 2;
    }

    ArgsOutcome::Run(Box::new(config))
}

fn set_numeric<T: std::str::FromStr>(flag: &str, value: &str, out: &mut T) {
    match value.parse() {
        Ok(parsed) => *out = parsed,
        Err(_) => eprintln!("[WARN] invalid value for {flag}: {value}, keeping default"),
    }
}

pub fn usage() -> &'static str {
    "Usage: dkv-node [OPTIONS]\n\
     \n\
     Options:\n\
     \x20 --port <PORT>                Listen port (default: 7001)\n\
     \x20 --node-id <ID>               Unique node identifier (default: 1)\n\
     \x20 --cluster-conf <PATH>        Cluster config file (default: cluster.conf)\n\
     \x20 --replication-factor <N>     Replication factor (default: 3)\n\
     \x20 --write-quorum <W>           Write quorum (default: 2)\n\
     \x20 --read-quorum <R>            Read quorum (default: 2)\n\
     \x20 --vnodes <V>                 Virtual nodes per physical node (default: 128)\n\
     \x20 --wal-dir <PATH>             WAL directory (default: ./data/wal)\n\
     \x20 --snapshot-dir <PATH>        Snapshot directory (default: ./data/snapshots)\n\
     \x20 --snapshot-interval <OPS>    Ops between snapshots (default: 100000)\n\
     \x20 --fsync-interval-ms <MS>     Max ms between fsyncs (default: 10)\n\
     \x20 --fsync-batch-ops <OPS>      Fsync after this many appends (default: 100)\n\
     \x20 --worker-threads <N>         Worker threads (default: 4)\n\
     \x20 --heartbeat-interval-ms <MS> Heartbeat period (default: 1000)\n\
     \x20 --heartbeat-timeout-ms <MS>  Down detection timeout (default: 5000)\n\
     \x20 -h, --help                   Show this help\n"
}
