//! Cluster membership file parsing.
//!
//! One member per line: `<name> <host>:<port>`. Blank lines and lines
//! starting with `#` are ignored; malformed lines are logged and skipped so
//! one bad entry never takes the whole cluster definition down with it.

use std::fs;
use std::path::Path;

use crate::hash::hash64;

/// One entry from the cluster configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeEntry {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Node id for ring placement: the digits embedded in the member name
    /// (`node12` → 12). Names without digits fall back to a hash of the
    /// name so they still get a stable, non-zero id.
    pub fn derive_node_id(&self) -> u32 {
        let id = self
            .name
            .chars()
            .filter(char::is_ascii_digit)
            .fold(0u32, |acc, c| {
                acc.wrapping_mul(10).wrapping_add(c as u32 - '0' as u32)
            });
        if id != 0 {
            id
        } else {
            hash64(self.name.as_bytes()) as u32
        }
    }
}

/// Parse the membership file at `path`. An unreadable file is logged and
/// yields an empty membership.
pub fn parse_cluster_config(path: &Path) -> Vec<NodeEntry> {
    match fs::read_to_string(path) {
        Ok(contents) => parse_cluster_entries(&contents),
        Err(err) => {
            tracing::warn!("cannot open cluster config {}: {err}", path.display());
            Vec::new()
        }
    }
}

/// Parse membership entries from file contents.
pub fn parse_cluster_entries(contents: &str) -> Vec<NodeEntry> {
    let mut entries = Vec::new();

    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(name), Some(address)) = (fields.next(), fields.next()) else {
            tracing::warn!("skipping malformed line {}: {line}", line_no + 1);
            continue;
        };

        let Some((host, port_str)) = address.rsplit_once(':') else {
            tracing::warn!(
                "skipping malformed address on line {}: {address}",
                line_no + 1
            );
            continue;
        };
        if host.is_empty() {
            tracing::warn!(
                "skipping malformed address on line {}: {address}",
                line_no + 1
            );
            continue;
        }

        let Ok(port) = port_str.parse::<u16>() else {
            tracing::warn!("invalid port on line {}: {port_str}", line_no + 1);
            continue;
        };
        if port == 0 {
            tracing::warn!("invalid port on line {}: {port_str}", line_no + 1);
            continue;
        }

        entries.push(NodeEntry {
            name: name.to_string(),
            host: host.to_string(),
            port,
        });
    }

    entries
}
