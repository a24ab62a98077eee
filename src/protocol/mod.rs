//! Wire Protocol
//!
//! Defines the newline-terminated client/inter-node frame format, the
//! incremental parser used by the TCP server, and the response formatters.
//!
//! ## Frame format
//! A frame is one line ending at the first `\n`. Keys and values are
//! length-delimited so they may contain spaces, tabs or CR; embedded
//! newlines are rejected at the sender, so the first newline in the buffer
//! always terminates the frame.
//!
//! ```text
//! PING\n
//! GET <klen> <key>\n
//! DEL <klen> <key>\n
//! SET <klen> <key> <vlen> <value>\n
//! FWD <hops> <inner-frame-body>\n
//! RGET <klen> <key>\n
//! RSET <klen> <key> <vlen> <value> <ts_ms> <node_id>\n
//! RDEL <klen> <key> <ts_ms> <node_id>\n
//! ```
//!
//! Responses: `+OK`, `+PONG`, `$<vlen> <value>`, `$V <vlen> <value> <ts_ms>
//! <node_id>`, `-NOT_FOUND`, `-ERR <message>` — each newline-terminated.

use bytes::{BufMut, Bytes, BytesMut};

use crate::storage::types::Version;


/// A parsed request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
    },
    Del {
        key: Bytes,
    },
    /// Internal forwarded request. Carries a decrementing TTL and the inner
    /// frame body (without its trailing newline).
    Fwd {
        hops_remaining: u32,
        inner_line: Bytes,
    },
    /// Replica read: like GET but answered with a versioned value.
    RGet {
        key: Bytes,
    },
    /// Replica write carrying the coordinator-chosen version.
    RSet {
        key: Bytes,
        value: Bytes,
        version: Version,
    },
    /// Replica delete carrying the coordinator-chosen version.
    RDel {
        key: Bytes,
        version: Version,
    },
}

/// Result of attempting to parse one frame from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete command was parsed; `consumed` bytes were used.
    Ok { command: Command, consumed: usize },
    /// No newline in the buffer yet; zero bytes consumed.
    Incomplete,
    /// Malformed frame. The whole frame up to and including its newline is
    /// consumed so the stream stays aligned.
    Error {
        message: &'static str,
        consumed: usize,
    },
}

// ── Parser helpers ──────────────────────────────────────────────────────────

fn consume_space(frame: &[u8], pos: &mut usize) -> bool {
    if *pos >= frame.len() || frame[*pos] != b' ' {
        return false;
    }
    *pos += 1;
    true
}

/// Parse a decimal integer at `pos`, advancing past the digits.
fn parse_uint(frame: &[u8], pos: &mut usize) -> Option<u64> {
    let start = *pos;
    let mut value: u64 = 0;
    while *pos < frame.len() && frame[*pos].is_ascii_digit() {
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(frame[*pos] - b'0'))?;
        *pos += 1;
    }
    if *pos == start {
        return None; // no digits
    }
    Some(value)
}

fn parse_u32(frame: &[u8], pos: &mut usize) -> Option<u32> {
    parse_uint(frame, pos).and_then(|v| u32::try_from(v).ok())
}

/// Copy exactly `count` bytes at `pos` out of the frame.
fn read_bytes(frame: &[u8], pos: &mut usize, count: usize) -> Option<Bytes> {
    if *pos + count > frame.len() {
        return None;
    }
    let out = Bytes::copy_from_slice(&frame[*pos..*pos + count]);
    *pos += count;
    Some(out)
}

/// Parse `<klen> <key>` — shared by GET/DEL/RGET and the front of SET/RSET.
fn parse_key(frame: &[u8], pos: &mut usize) -> Result<Bytes, &'static str> {
    if !consume_space(frame, pos) {
        return Err("expected space after command");
    }
    let klen = parse_u32(frame, pos).ok_or("invalid key_len")? as usize;
    if !consume_space(frame, pos) {
        return Err("expected space after key_len");
    }
    read_bytes(frame, pos, klen).ok_or("key shorter than key_len")
}

/// Parse `<vlen> <value>` following a key.
fn parse_value(frame: &[u8], pos: &mut usize) -> Result<Bytes, &'static str> {
    if !consume_space(frame, pos) {
        return Err("expected space after key");
    }
    let vlen = parse_u32(frame, pos).ok_or("invalid val_len")? as usize;
    if !consume_space(frame, pos) {
        return Err("expected space after val_len");
    }
    read_bytes(frame, pos, vlen).ok_or("value shorter than val_len")
}

/// Parse the trailing `<ts_ms> <node_id>` version fields of RSET/RDEL.
fn parse_version(frame: &[u8], pos: &mut usize) -> Result<Version, &'static str> {
    if !consume_space(frame, pos) {
        return Err("expected space before timestamp");
    }
    let timestamp_ms = parse_uint(frame, pos).ok_or("invalid timestamp")?;
    if !consume_space(frame, pos) {
        return Err("expected space after timestamp");
    }
    let node_id = parse_u32(frame, pos).ok_or("invalid node_id")?;
    Ok(Version {
        timestamp_ms,
        node_id,
    })
}

// ── Parser ──────────────────────────────────────────────────────────────────

/// Try to parse a single frame from the front of `buf`.
///
/// The caller advances its read cursor by the `consumed` count of the
/// `Ok`/`Error` outcomes and retries later on `Incomplete`.
pub fn try_parse(buf: &[u8]) -> ParseOutcome {
    // The first newline marks the end of this frame.
    let Some(frame_end) = buf.iter().position(|&b| b == b'\n') else {
        return ParseOutcome::Incomplete;
    };
    let frame = &buf[..frame_end];
    let consumed = frame_end + 1; // include the newline

    let error = |message: &'static str| ParseOutcome::Error { message, consumed };
    let ok = |command: Command| ParseOutcome::Ok { command, consumed };

    // Command word runs until the first space (or end of frame).
    let cmd_end = frame
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(frame.len());
    let word = &frame[..cmd_end];
    let mut pos = cmd_end;

    match word {
        b"PING" => {
            if pos != frame.len() {
                return error("PING takes no arguments");
            }
            ok(Command::Ping)
        }

        b"GET" | b"DEL" | b"RGET" => {
            let key = match parse_key(frame, &mut pos) {
                Ok(key) => key,
                Err(message) => return error(message),
            };
            if pos != frame.len() {
                return error("trailing data after key");
            }
            ok(match word {
                b"GET" => Command::Get { key },
                b"DEL" => Command::Del { key },
                _ => Command::RGet { key },
            })
        }

        b"SET" => {
            let key = match parse_key(frame, &mut pos) {
                Ok(key) => key,
                Err(message) => return error(message),
            };
            let value = match parse_value(frame, &mut pos) {
                Ok(value) => value,
                Err(message) => return error(message),
            };
            if pos != frame.len() {
                return error("trailing data after value");
            }
            ok(Command::Set { key, value })
        }

        b"RSET" => {
            let key = match parse_key(frame, &mut pos) {
                Ok(key) => key,
                Err(message) => return error(message),
            };
            let value = match parse_value(frame, &mut pos) {
                Ok(value) => value,
                Err(message) => return error(message),
            };
            let version = match parse_version(frame, &mut pos) {
                Ok(version) => version,
                Err(message) => return error(message),
            };
            if pos != frame.len() {
                return error("trailing data after version");
            }
            ok(Command::RSet {
                key,
                value,
                version,
            })
        }

        b"RDEL" => {
            let key = match parse_key(frame, &mut pos) {
                Ok(key) => key,
                Err(message) => return error(message),
            };
            let version = match parse_version(frame, &mut pos) {
                Ok(version) => version,
                Err(message) => return error(message),
            };
            if pos != frame.len() {
                return error("trailing data after version");
            }
            ok(Command::RDel { key, version })
        }

        b"FWD" => {
            if !consume_space(frame, &mut pos) {
                return error("expected space after FWD");
            }
            let Some(hops_remaining) = parse_u32(frame, &mut pos) else {
                return error("invalid hop count");
            };
            if !consume_space(frame, &mut pos) {
                return error("expected space after hop count");
            }
            let inner_line = Bytes::copy_from_slice(&frame[pos..]);
            ok(Command::Fwd {
                hops_remaining,
                inner_line,
            })
        }

        _ => error("unknown command"),
    }
}

// ── Response formatters ─────────────────────────────────────────────────────

pub fn format_ok() -> Bytes {
    Bytes::from_static(b"+OK\n")
}

pub fn format_pong() -> Bytes {
    Bytes::from_static(b"+PONG\n")
}

pub fn format_not_found() -> Bytes {
    Bytes::from_static(b"-NOT_FOUND\n")
}

pub fn format_error(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + message.len());
    buf.put_slice(b"-ERR ");
    buf.put_slice(message.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}

/// `$<vlen> <value>\n`
pub fn format_value(value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.len() + 16);
    buf.put_slice(format!("${} ", value.len()).as_bytes());
    buf.put_slice(value);
    buf.put_u8(b'\n');
    buf.freeze()
}

/// `$V <vlen> <value> <ts_ms> <node_id>\n`
pub fn format_versioned_value(value: &[u8], version: Version) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.len() + 48);
    buf.put_slice(format!("$V {} ", value.len()).as_bytes());
    buf.put_slice(value);
    buf.put_slice(format!(" {} {}\n", version.timestamp_ms, version.node_id).as_bytes());
    buf.freeze()
}

/// `FWD <hops> <inner-line>\n` — wraps a command line for forwarding.
pub fn format_forward(hops: u32, inner_line: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(inner_line.len() + 16);
    buf.put_slice(format!("FWD {hops} ").as_bytes());
    buf.put_slice(inner_line);
    buf.put_u8(b'\n');
    buf.freeze()
}

// ── Replication frame builders ──────────────────────────────────────────────

/// `RSET <klen> <key> <vlen> <value> <ts_ms> <node_id>\n`
pub fn frame_rset(key: &[u8], value: &[u8], version: Version) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + value.len() + 48);
    buf.put_slice(format!("RSET {} ", key.len()).as_bytes());
    buf.put_slice(key);
    buf.put_slice(format!(" {} ", value.len()).as_bytes());
    buf.put_slice(value);
    buf.put_slice(format!(" {} {}\n", version.timestamp_ms, version.node_id).as_bytes());
    buf.freeze()
}

/// `RDEL <klen> <key> <ts_ms> <node_id>\n`
pub fn frame_rdel(key: &[u8], version: Version) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 40);
    buf.put_slice(format!("RDEL {} ", key.len()).as_bytes());
    buf.put_slice(key);
    buf.put_slice(format!(" {} {}\n", version.timestamp_ms, version.node_id).as_bytes());
    buf.freeze()
}

/// `RGET <klen> <key>\n`
pub fn frame_rget(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 16);
    buf.put_slice(format!("RGET {} ", key.len()).as_bytes());
    buf.put_slice(key);
    buf.put_u8(b'\n');
    buf.freeze()
}

// ── Versioned response parsing ──────────────────────────────────────────────

/// A parsed `$V`/`-NOT_FOUND` reply from a replica RGET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedRead {
    pub found: bool,
    pub value: Bytes,
    pub version: Version,
}

/// Parse the response to an RGET. `-NOT_FOUND` (and any error reply) maps to
/// `found = false`. The value length is taken from the `<vlen>` field, so
/// values containing spaces parse correctly.
pub fn parse_versioned_response(line: &[u8]) -> VersionedRead {
    let line = match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    };

    if !line.starts_with(b"$V ") {
        return VersionedRead::default();
    }

    let mut pos = 2; // at the space after "$V"
    if !consume_space(line, &mut pos) {
        return VersionedRead::default();
    }
    let Some(vlen) = parse_u32(line, &mut pos) else {
        return VersionedRead::default();
    };
    if !consume_space(line, &mut pos) {
        return VersionedRead::default();
    }
    let Some(value) = read_bytes(line, &mut pos, vlen as usize) else {
        return VersionedRead::default();
    };
    let Ok(version) = parse_version(line, &mut pos) else {
        return VersionedRead::default();
    };
    if pos != line.len() {
        return VersionedRead::default();
    }

    VersionedRead {
        found: true,
        value,
        version,
    }
}
