//! Per-peer pool of persistent TCP connections.
//!
//! Inter-node requests are tiny line-oriented exchanges, so each peer keeps
//! a small LIFO of idle sockets. `acquire` hands out an idle socket or dials
//! a new one with a bounded connect; every socket carries send and receive
//! timeouts (`set_write_timeout`/`set_read_timeout`), so each blocking
//! syscall is bounded. A socket that fails or times out is dropped rather
//! than returned to the pool.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

pub const DEFAULT_MAX_PER_PEER: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on a single inter-node reply; anything bigger is a protocol
/// violation.
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Why an inter-node request produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeerError {
    /// No connection could be established (or the request could not be
    /// written).
    #[error("peer unavailable")]
    Unavailable,
    /// The peer accepted the request but produced no bytes within the
    /// timeout.
    #[error("peer timed out")]
    Timeout,
}

/// An idle socket checked out of the pool.
pub struct PooledConnection {
    pub stream: TcpStream,
    pub address: String,
}

pub struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    max_per_peer: usize,
    timeout: Duration,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_PEER, DEFAULT_TIMEOUT)
    }
}

impl ConnectionPool {
    pub fn new(max_per_peer: usize, timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_per_peer,
            timeout,
        }
    }

    /// Pop an idle connection for `address`, or dial a new one. Returns
    /// `None` if the connect fails or times out.
    pub fn acquire(&self, address: &str) -> Option<PooledConnection> {
        if let Some(stream) = self.idle.lock().get_mut(address).and_then(Vec::pop) {
            return Some(PooledConnection {
                stream,
                address: address.to_string(),
            });
        }

        let stream = self.connect(address)?;
        Some(PooledConnection {
            stream,
            address: address.to_string(),
        })
    }

    fn connect(&self, address: &str) -> Option<TcpStream> {
        let addr = resolve(address)?;
        let stream = match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!("connect to {address} failed: {err}");
                return None;
            }
        };

        // Bound every send and receive on this socket.
        if let Err(err) = stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
        {
            tracing::warn!("cannot apply timeouts to {address}: {err}");
            return None;
        }

        Some(stream)
    }

    /// Return a connection to its peer's pool, or close it if the pool is
    /// already at capacity.
    pub fn release(&self, conn: PooledConnection) {
        let mut idle = self.idle.lock();
        let pool = idle.entry(conn.address).or_default();
        if pool.len() < self.max_per_peer {
            pool.push(conn.stream);
        }
        // A full pool just drops the stream, closing it.
    }

    /// Close every idle socket and clear the pools.
    pub fn close_all(&self) {
        self.idle.lock().clear();
    }

    /// Idle sockets currently pooled for `address`.
    pub fn idle_count(&self, address: &str) -> usize {
        self.idle.lock().get(address).map_or(0, Vec::len)
    }

    /// One request/response exchange: send `frame`, read one reply line.
    ///
    /// The connection is returned to the pool only after a cleanly
    /// terminated reply; any failure path drops (closes) it. A receive that
    /// times out with no bytes so far yields `Timeout`; a reply cut off
    /// after some bytes is returned as-is.
    pub fn request(&self, address: &str, frame: &[u8]) -> Result<Bytes, PeerError> {
        let Some(mut conn) = self.acquire(address) else {
            return Err(PeerError::Unavailable);
        };

        if let Err(err) = conn.stream.write_all(frame) {
            tracing::warn!("send to {address} failed: {err}");
            return Err(PeerError::Unavailable);
        }

        let mut response = BytesMut::with_capacity(256);
        let mut chunk = [0u8; 4096];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => return finish_partial(response), // peer closed
                Ok(n) => {
                    response.extend_from_slice(&chunk[..n]);
                    if response.last() == Some(&b'\n') {
                        self.release(conn);
                        return Ok(response.freeze());
                    }
                    if response.len() > MAX_RESPONSE_BYTES {
                        tracing::warn!("oversized reply from {address}, dropping connection");
                        return Err(PeerError::Timeout);
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // SO_RCVTIMEO expiry surfaces as WouldBlock/TimedOut.
                Err(_) => return finish_partial(response),
            }
        }
    }
}

fn finish_partial(response: BytesMut) -> Result<Bytes, PeerError> {
    if response.is_empty() {
        Err(PeerError::Timeout)
    } else {
        Ok(response.freeze())
    }
}

fn resolve(address: &str) -> Option<SocketAddr> {
    match address.to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(err) => {
            tracing::warn!("invalid peer address {address}: {err}");
            None
        }
    }
}
