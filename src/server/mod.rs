//! TCP Front End
//!
//! A reactor: one event-loop thread owns every client connection's socket,
//! read buffer and write buffer, multiplexed through edge-triggered
//! readiness (epoll/kqueue via `mio`). Workers own no socket state — they
//! receive a parsed command plus connection token by value, produce a
//! response, push it onto a shared reply queue and signal a wakeup fd that
//! the event loop polls.
//!
//! Event-loop rules:
//! - Accepting, reading and writing all drain until `WouldBlock` and
//!   re-arm; readiness is edge-triggered, never assume another event for
//!   data already signalled.
//! - Each readable burst is parsed incrementally: INCOMPLETE waits for more
//!   bytes, ERROR is answered by the loop itself (the frame is consumed,
//!   the connection stays open), OK frames are handed to the worker pool.
//! - On the wakeup token the loop drains the reply queue, appends each
//!   response to its connection's write buffer and attempts an immediate
//!   write; leftover bytes register write interest, a full drain removes
//!   it.
//! - Pipelined requests may be executed by different workers and complete
//!   in any order; each reply still goes out on the connection its request
//!   arrived on.
//!
//! Stop is thread-safe (and safe from a signal context): one atomic flag
//! flip plus one wakeup write; the next poll returns, the running check
//! fails, and dropping the loop's state closes every owned descriptor.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::Sender;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::protocol::{self, Command, ParseOutcome};
use crate::storage::engine::StorageEngine;
use crate::storage::types::{now_ms, Version};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// Poll timeout; a backstop for the running check, wakeups arrive via the
/// waker long before this.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How a server turns parsed commands into responses.
#[derive(Clone)]
pub enum ExecutionMode {
    /// Route everything through the quorum coordinator.
    Cluster(Arc<Coordinator>),
    /// Degenerate single-node mode: hit the engine directly, versioning
    /// writes with the current time and this node's id.
    SingleNode {
        engine: Arc<StorageEngine>,
        node_id: u32,
    },
}

/// A unit of work handed to the pool: the command and the token of the
/// connection that must receive the reply. Workers get nothing else.
struct Job {
    token: Token,
    command: Command,
}

/// State shared between the event loop, the workers, and stop handles.
struct Shared {
    running: AtomicBool,
    waker: Waker,
    replies: Mutex<Vec<(Token, Bytes)>>,
}

/// Cheap handle for stopping the server from another thread (or a signal
/// collaborator): an atomic flag toggle plus one wakeup write.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            let _ = self.shared.waker.wake();
        }
    }
}

struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Whether the socket is currently registered for write readiness.
    write_interest: bool,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::new(),
            write_interest: false,
        }
    }
}

pub struct TcpServer {
    listener: TcpListener,
    mode: ExecutionMode,
    worker_threads: usize,
    poll: Poll,
    shared: Arc<Shared>,
}

impl TcpServer {
    pub fn new(
        listener: std::net::TcpListener,
        mode: ExecutionMode,
        worker_threads: usize,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener);
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            waker,
            replies: Mutex::new(Vec::new()),
        });

        Ok(Self {
            listener,
            mode,
            worker_threads,
            poll,
            shared,
        })
    }

    pub fn bind(
        addr: SocketAddr,
        mode: ExecutionMode,
        worker_threads: usize,
    ) -> std::io::Result<Self> {
        Self::new(std::net::TcpListener::bind(addr)?, mode, worker_threads)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the loop started by [`run`](Self::run).
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the event loop on the calling thread until a handle's `stop` is
    /// invoked. Worker threads are spawned here and joined before return.
    pub fn run(self) -> std::io::Result<()> {
        let TcpServer {
            mut listener,
            mode,
            worker_threads,
            mut poll,
            shared,
        } = self;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        // Fixed worker pool. Workers drain jobs until the channel closes,
        // which happens when the event loop exits.
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(worker_threads.max(1));
        for i in 0..worker_threads.max(1) {
            let job_rx = job_rx.clone();
            let mode = mode.clone();
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let response = execute(&mode, job.command);
                        shared.replies.lock().push((job.token, response));
                        if let Err(err) = shared.waker.wake() {
                            warn!("wakeup write failed: {err}");
                        }
                    }
                })?;
            workers.push(worker);
        }
        drop(job_rx);

        let mut connections: HashMap<Token, Connection> = HashMap::new();
        let mut next_token = FIRST_CONNECTION_TOKEN;
        let mut events = Events::with_capacity(256);

        shared.running.store(true, Ordering::SeqCst);
        info!("listening on {}", listener.local_addr()?);

        while shared.running.load(Ordering::SeqCst) {
            if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => accept_all(
                        poll.registry(),
                        &mut listener,
                        &mut connections,
                        &mut next_token,
                    ),
                    WAKER => drain_replies(poll.registry(), &mut connections, &shared),
                    token => {
                        if event.is_error() {
                            close_connection(poll.registry(), &mut connections, token);
                            continue;
                        }
                        if event.is_readable() {
                            handle_read(poll.registry(), &mut connections, token, &job_tx);
                        }
                        if event.is_writable()
                            && flush_connection(poll.registry(), &mut connections, token)
                                .is_err()
                        {
                            close_connection(poll.registry(), &mut connections, token);
                        }
                    }
                }
            }
        }

        info!("server shutting down");
        drop(job_tx);
        for worker in workers {
            let _ = worker.join();
        }
        // Dropping the poll, listener and connections closes every owned
        // descriptor.
        Ok(())
    }
}

// ── Event handlers ──────────────────────────────────────────────────────────

/// Edge-triggered accept: take connections until `WouldBlock`.
fn accept_all(
    registry: &Registry,
    listener: &mut TcpListener,
    connections: &mut HashMap<Token, Connection>,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, _peer)) => {
                let token = Token(*next_token);
                *next_token += 1;
                if let Err(err) = registry.register(&mut stream, token, Interest::READABLE) {
                    warn!("failed to register connection: {err}");
                    continue;
                }
                connections.insert(token, Connection::new(stream));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept failed: {err}");
                break;
            }
        }
    }
}

/// Drain the socket until `WouldBlock`, then parse every complete frame off
/// the front of the read buffer.
fn handle_read(
    registry: &Registry,
    connections: &mut HashMap<Token, Connection>,
    token: Token,
    job_tx: &Sender<Job>,
) {
    let mut closed = false;
    let mut pending_write = false;

    let Some(conn) = connections.get_mut(&token) else {
        return;
    };

    let mut chunk = [0u8; 4096];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => conn.read_buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                closed = true;
                break;
            }
        }
    }

    if !closed {
        loop {
            match protocol::try_parse(&conn.read_buf) {
                ParseOutcome::Incomplete => break,
                ParseOutcome::Error { message, consumed } => {
                    // Malformed frames are answered by the event loop
                    // itself; the stream stays aligned and open.
                    conn.read_buf.advance(consumed);
                    conn.write_buf
                        .extend_from_slice(&protocol::format_error(message));
                }
                ParseOutcome::Ok { command, consumed } => {
                    conn.read_buf.advance(consumed);
                    let _ = job_tx.send(Job { token, command });
                }
            }
        }
        pending_write = !conn.write_buf.is_empty();
    }

    if closed {
        close_connection(registry, connections, token);
        return;
    }
    if pending_write && flush_connection(registry, connections, token).is_err() {
        close_connection(registry, connections, token);
    }
}

/// Hand completed responses from the workers to their connections.
fn drain_replies(
    registry: &Registry,
    connections: &mut HashMap<Token, Connection>,
    shared: &Shared,
) {
    let batch = std::mem::take(&mut *shared.replies.lock());
    for (token, response) in batch {
        if let Some(conn) = connections.get_mut(&token) {
            conn.write_buf.extend_from_slice(&response);
        } else {
            continue; // connection closed while the command ran
        }
        if flush_connection(registry, connections, token).is_err() {
            close_connection(registry, connections, token);
        }
    }
}

/// Write until the buffer empties or the socket pushes back. `WouldBlock`
/// registers write interest; a full drain removes it.
fn flush_connection(
    registry: &Registry,
    connections: &mut HashMap<Token, Connection>,
    token: Token,
) -> std::io::Result<()> {
    let Some(conn) = connections.get_mut(&token) else {
        return Ok(());
    };

    while !conn.write_buf.is_empty() {
        match conn.stream.write(&conn.write_buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => conn.write_buf.advance(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if !conn.write_interest {
                    registry.reregister(
                        &mut conn.stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    conn.write_interest = true;
                }
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    if conn.write_interest {
        registry.reregister(&mut conn.stream, token, Interest::READABLE)?;
        conn.write_interest = false;
    }
    Ok(())
}

fn close_connection(
    registry: &Registry,
    connections: &mut HashMap<Token, Connection>,
    token: Token,
) {
    if let Some(mut conn) = connections.remove(&token) {
        let _ = registry.deregister(&mut conn.stream);
    }
}

// ── Command execution (worker side) ─────────────────────────────────────────

fn execute(mode: &ExecutionMode, command: Command) -> Bytes {
    match mode {
        ExecutionMode::Cluster(coordinator) => coordinator.handle(command),
        ExecutionMode::SingleNode { engine, node_id } => {
            execute_single_node(engine, *node_id, command)
        }
    }
}

/// Single-node execution: no ring, no peers, every command is local.
fn execute_single_node(engine: &StorageEngine, node_id: u32, command: Command) -> Bytes {
    match command {
        Command::Ping => protocol::format_pong(),

        Command::Get { key } => match engine.get(&key) {
            Some((value, _)) => protocol::format_value(&value),
            None => protocol::format_not_found(),
        },

        Command::Set { key, value } => {
            engine.set(key, value, Version::new(now_ms(), node_id));
            protocol::format_ok()
        }

        Command::Del { key } => {
            engine.del(key, Version::new(now_ms(), node_id));
            protocol::format_ok()
        }

        // Replica commands still work against the local engine; useful for
        // inspecting versions even without a cluster.
        Command::RGet { key } => match engine.get(&key) {
            Some((value, version)) => protocol::format_versioned_value(&value, version),
            None => protocol::format_not_found(),
        },

        Command::RSet {
            key,
            value,
            version,
        } => {
            engine.set(key, value, version);
            protocol::format_ok()
        }

        Command::RDel { key, version } => {
            engine.del(key, version);
            protocol::format_ok()
        }

        // There is nowhere to route to without a cluster.
        Command::Fwd { .. } => protocol::format_error("INTERNAL"),
    }
}
