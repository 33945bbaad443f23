//! The TCP connection-dispatch engine.
//!
//! Two loops, each on its own thread, feed a bounded pool of short-lived
//! workers:
//!
//! ```text
//! accept loop:  accept selector ──> accept() ──> registry.insert ──> worker: on_incoming
//!                                                                       │ Continue
//!                                                                       ▼
//! poll loop:    data selector ──> unregister ──> worker: on_readable ──> register
//!                     ▲                                    │ Reject / Err
//!                     └──────────────── (re-armed) ────────┼──────────> disconnect
//! ```
//!
//! A connection is either watched by the data selector or owned by exactly
//! one worker, never both. The poll loop unregisters a socket before handing
//! it to a worker, and only that worker puts it back, so one readiness event
//! is never dispatched twice and each connection is handled sequentially.
//!
//! Every termination path (read error, rejected handshake, explicit call,
//! shutdown) goes through [`ServerContext::disconnect`], which closes the
//! socket and fires the close callback exactly once.
//!
//! ```rust,no_run
//! use mill_sockets::{ServerConfig, SocketServer, Verdict};
//!
//! let config = ServerConfig::builder()
//!     .host("127.0.0.1")
//!     .port(8080)
//!     .on_readable(|ctx, conn| {
//!         let data = conn.recv_some(4096)?;
//!         Ok(Verdict::from(ctx.send(conn, &data, None) == data.len()))
//!     })
//!     .on_closed(|_, conn, reason| println!("{} left: {reason}", conn.peer_addr()))
//!     .build();
//!
//! let server = SocketServer::new(config)?;
//! server.start()?;
//! // ...
//! server.stop()?;
//! # Ok::<(), mill_sockets::Error>(())
//! ```

pub mod config;
pub mod connection;

use std::{
    collections::{HashMap, HashSet},
    io,
    net::{Shutdown, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::{net::TcpListener, Events, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    handler::{panic_message, Verdict},
    poll::{Selector, EVENTS_CAPACITY},
    reactor::LoopThread,
    thread_pool::ThreadPool,
};
use config::ServerConfig;
use connection::{Connection, ConnectionId};

/// Reason handed to the close callback for connections dropped by `stop()`.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

const LISTENER_TOKEN: Token = Token(0);

/// Live connections plus the subset currently watched for readability.
///
/// Both live behind one lock so that register, unregister, insert and
/// remove are atomic with respect to each other.
#[derive(Default)]
struct ClientTable {
    clients: HashMap<ConnectionId, Arc<Connection>>,
    watched: HashSet<ConnectionId>,
}

struct Inner {
    config: ServerConfig,
    table: Mutex<ClientTable>,
    accept_selector: Selector,
    recv_selector: Selector,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    pool: ThreadPool,
    next_conn_id: AtomicU64,
}

/// Handle to a server's shared state, passed to every callback.
///
/// Cheap to clone. All operations are safe to call from any thread.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<Inner>,
}

impl ServerContext {
    /// Puts `conn` under readability watch.
    ///
    /// Registering an already watched connection is
    /// [`Error::AlreadyRegistered`] unless `silent` is set.
    pub fn register(&self, conn: &Arc<Connection>, silent: bool) -> Result<()> {
        let mut table = self.inner.table.lock();
        if conn.is_closed() || !table.clients.contains_key(&conn.id()) {
            return Err(Error::ConnectionClosed(conn.id()));
        }
        if table.watched.contains(&conn.id()) {
            if silent {
                return Ok(());
            }
            error!(id = %conn.id(), peer = %conn.peer_addr(), "Tried to register an already registered client");
            return Err(Error::AlreadyRegistered(conn.id()));
        }
        self.inner
            .recv_selector
            .register_fd(conn.fd(), conn.id().token())?;
        table.watched.insert(conn.id());
        debug!(id = %conn.id(), peer = %conn.peer_addr(), "Registered to the selector");
        Ok(())
    }

    /// Takes `conn` out of readability watch.
    ///
    /// Unregistering a connection that is not watched is
    /// [`Error::NotRegistered`] unless `silent` is set.
    pub fn unregister(&self, conn: &Arc<Connection>, silent: bool) -> Result<()> {
        let mut table = self.inner.table.lock();
        if self.unregister_locked(&mut table, conn) || silent {
            return Ok(());
        }
        error!(id = %conn.id(), peer = %conn.peer_addr(), "Tried to unregister a client that is not registered");
        Err(Error::NotRegistered(conn.id()))
    }

    fn unregister_locked(&self, table: &mut ClientTable, conn: &Connection) -> bool {
        if !table.watched.remove(&conn.id()) {
            return false;
        }
        // a released descriptor already left the selector and its number may be reused
        if !conn.is_released() {
            if let Err(e) = self.inner.recv_selector.deregister_fd(conn.fd()) {
                debug!(id = %conn.id(), error = %e, "Deregistering from the selector failed");
            }
        }
        true
    }

    /// Closes `conn` with a bidirectional shutdown. See
    /// [`disconnect_with`](Self::disconnect_with).
    pub fn disconnect(&self, conn: &Arc<Connection>, reason: &str) -> bool {
        self.disconnect_with(conn, reason, Shutdown::Both)
    }

    /// Unregisters, closes and forgets `conn`, then fires the close callback.
    ///
    /// Safe to call any number of times from any thread; only the first call
    /// does the work and returns true.
    pub fn disconnect_with(&self, conn: &Arc<Connection>, reason: &str, how: Shutdown) -> bool {
        let first = {
            let mut table = self.inner.table.lock();
            self.unregister_locked(&mut table, conn);
            table.clients.remove(&conn.id());
            // closed under the lock so a racing register() sees it
            conn.mark_closed();
            conn.claim_close()
        };
        conn.close_with(how);
        if !first {
            return false;
        }

        info!(id = %conn.id(), peer = %conn.peer_addr(), reason, "Disconnected (socket closed)");
        let closed = &self.inner.config.handlers.closed;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| closed(self, conn, reason))) {
            error!(id = %conn.id(), error = %panic_message(payload.as_ref()), "Close handler failed");
        }
        true
    }

    /// Disconnects every connection in `conns`. Returns how many were
    /// actually closed by this call.
    pub fn disconnect_many<I>(&self, conns: I, reason: &str) -> usize
    where
        I: IntoIterator<Item = Arc<Connection>>,
    {
        self.disconnect_many_with(conns, reason, Shutdown::Both)
    }

    /// Bulk form of [`disconnect_with`](Self::disconnect_with). Works on a
    /// snapshot of `conns`, so it may be fed the live client list.
    pub fn disconnect_many_with<I>(&self, conns: I, reason: &str, how: Shutdown) -> usize
    where
        I: IntoIterator<Item = Arc<Connection>>,
    {
        let snapshot: Vec<Arc<Connection>> = conns.into_iter().collect();
        snapshot
            .iter()
            .filter(|conn| self.disconnect_with(conn, reason, how))
            .count()
    }

    /// Disconnects a snapshot of every live connection.
    pub fn disconnect_all(&self, reason: &str) -> usize {
        self.disconnect_many(self.clients(), reason)
    }

    /// Sends `bytes` to `conn`, disconnecting it on failure.
    ///
    /// Returns the number of bytes sent: all of them, or 0 if the send lock
    /// could not be taken within `timeout` or the connection failed.
    pub fn send(&self, conn: &Arc<Connection>, bytes: &[u8], timeout: Option<Duration>) -> usize {
        match conn.send(bytes, timeout) {
            Ok(sent) => sent,
            Err(Error::LockTimeout(limit)) => {
                debug!(id = %conn.id(), ?limit, "Send lock not acquired in time");
                0
            }
            Err(e) => {
                self.disconnect(conn, &e.to_string());
                0
            }
        }
    }

    /// Snapshot of every live connection.
    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.inner.table.lock().clients.values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.table.lock().clients.len()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.table.lock().clients.get(&id).cloned()
    }

    pub fn is_registered(&self, conn: &Connection) -> bool {
        self.inner.table.lock().watched.contains(&conn.id())
    }

    /// Address the listening socket is bound to, while the server runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn insert(&self, conn: Arc<Connection>) {
        self.inner.table.lock().clients.insert(conn.id(), conn);
    }

    /// Atomically moves a ready connection from "watched" to "in flight".
    fn take_ready(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut table = self.inner.table.lock();
        let conn = table.clients.get(&id).cloned()?;
        if self.unregister_locked(&mut table, &conn) {
            Some(conn)
        } else {
            None
        }
    }

    fn accept_once(&self, events: &mut Events) -> Result<()> {
        let block_time = Some(self.inner.config.block_time);
        if self.inner.accept_selector.select(events, block_time)? == 0 {
            return Ok(());
        }

        let accepted = {
            let mut listener = self.inner.listener.lock();
            let Some(listener) = listener.as_mut() else {
                return Ok(());
            };
            let accepted = listener.accept();
            if !matches!(&accepted, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                // one accept per wakeup; re-arm so a remaining backlog wakes us again
                self.inner
                    .accept_selector
                    .reregister(listener, LISTENER_TOKEN)?;
            }
            accepted
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    debug!(error = %e, "Accept failed, retrying");
                }
                return Ok(());
            }
        };

        let id = ConnectionId::new(self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst));
        let conn = match Connection::new(id, stream, peer_addr) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Could not set up accepted socket");
                return Ok(());
            }
        };
        self.insert(Arc::clone(&conn));
        info!(id = %id, peer = %peer_addr, "New socket connection detected");

        let ctx = self.clone();
        let worker_conn = Arc::clone(&conn);
        if let Err(e) = self
            .inner
            .pool
            .exec(move || ctx.handle_accepted(&worker_conn))
        {
            self.disconnect(&conn, &e.to_string());
        }
        Ok(())
    }

    fn poll_readable(&self, events: &mut Events) -> Result<()> {
        let block_time = Some(self.inner.config.block_time);
        if self.inner.recv_selector.select(events, block_time)? == 0 {
            return Ok(());
        }

        for event in events.iter() {
            if !(event.is_readable() || event.is_read_closed() || event.is_error()) {
                continue;
            }
            // None means a disconnect got there first
            let Some(conn) = self.take_ready(ConnectionId::from(event.token())) else {
                continue;
            };

            let ctx = self.clone();
            let worker_conn = Arc::clone(&conn);
            if let Err(e) = self
                .inner
                .pool
                .exec(move || ctx.handle_readable(&worker_conn))
            {
                self.disconnect(&conn, &e.to_string());
            }
        }
        Ok(())
    }

    fn handle_accepted(&self, conn: &Arc<Connection>) {
        let incoming = &self.inner.config.handlers.incoming;
        let verdict = self.invoke(conn, || incoming(self, conn));
        if verdict.is_continue() && !conn.is_closed() {
            conn.mark_accepted();
        }
        self.conclude(conn, verdict);
    }

    fn handle_readable(&self, conn: &Arc<Connection>) {
        let readable = &self.inner.config.handlers.readable;
        let verdict = self.invoke(conn, || readable(self, conn));
        self.conclude(conn, verdict);
    }

    /// Runs a callback, turning errors and panics into a rejection.
    fn invoke<F>(&self, conn: &Connection, f: F) -> Verdict
    where
        F: FnOnce() -> anyhow::Result<Verdict>,
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                let reason = format!("{e:#}");
                let broken = e
                    .downcast_ref::<Error>()
                    .is_some_and(Error::is_connection_broken);
                if !broken {
                    warn!(id = %conn.id(), error = %reason, "Handler failed");
                }
                Verdict::Reject(reason)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(id = %conn.id(), error = %reason, "Handler panicked");
                Verdict::Reject(reason)
            }
        }
    }

    /// Hands the connection back to the poll loop, or disconnects it.
    fn conclude(&self, conn: &Arc<Connection>, verdict: Verdict) {
        match verdict {
            Verdict::Continue if !conn.is_closed() => {
                if let Err(e) = self.register(conn, false) {
                    self.disconnect(conn, &e.to_string());
                }
            }
            Verdict::Continue => {
                self.disconnect(conn, "Connection closed by handler");
            }
            Verdict::Reject(reason) => {
                self.disconnect(conn, &reason);
            }
        }
    }
}

/// The socket server: a listening socket, the two dispatch loops and the
/// shared connection registry.
pub struct SocketServer {
    ctx: ServerContext,
    accept_loop: LoopThread,
    poll_loop: LoopThread,
    running: AtomicBool,
}

impl SocketServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPool::new(config.max_subthreads);
        let accept_selector = (config.selector)()?;
        let recv_selector = (config.selector)()?;
        let inner = Inner {
            config,
            table: Mutex::new(ClientTable::default()),
            accept_selector,
            recv_selector,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            pool,
            // token 0 belongs to the listener
            next_conn_id: AtomicU64::new(1),
        };

        Ok(Self {
            ctx: ServerContext {
                inner: Arc::new(inner),
            },
            accept_loop: LoopThread::new("mill-accept"),
            poll_loop: LoopThread::new("mill-poll"),
            running: AtomicBool::new(false),
        })
    }

    /// Binds and listens, then starts both dispatch loops.
    ///
    /// Bind and listen failures are returned as-is and leave the server
    /// stopped.
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        if let Err(e) = self.start_inner() {
            self.accept_loop.stop();
            self.poll_loop.stop();
            self.close_listener();
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn start_inner(&self) -> Result<()> {
        let inner = &self.ctx.inner;
        let addr = inner.config.bind_addr()?;
        info!(%addr, "Binding server socket");
        let mut listener = bind_listener(addr, inner.config.queue_size)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, queue_size = inner.config.queue_size, "Server socket now listening");

        inner.accept_selector.register(&mut listener, LISTENER_TOKEN)?;
        *inner.listener.lock() = Some(listener);
        *inner.local_addr.lock() = Some(local_addr);

        info!("Starting main threads");
        let ctx = self.ctx.clone();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        self.accept_loop
            .start(move || ctx.accept_once(&mut events))?;

        let ctx = self.ctx.clone();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        self.poll_loop
            .start(move || ctx.poll_readable(&mut events))?;
        info!("Main threads started");
        Ok(())
    }

    /// Disconnects every client, stops both loops and closes the listener.
    ///
    /// Every live connection has received its close callback by the time
    /// this returns. Workers still running are not interrupted.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }

        info!(count = self.ctx.client_count(), "Closing all connections");
        self.ctx.disconnect_all(SHUTDOWN_REASON);

        info!("Stopping main threads");
        self.accept_loop.send_stop_signal();
        self.poll_loop.send_stop_signal();
        self.accept_loop.stop();
        self.poll_loop.stop();

        // the accept loop may have let a last client in before it stopped
        self.ctx.disconnect_all(SHUTDOWN_REASON);

        self.close_listener();
        Ok(())
    }

    fn close_listener(&self) {
        let inner = &self.ctx.inner;
        let Some(mut listener) = inner.listener.lock().take() else {
            return;
        };
        info!("Shutting down server socket");
        if let Err(e) = inner.accept_selector.deregister(&mut listener) {
            debug!(error = %e, "Deregistering the listener failed");
        }
        if let Err(e) = SockRef::from(&listener).shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown failed");
        }
        info!("Closing server socket");
        drop(listener);
        *inner.local_addr.lock() = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr()
    }

    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.ctx.clients()
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(|source| Error::Bind { addr, source })?;
    Ok(TcpListener::from_std(socket.into()))
}
