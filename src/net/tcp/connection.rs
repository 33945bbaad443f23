use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use mio::{net::TcpStream, Token};
use parking_lot::{Mutex, RwLock};
use socket2::SockRef;
use tracing::trace;

use crate::error::{Direction, Error, Result};

/// Upper bound on a single read while assembling a fixed-size message.
pub const RECV_CHUNK_SIZE: usize = 2048;

/// Unique identifier for connections.
///
/// Assigned from a monotonically increasing counter when the socket is
/// accepted and never reused, so it doubles as the selector token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0 as usize)
    }
}

impl From<Token> for ConnectionId {
    fn from(token: Token) -> Self {
        ConnectionId(token.0 as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted socket.
///
/// The socket is kept in blocking mode: readiness is only used to decide
/// *when* a worker should look at it, after which `send`/`recv` behave like
/// ordinary blocking transfers. Sends are serialized by a per-connection
/// lock, reads are not.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    fd: RawFd,
    stream: RwLock<Option<TcpStream>>,
    send_lock: Mutex<()>,
    closed: AtomicBool,
    accepted: AtomicBool,
    close_handled: AtomicBool,
}

impl Connection {
    /// Wraps a freshly accepted stream, switching it to blocking mode.
    pub fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self> {
        SockRef::from(&stream).set_nonblocking(false)?;
        Ok(Self {
            id,
            peer_addr,
            fd: stream.as_raw_fd(),
            stream: RwLock::new(Some(stream)),
            send_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            accepted: AtomicBool::new(false),
            close_handled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once the accept-validation callback approved the connection.
    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// True once the socket descriptor has been given back to the OS.
    pub(crate) fn is_released(&self) -> bool {
        self.stream.read().is_none()
    }

    pub(crate) fn mark_accepted(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn hold_send_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.send_lock.lock()
    }

    /// Returns true for exactly one caller over the connection's lifetime.
    pub(crate) fn claim_close(&self) -> bool {
        !self.close_handled.swap(true, Ordering::SeqCst)
    }

    /// Writes all of `bytes` while holding the send lock.
    ///
    /// `timeout` bounds the wait for the lock only; `None` or a zero
    /// duration waits indefinitely. A zero-length write means the peer went
    /// away and is reported as [`Error::ConnectionBroken`].
    pub fn send(&self, bytes: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let _guard = match timeout.filter(|t| !t.is_zero()) {
            Some(limit) => self
                .send_lock
                .try_lock_for(limit)
                .ok_or(Error::LockTimeout(limit))?,
            None => self.send_lock.lock(),
        };

        let stream = self.stream.read();
        let mut stream = stream.as_ref().ok_or(Error::ConnectionClosed(self.id))?;

        let mut total_sent = 0;
        while total_sent < bytes.len() {
            match stream.write(&bytes[total_sent..]) {
                Ok(0) => return Err(Error::ConnectionBroken(Direction::Send)),
                Ok(sent) => total_sent += sent,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total_sent)
    }

    /// `fixed` selects between [`recv_exact`](Self::recv_exact) and
    /// [`recv_some`](Self::recv_some).
    pub fn recv(&self, size: usize, fixed: bool) -> Result<Vec<u8>> {
        if fixed {
            self.recv_exact(size)
        } else {
            self.recv_some(size)
        }
    }

    /// Reads exactly `size` bytes, in chunks of at most [`RECV_CHUNK_SIZE`].
    pub fn recv_exact(&self, size: usize) -> Result<Vec<u8>> {
        let stream = self.stream.read();
        let mut stream = stream.as_ref().ok_or(Error::ConnectionClosed(self.id))?;

        let mut data = Vec::with_capacity(size.min(RECV_CHUNK_SIZE));
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        while data.len() < size {
            let want = (size - data.len()).min(RECV_CHUNK_SIZE);
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Err(Error::ConnectionBroken(Direction::Recv)),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(data)
    }

    /// One read of up to `size` bytes. Only an empty read is an error.
    pub fn recv_some(&self, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let stream = self.stream.read();
        let mut stream = stream.as_ref().ok_or(Error::ConnectionClosed(self.id))?;

        let mut data = vec![0u8; size];
        let n = loop {
            match stream.read(&mut data) {
                Ok(0) => return Err(Error::ConnectionBroken(Direction::Recv)),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        data.truncate(n);
        Ok(data)
    }

    /// Shuts the socket down in both directions and releases it.
    ///
    /// Prefer `ServerContext::disconnect`, which also takes the connection
    /// out of the registry and fires the close callback.
    pub fn close(&self) {
        self.close_with(Shutdown::Both);
    }

    pub(crate) fn close_with(&self, how: Shutdown) {
        self.mark_closed();
        if let Some(stream) = self.stream.read().as_ref() {
            // the peer may already be gone
            if let Err(e) = stream.shutdown(how) {
                trace!(id = %self.id, error = %e, "Shutdown failed");
            }
        }
        // shutdown wakes any blocked reader or writer, so this does not wait long
        drop(self.stream.write().take());
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .field("accepted", &self.is_accepted())
            .finish()
    }
}
