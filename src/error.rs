use std::{fmt, io, net::SocketAddr, result::Result as StdResult, time::Duration};

use thiserror::Error;

use crate::net::tcp::connection::ConnectionId;

pub type Result<T> = StdResult<T, Error>;

/// Which half of a transfer observed a zero-length result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to bind server socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Socket connection broken on {0}")]
    ConnectionBroken(Direction),
    #[error("Timed out after {0:?} waiting for the send lock")]
    LockTimeout(Duration),
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("Connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
    #[error("Connection {0} is not registered")]
    NotRegistered(ConnectionId),
    #[error("Server is already running")]
    AlreadyRunning,
    #[error("Server is not running")]
    NotRunning,
    #[error("Configuration Error: {0}")]
    Configuration(String),
    #[error("Could not resolve bind address {0}")]
    Resolve(String),
}

impl Error {
    /// True for failures that mean the peer is gone rather than a local
    /// misuse of the API.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::ConnectionBroken(_) | Error::ConnectionClosed(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_messages_name_the_direction() {
        assert_eq!(
            Error::ConnectionBroken(Direction::Recv).to_string(),
            "Socket connection broken on recv"
        );
        assert_eq!(
            Error::ConnectionBroken(Direction::Send).to_string(),
            "Socket connection broken on send"
        );
    }

    #[test]
    fn test_is_connection_broken() {
        assert!(Error::ConnectionBroken(Direction::Send).is_connection_broken());
        assert!(Error::ConnectionClosed(ConnectionId(3)).is_connection_broken());
        assert!(Error::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_connection_broken());
        assert!(!Error::LockTimeout(Duration::from_millis(5)).is_connection_broken());
        assert!(!Error::AlreadyRegistered(ConnectionId(1)).is_connection_broken());
    }
}
