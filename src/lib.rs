//! # Mill-Sockets
//! A multiplexed TCP connection server core for Rust that dispatches per-connection work to a
//! bounded pool of worker threads, without relying on an async runtime.
//! Mill-Sockets accepts connections on one thread, watches every open socket for readable data on
//! another, and runs your protocol code on worker threads so that slow or hostile clients cannot
//! block the event loops or exhaust the machine.
//! ## Core Philosophy
//! Mill-Sockets was designed for applications that require:
//! - **Plain blocking protocol code** running on worker threads, with readiness handled for you
//! - **Bounded resource use** through a worker ceiling that doubles as admission control
//! - **Exactly-once cleanup**: every connection is closed and reported exactly once
//! ## Features
//! - **Runtime-agnostic**: No dependency on Tokio or other async runtimes
//! - **Two selectors**: accept latency never waits behind client I/O polling
//! - **Backpressure**: a full worker pool throttles both dispatch loops
//! - **Three callbacks**: accept validation, readable data, close notification
//! ## Architecture Overview
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ SocketServer │───▶│ LoopThread×2 │───▶│  Selector   │
//! └──────────────┘    └──────────────┘    └─────────────┘
//!                             │
//!                             ▼
//!                    ┌──────────────┐    ┌─────────────┐
//!                    │ ThreadPool   │───▶│  Callbacks  │
//!                    └──────────────┘    └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_sockets::{ServerConfig, SocketServer, Verdict};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::builder()
//!         .host("127.0.0.1")
//!         .port(8080)
//!         .on_incoming(|_, conn| {
//!             println!("New client {}", conn.peer_addr());
//!             Ok(Verdict::Continue)
//!         })
//!         .on_readable(|ctx, conn| {
//!             // echo whatever arrived
//!             let data = conn.recv_some(4096)?;
//!             Ok(Verdict::from(ctx.send(conn, &data, None) == data.len()))
//!         })
//!         .on_closed(|_, conn, reason| println!("{} closed: {}", conn.peer_addr(), reason))
//!         .max_subthreads(Some(64))
//!         .build();
//!
//!     let server = SocketServer::new(config)?;
//!     server.start()?;
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     server.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`SocketServer`]: owns the listener and the two dispatch loops
//! - [`ServerContext`]: handle passed to callbacks for sending and disconnecting
//! - [`Connection`]: one accepted socket with locked sends and fixed or best-effort reads
//! - [`reactor`]: the restartable loop thread used by both dispatch loops
//! - [`thread_pool`]: worker threads with an in-flight ceiling
//! - [`poll`]: readiness selector on top of [`mio`]
//! - [`error`]: Error types and result handling

pub mod error;
pub mod handler;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod thread_pool;

pub use error::{Error, Result};
pub use handler::Verdict;
pub use net::tcp::{
    config::{SelectorFactory, ServerConfig, ServerConfigBuilder, ServerSettings},
    connection::{Connection, ConnectionId},
    ServerContext, SocketServer, SHUTDOWN_REASON,
};

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_sockets::prelude::*;
/// ```
pub mod prelude {
    pub use crate::handler::{Handlers, Verdict};
    pub use crate::net::tcp::{
        config::{ServerConfig, ServerSettings},
        connection::{Connection, ConnectionId},
        ServerContext, SocketServer,
    };
    pub use crate::poll::Selector;
    pub use crate::reactor::LoopThread;
    pub use crate::thread_pool::ThreadPool;
}
