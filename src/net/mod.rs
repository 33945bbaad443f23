//! Network servers built on the selector, loop and worker primitives.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────────────────┐  │
//! │  │ SocketServer │────────▶│ on_incoming / on_readable / │  │
//! │  │              │          │ on_closed callbacks         │  │
//! │  └──────────────┘          └─────────────────────────────┘  │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ start / stop         │ Verdict
//!              ▼                      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────────┐   │
//! │  │ accept loop │   │  poll loop  │──▶│ ThreadPool       │   │
//! │  │ (Selector)  │   │ (Selector)  │   │ (max_subthreads) │   │
//! │  └─────────────┘   └─────────────┘   └──────────────────┘   │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS readiness
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The accept loop and the poll loop wait on separate selectors so a burst
//! of client traffic never delays accepting new connections. Each readiness
//! hit becomes one job on the worker pool, which invokes the callback you
//! supplied in [`tcp::config::ServerConfig`].

pub mod tcp;
