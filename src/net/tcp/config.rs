use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    handler::{Handlers, Verdict},
    net::tcp::{connection::Connection, ServerContext},
    poll::Selector,
};

pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_QUEUE_SIZE: u32 = 1000;
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(2);

/// Builds one readiness multiplexer. Called twice per server, once for the
/// accept loop and once for the poll loop.
pub type SelectorFactory = Arc<dyn Fn() -> Result<Selector> + Send + Sync>;

/// Configuration for the socket server.
///
/// Controls where the server listens, how long each dispatch loop blocks in
/// its readiness wait, how many handshakes may run at once, and the three
/// callbacks. Use `ServerConfig::builder()` for ergonomic construction.
///
/// ## Timing
///
/// - block_time: upper bound of one readiness wait, and therefore of how long
///   `stop()` waits for each loop to notice the stop signal
///
/// ## Resource Limits
///
/// - queue_size: listen backlog handed to the OS
/// - max_subthreads: ceiling on concurrently running handshakes (None for unlimited)
///
/// ## Readiness
///
/// - selector: factory for the two readiness multiplexers, [`Selector::new`] by default
#[derive(Clone)]
pub struct ServerConfig {
    /// Host to bind to; resolved on every `start()`. None binds all IPv4 interfaces.
    pub host: Option<String>,
    /// Port to bind to, 0 for an ephemeral port
    pub port: u16,
    /// Listen backlog
    pub queue_size: u32,
    /// Readiness wait timeout for both dispatch loops
    pub block_time: Duration,
    /// Maximum number of in-flight handshake workers
    pub max_subthreads: Option<usize>,
    /// Accept, readable and close callbacks
    pub handlers: Handlers,
    /// Readiness multiplexer factory
    pub selector: SelectorFactory,
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_subthreads == Some(0) {
            return Err(Error::Configuration(
                "max_subthreads must be at least 1".into(),
            ));
        }
        if self.block_time.is_zero() {
            return Err(Error::Configuration("block_time must be non-zero".into()));
        }
        Ok(())
    }

    /// Resolves the bind address at call time.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        match &self.host {
            None => Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.port)),
            Some(host) => (host.as_str(), self.port)
                .to_socket_addrs()
                .map_err(|e| Error::Resolve(format!("{host}: {e}")))?
                .next()
                .ok_or_else(|| Error::Resolve(host.clone())),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            queue_size: DEFAULT_QUEUE_SIZE,
            block_time: DEFAULT_BLOCK_TIME,
            max_subthreads: None,
            handlers: Handlers::default(),
            selector: Arc::new(Selector::new),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("queue_size", &self.queue_size)
            .field("block_time", &self.block_time)
            .field("max_subthreads", &self.max_subthreads)
            .finish_non_exhaustive()
    }
}

/// Plain-data part of [`ServerConfig`], loadable from a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: u16,
    pub queue_size: u32,
    pub block_time_ms: u64,
    pub max_subthreads: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            queue_size: DEFAULT_QUEUE_SIZE,
            block_time_ms: DEFAULT_BLOCK_TIME.as_millis() as u64,
            max_subthreads: None,
        }
    }
}

/// Builder for ServerConfig using the builder pattern.
///
/// All fields are optional and will use defaults from ServerConfig::default()
/// if not explicitly set.
#[derive(Default)]
pub struct ServerConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    queue_size: Option<u32>,
    block_time: Option<Duration>,
    max_subthreads: Option<Option<usize>>,
    handlers: Handlers,
    selector: Option<SelectorFactory>,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every plain setting from `settings`
    pub fn settings(mut self, settings: ServerSettings) -> Self {
        self.host = settings.host;
        self.port = Some(settings.port);
        self.queue_size = Some(settings.queue_size);
        self.block_time = Some(Duration::from_millis(settings.block_time_ms));
        self.max_subthreads = Some(settings.max_subthreads);
        self
    }

    /// Set the host to bind to
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port to bind to
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the listen backlog
    pub fn queue_size(mut self, size: u32) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Set the readiness wait timeout
    pub fn block_time(mut self, block_time: Duration) -> Self {
        self.block_time = Some(block_time);
        self
    }

    /// Set the worker ceiling, None for unbounded
    pub fn max_subthreads(mut self, max: Option<usize>) -> Self {
        self.max_subthreads = Some(max);
        self
    }

    /// Set the accept-validation callback
    pub fn on_incoming<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServerContext, &Arc<Connection>) -> anyhow::Result<Verdict> + Send + Sync + 'static,
    {
        self.handlers.incoming = Arc::new(f);
        self
    }

    /// Set the readable-data callback
    ///
    /// Returning `Continue` re-arms the socket, so the callback must read the
    /// pending bytes or let a failed `recv` report the peer's hangup.
    pub fn on_readable<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServerContext, &Arc<Connection>) -> anyhow::Result<Verdict> + Send + Sync + 'static,
    {
        self.handlers.readable = Arc::new(f);
        self
    }

    /// Set the close-notification callback
    pub fn on_closed<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServerContext, &Arc<Connection>, &str) + Send + Sync + 'static,
    {
        self.handlers.closed = Arc::new(f);
        self
    }

    /// Set how the readiness multiplexers are built
    pub fn selector<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Selector> + Send + Sync + 'static,
    {
        self.selector = Some(Arc::new(factory));
        self
    }

    /// Build the ServerConfig
    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            host: self.host.or(default.host),
            port: self.port.unwrap_or(default.port),
            queue_size: self.queue_size.unwrap_or(default.queue_size),
            block_time: self.block_time.unwrap_or(default.block_time),
            max_subthreads: self.max_subthreads.unwrap_or(default.max_subthreads),
            handlers: self.handlers,
            selector: self.selector.unwrap_or(default.selector),
        }
    }
}
