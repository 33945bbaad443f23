use std::{any::Any, fmt, sync::Arc};

use crate::net::tcp::{connection::Connection, ServerContext};

/// Outcome of an accept-validation or readable-data callback.
///
/// `Continue` keeps the connection alive and puts it back under readiness
/// watch. `Reject` disconnects it, handing the reason to the close callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Reject(String),
}

impl Verdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Verdict::Reject(reason.into())
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Verdict::Continue)
    }
}

impl From<bool> for Verdict {
    fn from(keep: bool) -> Self {
        if keep {
            Verdict::Continue
        } else {
            Verdict::reject("Rejected by handler")
        }
    }
}

/// Called on a worker thread once per accepted socket, before it is watched.
pub type IncomingFn =
    dyn Fn(&ServerContext, &Arc<Connection>) -> anyhow::Result<Verdict> + Send + Sync;

/// Called on a worker thread each time a watched socket becomes readable.
///
/// A callback that returns [`Verdict::Continue`] must consume the pending
/// data or report end of stream (a `recv` on a closed peer fails with
/// [`Error::ConnectionBroken`](crate::Error::ConnectionBroken)). Otherwise
/// the socket is still readable when it is watched again and is dispatched
/// over and over.
pub type ReadableFn =
    dyn Fn(&ServerContext, &Arc<Connection>) -> anyhow::Result<Verdict> + Send + Sync;

/// Called exactly once per connection after its socket has been closed.
pub type ClosedFn = dyn Fn(&ServerContext, &Arc<Connection>, &str) + Send + Sync;

/// The three extension points of the server.
///
/// The default readable callback keeps every connection without reading
/// from it, so a peer that sends data or hangs up keeps a worker busy until
/// the server stops. Any real protocol installs its own; see [`ReadableFn`].
#[derive(Clone)]
pub struct Handlers {
    pub(crate) incoming: Arc<IncomingFn>,
    pub(crate) readable: Arc<ReadableFn>,
    pub(crate) closed: Arc<ClosedFn>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            incoming: Arc::new(|_, _| Ok(Verdict::Continue)),
            readable: Arc::new(|_, _| Ok(Verdict::Continue)),
            closed: Arc::new(|_, _, _| {}),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("Handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("Handler panicked: {msg}")
    } else {
        "Handler panicked".to_string()
    }
}
