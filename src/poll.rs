use std::{io, os::fd::RawFd, time::Duration};

use mio::{event::Source, unix::SourceFd, Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;

use crate::error::Result;

pub const EVENTS_CAPACITY: usize = 1024;

/// A readiness multiplexer.
///
/// Waiting happens on the owning loop thread while holding `poller`;
/// registration goes through a cloned [`Registry`] so workers can add and
/// remove sockets without waiting for an in-progress poll to time out.
pub struct Selector {
    poller: Mutex<Poll>,
    registry: Registry,
}

impl Selector {
    pub fn new() -> Result<Self> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        Ok(Selector {
            poller: Mutex::new(poller),
            registry,
        })
    }

    pub fn register<S>(&self, src: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.register(src, token, Interest::READABLE)?;
        Ok(())
    }

    /// Re-arms `src`. Readiness that is still pending is reported again.
    pub fn reregister<S>(&self, src: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.reregister(src, token, Interest::READABLE)?;
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.deregister(src)?;
        Ok(())
    }

    pub fn register_fd(&self, fd: RawFd, token: Token) -> Result<()> {
        self.register(&mut SourceFd(&fd), token)
    }

    pub fn deregister_fd(&self, fd: RawFd) -> Result<()> {
        self.deregister(&mut SourceFd(&fd))
    }

    /// Waits up to `timeout` for readiness and returns the number of events.
    /// An interrupted wait counts as a wait with no events.
    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        let mut poller = self.poller.lock();
        match poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }
}
