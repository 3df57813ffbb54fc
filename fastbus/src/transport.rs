//! Collaborator traits implemented by bus backends.
//!
//! A backend supplies two things for a channel:
//! - a [`BusTransport`]: the standard blocking receive, always available;
//! - a [`FastPrimitive`]: a polling decoder that fills a [`FrameRing`] from a
//!   dedicated thread, valid only for a supported subset of frames.
//!
//! Handles close when dropped.

use std::io;
use std::time::Duration;

use crate::config::BusConfig;
use crate::error::{OpenError, PollError};
use crate::frame::Frame;
use crate::sync::{FrameRing, StopSignal};

/// Blocking receive on an open bus handle.
pub trait BusTransport: Send + 'static {
    /// Waits up to `timeout` for the next frame.
    ///
    /// A zero timeout polls once without blocking. Returns `Ok(None)` when
    /// the timeout expires.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the underlying handle.
    fn blocking_receive(&mut self, timeout: Duration) -> io::Result<Option<Frame>>;

    /// Stops delivery while the fast path serves the channel.
    ///
    /// Frames that arrive while parked must never be returned, including
    /// after [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// Any I/O failure of the underlying handle.
    fn park(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Restarts delivery after [`park`](Self::park). Discards anything
    /// queued before the call.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the underlying handle.
    fn resume(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Low-latency decoder run by the fast-path poll thread.
pub trait FastPrimitive: Send + 'static {
    /// Decodes frames into `ring` until `stop` is raised.
    ///
    /// Implementations must not block longer than their configured poll
    /// interval between checks of `stop`.
    ///
    /// # Errors
    ///
    /// - [`PollError::Unsupported`] when a frame or option falls outside the
    ///   decodable subset. The loop must return instead of skipping it.
    /// - [`PollError::Shutdown`] when the process is going away.
    /// - [`PollError::Io`] for anything else.
    fn poll_loop(&mut self, ring: &FrameRing, stop: &StopSignal) -> Result<(), PollError>;
}

/// Opens transports and fast primitives for a channel.
pub trait Backend {
    type Transport: BusTransport;
    type Primitive: FastPrimitive;

    /// Opens the blocking transport.
    ///
    /// For a fast-mode receiver the transport is parked right after opening
    /// and resumed at the downgrade.
    ///
    /// # Errors
    ///
    /// [`OpenError::Rejected`] if the parameters are refused,
    /// [`OpenError::Io`] if the device cannot be opened.
    fn open_transport(&self, config: &BusConfig) -> Result<Self::Transport, OpenError>;

    /// Opens the fast primitive. Only called for eligible configurations.
    ///
    /// # Errors
    ///
    /// [`OpenError::Rejected`] if the primitive cannot serve these
    /// parameters, [`OpenError::Io`] if the device cannot be opened.
    fn open_fast(&self, config: &BusConfig) -> Result<Self::Primitive, OpenError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn blocking_receive(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        (**self).blocking_receive(timeout)
    }

    fn park(&mut self) -> io::Result<()> {
        (**self).park()
    }

    fn resume(&mut self) -> io::Result<()> {
        (**self).resume()
    }
}

impl<P: FastPrimitive + ?Sized> FastPrimitive for Box<P> {
    fn poll_loop(&mut self, ring: &FrameRing, stop: &StopSignal) -> Result<(), PollError> {
        (**self).poll_loop(ring, stop)
    }
}
