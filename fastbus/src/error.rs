//! Error taxonomy shared by the receive paths.
//!
//! | Type | Raised by | Reaches the caller? |
//! |------|-----------|---------------------|
//! | [`Rejection`] | eligibility check, backend open | only when degraded construction also fails |
//! | [`Unsupported`] | fast receive primitive | no, absorbed by the downgrade |
//! | [`PollError`] | poll loop exit | only the `Io` variant, via [`ReceiveError::Fast`] |
//! | [`ReceiveError`] | [`AdaptiveReceiver`](crate::AdaptiveReceiver) | yes |

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Why a set of bus parameters cannot be serviced by a given path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The fast path is switched off in the configuration.
    #[error("fast path disabled by configuration")]
    Disabled,
    /// Channel name is empty or too long for a network interface.
    #[error("invalid channel name {0:?}")]
    InvalidChannel(String),
    /// The channel exists but the backend cannot serve it.
    #[error("channel {0:?} is not supported")]
    UnsupportedChannel(String),
    /// An option the fast primitive cannot honour.
    #[error("option {0} is not supported by the fast path")]
    UnsupportedOption(&'static str),
    /// Too many acceptance filters.
    #[error("{count} filters requested, at most {max} supported")]
    TooManyFilters { count: usize, max: usize },
    /// Ring buffer capacity must be non-zero.
    #[error("ring buffer capacity must be greater than 0")]
    ZeroCapacity,
}

/// Error opening a transport handle or a fast primitive.
#[derive(Debug, Error)]
pub enum OpenError {
    /// Parameters refused; the caller may retry on another path.
    #[error("parameters rejected: {0}")]
    Rejected(#[from] Rejection),
    /// The underlying device could not be opened.
    #[error("failed to open bus: {0}")]
    Io(#[from] io::Error),
}

impl OpenError {
    /// Whether falling back to another path may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// A frame shape or option outside the subset the fast primitive decodes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unsupported {
    #[error("remote transmission request frames")]
    RemoteFrame,
    #[error("error frames")]
    ErrorFrame,
    #[error("CAN FD frames on a classic-only channel")]
    FdFrame,
    #[error("malformed frame of {0} bytes")]
    Malformed(usize),
    #[error("{0}")]
    Other(String),
}

/// Why a receiver is running on the degraded path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DegradeCause {
    /// Built degraded because the parameters were not eligible or were
    /// rejected while opening the fast path.
    #[error("ineligible parameters: {0}")]
    Ineligible(Rejection),
    /// Downgraded after the fast primitive reported an unsupported condition.
    #[error("unsupported condition: {0}")]
    Unsupported(Unsupported),
}

/// Why a fast-path poll loop returned.
///
/// A loop that returns `Ok(())` was stopped through its
/// [`StopSignal`](crate::StopSignal).
#[derive(Debug, Error)]
pub enum PollError {
    /// The process is shutting down; expected, never surfaced.
    #[error("process shutdown observed")]
    Shutdown,
    /// The primitive met something outside its supported subset.
    #[error("unsupported by fast path: {0}")]
    Unsupported(#[from] Unsupported),
    /// Anything else.
    #[error("fast path I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned to callers of [`AdaptiveReceiver`](crate::AdaptiveReceiver).
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// A positive timeout was requested while the fast path is active.
    #[error("timeout {requested:?} not supported in fast mode, use Duration::ZERO")]
    TimeoutUnsupported { requested: Duration },
    /// A fast-path-only operation was called after the downgrade.
    #[error("operation requires the fast path, which is unavailable: {cause}")]
    NotSupported { cause: DegradeCause },
    /// The poll loop died with an unexpected error.
    #[error("fast path failed: {0}")]
    Fast(#[source] Arc<io::Error>),
    /// The blocking transport failed.
    #[error("transport receive failed: {0}")]
    Transport(#[from] io::Error),
}
