//! Adaptive CAN frame receiver.
//!
//! `fastbus` receives CAN frames through one of two paths behind a single
//! [`AdaptiveReceiver::receive`] call:
//!
//! - **Fast**: a dedicated poll thread drives a [`FastPrimitive`] that
//!   decodes frames into a bounded ring; `receive(Duration::ZERO)` pops the
//!   ring and never blocks.
//! - **Degraded**: the [`BusTransport`]'s ordinary blocking receive.
//!
//! [`dispatch::create`] picks the path at construction from
//! [`BusConfig::fast_eligibility`]. A receiver that starts fast switches to
//! degraded, once and for good, the first time the primitive reports a frame
//! or option it cannot decode. Callers see the same API either way.
//!
//! Backends: [`sim::SimBus`] (in-memory, always available) and
//! `socketcan::SocketCan` (Linux, `socketcan` feature).
//!
//! Enable the `tracing` feature and call [`init_tracing`] to see mode
//! decisions, poll thread lifecycle and downgrades.

pub mod config;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod sim;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
pub mod sync;
pub mod transport;

mod trace;

pub use config::{BusConfig, CanFilter, FastPathConfig, OverflowPolicy};
pub use error::{DegradeCause, OpenError, PollError, ReceiveError, Rejection, Unsupported};
pub use frame::{CanId, Frame, FrameError, FrameKind};
pub use receiver::{AdaptiveReceiver, ReceiverMode, ReceiverStats, dispatch};
pub use sync::{FrameRing, Liveness, StopSignal};
pub use trace::init_tracing;
pub use transport::{Backend, BusTransport, FastPrimitive};
