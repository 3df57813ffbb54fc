//! Synchronization primitives shared by the poll thread and its owner.
//!
//! - [`FrameRing`]: bounded FIFO from the poll thread to `receive()`
//! - [`StopSignal`]: idempotent termination request
//! - [`Liveness`]: probe on whether a poll thread is running

mod ring;
mod signal;

pub use ring::FrameRing;
pub(crate) use signal::AliveGuard;
pub use signal::{Liveness, StopSignal};
