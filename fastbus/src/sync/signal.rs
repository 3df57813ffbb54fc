//! One-way flags shared between the poll thread and its owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Termination request for a poll loop.
///
/// Raising is idempotent and sticky: once raised, every current and future
/// check observes it. Poll loops must check it at least once per
/// [`poll_interval`](crate::FastPathConfig::poll_interval).
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination. Safe to call any number of times.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Read-only probe on whether a poll thread is running.
///
/// Clones share state, so a probe taken from a receiver keeps answering
/// after the receiver is dropped.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    /// A probe that reports not-alive forever.
    #[must_use]
    pub fn dead() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn new(alive: bool) -> Self {
        Self(Arc::new(AtomicBool::new(alive)))
    }

    pub(crate) fn set(&self, alive: bool) {
        self.0.store(alive, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Marks a [`Liveness`] dead when dropped, including during unwinding.
pub(crate) struct AliveGuard(pub(crate) Liveness);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
