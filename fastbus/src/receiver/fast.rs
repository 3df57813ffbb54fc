//! Fast path: poll thread lifecycle and ring buffer.
//!
//! The poll thread runs a [`FastPrimitive`] until the [`StopSignal`] is
//! raised or the primitive returns. Whatever made it return is recorded as a
//! [`Fault`] before the liveness flag drops, so an owner that sees the thread
//! dead always sees why. A panicking primitive, or one that returns `Ok(())`
//! without being asked to stop, is recorded as a fatal I/O fault.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use core_affinity::CoreId;

use crate::config::FastPathConfig;
use crate::error::{PollError, Unsupported};
use crate::frame::Frame;
use crate::sync::{AliveGuard, FrameRing, Liveness, StopSignal};
use crate::trace::{debug, error, info, warn};
use crate::transport::FastPrimitive;

/// Reason a poll loop ended that its owner has to act on.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Downgrade trigger.
    Unsupported(Unsupported),
    /// Propagated to callers.
    Io(Arc<io::Error>),
}

/// Write-once fault cell with a lock-free "is anything there" check.
#[derive(Default)]
struct FaultSlot {
    raised: AtomicBool,
    fault: Mutex<Option<Fault>>,
}

impl FaultSlot {
    fn record(&self, fault: Fault) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(fault);
            self.raised.store(true, Ordering::Release);
        }
    }

    #[inline]
    fn peek(&self) -> Option<Fault> {
        if !self.raised.load(Ordering::Acquire) {
            return None;
        }
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Owns the poll thread and the ring it fills.
///
/// Dropping a `FastPath` stops and joins its thread.
pub struct FastPath {
    ring: Arc<FrameRing>,
    stop: StopSignal,
    liveness: Liveness,
    fault: Arc<FaultSlot>,
    /// Primitive waiting for `start()`; `None` once started or stopped.
    pending: Option<Box<dyn FastPrimitive>>,
    handle: Option<JoinHandle<()>>,
    thread_name: String,
    pin_core: Option<usize>,
}

impl FastPath {
    /// Allocates the ring and wraps `primitive` without starting a thread.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity == 0`.
    pub(crate) fn new(
        primitive: Box<dyn FastPrimitive>,
        config: &FastPathConfig,
        channel: &str,
    ) -> Self {
        Self {
            ring: Arc::new(FrameRing::new(config.capacity, config.overflow)),
            stop: StopSignal::new(),
            liveness: Liveness::new(false),
            fault: Arc::new(FaultSlot::default()),
            pending: Some(primitive),
            handle: None,
            thread_name: format!("fastbus-poll-{channel}"),
            pin_core: config.pin_core,
        }
    }

    /// Spawns the poll thread.
    ///
    /// Does nothing if the thread was already started or the path was
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn start(&mut self) -> io::Result<()> {
        if self.stop.is_raised() {
            return Ok(());
        }
        let Some(primitive) = self.pending.take() else {
            return Ok(());
        };

        let ring = Arc::clone(&self.ring);
        let stop = self.stop.clone();
        let fault = Arc::clone(&self.fault);
        let liveness = self.liveness.clone();
        let pin_core = self.pin_core;

        debug!(thread = %self.thread_name, "spawning poll thread");
        self.liveness.set(true);
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_poll_thread(primitive, &ring, &stop, &fault, liveness, pin_core));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.liveness.set(false);
                error!(thread = %self.thread_name, error = %e, "failed to spawn poll thread");
                Err(e)
            }
        }
    }

    /// Signals the poll thread to exit and waits for it.
    ///
    /// Idempotent. A path that was never started just drops its primitive.
    pub fn stop(&mut self) {
        self.stop.raise();
        self.pending = None;
        if let Some(handle) = self.handle.take() {
            debug!(thread = %self.thread_name, "waiting for poll thread to exit");
            if handle.join().is_err() {
                warn!(thread = %self.thread_name, "poll thread panicked");
            }
        }
    }

    /// Takes the oldest buffered frame. Never blocks.
    #[inline]
    #[must_use]
    pub fn try_take(&self) -> Option<Frame> {
        self.ring.pop()
    }

    /// Discards buffered frames, returning how many were dropped.
    pub fn discard(&self) -> usize {
        self.ring.clear()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// A probe that keeps reporting after this path is dropped.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Frames lost to ring overflow so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }

    #[inline]
    pub(crate) fn fault(&self) -> Option<Fault> {
        self.fault.peek()
    }
}

impl Drop for FastPath {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the poll thread.
fn run_poll_thread(
    mut primitive: Box<dyn FastPrimitive>,
    ring: &FrameRing,
    stop: &StopSignal,
    fault: &FaultSlot,
    liveness: Liveness,
    pin_core: Option<usize>,
) {
    // Declared first so it drops last: the fault is visible before liveness clears.
    let _alive = AliveGuard(liveness);

    if let Some(core) = pin_core {
        if pin_to_core(core) {
            debug!(core, "poll thread pinned");
        } else {
            warn!(core, "failed to pin poll thread, running unpinned");
        }
    }

    info!("poll thread started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| primitive.poll_loop(ring, stop)));
    match outcome {
        Ok(Ok(())) if stop.is_raised() => {
            info!("poll thread stopped on request");
        }
        Ok(Ok(())) => {
            error!("poll loop returned without a stop request");
            fault.record(Fault::Io(Arc::new(io::Error::other(
                "poll loop returned without a stop request",
            ))));
        }
        Ok(Err(PollError::Shutdown)) => {
            debug!("poll thread observed process shutdown");
        }
        Ok(Err(PollError::Unsupported(reason))) => {
            warn!(reason = %reason, "fast primitive hit an unsupported condition");
            fault.record(Fault::Unsupported(reason));
        }
        Ok(Err(PollError::Io(e))) => {
            error!(error = %e, "poll thread failed");
            fault.record(Fault::Io(Arc::new(e)));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "poll loop panicked");
            fault.record(Fault::Io(Arc::new(io::Error::other(format!(
                "poll loop panicked: {message}"
            )))));
        }
    }
    info!("poll thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Pins the current thread to a specific core.
///
/// Returns `false` if the core ID is invalid or the OS refuses.
fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}
