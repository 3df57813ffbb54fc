//! Adaptive receiver: one `receive()` over two interchangeable paths.
//!
//! # State machine
//!
//! ```text
//!            dispatch::create
//!           /                \
//!   eligible + accepted     ineligible / rejected
//!         |                        |
//!       Fast ──unsupported──▶ Degraded (terminal)
//! ```
//!
//! In `Fast` mode `receive(Duration::ZERO)` pops the poll thread's ring and
//! never blocks. In `Degraded` mode `receive(timeout)` is the transport's
//! blocking receive. The switch happens at most once and is invisible in the
//! API: same signature, same result type, only latency changes.
//!
//! # Concurrency
//!
//! `AdaptiveReceiver` is `Send + Sync` and may be shared between threads.
//! The fast path sits in a mutex-guarded slot; the downgrade empties the slot
//! and flips the atomic mode flag while holding that mutex, so every call
//! either completes on the fast path before the switch or runs entirely on
//! the degraded path after it. The transport stays parked while the fast
//! path runs and is resumed inside the switch, so the degraded path never
//! replays frames the ring already delivered. Degraded callers are serialized on the
//! transport handle.
//!
//! # Failure routing
//!
//! | Fast-path observation | Result |
//! |-----------------------|--------|
//! | ring empty | `Ok(None)` |
//! | primitive reported unsupported | downgrade, `Ok(None)` for this call |
//! | poll loop panicked or quit unasked | `Err(ReceiveError::Fast)` on every fast call |
//! | poll thread saw process shutdown | `Ok(None)` once drained; no downgrade |
//! | poll thread I/O error | `Err(ReceiveError::Fast)` on every fast call |

pub mod dispatch;
pub mod fast;

mod degraded;

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use crate::config::BusConfig;
use crate::error::{DegradeCause, OpenError, ReceiveError, Unsupported};
use crate::frame::Frame;
use crate::sync::Liveness;
use crate::trace::{debug, warn};
use crate::transport::{Backend, BusTransport};

use degraded::DegradedPath;
use fast::{FastPath, Fault};

const MODE_FAST: u8 = 0;
const MODE_DEGRADED: u8 = 1;

/// Which path currently services `receive()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverMode {
    Fast,
    Degraded,
}

/// Snapshot of a receiver's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Calls that consulted the fast path.
    pub fast_polls: u64,
    /// Frames delivered from the ring.
    pub fast_frames: u64,
    /// Calls serviced by the transport.
    pub degraded_calls: u64,
    /// Frames delivered by the transport.
    pub degraded_frames: u64,
    /// Frames lost to ring overflow or discarded at downgrade.
    pub overflow_drops: u64,
    /// 0 or 1.
    pub downgrades: u64,
}

#[derive(Default)]
struct Counters {
    fast_polls: AtomicU64,
    fast_frames: AtomicU64,
    degraded_calls: AtomicU64,
    degraded_frames: AtomicU64,
    /// Drops accounted from fast paths that no longer exist.
    retired_drops: AtomicU64,
    downgrades: AtomicU64,
}

/// Outcome of consulting the fast slot.
enum FastAttempt {
    Served(Option<Frame>),
    /// The slot is empty; use the degraded path.
    Degraded,
}

/// CAN receiver that prefers a polling fast path and falls back to blocking
/// receive.
///
/// Build one with [`AdaptiveReceiver::open`] (or [`dispatch::create`]).
/// Dropping the receiver stops and joins the poll thread before the
/// transport handle is closed.
pub struct AdaptiveReceiver {
    mode: AtomicU8,
    /// `Some` exactly while in fast mode.
    fast: Mutex<Option<FastPath>>,
    degraded: DegradedPath,
    cause: OnceLock<DegradeCause>,
    liveness: Liveness,
    counters: Counters,
    config: BusConfig,
}

impl AdaptiveReceiver {
    /// Opens a receiver, choosing the path from `config`'s eligibility.
    ///
    /// # Errors
    ///
    /// See [`dispatch::create`].
    pub fn open<B: Backend>(backend: &B, config: BusConfig) -> Result<Self, OpenError> {
        dispatch::create(backend, config)
    }

    pub(crate) fn new_fast(
        config: BusConfig,
        transport: Box<dyn BusTransport>,
        fast: FastPath,
    ) -> Self {
        Self {
            mode: AtomicU8::new(MODE_FAST),
            liveness: fast.liveness(),
            fast: Mutex::new(Some(fast)),
            degraded: DegradedPath::new(transport),
            cause: OnceLock::new(),
            counters: Counters::default(),
            config,
        }
    }

    pub(crate) fn new_degraded(
        config: BusConfig,
        transport: Box<dyn BusTransport>,
        cause: DegradeCause,
    ) -> Self {
        Self {
            mode: AtomicU8::new(MODE_DEGRADED),
            fast: Mutex::new(None),
            degraded: DegradedPath::new(transport),
            cause: OnceLock::from(cause),
            liveness: Liveness::dead(),
            counters: Counters::default(),
            config,
        }
    }

    /// Receives the next frame.
    ///
    /// In fast mode `timeout` must be zero and the call never blocks. In
    /// degraded mode the call blocks for at most `timeout`. `Ok(None)` means
    /// no frame was available in time.
    ///
    /// # Errors
    ///
    /// - [`ReceiveError::TimeoutUnsupported`] for a positive timeout in fast
    ///   mode. The mode is left unchanged.
    /// - [`ReceiveError::Fast`] if the poll thread died with an I/O error.
    /// - [`ReceiveError::Transport`] if the blocking receive fails.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Frame>, ReceiveError> {
        if self.mode() == ReceiverMode::Fast {
            if let FastAttempt::Served(frame) = self.poll_fast(timeout)? {
                return Ok(frame);
            }
        }
        self.receive_degraded(timeout)
    }

    /// Pops the fast-path ring directly.
    ///
    /// # Errors
    ///
    /// [`ReceiveError::NotSupported`] once the receiver is degraded, and
    /// [`ReceiveError::Fast`] if the poll thread died with an I/O error.
    pub fn fast_receive(&self) -> Result<Option<Frame>, ReceiveError> {
        if self.mode() == ReceiverMode::Fast {
            if let FastAttempt::Served(frame) = self.poll_fast(Duration::ZERO)? {
                return Ok(frame);
            }
        }
        Err(self.not_supported())
    }

    /// Starts a poll thread that was deferred at construction.
    ///
    /// Does nothing if it is already running.
    ///
    /// # Errors
    ///
    /// [`ReceiveError::NotSupported`] once the receiver is degraded, and
    /// [`ReceiveError::Fast`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<(), ReceiveError> {
        let mut slot = self.lock_fast();
        match slot.as_mut() {
            Some(fast) => fast.start().map_err(|e| ReceiveError::Fast(Arc::new(e))),
            None => Err(self.not_supported()),
        }
    }

    #[inline]
    #[must_use]
    pub fn mode(&self) -> ReceiverMode {
        match self.mode.load(Ordering::Acquire) {
            MODE_FAST => ReceiverMode::Fast,
            _ => ReceiverMode::Degraded,
        }
    }

    /// Why the receiver is degraded, or `None` while in fast mode.
    #[must_use]
    pub fn degrade_cause(&self) -> Option<&DegradeCause> {
        self.cause.get()
    }

    /// Probe on the poll thread. Always not-alive for receivers built in
    /// degraded mode.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> ReceiverStats {
        let live_drops = self.lock_fast().as_ref().map_or(0, FastPath::dropped);
        let c = &self.counters;
        ReceiverStats {
            fast_polls: c.fast_polls.load(Ordering::Relaxed),
            fast_frames: c.fast_frames.load(Ordering::Relaxed),
            degraded_calls: c.degraded_calls.load(Ordering::Relaxed),
            degraded_frames: c.degraded_frames.load(Ordering::Relaxed),
            overflow_drops: c.retired_drops.load(Ordering::Relaxed) + live_drops,
            downgrades: c.downgrades.load(Ordering::Relaxed),
        }
    }

    /// Stops the poll thread, then closes the transport.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn poll_fast(&self, timeout: Duration) -> Result<FastAttempt, ReceiveError> {
        let mut slot = self.lock_fast();
        let fault = match slot.as_ref() {
            Some(fast) => fast.fault(),
            None => return Ok(FastAttempt::Degraded),
        };
        if !timeout.is_zero() {
            return Err(ReceiveError::TimeoutUnsupported { requested: timeout });
        }
        self.counters.fast_polls.fetch_add(1, Ordering::Relaxed);

        match fault {
            None => {}
            Some(Fault::Unsupported(reason)) => {
                warn!(
                    channel = %self.config.channel,
                    reason = %reason,
                    "fast path disabled, falling back to blocking receive"
                );
                let _ = self.cause.set(DegradeCause::Unsupported(reason));
                let retired = slot.take();
                // No degraded caller can hold the transport before the mode flips.
                let resumed = self.degraded.resume();
                self.mode.store(MODE_DEGRADED, Ordering::Release);
                drop(slot);

                self.counters.downgrades.fetch_add(1, Ordering::Relaxed);
                if let Some(fast) = retired {
                    self.retire(fast);
                }
                if let Err(e) = resumed {
                    warn!(channel = %self.config.channel, error = %e, "failed to resume transport");
                    return Err(ReceiveError::Transport(e));
                }
                return Ok(FastAttempt::Served(None));
            }
            Some(Fault::Io(e)) => return Err(ReceiveError::Fast(e)),
        }

        let frame = slot.as_ref().and_then(FastPath::try_take);
        if frame.is_some() {
            self.counters.fast_frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(FastAttempt::Served(frame))
    }

    /// Stops a fast path that has left the slot and folds in its drop count.
    fn retire(&self, mut fast: FastPath) {
        fast.stop();
        let discarded = fast.discard() as u64;
        self.counters
            .retired_drops
            .fetch_add(fast.dropped() + discarded, Ordering::Relaxed);
        debug!(
            channel = %self.config.channel,
            discarded,
            "fast path released"
        );
    }

    fn receive_degraded(&self, timeout: Duration) -> Result<Option<Frame>, ReceiveError> {
        self.counters.degraded_calls.fetch_add(1, Ordering::Relaxed);
        let frame = self.degraded.receive(timeout)?;
        if frame.is_some() {
            self.counters.degraded_frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(frame)
    }

    fn not_supported(&self) -> ReceiveError {
        let cause = self.cause.get().cloned().unwrap_or_else(|| {
            DegradeCause::Unsupported(Unsupported::Other("fast path released".to_owned()))
        });
        ReceiveError::NotSupported { cause }
    }

    fn lock_fast(&self) -> MutexGuard<'_, Option<FastPath>> {
        self.fast.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&mut self) {
        let fast = self
            .fast
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut fast) = fast {
            debug!(channel = %self.config.channel, "stopping poll thread");
            fast.stop();
        }
    }
}

impl Drop for AdaptiveReceiver {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FastPathConfig;
    use crate::error::Rejection;
    use crate::frame::CanId;
    use crate::sim::SimBus;

    fn frame(id: u16, data: &[u8]) -> Frame {
        Frame::new(CanId::standard(id).unwrap(), data, 1.0).unwrap()
    }

    /// Spins `receive(0)` until a frame shows up or five seconds pass.
    fn receive_soon(rx: &AdaptiveReceiver) -> Option<Frame> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if let Some(frame) = rx.receive(Duration::ZERO).unwrap() {
                return Some(frame);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        None
    }

    fn wait_dead(probe: &Liveness) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while probe.is_alive() {
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn receiver_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AdaptiveReceiver>();
    }

    #[test]
    fn positive_timeout_rejected_in_fast_mode() {
        let bus = SimBus::new("vcan0");
        let rx = AdaptiveReceiver::open(&bus, BusConfig::new("vcan0")).unwrap();

        let err = rx.receive(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::TimeoutUnsupported { requested } if requested == Duration::from_millis(10)
        ));
        assert_eq!(rx.mode(), ReceiverMode::Fast);
        assert!(rx.degrade_cause().is_none());
    }

    #[test]
    fn fast_only_operations_fail_after_downgrade() {
        let bus = SimBus::new("vcan0");
        let rx = AdaptiveReceiver::open(&bus, BusConfig::new("vcan0")).unwrap();
        let probe = rx.liveness();

        bus.inject(Frame::remote(CanId::standard(0x10).unwrap(), 0.0));
        assert!(wait_dead(&probe));
        assert_eq!(rx.fast_receive().unwrap(), None);
        assert_eq!(rx.mode(), ReceiverMode::Degraded);

        assert!(matches!(
            rx.fast_receive(),
            Err(ReceiveError::NotSupported {
                cause: DegradeCause::Unsupported(Unsupported::RemoteFrame)
            })
        ));
        assert!(matches!(rx.start(), Err(ReceiveError::NotSupported { .. })));
    }

    #[test]
    fn degraded_from_construction_reports_ineligibility() {
        let bus = SimBus::new("vcan0");
        let mut config = BusConfig::new("vcan0");
        config.receive_own_messages = true;
        let rx = AdaptiveReceiver::open(&bus, config).unwrap();

        assert_eq!(rx.mode(), ReceiverMode::Degraded);
        assert_eq!(
            rx.degrade_cause(),
            Some(&DegradeCause::Ineligible(Rejection::UnsupportedOption(
                "receive_own_messages"
            )))
        );
        assert!(matches!(
            rx.fast_receive(),
            Err(ReceiveError::NotSupported { .. })
        ));
        assert_eq!(bus.fast_opens(), 0);
    }

    #[test]
    fn deferred_start_buffers_nothing_until_started() {
        let bus = SimBus::new("vcan0");
        let config = BusConfig::new("vcan0").with_fast(FastPathConfig {
            defer_start: true,
            ..FastPathConfig::default()
        });
        let rx = AdaptiveReceiver::open(&bus, config).unwrap();
        assert_eq!(rx.mode(), ReceiverMode::Fast);
        assert!(!rx.is_alive());

        bus.inject(frame(0x42, &[0xAA]));
        assert_eq!(rx.receive(Duration::ZERO).unwrap(), None);

        rx.start().unwrap();
        rx.start().unwrap();
        assert!(rx.is_alive());
        assert_eq!(receive_soon(&rx), Some(frame(0x42, &[0xAA])));
    }

    #[test]
    fn io_fault_propagates_without_downgrade() {
        let bus = SimBus::new("vcan0");
        let rx = AdaptiveReceiver::open(&bus, BusConfig::new("vcan0")).unwrap();
        let probe = rx.liveness();

        bus.inject_fault(std::io::ErrorKind::BrokenPipe);
        assert!(wait_dead(&probe));

        let err = rx.receive(Duration::ZERO).unwrap_err();
        assert!(matches!(err, ReceiveError::Fast(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));
        assert_eq!(rx.mode(), ReceiverMode::Fast);
        assert!(rx.receive(Duration::ZERO).is_err());
    }

    #[test]
    fn stats_track_both_paths() {
        let bus = SimBus::new("vcan0");
        let rx = AdaptiveReceiver::open(&bus, BusConfig::new("vcan0")).unwrap();

        bus.inject(frame(1, &[1]));
        assert!(receive_soon(&rx).is_some());
        bus.inject(Frame::remote(CanId::standard(2).unwrap(), 0.0));
        assert!(wait_dead(&rx.liveness()));
        assert_eq!(rx.receive(Duration::ZERO).unwrap(), None);

        bus.inject(frame(3, &[3]));
        assert!(rx.receive(Duration::from_millis(500)).unwrap().is_some());

        let stats = rx.stats();
        assert_eq!(stats.fast_frames, 1);
        assert_eq!(stats.degraded_frames, 1);
        assert_eq!(stats.degraded_calls, 1);
        assert_eq!(stats.downgrades, 1);
        assert!(stats.fast_polls >= 2);
    }
}
