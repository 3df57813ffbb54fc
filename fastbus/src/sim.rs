//! In-memory virtual bus.
//!
//! [`SimBus`] plays the role `vcan` plays for SocketCAN: frames injected on
//! the bus are read by whichever path is active, with no hardware involved.
//! It implements [`Backend`], so it drives an
//! [`AdaptiveReceiver`](crate::AdaptiveReceiver) exactly like a real device.
//!
//! Like raw CAN sockets, every open transport and primitive has its own
//! queue and gets its own copy of each frame sent after it opened. A parked
//! transport gets nothing.
//!
//! The sim fast primitive decodes data frames only. Remote and error frames
//! are outside its subset and end the poll loop with
//! [`PollError::Unsupported`]; FD frames are decoded only when the
//! configuration enables FD. The sim transport accepts every frame shape.
//!
//! ```
//! use std::time::Duration;
//! use fastbus::{AdaptiveReceiver, BusConfig, CanId, Frame, ReceiverMode};
//! use fastbus::sim::SimBus;
//!
//! let bus = SimBus::new("vcan0");
//! let rx = AdaptiveReceiver::open(&bus, BusConfig::new("vcan0")).unwrap();
//! assert_eq!(rx.mode(), ReceiverMode::Fast);
//!
//! bus.inject(Frame::new(CanId::standard(0x123).unwrap(), &[1, 2, 3], 1.0).unwrap());
//! let frame = loop {
//!     if let Some(frame) = rx.receive(Duration::ZERO).unwrap() {
//!         break frame;
//!     }
//! };
//! assert_eq!(frame.data(), &[1, 2, 3]);
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use minstant::Instant;

use crate::config::BusConfig;
use crate::error::{OpenError, PollError, Rejection, Unsupported};
use crate::frame::Frame;
use crate::sync::{FrameRing, StopSignal};
use crate::trace::trace;
use crate::transport::{Backend, BusTransport, FastPrimitive};

/// Something travelling on the simulated wire.
#[derive(Debug, Clone)]
enum WireEvent {
    Frame(Frame),
    /// Whoever reads this fails with an I/O error of this kind.
    Fault(io::ErrorKind),
}

/// One reader's queue. Dropped readers are pruned on the next send.
struct Tap {
    tx: Sender<WireEvent>,
    accepting: Arc<AtomicBool>,
}

struct SimInner {
    channel: String,
    taps: Mutex<Vec<Tap>>,
    /// Process-wide shutdown as seen by poll loops.
    exiting: AtomicBool,
    fast_rejection: Mutex<Option<Rejection>>,
    epoch: Instant,
    fast_opens: AtomicU64,
    transport_opens: AtomicU64,
    fast_iterations: AtomicU64,
}

/// Cloneable handle to a virtual bus.
#[derive(Clone)]
pub struct SimBus {
    inner: Arc<SimInner>,
}

impl SimBus {
    /// Creates a bus that serves only `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                channel: channel.into(),
                taps: Mutex::new(Vec::new()),
                exiting: AtomicBool::new(false),
                fast_rejection: Mutex::new(None),
                epoch: Instant::now(),
                fast_opens: AtomicU64::new(0),
                transport_opens: AtomicU64::new(0),
                fast_iterations: AtomicU64::new(0),
            }),
        }
    }

    /// Makes future `open_fast` calls fail with `rejection`.
    #[must_use]
    pub fn reject_fast(self, rejection: Rejection) -> Self {
        *self
            .inner
            .fast_rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(rejection);
        self
    }

    /// Puts `frame` on the wire unchanged.
    pub fn inject(&self, frame: Frame) {
        self.broadcast(&WireEvent::Frame(frame));
    }

    /// Puts a frame on the wire stamped with the bus clock.
    pub fn send(&self, frame: Frame) {
        self.inject(frame.with_timestamp(self.now()));
    }

    /// Makes every current reader fail with an I/O error of `kind`.
    pub fn inject_fault(&self, kind: io::ErrorKind) {
        self.broadcast(&WireEvent::Fault(kind));
    }

    /// Simulates process termination as observed by poll loops.
    pub fn shutdown(&self) {
        self.inner.exiting.store(true, Ordering::Release);
    }

    /// Seconds since the bus was created.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.inner.epoch.elapsed().as_secs_f64()
    }

    /// Frames and faults queued for readers and not yet read, summed over
    /// all readers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_taps().iter().map(|tap| tap.tx.len()).sum()
    }

    /// How many fast primitives were opened.
    #[must_use]
    pub fn fast_opens(&self) -> u64 {
        self.inner.fast_opens.load(Ordering::Relaxed)
    }

    /// How many transports were opened.
    #[must_use]
    pub fn transport_opens(&self) -> u64 {
        self.inner.transport_opens.load(Ordering::Relaxed)
    }

    /// Total poll-loop iterations across all sim primitives.
    #[must_use]
    pub fn fast_iterations(&self) -> u64 {
        self.inner.fast_iterations.load(Ordering::Relaxed)
    }

    fn broadcast(&self, event: &WireEvent) {
        self.lock_taps().retain(|tap| {
            // The reader holds the only other handle to `accepting`.
            if Arc::strong_count(&tap.accepting) == 1 {
                return false;
            }
            !tap.accepting.load(Ordering::Acquire) || tap.tx.send(event.clone()).is_ok()
        });
    }

    fn subscribe(&self) -> (Receiver<WireEvent>, Arc<AtomicBool>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let accepting = Arc::new(AtomicBool::new(true));
        self.lock_taps().push(Tap {
            tx,
            accepting: Arc::clone(&accepting),
        });
        (rx, accepting)
    }

    fn lock_taps(&self) -> MutexGuard<'_, Vec<Tap>> {
        self.inner.taps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_channel(&self, config: &BusConfig) -> Result<(), OpenError> {
        if config.channel == self.inner.channel {
            Ok(())
        } else {
            Err(OpenError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such channel: {}", config.channel),
            )))
        }
    }
}
impl Backend for SimBus {
    type Transport = SimTransport;
    type Primitive = SimPrimitive;

    fn open_transport(&self, config: &BusConfig) -> Result<SimTransport, OpenError> {
        self.check_channel(config)?;
        self.inner.transport_opens.fetch_add(1, Ordering::Relaxed);
        let (rx, accepting) = self.subscribe();
        Ok(SimTransport {
            rx,
            accepting,
            config: config.clone(),
        })
    }

    fn open_fast(&self, config: &BusConfig) -> Result<SimPrimitive, OpenError> {
        self.check_channel(config)?;
        let rejection = self
            .inner
            .fast_rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(rejection) = rejection {
            return Err(OpenError::Rejected(rejection));
        }
        self.inner.fast_opens.fetch_add(1, Ordering::Relaxed);
        let (rx, registered) = self.subscribe();
        Ok(SimPrimitive {
            bus: self.clone(),
            rx,
            _registered: registered,
            config: config.clone(),
        })
    }
}

/// Blocking transport over a [`SimBus`].
pub struct SimTransport {
    rx: Receiver<WireEvent>,
    accepting: Arc<AtomicBool>,
    config: BusConfig,
}

impl BusTransport for SimTransport {
    fn blocking_receive(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = remaining(deadline);
            match self.rx.recv_timeout(wait) {
                Ok(WireEvent::Frame(frame)) => {
                    if frame.is_fd() && !self.config.fd {
                        trace!(id = frame.arbitration_id(), "classic transport skipped FD frame");
                        continue;
                    }
                    if self.config.accepts(&frame) {
                        return Ok(Some(frame));
                    }
                }
                Ok(WireEvent::Fault(kind)) => {
                    return Err(io::Error::new(kind, "injected transport fault"));
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn park(&mut self) -> io::Result<()> {
        self.accepting.store(false, Ordering::Release);
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        self.rx.try_iter().for_each(drop);
        self.accepting.store(true, Ordering::Release);
        Ok(())
    }
}

/// Fast primitive over a [`SimBus`].
pub struct SimPrimitive {
    bus: SimBus,
    rx: Receiver<WireEvent>,
    /// Keeps this reader's tap registered.
    _registered: Arc<AtomicBool>,
    config: BusConfig,
}

impl SimPrimitive {
    fn decode(&self, frame: Frame) -> Result<Option<Frame>, Unsupported> {
        if frame.is_remote() {
            return Err(Unsupported::RemoteFrame);
        }
        if frame.is_error() {
            return Err(Unsupported::ErrorFrame);
        }
        if frame.is_fd() && !self.config.fd {
            return Err(Unsupported::FdFrame);
        }
        Ok(self.config.accepts(&frame).then_some(frame))
    }
}

impl FastPrimitive for SimPrimitive {
    fn poll_loop(&mut self, ring: &FrameRing, stop: &StopSignal) -> Result<(), PollError> {
        let inner = &self.bus.inner;
        while !stop.is_raised() {
            if inner.exiting.load(Ordering::Acquire) {
                return Err(PollError::Shutdown);
            }
            inner.fast_iterations.fetch_add(1, Ordering::Relaxed);

            match self.rx.recv_timeout(self.config.fast.poll_interval) {
                Ok(WireEvent::Frame(frame)) => {
                    if let Some(frame) = self.decode(frame)? {
                        ring.push(frame);
                    }
                }
                Ok(WireEvent::Fault(kind)) => {
                    return Err(PollError::Io(io::Error::new(kind, "injected poll fault")));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(PollError::Shutdown),
            }
        }
        Ok(())
    }
}

/// Time left until `deadline`, zero if it has passed.
fn remaining(deadline: Instant) -> Duration {
    let now = Instant::now();
    if now >= deadline {
        Duration::ZERO
    } else {
        deadline.duration_since(now)
    }
}
