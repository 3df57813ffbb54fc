//! SocketCAN backend (Linux).
//!
//! - [`SocketCanTransport`]: blocking receive via `read_frame_timeout`.
//! - [`SocketCanPrimitive`]: non-blocking raw socket registered with a mio
//!   poller; each wakeup drains the socket into the ring. Remote and error
//!   frames are outside the decoded subset.
//!
//! Each path opens its own raw socket, so the kernel delivers every frame to
//! both. While parked, the transport socket carries a drop-all filter; on
//! resume it is drained and its configured filters are restored. Timestamps
//! are host clock (Unix seconds) taken when the frame is read.

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use ::socketcan::{
    CanAnyFrame, CanFdSocket, CanFilter as RawFilter, CanFrame, CanSocket, EmbeddedFrame, Id,
    Socket, SocketOptions,
};
use minstant::{Anchor, Instant};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::config::BusConfig;
use crate::error::{OpenError, PollError, Rejection, Unsupported};
use crate::frame::{CanId, Frame, FrameError};
use crate::sync::{FrameRing, StopSignal};
use crate::trace::{debug, trace, warn};
use crate::transport::{Backend, BusTransport, FastPrimitive};

const SOCKET: Token = Token(0);

/// Backend opening raw CAN sockets by interface name.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketCan;

impl Backend for SocketCan {
    type Transport = SocketCanTransport;
    type Primitive = SocketCanPrimitive;

    fn open_transport(&self, config: &BusConfig) -> Result<SocketCanTransport, OpenError> {
        let socket = RawSocket::open(config)?;
        debug!(channel = %config.channel, fd = config.fd, "transport socket open");
        Ok(SocketCanTransport {
            socket,
            filters: raw_filters(config),
            error_frames: config.error_frames,
            clock: Clock::new(),
        })
    }

    fn open_fast(&self, config: &BusConfig) -> Result<SocketCanPrimitive, OpenError> {
        if config.channel == "any" {
            // Interface index 0 cannot be registered per-device in the poller.
            return Err(Rejection::UnsupportedChannel(config.channel.clone()).into());
        }
        let socket = RawSocket::open(config)?;
        socket.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let fd = socket.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), SOCKET, Interest::READABLE)?;

        debug!(channel = %config.channel, "fast socket registered");
        Ok(SocketCanPrimitive {
            socket,
            poll,
            events: Events::with_capacity(4),
            poll_interval: config.fast.poll_interval,
            channel: config.channel.clone(),
            clock: Clock::new(),
        })
    }
}

/// Classic or FD raw socket, chosen by `BusConfig::fd`.
enum RawSocket {
    Classic(CanSocket),
    Fd(CanFdSocket),
}

impl RawSocket {
    fn open(config: &BusConfig) -> io::Result<Self> {
        let socket = if config.fd {
            Self::Fd(CanFdSocket::open(&config.channel)?)
        } else {
            Self::Classic(CanSocket::open(&config.channel)?)
        };
        socket.configure(config)?;
        Ok(socket)
    }

    fn configure(&self, config: &BusConfig) -> io::Result<()> {
        self.set_filters(&raw_filters(config), config.error_frames)?;
        match self {
            Self::Classic(s) => s.set_recv_own_msgs(config.receive_own_messages)?,
            Self::Fd(s) => s.set_recv_own_msgs(config.receive_own_messages)?,
        }

        if let Some(size) = config.recv_buffer_size {
            // SAFETY: the descriptor belongs to `self` and outlives this borrow.
            let fd = unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) };
            rustix::net::sockopt::set_socket_recv_buffer_size(fd, size)?;
        }
        Ok(())
    }

    /// Installs `filters` (accept all when empty) and the error mask.
    fn set_filters(&self, filters: &[RawFilter], error_frames: bool) -> io::Result<()> {
        match self {
            Self::Classic(s) => {
                if filters.is_empty() {
                    s.set_filter_accept_all()?;
                } else {
                    s.set_filters(filters)?;
                }
                if error_frames {
                    s.set_error_filter_accept_all()?;
                } else {
                    s.set_error_filter_drop_all()?;
                }
            }
            Self::Fd(s) => {
                if filters.is_empty() {
                    s.set_filter_accept_all()?;
                } else {
                    s.set_filters(filters)?;
                }
                if error_frames {
                    s.set_error_filter_accept_all()?;
                } else {
                    s.set_error_filter_drop_all()?;
                }
            }
        }
        Ok(())
    }

    fn drop_all(&self) -> io::Result<()> {
        match self {
            Self::Classic(s) => {
                s.set_filter_drop_all()?;
                s.set_error_filter_drop_all()
            }
            Self::Fd(s) => {
                s.set_filter_drop_all()?;
                s.set_error_filter_drop_all()
            }
        }
    }

    /// Discards everything already queued on the socket.
    fn discard_queued(&self) -> io::Result<usize> {
        self.set_nonblocking(true)?;
        let mut discarded = 0;
        let outcome = loop {
            match self.read() {
                Ok(_) => discarded += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(discarded),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.set_nonblocking(false)?;
        outcome
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Classic(s) => s.set_nonblocking(nonblocking),
            Self::Fd(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn read(&self) -> io::Result<RawFrame> {
        match self {
            Self::Classic(s) => s.read_frame().map(RawFrame::Classic),
            Self::Fd(s) => s.read_frame().map(RawFrame::Any),
        }
    }

    fn read_timeout(&self, timeout: Duration) -> io::Result<RawFrame> {
        match self {
            Self::Classic(s) => s.read_frame_timeout(timeout).map(RawFrame::Classic),
            Self::Fd(s) => s.read_frame_timeout(timeout).map(RawFrame::Any),
        }
    }

    fn as_raw_fd(&self) -> i32 {
        match self {
            Self::Classic(s) => s.as_raw_fd(),
            Self::Fd(s) => s.as_raw_fd(),
        }
    }
}

enum RawFrame {
    Classic(CanFrame),
    Any(CanAnyFrame),
}

impl RawFrame {
    /// Converts every frame shape; used by the blocking transport.
    fn decode_any(self, timestamp: f64) -> Result<Frame, FrameError> {
        match self {
            Self::Classic(CanFrame::Data(f)) | Self::Any(CanAnyFrame::Normal(f)) => {
                Frame::new(convert_id(f.id())?, f.data(), timestamp)
            }
            Self::Classic(CanFrame::Remote(f)) | Self::Any(CanAnyFrame::Remote(f)) => {
                Ok(Frame::remote(convert_id(f.id())?, timestamp))
            }
            Self::Classic(CanFrame::Error(f)) | Self::Any(CanAnyFrame::Error(f)) => {
                Frame::error(convert_id(f.id())?.as_raw(), f.data(), timestamp)
            }
            Self::Any(CanAnyFrame::Fd(f)) => Frame::new_fd(convert_id(f.id())?, f.data(), timestamp),
        }
    }

    /// Converts the data-frame subset; used by the fast primitive.
    fn decode_fast(self, timestamp: f64) -> Result<Frame, Unsupported> {
        match self {
            Self::Classic(CanFrame::Data(f)) | Self::Any(CanAnyFrame::Normal(f)) => {
                let malformed = |_| Unsupported::Malformed(f.data().len());
                Frame::new(convert_id(f.id()).map_err(malformed)?, f.data(), timestamp)
                    .map_err(malformed)
            }
            Self::Any(CanAnyFrame::Fd(f)) => {
                let malformed = |_| Unsupported::Malformed(f.data().len());
                Frame::new_fd(convert_id(f.id()).map_err(malformed)?, f.data(), timestamp)
                    .map_err(malformed)
            }
            Self::Classic(CanFrame::Remote(_)) | Self::Any(CanAnyFrame::Remote(_)) => {
                Err(Unsupported::RemoteFrame)
            }
            Self::Classic(CanFrame::Error(_)) | Self::Any(CanAnyFrame::Error(_)) => {
                Err(Unsupported::ErrorFrame)
            }
        }
    }
}

/// Prefixes `e` with the interface name, keeping its kind.
fn on_channel(channel: &str, e: io::Error) -> io::Error {
    io::Error::new(e.kind(), format!("{channel}: {e}"))
}

fn raw_filters(config: &BusConfig) -> Vec<RawFilter> {
    config
        .filters
        .iter()
        .map(|f| RawFilter::new(f.id, f.mask))
        .collect()
}

fn convert_id(id: Id) -> Result<CanId, FrameError> {
    match id {
        Id::Standard(id) => CanId::standard(id.as_raw()),
        Id::Extended(id) => CanId::extended(id.as_raw()),
    }
}

/// Host clock as Unix seconds, calibrated once per socket.
struct Clock {
    anchor: Anchor,
}

impl Clock {
    fn new() -> Self {
        Self {
            anchor: Anchor::new(),
        }
    }

    #[inline]
    fn now(&self) -> f64 {
        Instant::now().as_unix_nanos(&self.anchor) as f64 / 1e9
    }
}

/// Blocking receive on a raw CAN socket.
pub struct SocketCanTransport {
    socket: RawSocket,
    filters: Vec<RawFilter>,
    error_frames: bool,
    clock: Clock,
}

impl BusTransport for SocketCanTransport {
    fn blocking_receive(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        match self.socket.read_timeout(timeout) {
            Ok(raw) => raw
                .decode_any(self.clock.now())
                .map(Some)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn park(&mut self) -> io::Result<()> {
        self.socket.drop_all()
    }

    fn resume(&mut self) -> io::Result<()> {
        let discarded = self.socket.discard_queued()?;
        if discarded > 0 {
            debug!(discarded, "stale frames discarded on resume");
        }
        self.socket.set_filters(&self.filters, self.error_frames)
    }
}

/// Polling decoder on a non-blocking raw CAN socket.
pub struct SocketCanPrimitive {
    socket: RawSocket,
    poll: Poll,
    events: Events,
    poll_interval: Duration,
    channel: String,
    clock: Clock,
}

impl SocketCanPrimitive {
    /// Reads until the socket would block.
    fn drain(&mut self, ring: &FrameRing) -> Result<(), PollError> {
        loop {
            match self.socket.read() {
                Ok(raw) => {
                    let frame = raw.decode_fast(self.clock.now())?;
                    trace!(channel = %self.channel, frame = %frame, "fast rx");
                    ring.push(frame);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(rustix::io::Errno::NETDOWN.raw_os_error()) => {
                    warn!(channel = %self.channel, "interface down");
                    return Ok(());
                }
                Err(e) => return Err(PollError::Io(on_channel(&self.channel, e))),
            }
        }
    }
}

impl FastPrimitive for SocketCanPrimitive {
    fn poll_loop(&mut self, ring: &FrameRing, stop: &StopSignal) -> Result<(), PollError> {
        while !stop.is_raised() {
            match self.poll.poll(&mut self.events, Some(self.poll_interval)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PollError::Io(on_channel(&self.channel, e))),
            }
            if self.events.iter().any(|event| event.token() == SOCKET) {
                self.drain(ring)?;
            }
        }
        Ok(())
    }
}
