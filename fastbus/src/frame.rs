//! Decoded CAN frames.
//!
//! A [`Frame`] is an immutable value: once built, its identifier, payload and
//! timestamp never change. Constructors validate the payload against the
//! frame flavour so that `data().len() == len()` always holds.

use std::fmt;

use thiserror::Error;

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_DLEN: usize = 8;

/// Maximum payload of a CAN FD frame.
pub const CANFD_MAX_DLEN: usize = 64;

/// Largest 11-bit identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;

/// Largest 29-bit identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Errors raised while building a [`Frame`] or [`CanId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Identifier does not fit the requested width.
    #[error("identifier 0x{id:x} exceeds 0x{max:x}")]
    IdOutOfRange { id: u32, max: u32 },
    /// Payload is longer than the frame flavour allows.
    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLong { len: usize, max: usize },
    /// Payload length is not one of the CAN FD length steps.
    #[error("{0} is not a valid CAN FD payload length")]
    InvalidFdLength(usize),
}

/// Arbitration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanId {
    /// 11-bit base frame format identifier.
    Standard(u16),
    /// 29-bit extended frame format identifier.
    Extended(u32),
}

impl CanId {
    /// Creates an 11-bit identifier.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::IdOutOfRange`] if `raw > 0x7FF`.
    pub const fn standard(raw: u16) -> Result<Self, FrameError> {
        if raw as u32 > STANDARD_ID_MAX {
            return Err(FrameError::IdOutOfRange {
                id: raw as u32,
                max: STANDARD_ID_MAX,
            });
        }
        Ok(Self::Standard(raw))
    }

    /// Creates a 29-bit identifier.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::IdOutOfRange`] if `raw > 0x1FFF_FFFF`.
    pub const fn extended(raw: u32) -> Result<Self, FrameError> {
        if raw > EXTENDED_ID_MAX {
            return Err(FrameError::IdOutOfRange {
                id: raw,
                max: EXTENDED_ID_MAX,
            });
        }
        Ok(Self::Extended(raw))
    }

    /// Raw identifier bits, without format flags.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Standard(id) => id as u32,
            Self::Extended(id) => id,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_extended(self) -> bool {
        matches!(self, Self::Extended(_))
    }
}

/// Picks the narrowest format that can carry `raw`.
impl TryFrom<u32> for CanId {
    type Error = FrameError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        if raw <= STANDARD_ID_MAX {
            Ok(Self::Standard(raw as u16))
        } else {
            Self::extended(raw)
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(id) => write!(f, "{id:03X}"),
            Self::Extended(id) => write!(f, "{id:08X}"),
        }
    }
}

/// What a frame carries on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    /// Remote transmission request; carries no payload.
    Remote,
    /// Controller error report.
    Error,
}

/// One decoded bus message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    id: CanId,
    kind: FrameKind,
    fd: bool,
    len: u8,
    /// Bytes past `len` are always zero.
    data: [u8; CANFD_MAX_DLEN],
    /// Seconds, monotonic per source.
    timestamp: f64,
}

impl Frame {
    /// Builds a classic data frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLong`] if `data` exceeds 8 bytes.
    pub fn new(id: CanId, data: &[u8], timestamp: f64) -> Result<Self, FrameError> {
        if data.len() > CAN_MAX_DLEN {
            return Err(FrameError::PayloadTooLong {
                len: data.len(),
                max: CAN_MAX_DLEN,
            });
        }
        Ok(Self::build(id, FrameKind::Data, false, data, timestamp))
    }

    /// Builds a CAN FD data frame.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is longer than 64 bytes or is not one of
    /// the FD length steps (0-8, 12, 16, 20, 24, 32, 48, 64).
    pub fn new_fd(id: CanId, data: &[u8], timestamp: f64) -> Result<Self, FrameError> {
        let len = data.len();
        if len > CANFD_MAX_DLEN {
            return Err(FrameError::PayloadTooLong {
                len,
                max: CANFD_MAX_DLEN,
            });
        }
        if !is_fd_length(len) {
            return Err(FrameError::InvalidFdLength(len));
        }
        Ok(Self::build(id, FrameKind::Data, true, data, timestamp))
    }

    /// Builds a remote transmission request.
    #[must_use]
    pub fn remote(id: CanId, timestamp: f64) -> Self {
        Self::build(id, FrameKind::Remote, false, &[], timestamp)
    }

    /// Builds an error frame. `class` is the error class mask.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLong`] if `data` exceeds 8 bytes.
    pub fn error(class: u32, data: &[u8], timestamp: f64) -> Result<Self, FrameError> {
        if data.len() > CAN_MAX_DLEN {
            return Err(FrameError::PayloadTooLong {
                len: data.len(),
                max: CAN_MAX_DLEN,
            });
        }
        let id = CanId::extended(class)?;
        Ok(Self::build(id, FrameKind::Error, false, data, timestamp))
    }

    fn build(id: CanId, kind: FrameKind, fd: bool, data: &[u8], timestamp: f64) -> Self {
        let mut payload = [0u8; CANFD_MAX_DLEN];
        payload[..data.len()].copy_from_slice(data);
        Self {
            id,
            kind,
            fd,
            len: data.len() as u8,
            data: payload,
            timestamp,
        }
    }

    /// Returns a copy of this frame stamped with `timestamp`.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> CanId {
        self.id
    }

    /// Raw arbitration identifier bits.
    #[inline]
    #[must_use]
    pub const fn arbitration_id(&self) -> u32 {
        self.id.as_raw()
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// Payload length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn timestamp(&self) -> f64 {
        self.timestamp
    }

    #[inline]
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.id.is_extended()
    }

    #[inline]
    #[must_use]
    pub const fn is_fd(&self) -> bool {
        self.fd
    }

    #[inline]
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self.kind, FrameKind::Remote)
    }

    #[inline]
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.kind, FrameKind::Error)
    }
}

/// Formats in candump's compact log syntax: `123#0102`, `123##0...` for FD,
/// `123#R` for remote requests.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#", self.id)?;
        if self.is_remote() {
            return f.write_str("R");
        }
        if self.fd {
            f.write_str("#0")?;
        }
        for byte in self.data() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Whether `len` is one of the payload sizes an FD length code can express.
const fn is_fd_length(len: usize) -> bool {
    matches!(len, 0..=8 | 12 | 16 | 20 | 24 | 32 | 48 | 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_frame_keeps_payload_and_timestamp() {
        let id = CanId::try_from(0x123).unwrap();
        let frame = Frame::new(id, &[1, 2, 3], 1.0).unwrap();

        assert_eq!(frame.arbitration_id(), 0x123);
        assert!(!frame.is_extended());
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert!((frame.timestamp() - 1.0).abs() < f64::EPSILON);
        assert_eq!(frame.kind(), FrameKind::Data);
    }

    #[test]
    fn classic_frame_rejects_long_payload() {
        let id = CanId::standard(0x10).unwrap();
        assert_eq!(
            Frame::new(id, &[0u8; 9], 0.0),
            Err(FrameError::PayloadTooLong { len: 9, max: 8 })
        );
    }

    #[test]
    fn fd_frame_accepts_only_length_steps() {
        let id = CanId::extended(0x1234_5678).unwrap();
        assert!(Frame::new_fd(id, &[0u8; 12], 0.0).unwrap().is_fd());
        assert!(Frame::new_fd(id, &[0u8; 64], 0.0).is_ok());
        assert_eq!(
            Frame::new_fd(id, &[0u8; 13], 0.0),
            Err(FrameError::InvalidFdLength(13))
        );
        assert!(matches!(
            Frame::new_fd(id, &[0u8; 65], 0.0),
            Err(FrameError::PayloadTooLong { len: 65, .. })
        ));
    }

    #[test]
    fn id_classification() {
        assert_eq!(CanId::try_from(0x7FF), Ok(CanId::Standard(0x7FF)));
        assert_eq!(CanId::try_from(0x800), Ok(CanId::Extended(0x800)));
        assert!(CanId::try_from(0x2000_0000).is_err());
        assert!(CanId::standard(0x800).is_err());
    }

    #[test]
    fn with_timestamp_leaves_original_untouched() {
        let id = CanId::standard(0x1).unwrap();
        let original = Frame::new(id, &[9], 0.5).unwrap();
        let stamped = original.with_timestamp(2.0);

        assert!((original.timestamp() - 0.5).abs() < f64::EPSILON);
        assert!((stamped.timestamp() - 2.0).abs() < f64::EPSILON);
        assert_eq!(stamped.data(), original.data());
    }

    #[test]
    fn display_uses_candump_syntax() {
        let std_id = CanId::standard(0x123).unwrap();
        let ext_id = CanId::extended(0x18DA_F110).unwrap();

        assert_eq!(Frame::new(std_id, &[1, 0xAB], 0.0).unwrap().to_string(), "123#01AB");
        assert_eq!(Frame::remote(std_id, 0.0).to_string(), "123#R");
        assert_eq!(Frame::new_fd(ext_id, &[0xFF], 0.0).unwrap().to_string(), "18DAF110##0FF");
    }
}
