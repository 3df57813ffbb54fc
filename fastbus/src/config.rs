//! Bus and fast-path configuration.
//!
//! [`BusConfig`] has the same shape a plain blocking receiver takes (channel,
//! bitrate, filters) plus a [`FastPathConfig`] section, so a config file
//! written for a blocking receiver loads unchanged. The fast-path eligibility
//! predicate lives here because it depends on nothing but these values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Rejection;
use crate::frame::Frame;

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_CHANNEL_NAME_LEN: usize = 15;

/// Most acceptance filters a raw CAN socket accepts (`CAN_RAW_FILTER_MAX`).
pub const MAX_FILTERS: usize = 512;

/// Default ring buffer capacity, in frames.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// Default bound on how long one poll-loop wait may block.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Acceptance filter: a frame passes when `frame_id & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
}

impl CanFilter {
    #[must_use]
    pub const fn new(id: u32, mask: u32) -> Self {
        Self { id, mask }
    }

    #[inline]
    #[must_use]
    pub const fn matches(&self, frame: &Frame) -> bool {
        frame.arbitration_id() & self.mask == self.id & self.mask
    }
}

/// What the ring buffer does when a frame arrives and it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered frame so the newest is kept.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Fast-path tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    /// Attempt the fast path at all.
    pub enabled: bool,
    /// Ring buffer capacity in frames.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Build the poll thread but wait for an explicit `start()`.
    pub defer_start: bool,
    /// Upper bound on a single wait inside the poll loop. This is also the
    /// worst-case latency of `stop()`.
    pub poll_interval: Duration,
    /// Pin the poll thread to this core.
    pub pin_core: Option<usize>,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_RING_CAPACITY,
            overflow: OverflowPolicy::default(),
            defer_start: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pin_core: None,
        }
    }
}

/// Connection parameters for a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Interface name, e.g. `can0` or `vcan0`.
    pub channel: String,
    /// Nominal bitrate in bit/s. Informational; interface bitrate is set
    /// by the system (`ip link`), not by the receiver.
    pub bitrate: Option<u32>,
    pub filters: Vec<CanFilter>,
    /// Accept CAN FD frames.
    pub fd: bool,
    /// Deliver frames sent by this host back to it.
    pub receive_own_messages: bool,
    /// Subscribe to controller error frames.
    pub error_frames: bool,
    /// Kernel socket receive buffer size in bytes.
    pub recv_buffer_size: Option<usize>,
    pub fast: FastPathConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: "vcan0".to_owned(),
            bitrate: None,
            filters: Vec::new(),
            fd: false,
            receive_own_messages: false,
            error_frames: false,
            recv_buffer_size: None,
            fast: FastPathConfig::default(),
        }
    }
}

impl BusConfig {
    /// Creates a configuration for `channel` with default options.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: impl IntoIterator<Item = CanFilter>) -> Self {
        self.filters = filters.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_fd(mut self, fd: bool) -> Self {
        self.fd = fd;
        self
    }

    #[must_use]
    pub fn with_fast(mut self, fast: FastPathConfig) -> Self {
        self.fast = fast;
        self
    }

    /// Whether a frame passes the acceptance filters. No filters means
    /// everything passes.
    #[must_use]
    pub fn accepts(&self, frame: &Frame) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(frame))
    }

    /// Checks whether these parameters may be served by the fast path.
    ///
    /// Pure: looks only at `self`, touches no device.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] found.
    pub fn fast_eligibility(&self) -> Result<(), Rejection> {
        if !self.fast.enabled {
            return Err(Rejection::Disabled);
        }
        if self.channel.is_empty() || self.channel.len() > MAX_CHANNEL_NAME_LEN {
            return Err(Rejection::InvalidChannel(self.channel.clone()));
        }
        if self.receive_own_messages {
            return Err(Rejection::UnsupportedOption("receive_own_messages"));
        }
        if self.error_frames {
            return Err(Rejection::UnsupportedOption("error_frames"));
        }
        if self.filters.len() > MAX_FILTERS {
            return Err(Rejection::TooManyFilters {
                count: self.filters.len(),
                max: MAX_FILTERS,
            });
        }
        if self.fast.capacity == 0 {
            return Err(Rejection::ZeroCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanId;

    #[test]
    fn default_config_is_eligible() {
        assert_eq!(BusConfig::new("can0").fast_eligibility(), Ok(()));
    }

    #[test]
    fn eligibility_rejections() {
        let mut disabled = BusConfig::new("can0");
        disabled.fast.enabled = false;
        assert_eq!(disabled.fast_eligibility(), Err(Rejection::Disabled));

        assert_eq!(
            BusConfig::new("").fast_eligibility(),
            Err(Rejection::InvalidChannel(String::new()))
        );
        assert!(matches!(
            BusConfig::new("a-very-long-interface-name").fast_eligibility(),
            Err(Rejection::InvalidChannel(_))
        ));

        let mut loopback = BusConfig::new("can0");
        loopback.receive_own_messages = true;
        assert_eq!(
            loopback.fast_eligibility(),
            Err(Rejection::UnsupportedOption("receive_own_messages"))
        );

        let mut errors = BusConfig::new("can0");
        errors.error_frames = true;
        assert_eq!(
            errors.fast_eligibility(),
            Err(Rejection::UnsupportedOption("error_frames"))
        );

        let many = BusConfig::new("can0")
            .with_filters((0..=MAX_FILTERS as u32).map(|id| CanFilter::new(id, 0x7FF)));
        assert_eq!(
            many.fast_eligibility(),
            Err(Rejection::TooManyFilters {
                count: MAX_FILTERS + 1,
                max: MAX_FILTERS
            })
        );

        let mut empty_ring = BusConfig::new("can0");
        empty_ring.fast.capacity = 0;
        assert_eq!(empty_ring.fast_eligibility(), Err(Rejection::ZeroCapacity));
    }

    #[test]
    fn eligibility_does_not_touch_config() {
        let config = BusConfig::new("").with_bitrate(500_000);
        let before = config.clone();
        let _ = config.fast_eligibility();
        assert_eq!(config, before);
    }

    #[test]
    fn filters_match_masked_ids() {
        let config = BusConfig::new("can0").with_filters([CanFilter::new(0x100, 0x700)]);
        let hit = Frame::new(CanId::standard(0x123).unwrap(), &[], 0.0).unwrap();
        let miss = Frame::new(CanId::standard(0x223).unwrap(), &[], 0.0).unwrap();

        assert!(config.accepts(&hit));
        assert!(!config.accepts(&miss));
        assert!(BusConfig::new("can0").accepts(&miss));
    }

    #[test]
    fn loads_partial_json_with_defaults() {
        let config: BusConfig = serde_json::from_str(
            r#"{"channel":"can1","bitrate":250000,"fast":{"capacity":64,"overflow":"drop_newest"}}"#,
        )
        .unwrap();

        assert_eq!(config.channel, "can1");
        assert_eq!(config.bitrate, Some(250_000));
        assert_eq!(config.fast.capacity, 64);
        assert_eq!(config.fast.overflow, OverflowPolicy::DropNewest);
        assert!(config.fast.enabled);
        assert_eq!(config.fast.poll_interval, DEFAULT_POLL_INTERVAL);
    }
}
