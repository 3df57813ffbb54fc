//! Bounded frame ring fed by the poll thread.
//!
//! Backed by [`crossbeam_queue::ArrayQueue`], which allows the producer to
//! evict the oldest entry without coordinating with the reader. Frames come
//! out in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::config::OverflowPolicy;
use crate::frame::Frame;
use crate::trace::trace;

/// Bounded FIFO of decoded frames with a fixed overflow policy.
pub struct FrameRing {
    queue: ArrayQueue<Frame>,
    policy: OverflowPolicy,
    /// Frames accepted by `push`, including ones later evicted.
    pushed: AtomicU64,
    /// Frames lost to overflow, whichever end they were dropped from.
    dropped: AtomicU64,
}

impl FrameRing {
    /// Creates a ring holding at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`. Configurations are checked for this by
    /// [`BusConfig::fast_eligibility`](crate::BusConfig::fast_eligibility).
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "ring capacity must be greater than 0");
        Self {
            queue: ArrayQueue::new(capacity),
            policy,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Stores `frame`, applying the overflow policy if the ring is full.
    ///
    /// Returns `false` if a frame was dropped to make this push fit (or this
    /// frame itself was dropped).
    #[inline]
    pub fn push(&self, frame: Frame) -> bool {
        match self.policy {
            OverflowPolicy::DropOldest => match self.queue.force_push(frame) {
                None => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Some(_evicted) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(id = _evicted.arbitration_id(), "ring full, evicted oldest frame");
                    false
                }
            },
            OverflowPolicy::DropNewest => match self.queue.push(frame) {
                Ok(()) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_rejected) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(id = _rejected.arbitration_id(), "ring full, dropped incoming frame");
                    false
                }
            },
        }
    }

    /// Takes the oldest buffered frame.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<Frame> {
        self.queue.pop()
    }

    /// Discards everything buffered. Returns how many frames were dropped.
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.queue.pop().is_some() {
            n += 1;
        }
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanId;

    fn frame(id: u16) -> Frame {
        Frame::new(CanId::standard(id).unwrap(), &[id as u8], f64::from(id)).unwrap()
    }

    fn drain(ring: &FrameRing) -> Vec<u32> {
        std::iter::from_fn(|| ring.pop()).map(|f| f.arbitration_id()).collect()
    }

    #[test]
    fn fifo_order() {
        let ring = FrameRing::new(8, OverflowPolicy::DropOldest);
        for id in 1..=3 {
            assert!(ring.push(frame(id)));
        }
        assert_eq!(drain(&ring), vec![1, 2, 3]);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn drop_oldest_keeps_newest_n() {
        let ring = FrameRing::new(4, OverflowPolicy::DropOldest);
        for id in 0..4 {
            assert!(ring.push(frame(id)));
        }
        assert!(!ring.push(frame(4)));

        assert_eq!(ring.dropped(), 1);
        assert_eq!(drain(&ring), vec![1, 2, 3, 4]);
    }

    #[test]
    fn drop_newest_keeps_first_n() {
        let ring = FrameRing::new(4, OverflowPolicy::DropNewest);
        for id in 0..4 {
            assert!(ring.push(frame(id)));
        }
        assert!(!ring.push(frame(4)));

        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.pushed(), 4);
        assert_eq!(drain(&ring), vec![0, 1, 2, 3]);
    }

    #[test]
    fn clear_reports_discarded() {
        let ring = FrameRing::new(4, OverflowPolicy::DropOldest);
        ring.push(frame(1));
        ring.push(frame(2));
        assert_eq!(ring.clear(), 2);
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_producer_preserves_order() {
        let ring = std::sync::Arc::new(FrameRing::new(64, OverflowPolicy::DropNewest));
        let producer = std::sync::Arc::clone(&ring);
        let count = 1000u16;

        let handle = std::thread::spawn(move || {
            for id in 0..count {
                while producer.len() == producer.capacity() {
                    std::hint::spin_loop();
                }
                producer.push(frame(id % 0x7FF));
            }
        });

        let mut received = Vec::with_capacity(usize::from(count));
        while received.len() < usize::from(count) {
            if let Some(f) = ring.pop() {
                received.push(f.arbitration_id());
            } else {
                std::hint::spin_loop();
            }
        }
        handle.join().unwrap();

        for (i, id) in received.iter().enumerate() {
            assert_eq!(*id, i as u32);
        }
    }
}
