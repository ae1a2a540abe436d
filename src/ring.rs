// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity ring of decoded frame copies.
//!
//! The hardware decode path produces frames at its own pace, driven by the
//! engine rather than by the consumer. This ring decouples the two: the
//! producer never blocks, and when the consumer falls behind the oldest
//! buffered frame is evicted so the consumer keeps seeing roughly-live
//! content instead of drifting further behind.

use crate::Resolution;

/// Default number of slots, matching the reference latency/memory tradeoff.
pub const DEFAULT_RING_CAPACITY: usize = 16;

/// One fully-copied decoded frame, with its geometry recorded at fill time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSlot {
    pub data: Vec<u8>,
    pub resolution: Resolution,
    pub pts: i64,
}

/// Outcome of a [`FrameRing::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The ring was full; the oldest slot was dropped to make room.
    Evicted,
}

/// Capacity-bounded FIFO of [`RingSlot`]s, lossy under backpressure.
///
/// The write and read positions are monotonic counters; the slot index is the
/// counter modulo the capacity. At most `capacity` frames are live at once.
pub struct FrameRing {
    slots: Box<[Option<RingSlot>]>,
    write: u64,
    read: u64,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            write: 0,
            read: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live frames.
    pub fn len(&self) -> usize {
        (self.write - self.read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    /// Stores `slot`, evicting the oldest live frame if the ring is full.
    pub fn push(&mut self, slot: RingSlot) -> PushOutcome {
        let capacity = self.capacity() as u64;

        let outcome = if self.write - self.read == capacity {
            self.slots[(self.read % capacity) as usize] = None;
            self.read += 1;
            PushOutcome::Evicted
        } else {
            PushOutcome::Stored
        };

        self.slots[(self.write % capacity) as usize] = Some(slot);
        self.write += 1;

        outcome
    }

    /// Removes and returns the oldest live frame.
    pub fn pop(&mut self) -> Option<RingSlot> {
        if self.is_empty() {
            return None;
        }

        let capacity = self.capacity() as u64;
        let slot = self.slots[(self.read % capacity) as usize].take();
        self.read += 1;
        slot
    }

    /// Drops all live frames.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.read = self.write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(tag: u8) -> RingSlot {
        RingSlot {
            data: vec![tag; 4],
            resolution: Resolution::from((2, 1)),
            pts: tag as i64,
        }
    }

    #[test]
    fn push_pop_order() {
        let mut ring = FrameRing::new(4);
        assert!(ring.pop().is_none());

        for tag in 0..3 {
            assert_eq!(ring.push(slot(tag)), PushOutcome::Stored);
        }
        assert_eq!(ring.len(), 3);

        for tag in 0..3 {
            assert_eq!(ring.pop().unwrap().pts, tag as i64);
        }
        assert!(ring.is_empty());
        assert!(ring.pop().is_none());
    }

    #[test]
    fn eviction_drops_exactly_the_oldest() {
        let mut ring = FrameRing::new(4);
        for tag in 0..4 {
            assert_eq!(ring.push(slot(tag)), PushOutcome::Stored);
        }

        // A fifth push must displace slot 0 only.
        assert_eq!(ring.push(slot(4)), PushOutcome::Evicted);
        assert_eq!(ring.len(), 4);

        let popped: Vec<i64> = std::iter::from_fn(|| ring.pop()).map(|s| s.pts).collect();
        assert_eq!(popped, vec![1, 2, 3, 4]);
    }

    #[test]
    fn backpressure_keeps_newest_sixteen() {
        let mut ring = FrameRing::new(DEFAULT_RING_CAPACITY);
        for tag in 0..20 {
            ring.push(slot(tag));
        }

        assert_eq!(ring.len(), 16);
        let popped: Vec<i64> = std::iter::from_fn(|| ring.pop()).map(|s| s.pts).collect();
        assert_eq!(popped, (4..20).collect::<Vec<i64>>());
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut ring = FrameRing::new(3);
        for tag in 0..100 {
            ring.push(slot(tag));
            assert!(ring.len() <= 3);
        }
    }

    #[test]
    fn clear_empties_the_ring() {
        let mut ring = FrameRing::new(4);
        for tag in 0..3 {
            ring.push(slot(tag));
        }
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.pop().is_none());

        // Still usable after a clear.
        ring.push(slot(9));
        assert_eq!(ring.pop().unwrap().pts, 9);
    }
}
