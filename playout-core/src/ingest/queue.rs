//! Bounded frame queue between ingest and scheduling

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::FrameSink;
use crate::types::RgbaFrame;

/// Frames held between ingest and the scheduler
pub const QUEUE_CAPACITY: usize = 4;

/// Bounded FIFO that drops its oldest frame on overflow
///
/// Neither push nor pop ever waits for the other side.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<RgbaFrame>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    /// Queue with the standard capacity
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    /// Queue with a custom capacity (at least 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame; returns true if the oldest frame was dropped for it
    pub fn push(&self, frame: RgbaFrame) -> bool {
        let mut frames = self.frames.lock();
        let overflow = frames.len() >= self.capacity;
        if overflow {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        overflow
    }

    /// Take the oldest frame, if any
    pub fn try_pop(&self) -> Option<RgbaFrame> {
        self.frames.lock().pop_front()
    }

    /// Frames currently queued
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Maximum frames held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames discarded on overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for FrameQueue {
    fn push_frame(&self, frame: RgbaFrame) {
        self.push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u64) -> RgbaFrame {
        RgbaFrame::new(1, 1, ts, vec![0; 4])
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new();
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.try_pop().map(|f| f.timestamp), Some(1));
        assert_eq!(queue.try_pop().map(|f| f.timestamp), Some(2));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = FrameQueue::new();
        for ts in 1..=4 {
            assert!(!queue.push(frame(ts)));
        }
        assert!(queue.push(frame(5)));
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        assert_eq!(queue.dropped(), 1);
        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|f| f.timestamp).collect();
        assert_eq!(order, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let queue = FrameQueue::with_capacity(2);
        for ts in 0..100 {
            queue.push(frame(ts));
            assert!(queue.len() <= 2);
        }
        assert_eq!(queue.dropped(), 98);
    }
}
