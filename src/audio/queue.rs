//! Frame queue shared between the capture and playback threads
//!
//! Unlike the byte rings inside the device wrappers, this queue is unbounded
//! and guarded by a single mutex. Live playback deliberately lags capture by a
//! fixed number of frames, so the queue must be able to hold the whole delay
//! plus any jitter without dropping audio.
//!
//! ## Design
//!
//! - One producer (the capture thread) pushes frames, then the end-of-stream
//!   marker exactly once when the session ends.
//! - One consumer (the playback thread) blocks in [`FrameQueue::pop_blocking`]
//!   until a frame or the marker arrives.
//! - The consumer binding lives under the same lock as the items, so the
//!   "queue is deep enough and nobody is playing yet" check in
//!   [`FrameQueue::push_with_threshold`] can never hand out two consumers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::frame::Frame;

/// An entry in the [`FrameQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Frame(Frame),
    /// No further frames will be produced
    EndOfStream,
}

/// Whether a playback consumer is attached to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerBinding {
    Unbound,
    Bound,
    /// A consumer ran and finished; the queue never binds another one
    Released,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    closed: bool,
    binding: ConsumerBinding,
}

/// Unbounded FIFO of frames with blocking dequeue
pub struct FrameQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                binding: ConsumerBinding::Unbound,
            }),
            not_empty: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake a waiting consumer.
    ///
    /// Frames pushed after the end-of-stream marker are dropped, and a second
    /// marker is ignored.
    pub fn push(&self, item: QueueItem) {
        let mut state = self.lock();
        Self::push_locked(&mut state, item);
        drop(state);
        self.not_empty.notify_one();
    }

    fn push_locked(state: &mut QueueState, item: QueueItem) -> bool {
        if state.closed {
            match item {
                QueueItem::Frame(_) => log::warn!("Dropping frame pushed after end of stream"),
                QueueItem::EndOfStream => log::debug!("Queue already closed"),
            }
            return false;
        }
        if item == QueueItem::EndOfStream {
            state.closed = true;
        }
        state.items.push_back(item);
        true
    }

    /// Push a frame and, under the same lock, claim the consumer binding if
    /// nobody holds it yet and the queue holds at least `threshold` items.
    ///
    /// Returns `true` exactly once per queue: the caller that receives it must
    /// start the consumer.
    pub fn push_with_threshold(&self, frame: Frame, threshold: usize) -> bool {
        let mut state = self.lock();
        let claimed = Self::push_locked(&mut state, QueueItem::Frame(frame))
            && state.binding == ConsumerBinding::Unbound
            && state.items.len() >= threshold;
        if claimed {
            state.binding = ConsumerBinding::Bound;
        }
        drop(state);
        self.not_empty.notify_one();
        claimed
    }

    /// Push the end-of-stream marker. Returns whether this call pushed it.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        let pushed = Self::push_locked(&mut state, QueueItem::EndOfStream);
        drop(state);
        self.not_empty.notify_all();
        pushed
    }

    /// Remove the head, waiting as long as the queue is empty.
    ///
    /// Once the marker has been consumed the queue can never produce again, so
    /// further calls return [`QueueItem::EndOfStream`] without blocking.
    pub fn pop_blocking(&self) -> QueueItem {
        let state = self.lock();
        let mut state = self
            .not_empty
            .wait_while(state, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.items.pop_front().unwrap_or(QueueItem::EndOfStream)
    }

    pub fn try_pop(&self) -> Option<QueueItem> {
        self.lock().items.pop_front()
    }

    /// Number of queued items, including the marker if present
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn has_active_consumer(&self) -> bool {
        self.lock().binding == ConsumerBinding::Bound
    }

    /// Whether a consumer was bound and has since finished
    pub fn consumer_released(&self) -> bool {
        self.lock().binding == ConsumerBinding::Released
    }

    /// Mark the bound consumer as finished
    pub fn release_consumer(&self) {
        let mut state = self.lock();
        if state.binding == ConsumerBinding::Bound {
            state.binding = ConsumerBinding::Released;
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn frame(tag: u8) -> Frame {
        Frame::from(vec![tag; 4])
    }

    #[test]
    fn test_fifo_then_single_end_of_stream() {
        let queue = FrameQueue::new();
        for i in 0..10 {
            queue.push(QueueItem::Frame(frame(i)));
        }
        assert!(queue.close());
        assert!(!queue.close());

        for i in 0..10 {
            assert_eq!(queue.pop_blocking(), QueueItem::Frame(frame(i)));
        }
        assert_eq!(queue.pop_blocking(), QueueItem::EndOfStream);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let queue = FrameQueue::new();
        queue.close();
        queue.push(QueueItem::Frame(frame(1)));
        assert!(!queue.push_with_threshold(frame(2), 1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_blocking(), QueueItem::EndOfStream);
    }

    #[test]
    fn test_drained_closed_queue_does_not_block() {
        let queue = FrameQueue::new();
        queue.close();
        assert_eq!(queue.pop_blocking(), QueueItem::EndOfStream);
        assert_eq!(queue.pop_blocking(), QueueItem::EndOfStream);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(FrameQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        queue.push(QueueItem::Frame(frame(7)));
        assert_eq!(consumer.join().unwrap(), QueueItem::Frame(frame(7)));
    }

    #[test]
    fn test_consumer_sees_frames_in_order_across_threads() {
        let queue = Arc::new(FrameQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let QueueItem::Frame(f) = queue.pop_blocking() {
                    seen.push(f.as_bytes()[0]);
                }
                seen
            })
        };

        for i in 0..200u32 {
            queue.push(QueueItem::Frame(frame((i % 256) as u8)));
        }
        queue.close();

        let seen = consumer.join().unwrap();
        let expected: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_threshold_claims_on_exact_push_only_once() {
        let queue = FrameQueue::new();
        for i in 1..50 {
            assert!(!queue.push_with_threshold(frame(i), 50), "claimed early at {}", i);
        }
        assert!(queue.push_with_threshold(frame(50), 50));
        assert!(queue.has_active_consumer());
        for i in 51..60 {
            assert!(!queue.push_with_threshold(frame(i), 50));
        }
    }

    #[test]
    fn test_released_binding_is_not_reclaimed() {
        let queue = FrameQueue::new();
        assert!(queue.push_with_threshold(frame(1), 1));
        assert!(!queue.consumer_released());
        queue.release_consumer();
        assert!(!queue.has_active_consumer());
        assert!(queue.consumer_released());
        assert!(!queue.push_with_threshold(frame(2), 1));
    }

    #[test]
    fn test_racing_threshold_pushes_claim_once() {
        for _ in 0..100 {
            let queue = Arc::new(FrameQueue::new());
            for i in 0..48 {
                queue.push(QueueItem::Frame(frame(i)));
            }

            let barrier = Arc::new(Barrier::new(2));
            let pushers: Vec<_> = (0..2)
                .map(|t| {
                    let queue = Arc::clone(&queue);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        // Both pushes land at or past the threshold of 49
                        queue.push_with_threshold(frame(100 + t), 49)
                    })
                })
                .collect();

            let claims = pushers
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&claimed| claimed)
                .count();
            assert_eq!(claims, 1);
        }
    }
}
