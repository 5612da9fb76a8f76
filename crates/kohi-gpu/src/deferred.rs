//! Deferred release of GPU resources with multiple frames in flight.
//!
//! A resource handed back while a frame may still reference it cannot be freed
//! right away. [`DeferredQueue`] holds it, tagged with the frame number it was
//! released on, until enough frames have completed.

use std::collections::VecDeque;

struct Pending<T> {
    item: T,
    frame_queued: u64,
}

/// FIFO of resources waiting for in-flight frames to retire.
pub struct DeferredQueue<T> {
    pending: VecDeque<Pending<T>>,
    frames_in_flight: u64,
}

impl<T> DeferredQueue<T> {
    /// Create a queue that holds items for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Queue `item`, released during frame `frame_number`.
    pub fn push(&mut self, item: T, frame_number: u64) {
        self.pending.push_back(Pending {
            item,
            frame_queued: frame_number,
        });
    }

    /// Hand every item whose frame has retired by `current_frame_number` to `release`.
    ///
    /// Returns the number of items released.
    pub fn collect<F>(&mut self, current_frame_number: u64, mut release: F) -> usize
    where
        F: FnMut(T),
    {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight);
        let mut released = 0;

        // Frame numbers are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|p| p.frame_queued < cutoff)
        {
            if let Some(pending) = self.pending.pop_front() {
                release(pending.item);
                released += 1;
            }
        }

        released
    }

    /// Release everything immediately. Call only after the device is idle.
    pub fn flush<F>(&mut self, mut release: F)
    where
        F: FnMut(T),
    {
        while let Some(pending) = self.pending.pop_front() {
            release(pending.item);
        }
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// How many frames an item is held for.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_items_until_frames_retire() {
        let mut queue = DeferredQueue::new(2);
        queue.push("a", 10);
        queue.push("b", 11);

        let mut released = Vec::new();
        assert_eq!(queue.collect(12, |item| released.push(item)), 0);
        assert_eq!(queue.collect(13, |item| released.push(item)), 1);
        assert_eq!(released, vec!["a"]);

        queue.collect(14, |item| released.push(item));
        assert_eq!(released, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = DeferredQueue::new(3);
        queue.push(1, 0);
        queue.push(2, 5);

        let mut released = Vec::new();
        queue.flush(|item| released.push(item));
        assert_eq!(released, vec![1, 2]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn early_frames_do_not_underflow() {
        let mut queue = DeferredQueue::new(2);
        queue.push((), 0);
        assert_eq!(queue.collect(0, |()| {}), 0);
        assert_eq!(queue.collect(1, |()| {}), 0);
        assert_eq!(queue.collect(3, |()| {}), 1);
    }
}
