//! Lock-free FIFO between readback completions and the drain task

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;

use crate::capture::FrameImage;

/// One captured frame awaiting persistence.
#[derive(Debug)]
pub struct QueueEntry {
    pub image: FrameImage,
    /// Wall-clock time the readback request was issued
    pub captured_at: DateTime<Utc>,
    /// Request number within the session, for logging
    pub request: u64,
}

/// Unbounded-at-enqueue FIFO. The capture session bounds it by checking
/// `len()` before issuing requests; overrun is limited to the requests
/// in flight when that check last passed.
pub struct FrameQueue {
    entries: SegQueue<QueueEntry>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    enqueued: AtomicUsize,
    dequeued: AtomicUsize,
    peak_len: AtomicUsize,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            entries: SegQueue::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: never blocks, never rejects.
    pub fn enqueue(&self, entry: QueueEntry) {
        self.entries.push(entry);
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.stats
            .peak_len
            .fetch_max(self.entries.len(), Ordering::Relaxed);
        metrics::gauge!("frame_queue_len").set(self.entries.len() as f64);
    }

    /// Consumer: oldest entry, or `None` when empty.
    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        let entry = self.entries.pop()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and reset the high-water mark. Returns the number discarded.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.entries.pop().is_some() {
            dropped += 1;
        }
        self.stats.peak_len.store(0, Ordering::Relaxed);
        dropped
    }

    /// Largest length observed since the last `clear`.
    pub fn peak_len(&self) -> usize {
        self.stats.peak_len.load(Ordering::Relaxed)
    }

    /// (enqueued, dequeued) since construction
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.enqueued.load(Ordering::Relaxed),
            self.stats.dequeued.load(Ordering::Relaxed),
        )
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
    use std::sync::Arc;

    fn entry(request: u64) -> QueueEntry {
        QueueEntry {
            image: FrameImage::from_rgba(1, 1, vec![request as u8, 0, 0, 255]).unwrap(),
            captured_at: Utc::now(),
            request,
        }
    }

    #[test]
    fn dequeue_follows_enqueue_order() {
        let queue = FrameQueue::new();
        for request in [4, 1, 3, 2] {
            queue.enqueue(entry(request));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|e| e.request)
            .collect();
        assert_eq!(order, vec![4, 1, 3, 2]);
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.stats(), (4, 4));
    }

    #[test]
    fn clear_resets_length_and_peak() {
        let queue = FrameQueue::new();
        (0..5).for_each(|i| queue.enqueue(entry(i)));
        assert_eq!(queue.peak_len(), 5);
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.peak_len(), 0);
    }

    #[test]
    fn concurrent_producer_and_consumer_preserve_fifo() {
        let queue = Arc::new(FrameQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    queue.enqueue(entry(i));
                }
            })
        };

        let mut seen = Vec::with_capacity(2_000);
        while seen.len() < 2_000 {
            match queue.try_dequeue() {
                Some(e) => seen.push(e.request),
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..2_000).collect::<Vec<_>>());
    }
}
