//! Sequential drain of the frame queue into an image store

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{FrameQueue, QueueEntry};
use super::transform::rotate_quarter_turn;
use crate::storage::{ImageStore, SaveOutcome};

/// Order in which a drained batch is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOrder {
    /// Queue order, i.e. readback completion order
    #[default]
    Completion,
    /// Wait for in-flight requests, then sort by capture timestamp
    CaptureTime,
}

#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub album: String,
    pub rotate: bool,
    /// How long an empty queue is polled while requests are still in flight
    pub settle: Duration,
    pub poll: Duration,
    pub abort_on_denied: bool,
    pub order: DrainOrder,
}

/// One event per drained item, then `Finished`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainEvent {
    Saved {
        index: usize,
        filename: String,
        path: Option<PathBuf>,
    },
    Denied {
        index: usize,
        filename: String,
    },
    Failed {
        index: usize,
        filename: String,
    },
    Finished(DrainReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub saved: usize,
    pub denied: usize,
    pub failed: usize,
    /// Entries dropped unsaved after an aborting denial
    pub discarded: usize,
    /// Requests still outstanding when the drain gave up waiting
    pub abandoned: usize,
}

/// `Frame_<index>_<YYYYMMDD_HHMMSS_mmm>.png`, UTC.
pub fn frame_filename(index: usize, captured_at: DateTime<Utc>) -> String {
    format!(
        "Frame_{}_{}.png",
        index,
        captured_at.format("%Y%m%d_%H%M%S_%3f")
    )
}

/// Single consumer of the frame queue. Steps never overlap: each save is
/// awaited before the next dequeue.
pub struct SaveDrainer {
    queue: Arc<FrameQueue>,
    store: Arc<dyn ImageStore>,
    in_flight: Arc<AtomicUsize>,
    options: DrainOptions,
    events: flume::Sender<DrainEvent>,
}

enum Step {
    Continue,
    Abort,
}

impl SaveDrainer {
    pub fn new(
        queue: Arc<FrameQueue>,
        store: Arc<dyn ImageStore>,
        in_flight: Arc<AtomicUsize>,
        options: DrainOptions,
        events: flume::Sender<DrainEvent>,
    ) -> Self {
        Self {
            queue,
            store,
            in_flight,
            options,
            events,
        }
    }

    #[instrument(skip(self), fields(album = %self.options.album, order = ?self.options.order))]
    pub async fn run(self) -> DrainReport {
        let mut report = DrainReport::default();
        info!(queued = self.queue.len(), "Drain started");

        match self.options.order {
            DrainOrder::Completion => {
                let mut index = 0;
                while let Some(entry) = self.next_entry(&mut report).await {
                    let step = self.persist(index, entry, &mut report).await;
                    index += 1;
                    if let Step::Abort = step {
                        break;
                    }
                }
            }
            DrainOrder::CaptureTime => {
                let mut batch = Vec::with_capacity(self.queue.len());
                while let Some(entry) = self.next_entry(&mut report).await {
                    batch.push(entry);
                }
                batch.sort_by_key(|e| e.captured_at);

                let mut batch = batch.into_iter().enumerate();
                for (index, entry) in batch.by_ref() {
                    if let Step::Abort = self.persist(index, entry, &mut report).await {
                        break;
                    }
                }
                report.discarded += batch.count();
            }
        }

        info!(
            saved = report.saved,
            denied = report.denied,
            failed = report.failed,
            discarded = report.discarded,
            abandoned = report.abandoned,
            "Drain finished"
        );
        let _ = self.events.send(DrainEvent::Finished(report.clone()));
        report
    }

    /// Next queued entry. An empty queue only ends the drain once no request
    /// is in flight, or after the settle window expires.
    async fn next_entry(&self, report: &mut DrainReport) -> Option<QueueEntry> {
        let deadline = Instant::now() + self.options.settle;
        loop {
            // Completions enqueue before decrementing, so read the count first
            let pending = self.in_flight.load(Ordering::Acquire);
            if let Some(entry) = self.queue.try_dequeue() {
                return Some(entry);
            }
            if pending == 0 {
                return None;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Giving up on in-flight readbacks");
                report.abandoned = pending;
                return None;
            }
            tokio::time::sleep(self.options.poll).await;
        }
    }

    async fn persist(&self, index: usize, entry: QueueEntry, report: &mut DrainReport) -> Step {
        let filename = frame_filename(index, entry.captured_at);
        debug!(index, request = entry.request, %filename, "Saving frame");

        let store = self.store.clone();
        let album = self.options.album.clone();
        let rotate = self.options.rotate;
        let name = filename.clone();
        let result = tokio::task::spawn_blocking(move || {
            let image = if rotate {
                let rotated = rotate_quarter_turn(&entry.image);
                drop(entry);
                rotated
            } else {
                entry.image
            };
            store.save(&image, &album, &name)
        })
        .await;

        let outcome = result.unwrap_or_else(|e| {
            error!(index, "Save task panicked: {}", e);
            SaveOutcome::failed(None)
        });

        let mut step = Step::Continue;
        let event = if !outcome.permission_granted {
            warn!(index, %filename, "Storage permission denied");
            metrics::counter!("frames_denied").increment(1);
            report.denied += 1;
            if self.options.abort_on_denied {
                step = Step::Abort;
            }
            DrainEvent::Denied { index, filename }
        } else if !outcome.success {
            error!(index, %filename, "Failed to save frame");
            metrics::counter!("frames_save_failed").increment(1);
            report.failed += 1;
            DrainEvent::Failed { index, filename }
        } else {
            metrics::counter!("frames_saved").increment(1);
            report.saved += 1;
            DrainEvent::Saved {
                index,
                filename,
                path: outcome.path,
            }
        };
        let _ = self.events.send(event);

        if let Step::Abort = step {
            let discarded = self.queue.clear();
            warn!(discarded, "Aborting drain after permission denial");
            report.discarded += discarded;
        }

        // Hand the runtime back between items
        tokio::task::yield_now().await;
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameImage;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        saved: Mutex<Vec<(String, u32, u32)>>,
        deny: Vec<usize>,
        calls: AtomicUsize,
    }

    impl ImageStore for Recorder {
        fn has_permission(&self) -> bool {
            true
        }

        fn save(&self, image: &FrameImage, _album: &str, filename: &str) -> SaveOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.deny.contains(&call) {
                return SaveOutcome::denied();
            }
            self.saved
                .lock()
                .unwrap()
                .push((filename.to_string(), image.width(), image.height()));
            SaveOutcome::saved(PathBuf::from(filename))
        }
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap() + chrono::Duration::milliseconds(ms)
    }

    fn entry(request: u64, ms: i64) -> QueueEntry {
        QueueEntry {
            image: FrameImage::from_rgba(2, 3, vec![request as u8; 24]).unwrap(),
            captured_at: ts(ms),
            request,
        }
    }

    fn options() -> DrainOptions {
        DrainOptions {
            album: "Burst".into(),
            rotate: true,
            settle: Duration::from_millis(500),
            poll: Duration::from_millis(2),
            abort_on_denied: false,
            order: DrainOrder::Completion,
        }
    }

    fn drainer(
        queue: &Arc<FrameQueue>,
        store: &Arc<Recorder>,
        in_flight: &Arc<AtomicUsize>,
        options: DrainOptions,
    ) -> (SaveDrainer, flume::Receiver<DrainEvent>) {
        let (tx, rx) = flume::unbounded();
        let store: Arc<dyn ImageStore> = store.clone();
        (
            SaveDrainer::new(queue.clone(), store, in_flight.clone(), options, tx),
            rx,
        )
    }

    #[test]
    fn filename_is_reproducible() {
        let a = frame_filename(3, ts(45));
        let b = frame_filename(3, ts(45));
        assert_eq!(a, "Frame_3_20240501_123015_045.png");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a, frame_filename(4, ts(45)));
    }

    #[tokio::test]
    async fn drains_in_queue_order_with_rotation() {
        let queue = Arc::new(FrameQueue::new());
        let store = Arc::new(Recorder::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        // Completion order differs from capture order on purpose
        queue.enqueue(entry(1, 20));
        queue.enqueue(entry(0, 10));
        queue.enqueue(entry(2, 30));

        let (drainer, rx) = drainer(&queue, &store, &in_flight, options());
        let report = drainer.run().await;
        assert_eq!(report.saved, 3);

        let saved = store.saved.lock().unwrap().clone();
        let names: Vec<_> = saved.iter().map(|s| s.0.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Frame_0_20240501_123015_020.png",
                "Frame_1_20240501_123015_010.png",
                "Frame_2_20240501_123015_030.png",
            ]
        );
        assert!(saved.iter().all(|s| (s.1, s.2) == (3, 2)));

        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events.last(), Some(DrainEvent::Finished(r)) if r.saved == 3));
    }

    #[tokio::test]
    async fn capture_time_order_sorts_the_batch() {
        let queue = Arc::new(FrameQueue::new());
        let store = Arc::new(Recorder::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        queue.enqueue(entry(2, 30));
        queue.enqueue(entry(0, 10));
        queue.enqueue(entry(1, 20));

        let mut opts = options();
        opts.order = DrainOrder::CaptureTime;
        opts.rotate = false;
        let (drainer, _rx) = drainer(&queue, &store, &in_flight, opts);
        drainer.run().await;

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved[0].0, "Frame_0_20240501_123015_010.png");
        assert_eq!(saved[2].0, "Frame_2_20240501_123015_030.png");
        assert!(saved.iter().all(|s| (s.1, s.2) == (2, 3)));
    }

    #[tokio::test]
    async fn denial_skips_one_frame_and_continues() {
        let queue = Arc::new(FrameQueue::new());
        let store = Arc::new(Recorder {
            deny: vec![1],
            ..Default::default()
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        (0..4).for_each(|i| queue.enqueue(entry(i, i as i64)));

        let (drainer, rx) = drainer(&queue, &store, &in_flight, options());
        let report = drainer.run().await;
        assert_eq!((report.saved, report.denied, report.discarded), (3, 1, 0));
        assert!(rx
            .drain()
            .any(|e| matches!(e, DrainEvent::Denied { index: 1, .. })));
    }

    #[tokio::test]
    async fn denial_can_abort_the_batch() {
        let queue = Arc::new(FrameQueue::new());
        let store = Arc::new(Recorder {
            deny: vec![1],
            ..Default::default()
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        (0..5).for_each(|i| queue.enqueue(entry(i, i as i64)));

        let mut opts = options();
        opts.abort_on_denied = true;
        let (drainer, _rx) = drainer(&queue, &store, &in_flight, opts);
        let report = drainer.run().await;
        assert_eq!((report.saved, report.denied, report.discarded), (1, 1, 3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn late_completion_is_drained() {
        let queue = Arc::new(FrameQueue::new());
        let store = Arc::new(Recorder::default());
        let in_flight = Arc::new(AtomicUsize::new(1));
        queue.enqueue(entry(0, 0));

        let late = {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                queue.enqueue(entry(1, 1));
                in_flight.fetch_sub(1, Ordering::AcqRel);
            })
        };

        let (drainer, _rx) = drainer(&queue, &store, &in_flight, options());
        let report = drainer.run().await;
        late.await.unwrap();
        assert_eq!(report.saved, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn stuck_request_does_not_block_the_drain() {
        let queue = Arc::new(FrameQueue::new());
        let store = Arc::new(Recorder::default());
        let in_flight = Arc::new(AtomicUsize::new(2));
        queue.enqueue(entry(0, 0));

        let mut opts = options();
        opts.settle = Duration::from_millis(40);
        let (drainer, _rx) = drainer(&queue, &store, &in_flight, opts);
        let report = tokio::time::timeout(Duration::from_secs(5), drainer.run())
            .await
            .unwrap();
        assert_eq!(report.saved, 1);
        assert_eq!(report.abandoned, 2);
    }
}
