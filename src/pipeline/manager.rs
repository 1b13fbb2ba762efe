//! Burst capture orchestrator
//!
//! The host calls [`CameraManager::tick`] once per frame. Each tick may
//! dispatch one readback request; completions run as Tokio tasks and push
//! into the shared [`FrameQueue`]. When the queue reaches the target the
//! session flips to draining and a [`SaveDrainer`] task empties the queue
//! into the image store, reporting progress back through a channel that the
//! next ticks consume.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::utils::CachePadded;
use flume::TryRecvError;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use super::drain::{DrainEvent, DrainOptions, DrainReport, SaveDrainer};
use super::queue::{FrameQueue, QueueEntry};
use super::session::{CaptureSession, SessionState};
use crate::capture::{AsyncPixelReadback, Frame, FrameImage, PixelBuffer, Resolution, VideoSource};
use crate::error::{CaptureError, ReadbackError};
use crate::storage::ImageStore;
use crate::{CaptureStats, Config};

/// Source of capture timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Per-session counters bumped from the completion context.
#[derive(Default)]
pub(crate) struct CompletionCounters {
    readback_failures: AtomicUsize,
    corrupt_frames: AtomicUsize,
}

/// Where a completion may land. Built per request from the session that
/// issued it; the queue, counters and in-flight count are swapped out on
/// every `start_capture`, so a late completion can only reach its own
/// session's copies.
pub(crate) struct CompletionSink {
    generation: u64,
    current: Arc<AtomicU64>,
    stale: Arc<AtomicUsize>,
    queue: Arc<FrameQueue>,
    counters: Arc<CachePadded<CompletionCounters>>,
}

impl CompletionSink {
    fn is_stale(&self) -> bool {
        self.current.load(Ordering::Acquire) != self.generation
    }
}

pub struct CameraManager {
    resolution: Resolution,
    fps: u32,
    ready_timeout: Duration,
    pause_feed_while_draining: bool,
    drain_options: DrainOptions,

    source: Box<dyn VideoSource>,
    readback: Arc<dyn AsyncPixelReadback>,
    store: Arc<dyn ImageStore>,

    queue: Arc<FrameQueue>,
    session: CaptureSession,
    counters: Arc<CachePadded<CompletionCounters>>,
    in_flight: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
    /// Completions that arrived after their session ended, over the manager's lifetime
    stale_completions: Arc<AtomicUsize>,

    drain: Option<flume::Receiver<DrainEvent>>,
    drained: usize,
    last_report: Option<DrainReport>,

    clock: Clock,
    runtime: Handle,
    active: bool,
    feed_paused: bool,
}

impl CameraManager {
    /// Must be called from within a Tokio runtime; completions and the drain
    /// are spawned onto it.
    pub fn new(
        config: &Config,
        source: Box<dyn VideoSource>,
        readback: Arc<dyn AsyncPixelReadback>,
        store: Arc<dyn ImageStore>,
    ) -> Result<Self, CaptureError> {
        let runtime = Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;

        Ok(Self {
            resolution: Resolution::new(config.capture.width, config.capture.height),
            fps: config.capture.fps,
            ready_timeout: Duration::from_millis(config.capture.ready_timeout_ms),
            pause_feed_while_draining: config.session.pause_feed_while_draining,
            drain_options: config.drain_options(),
            source,
            readback,
            store,
            queue: Arc::new(FrameQueue::new()),
            session: CaptureSession::new(config.session.target_frames),
            counters: Arc::new(CachePadded::new(CompletionCounters::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            stale_completions: Arc::new(AtomicUsize::new(0)),
            drain: None,
            drained: 0,
            last_report: None,
            clock: Arc::new(Utc::now),
            runtime,
            active: false,
            feed_paused: false,
        })
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Acquire the video source. Fails once, without retry, when no device exists.
    #[instrument(skip(self))]
    pub fn on_activate(&mut self) -> Result<(), CaptureError> {
        if self.active {
            return Ok(());
        }
        if !self.source.devices_available() {
            error!("No video source available, capture disabled");
            return Err(CaptureError::DeviceUnavailable);
        }

        self.source.start(self.resolution, self.fps)?;
        self.active = true;
        self.feed_paused = false;
        info!(
            "Camera activated at {}x{}@{}",
            self.resolution.width, self.resolution.height, self.fps
        );
        Ok(())
    }

    /// Poll until the source reports real dimensions.
    pub async fn wait_until_ready(&self) -> Result<Resolution, CaptureError> {
        if !self.active {
            return Err(CaptureError::NotActive);
        }

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if let Some(resolution) = self.source.dimensions() {
                info!(
                    "Video source ready at {}x{}",
                    resolution.width, resolution.height
                );
                return Ok(resolution);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CaptureError::NotReady(self.ready_timeout.as_millis() as u64));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[instrument(skip(self))]
    pub fn on_deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.source.stop();
        self.active = false;
        self.feed_paused = false;
        info!("Camera deactivated");
    }

    /// Release the camera while keeping the manager active.
    pub fn pause_feed(&mut self) {
        if self.active && !self.feed_paused {
            self.source.stop();
            self.feed_paused = true;
            debug!("Feed paused");
        }
    }

    pub fn resume_feed(&mut self) -> Result<(), CaptureError> {
        if self.active && self.feed_paused {
            self.source.start(self.resolution, self.fps)?;
            self.feed_paused = false;
            debug!("Feed resumed");
        }
        Ok(())
    }

    /// `Idle -> Capturing`.
    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        if !self.active {
            return Err(CaptureError::NotActive);
        }
        self.session.start(&self.queue)?;

        // Requests abandoned by the last drain keep the old copies
        self.queue = Arc::new(FrameQueue::new());
        self.counters = Arc::new(CachePadded::new(CompletionCounters::default()));
        self.in_flight = Arc::new(AtomicUsize::new(0));
        self.generation.store(self.session.generation(), Ordering::Release);
        self.drained = 0;
        self.last_report = None;
        Ok(())
    }

    /// Advance the pipeline by one frame and return the resulting state.
    pub fn tick(&mut self) -> SessionState {
        self.poll_drain();

        let fresh =
            self.active && !self.feed_paused && self.source.did_produce_new_frame_this_tick();

        if self.session.state() == SessionState::Capturing {
            let queued = self.queue.len();
            if self.session.check_target(queued) {
                self.begin_drain();
            } else if fresh && self.session.should_request(queued) {
                if let Some(surface) = self.source.surface() {
                    self.dispatch(surface);
                }
            }
        }

        self.session.state()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn frames_requested(&self) -> u64 {
        self.session.frames_requested()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_report(&self) -> Option<&DrainReport> {
        self.last_report.as_ref()
    }

    pub fn stats(&self) -> CaptureStats {
        let (enqueued, _) = self.queue.stats();
        CaptureStats {
            state: self.session.state(),
            frames_requested: self.session.frames_requested(),
            in_flight: self.in_flight(),
            queued: self.queue.len(),
            peak_queue_len: self.queue.peak_len(),
            frames_enqueued: enqueued,
            readback_failures: self.counters.readback_failures.load(Ordering::Relaxed),
            corrupt_frames: self.counters.corrupt_frames.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            last_drain: self.last_report.clone(),
        }
    }

    /// Short status line for a UI label.
    pub fn progress_label(&self) -> String {
        match self.session.state() {
            SessionState::Idle => match &self.last_report {
                Some(report) => format!("Saved {} frames", report.saved),
                None => "Ready".to_string(),
            },
            SessionState::Capturing => format!(
                "Capturing {}/{} ({} requested)",
                self.queue.len(),
                self.session.target(),
                self.session.frames_requested()
            ),
            SessionState::Draining => format!("Saving {}", self.drained),
        }
    }

    fn dispatch(&mut self, surface: Frame) {
        let request = self.session.note_request();
        let captured_at = (self.clock)();
        let pending = self.readback.request(surface);

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let sink = CompletionSink {
            generation: self.session.generation(),
            current: self.generation.clone(),
            stale: self.stale_completions.clone(),
            queue: self.queue.clone(),
            counters: self.counters.clone(),
        };
        let in_flight = self.in_flight.clone();
        self.runtime.spawn(async move {
            let result = pending.await;
            handle_completion(result, request, captured_at, &sink);
            // Only after the enqueue, so the drainer never misses this frame
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });

        metrics::counter!("frames_requested").increment(1);
        debug!(request, "Readback requested");
    }

    fn begin_drain(&mut self) {
        if self.pause_feed_while_draining {
            self.pause_feed();
        }

        let (tx, rx) = flume::unbounded();
        let drainer = SaveDrainer::new(
            self.queue.clone(),
            self.store.clone(),
            self.in_flight.clone(),
            self.drain_options.clone(),
            tx,
        );
        self.runtime.spawn(drainer.run());
        self.drain = Some(rx);
        self.drained = 0;
    }

    fn poll_drain(&mut self) {
        let Some(rx) = self.drain.take() else {
            return;
        };

        let report = loop {
            match rx.try_recv() {
                Ok(DrainEvent::Finished(report)) => break Some(report),
                Ok(DrainEvent::Saved { index, path, .. }) => {
                    self.drained += 1;
                    debug!(index, ?path, "Frame saved");
                }
                Ok(DrainEvent::Denied { index, filename })
                | Ok(DrainEvent::Failed { index, filename }) => {
                    self.drained += 1;
                    debug!(index, %filename, "Frame not saved");
                }
                Err(TryRecvError::Empty) => break None,
                Err(TryRecvError::Disconnected) => {
                    // Drain task died; never leave the session stuck in Draining
                    error!("Drain task ended without a report");
                    break Some(DrainReport::default());
                }
            }
        };

        match report {
            Some(report) => {
                self.last_report = Some(report);
                self.session.finish_drain();
                if self.feed_paused {
                    if let Err(e) = self.resume_feed() {
                        error!("Failed to resume feed after drain: {}", e);
                    }
                }
            }
            None => self.drain = Some(rx),
        }
    }
}

/// Readback completion: validate, pair with the issue-time stamp, enqueue.
/// Failures drop the frame and never reach the session; so do completions
/// from a session that has already ended.
pub(crate) fn handle_completion(
    result: Result<PixelBuffer, ReadbackError>,
    request: u64,
    captured_at: DateTime<Utc>,
    sink: &CompletionSink,
) {
    if sink.is_stale() {
        debug!(
            request,
            generation = sink.generation,
            "Completion from an earlier session dropped"
        );
        sink.stale.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stale_completions").increment(1);
        return;
    }

    let counters = &sink.counters;
    let buffer = match result {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!(request, "Readback failed, dropping frame: {}", e);
            counters.readback_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("readback_failures").increment(1);
            return;
        }
    };

    let latency = buffer.timestamp.signed_duration_since(captured_at);
    metrics::histogram!("readback_latency_ms").record(latency.num_milliseconds() as f64);

    match FrameImage::from_pixel_buffer(&buffer) {
        Ok(image) => {
            sink.queue.enqueue(QueueEntry {
                image,
                captured_at,
                request,
            });
        }
        Err(e) => {
            warn!(request, "Corrupt frame dropped: {}", e);
            counters.corrupt_frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("corrupt_frames").increment(1);
        }
    }
}
