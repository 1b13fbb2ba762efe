//! Synthetic video source emitting a moving RGB test pattern

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::source::{FrameSlot, Resolution, TickCursor, VideoSource};
use crate::error::CaptureError;

/// Test-pattern source. Frames appear only after `ready_delay`, like a
/// webcam that reports placeholder dimensions while warming up.
pub struct PatternSource {
    ready_delay: Duration,
    slot: Arc<FrameSlot>,
    cursor: TickCursor,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PatternSource {
    pub fn new(ready_delay: Duration) -> Self {
        Self {
            ready_delay,
            slot: FrameSlot::new(),
            cursor: TickCursor::default(),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl VideoSource for PatternSource {
    fn devices_available(&self) -> bool {
        true
    }

    fn start(&mut self, resolution: Resolution, fps: u32) -> Result<(), CaptureError> {
        if self.is_playing() {
            return Ok(());
        }
        if resolution.width == 0 || resolution.height == 0 || fps == 0 {
            return Err(CaptureError::Source(format!(
                "invalid pattern mode {}x{}@{}",
                resolution.width, resolution.height, fps
            )));
        }

        info!(
            "Starting pattern source {}x{}@{}fps",
            resolution.width, resolution.height, fps
        );

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let slot = self.slot.clone();
        let ready_delay = self.ready_delay;
        let interval = Duration::from_secs(1) / fps;

        let worker = std::thread::Builder::new()
            .name("pattern-source".into())
            .spawn(move || {
                let started = Instant::now();
                let mut sequence = 0u64;
                while running.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if started.elapsed() < ready_delay {
                        continue;
                    }
                    sequence += 1;
                    slot.publish(render(resolution, sequence));
                }
                debug!("Pattern source stopped after {} frames", sequence);
            })
            .map_err(|e| CaptureError::Source(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Pattern source thread panicked");
            }
        }
        self.slot.clear();
    }

    fn is_playing(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::Acquire)
    }

    fn did_produce_new_frame_this_tick(&mut self) -> bool {
        self.cursor.advance(&self.slot)
    }

    fn dimensions(&self) -> Option<Resolution> {
        self.slot
            .latest()
            .map(|f| Resolution::new(f.meta.width, f.meta.height))
    }

    fn surface(&self) -> Option<Frame> {
        self.slot.latest()
    }
}

impl Drop for PatternSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Diagonal colour bands shifted by the frame sequence.
fn render(resolution: Resolution, sequence: u64) -> Frame {
    let Resolution { width, height } = resolution;
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            let band = (x as u64 + y as u64 + sequence * 4) % 256;
            data.extend_from_slice(&[band as u8, (255 - band) as u8, (y % 256) as u8]);
        }
    }

    Frame {
        data: Bytes::from(data),
        meta: Arc::new(FrameMetadata {
            sequence,
            width,
            height,
            stride: width * 3,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        }),
        timestamp: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_frame_matches_mode() {
        let frame = render(Resolution::new(4, 3), 7);
        assert_eq!(frame.data.len(), 4 * 3 * 3);
        assert_eq!(frame.meta.sequence, 7);
        assert_eq!(frame.meta.format, PixelFormat::Rgb24);
    }

    #[test]
    fn dimensions_appear_after_first_frame() {
        let mut source = PatternSource::new(Duration::from_millis(20));
        assert!(source.dimensions().is_none());

        source.start(Resolution::new(8, 6), 200).unwrap();
        assert!(source.is_playing());

        let deadline = Instant::now() + Duration::from_secs(2);
        while source.dimensions().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(source.dimensions(), Some(Resolution::new(8, 6)));
        assert!(source.did_produce_new_frame_this_tick());

        source.stop();
        assert!(!source.is_playing());
        assert!(source.surface().is_none());
    }

    #[test]
    fn zero_sized_mode_is_rejected() {
        let mut source = PatternSource::new(Duration::ZERO);
        assert!(source.start(Resolution::new(0, 6), 30).is_err());
    }
}
