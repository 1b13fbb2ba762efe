//! V4L2 webcam source running its capture loop on a dedicated thread

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::device::Handle;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::source::{FrameSlot, Resolution, TickCursor, VideoSource};
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Longest a single dequeue wait may block before `running` is checked again.
const POLL_SLICE: Duration = Duration::from_millis(100);
/// Bound on the first dequeue, which also starts the stream.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub struct V4l2Source {
    config: CaptureConfig,
    slot: Arc<FrameSlot>,
    cursor: TickCursor,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Source {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            slot: FrameSlot::new(),
            cursor: TickCursor::default(),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl VideoSource for V4l2Source {
    fn devices_available(&self) -> bool {
        Path::new(&self.config.device.path).exists()
    }

    fn start(&mut self, resolution: Resolution, fps: u32) -> Result<(), CaptureError> {
        if self.is_playing() {
            return Ok(());
        }

        let mut config = self.config.clone();
        config.width = resolution.width;
        config.height = resolution.height;
        config.fps = fps;

        // Open up front so a missing device fails the caller, not the thread
        let device =
            open_device(&config).map_err(|e| CaptureError::Source(format!("{e:#}")))?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let slot = self.slot.clone();

        let worker = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || {
                if let Err(e) = capture_loop(device, &config, &running, &slot) {
                    error!("V4L2 capture stopped: {:#}", e);
                }
                running.store(false, Ordering::Release);
            })
            .map_err(|e| CaptureError::Source(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("V4L2 capture thread panicked");
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

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_device(config: &CaptureConfig) -> Result<Device> {
    info!("Initializing V4L2 capture: {:?}", config.device);

    let device = Device::with_path(&config.device.path)?;

    let caps = device.query_caps()?;
    info!("Device: {} ({})", caps.card, caps.driver);

    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(eyre!("Device doesn't support video capture"));
    }

    let mut fmt = device.format()?;
    fmt.width = config.width;
    fmt.height = config.height;
    fmt.fourcc = FourCC::new(&config.device.format.fourcc());

    device.set_format(&fmt)?;
    Ok(device)
}

fn capture_loop(
    device: Device,
    config: &CaptureConfig,
    running: &AtomicBool,
    slot: &FrameSlot,
) -> Result<()> {
    // The driver may have adjusted the requested mode
    let negotiated = device.format()?;
    let format = PixelFormat::from_fourcc(&negotiated.fourcc.repr)
        .ok_or_else(|| eyre!("Driver negotiated unsupported format {}", negotiated.fourcc))?;
    if format != config.device.format {
        warn!(
            "Requested {:?}, driver delivers {:?}",
            config.device.format, format
        );
    }

    let handle = device.handle();
    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
    stream.set_timeout(FIRST_FRAME_TIMEOUT);
    info!(
        "Capture stream started with {} buffers at {}x{} {:?}",
        config.buffer_count, negotiated.width, negotiated.height, format
    );

    let mut sequence = 0u64;
    while running.load(Ordering::Acquire) {
        // Once streaming, only dequeue when a filled buffer is waiting so
        // `stop` never sits behind a blocked read
        if sequence > 0 && !frame_ready(&handle)? {
            continue;
        }

        let timestamp = Instant::now();
        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());

        sequence += 1;
        slot.publish(Frame {
            data: Bytes::copy_from_slice(&buf[..used]),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: negotiated.width,
                height: negotiated.height,
                stride: negotiated.stride,
                format,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            }),
            timestamp,
        });
    }
    Ok(())
}

fn frame_ready(handle: &Handle) -> io::Result<bool> {
    match handle.poll(libc::POLLIN, POLL_SLICE.as_millis() as i32) {
        Ok(ready) => Ok(ready > 0),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
        Err(e) => Err(e),
    }
}
