pub mod capture;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::drain::{DrainOptions, DrainOrder, DrainReport};
use crate::pipeline::session::SessionState;
use crate::utils::FoundDevice;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pattern,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    pub ready_timeout_ms: u64,
    /// Warm-up delay of the synthetic pattern source
    pub pattern_ready_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Frames collected before draining
    pub target_frames: usize,
    pub rotate: bool,
    pub drain_settle_ms: u64,
    pub drain_poll_ms: u64,
    pub pause_feed_while_draining: bool,
    pub abort_on_denied: bool,
    pub drain_order: DrainOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub album: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: SourceKind::Pattern,
                device: FoundDevice::new("/dev/video0".into(), PixelFormat::Mjpeg),
                width: 640,
                height: 480,
                fps: 30,
                buffer_count: 4,
                ready_timeout_ms: 5_000,
                pattern_ready_delay_ms: 250,
            },
            session: SessionConfig {
                target_frames: 60,
                rotate: true,
                drain_settle_ms: 2_000,
                drain_poll_ms: 5,
                pause_feed_while_draining: true,
                abort_on_denied: false,
                drain_order: DrainOrder::Completion,
            },
            storage: StorageConfig {
                root: PathBuf::from("gallery"),
                album: "Burst".into(),
            },
        }
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `BURSTCAM__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("BURSTCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.target_frames == 0 {
            return Err(ConfigError::ZeroTarget);
        }
        Ok(())
    }

    pub fn drain_options(&self) -> DrainOptions {
        DrainOptions {
            album: self.storage.album.clone(),
            rotate: self.session.rotate,
            settle: Duration::from_millis(self.session.drain_settle_ms),
            poll: Duration::from_millis(self.session.drain_poll_ms.max(1)),
            abort_on_denied: self.session.abort_on_denied,
            order: self.session.drain_order,
        }
    }
}

/// Snapshot of pipeline counters. Everything except `stale_completions`
/// covers the current session only and is reset by `start_capture`.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStats {
    pub state: SessionState,
    pub frames_requested: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub peak_queue_len: usize,
    pub frames_enqueued: usize,
    pub readback_failures: usize,
    pub corrupt_frames: usize,
    /// Completions dropped because their session had already ended
    pub stale_completions: usize,
    pub last_drain: Option<DrainReport>,
}
