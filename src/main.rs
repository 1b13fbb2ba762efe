//! burstcam: capture a burst of frames and save them to a gallery album

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use burstcam::capture::{DecodeReadback, PatternSource, VideoSource};
use burstcam::pipeline::{CameraManager, SessionState};
use burstcam::storage::GalleryStore;
use burstcam::{Config, SourceKind};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burstcam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("burstcam launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    burstcam::CONFIG.store(Arc::new(config));
    let config = burstcam::CONFIG.load_full();

    let source = build_source(&config)?;
    let store = Arc::new(GalleryStore::new(&config.storage.root));
    let mut manager = CameraManager::new(&config, source, Arc::new(DecodeReadback), store)?;

    manager.on_activate()?;
    manager.wait_until_ready().await?;
    manager.start_capture()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1) / config.capture.fps.max(1));
    let mut label = String::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, abandoning burst");
                break;
            }
        }

        let state = manager.tick();
        let next = manager.progress_label();
        if next != label {
            info!("{}", next);
            label = next;
        }
        if state == SessionState::Idle {
            break;
        }
    }

    manager.on_deactivate();
    let stats = manager.stats();
    info!(
        requested = stats.frames_requested,
        enqueued = stats.frames_enqueued,
        readback_failures = stats.readback_failures,
        corrupt = stats.corrupt_frames,
        stale = stats.stale_completions,
        "Burst finished"
    );
    if let Some(report) = stats.last_drain {
        info!(
            "Saved {} frames to {} ({} denied, {} failed)",
            report.saved,
            config.storage.root.join(&config.storage.album).display(),
            report.denied,
            report.failed
        );
    }

    Ok(())
}

fn build_source(config: &Config) -> Result<Box<dyn VideoSource>> {
    match config.capture.source {
        SourceKind::Pattern => Ok(Box::new(PatternSource::new(Duration::from_millis(
            config.capture.pattern_ready_delay_ms,
        )))),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => {
            let mut capture = config.capture.clone();
            // Auto-detect capture device if needed
            if capture.device.path.is_empty() {
                capture.device = burstcam::utils::auto_detect_device()?;
            }
            info!("Using capture device: {:?}", capture.device);
            Ok(Box::new(burstcam::capture::V4l2Source::new(capture)))
        }
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(color_eyre::eyre::eyre!(
            "built without the `v4l2` feature"
        )),
    }
}
