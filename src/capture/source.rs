//! Video source abstraction and the latest-frame slot shared with capture threads

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A live video feed polled once per tick.
pub trait VideoSource: Send {
    fn devices_available(&self) -> bool;

    fn start(&mut self, resolution: Resolution, fps: u32) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn is_playing(&self) -> bool;

    /// True at most once per produced frame.
    fn did_produce_new_frame_this_tick(&mut self) -> bool;

    /// Negotiated frame size. `None` until the device has delivered a frame.
    fn dimensions(&self) -> Option<Resolution>;

    /// Latest frame, used as the readback surface.
    fn surface(&self) -> Option<Frame>;
}

/// Single-slot mailbox a capture thread publishes into.
#[derive(Default)]
pub struct FrameSlot {
    latest: ArcSwapOption<Frame>,
    sequence: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, frame: Frame) {
        self.latest.store(Some(Arc::new(frame)));
        self.sequence.fetch_add(1, Ordering::Release);
    }

    pub fn latest(&self) -> Option<Frame> {
        self.latest.load_full().map(|f| (*f).clone())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.latest.store(None);
    }
}

/// Tracks which slot sequence the tick driver has already seen.
#[derive(Debug, Default)]
pub struct TickCursor {
    seen: u64,
}

impl TickCursor {
    pub fn advance(&mut self, slot: &FrameSlot) -> bool {
        let current = slot.sequence();
        if current != self.seen {
            self.seen = current;
            true
        } else {
            false
        }
    }
}
