//! Capture session state machine

use std::fmt;

use serde::Serialize;
use tracing::info;

use super::queue::FrameQueue;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Capturing,
    Draining,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
            SessionState::Draining => "draining",
        };
        f.write_str(label)
    }
}

/// Owns the session state and the tick-driver counters. Mutated only by
/// the tick driver, so no synchronisation is needed.
#[derive(Debug)]
pub struct CaptureSession {
    state: SessionState,
    target: usize,
    capture_enabled: bool,
    frames_requested: u64,
    /// Bumped on every `start`; completions carry it to tell sessions apart
    generation: u64,
}

impl CaptureSession {
    pub fn new(target: usize) -> Self {
        Self {
            state: SessionState::Idle,
            target: target.max(1),
            capture_enabled: false,
            frames_requested: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn frames_requested(&self) -> u64 {
        self.frames_requested
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `Idle -> Capturing`. Clears the queue and resets counters.
    pub fn start(&mut self, queue: &FrameQueue) -> Result<(), CaptureError> {
        if self.state != SessionState::Idle {
            return Err(CaptureError::SessionBusy(self.state));
        }

        let stale = queue.clear();
        self.frames_requested = 0;
        self.generation += 1;
        self.capture_enabled = true;
        self.state = SessionState::Capturing;
        info!(
            target_frames = self.target,
            generation = self.generation,
            stale,
            "Capture session started"
        );
        Ok(())
    }

    /// Whether a readback may be issued this tick.
    pub fn should_request(&self, queue_len: usize) -> bool {
        self.state == SessionState::Capturing && self.capture_enabled && queue_len < self.target
    }

    /// Record one dispatched request; returns its zero-based request number.
    pub fn note_request(&mut self) -> u64 {
        let request = self.frames_requested;
        self.frames_requested += 1;
        request
    }

    /// `Capturing -> Draining` once the queue holds the target count.
    /// Returns true when the transition happened.
    pub fn check_target(&mut self, queue_len: usize) -> bool {
        if self.state != SessionState::Capturing || queue_len < self.target {
            return false;
        }

        // Stop issuing before anything else runs this tick
        self.capture_enabled = false;
        self.state = SessionState::Draining;
        info!(
            queue_len,
            requested = self.frames_requested,
            "Target reached, draining"
        );
        true
    }

    /// `Draining -> Idle`. Ignored in any other state.
    pub fn finish_drain(&mut self) -> bool {
        if self.state != SessionState::Draining {
            return false;
        }
        self.state = SessionState::Idle;
        info!("Drain complete, session idle");
        true
    }
}
