//! Live capture amplitudes.
//!
//! A [`CaptureSource`] is polled for its peak amplitude on a fixed tick. The
//! reader keeps the most recent peaks in a bounded ring buffer and publishes
//! them as a normalized, smoothed window for rendering.

#[cfg(feature = "cpal-capture")]
mod cpal_source;
mod reader;

#[cfg(feature = "cpal-capture")]
pub use cpal_source::CpalCaptureSource;
pub use reader::{poll_capture_state, CaptureAmplitudeReader, CaptureRingBuffer, DynamicRange};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    Recording,
    Paused,
    /// Idle, stopped, or any state without an active input.
    #[default]
    Other,
}

impl CaptureState {
    /// Recording and paused both keep the capture window alive.
    pub fn is_capturing(self) -> bool {
        matches!(self, CaptureState::Recording | CaptureState::Paused)
    }
}

/// A recorder that can report its peak amplitude.
pub trait CaptureSource: Send + Sync {
    /// Peak absolute amplitude since the previous call, or `None` when the
    /// input is not configured.
    fn sample_once(&self) -> Option<i32>;

    fn current_state(&self) -> CaptureState;
}
