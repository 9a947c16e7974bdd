//! Amplitude time series for waveform rendering.
//!
//! Two producers feed the same kind of output, a series of loudness values:
//! - [`decode`] walks an audio file one visual step at a time on a dedicated
//!   worker thread and extracts a low-passed RMS value per step.
//! - [`capture`] polls a live recorder for its peak amplitude and keeps a
//!   rolling, normalized window.
//!
//! [`Visualizer`] wraps both behind watch channels.

pub mod capture;
pub mod decode;
pub mod dsp;
pub mod settings;
pub mod visualizer;
pub mod worker;

pub use settings::VisualizerSettings;
pub use visualizer::{Visualizer, VisualizerError, VisualizerState};
