//! File decoding pipeline.
//!
//! A [`MediaSource`] hands out compressed (or raw) blocks, a [`DecoderEngine`]
//! turns them into PCM and drives a [`CodecCallback`] from its own loop, and
//! [`DecodeSession`] is the callback that turns decoded blocks into amplitude
//! batches.

mod pcm;
mod session;
mod state_machine;
mod wav;

pub use pcm::{PcmDecoderFactory, PcmPassthroughEngine};
pub use session::{DecodeSession, SessionConfig, SessionControl, SessionStats};
pub use state_machine::{reduce, DecodeState, SessionEffect, SessionEvent, SharedDecodeState};
pub use wav::WavSource;

use thiserror::Error;

/// Prefix every decodable track's mime type carries.
pub const AUDIO_MIME_PREFIX: &str = "audio/";

/// Uncompressed little-endian PCM, as produced by [`WavSource`].
pub const MIME_AUDIO_RAW: &str = "audio/raw";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("Unsupported mime type: {0}")]
    UnsupportedMime(String),
    #[error("Invalid track format: {0}")]
    InvalidFormat(String),
    #[error("No such track: {0}")]
    NoSuchTrack(usize),
    #[error("Decoder used before configure()")]
    NotConfigured,
    #[error("Media source error: {0}")]
    Source(String),
    #[error("Codec error: {0}")]
    Codec(String),
}

/// PCM layout of decoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_depth: u16,
}

impl PcmFormat {
    /// Rejects layouts no block could ever be converted from. Unusual bit
    /// depths pass here; conversion reports them per block.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.sample_rate == 0 {
            return Err(DecodeError::InvalidFormat("sample rate is 0".into()));
        }
        if self.channel_count == 0 {
            return Err(DecodeError::InvalidFormat("channel count is 0".into()));
        }
        if self.bit_depth == 0 || self.bit_depth % 8 != 0 {
            return Err(DecodeError::InvalidFormat(format!(
                "bit depth {} is not a whole number of bytes",
                self.bit_depth
            )));
        }
        Ok(())
    }

    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.bit_depth / 8) * usize::from(self.channel_count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub mime_type: String,
    pub duration_ms: u64,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_depth: u16,
}

impl TrackInfo {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with(AUDIO_MIME_PREFIX)
    }

    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channel_count: self.channel_count,
            bit_depth: self.bit_depth,
        }
    }
}

/// Where a seek lands relative to the requested time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Nearest sync point at or before the requested time.
    PreviousSync,
    NextSync,
    ClosestSync,
}

/// A demuxed media container.
pub trait MediaSource: Send {
    fn track_count(&self) -> usize;

    fn track_info(&self, index: usize) -> Option<TrackInfo>;

    fn select_track(&mut self, index: usize) -> Result<(), DecodeError>;

    fn seek_to(&mut self, time_us: i64, mode: SeekMode);

    /// Copy the current sample into `buf`. Returns the number of bytes
    /// written, 0 when nothing is left.
    fn read_sample(&mut self, buf: &mut [u8]) -> usize;

    /// Presentation time of the current sample, `None` past the end.
    fn sample_time_us(&self) -> Option<i64>;

    /// Move to the next sample. Returns false once there is none.
    fn advance(&mut self) -> bool;
}

/// Metadata accompanying an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: usize,
    pub presentation_time_us: i64,
    pub end_of_stream: bool,
}

/// Buffer access handed to a [`CodecCallback`] while the engine runs.
pub trait Codec {
    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        end_of_stream: bool,
    );

    fn output_buffer(&self, index: usize) -> Option<&[u8]>;

    /// Must be called once per output buffer, whether or not it was read.
    fn release_output_buffer(&mut self, index: usize);

    /// Stop the engine loop. Idempotent.
    fn stop(&mut self);
}

/// Receives the engine's buffer notifications.
pub trait CodecCallback {
    fn on_input_buffer_available(&mut self, codec: &mut dyn Codec, index: usize);

    fn on_output_buffer_available(&mut self, codec: &mut dyn Codec, index: usize, info: BufferInfo);

    fn on_output_format_changed(&mut self, codec: &mut dyn Codec, format: PcmFormat);

    fn on_error(&mut self, codec: &mut dyn Codec, error: DecodeError);
}

/// An asynchronous-callback decoder.
pub trait DecoderEngine: Send {
    fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError>;

    /// Drive `callback` until the codec is stopped or the stream ends.
    /// Blocks the calling thread.
    fn run(&mut self, callback: &mut dyn CodecCallback) -> Result<(), DecodeError>;

    fn release(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn create(&self, track: &TrackInfo) -> Result<Box<dyn DecoderEngine>, DecodeError>;
}

/// First track whose mime type starts with `audio/`.
pub fn find_audio_track(source: &dyn MediaSource) -> Option<(usize, TrackInfo)> {
    (0..source.track_count())
        .filter_map(|index| source.track_info(index).map(|info| (index, info)))
        .find(|(_, info)| info.is_audio())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_validation() {
        let ok = PcmFormat {
            sample_rate: 44100,
            channel_count: 2,
            bit_depth: 16,
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.bytes_per_frame(), 4);

        let no_channels = PcmFormat {
            channel_count: 0,
            ..ok
        };
        assert!(no_channels.validate().is_err());

        let odd_depth = PcmFormat { bit_depth: 12, ..ok };
        assert!(odd_depth.validate().is_err());

        // 24-bit is a valid layout even though blocks in it cannot be converted
        let wide = PcmFormat { bit_depth: 24, ..ok };
        assert!(wide.validate().is_ok());
    }

    #[test]
    fn audio_mime_check() {
        let mut track = TrackInfo {
            mime_type: "audio/mp4a-latm".into(),
            duration_ms: 1000,
            sample_rate: 44100,
            channel_count: 2,
            bit_depth: 16,
        };
        assert!(track.is_audio());
        track.mime_type = "video/avc".into();
        assert!(!track.is_audio());
    }
}
