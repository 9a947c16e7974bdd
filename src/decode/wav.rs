//! WAV file media source.
//!
//! The whole file is read up front into little-endian PCM bytes and exposed
//! as fixed-length chunks. Every chunk is a sync point.

use std::io::Read;
use std::path::Path;

use super::{DecodeError, MediaSource, SeekMode, TrackInfo, MIME_AUDIO_RAW};

const DEFAULT_CHUNK_MS: u64 = 20;

pub struct WavSource {
    track: TrackInfo,
    data: Vec<u8>,
    chunk_bytes: usize,
    chunk_frames: usize,
    cursor: usize,
    selected: bool,
}

impl WavSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .map_err(|e| DecodeError::Source(format!("{}: {}", path.display(), e)))?;
        Self::load(reader)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DecodeError> {
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
            .map_err(|e| DecodeError::Source(e.to_string()))?;
        Self::load(reader)
    }

    /// Change the chunk length. Takes effect from the start of the file.
    pub fn with_chunk_ms(mut self, chunk_ms: u64) -> Self {
        let frames = (u64::from(self.track.sample_rate) * chunk_ms.max(1) / 1000).max(1);
        self.chunk_frames = usize::try_from(frames).unwrap_or(usize::MAX);
        self.chunk_bytes = self.chunk_frames * self.track.format().bytes_per_frame();
        self.cursor = 0;
        self
    }

    fn load<R: Read>(reader: hound::WavReader<R>) -> Result<Self, DecodeError> {
        let spec = reader.spec();
        let frame_count = u64::from(reader.duration());
        let (data, bit_depth) = read_pcm_bytes(reader)?;

        let track = TrackInfo {
            mime_type: MIME_AUDIO_RAW.to_string(),
            duration_ms: frame_count * 1000 / u64::from(spec.sample_rate.max(1)),
            sample_rate: spec.sample_rate,
            channel_count: spec.channels,
            bit_depth,
        };
        track.format().validate()?;

        log::debug!(
            "WAV source: {} Hz, {} ch, {}-bit, {} ms",
            track.sample_rate,
            track.channel_count,
            track.bit_depth,
            track.duration_ms
        );

        let source = Self {
            track,
            data,
            chunk_bytes: 0,
            chunk_frames: 0,
            cursor: 0,
            selected: false,
        };
        Ok(source.with_chunk_ms(DEFAULT_CHUNK_MS))
    }

    fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_bytes)
    }

    fn chunk_start(&self, chunk: usize) -> usize {
        chunk.saturating_mul(self.chunk_bytes)
    }
}

/// Interleaved little-endian bytes in the layout the track will report.
///
/// 8-bit comes out unsigned, 32-bit integer is converted to 32-bit float.
/// 24-bit stays 24-bit; hound refuses widths that are not whole bytes.
fn read_pcm_bytes<R: Read>(mut reader: hound::WavReader<R>) -> Result<(Vec<u8>, u16), DecodeError> {
    let spec = reader.spec();
    let map_err = |e: hound::Error| DecodeError::Source(e.to_string());

    match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => {
            let mut data = Vec::with_capacity(reader.len() as usize * 4);
            for sample in reader.samples::<f32>() {
                data.extend_from_slice(&sample.map_err(map_err)?.to_le_bytes());
            }
            Ok((data, 32))
        }
        (hound::SampleFormat::Float, bits) => Err(DecodeError::InvalidFormat(format!(
            "{}-bit float samples",
            bits
        ))),
        (hound::SampleFormat::Int, 8) => {
            let mut data = Vec::with_capacity(reader.len() as usize);
            for sample in reader.samples::<i8>() {
                data.push((i16::from(sample.map_err(map_err)?) + 128) as u8);
            }
            Ok((data, 8))
        }
        (hound::SampleFormat::Int, 16) => {
            let mut data = Vec::with_capacity(reader.len() as usize * 2);
            for sample in reader.samples::<i16>() {
                data.extend_from_slice(&sample.map_err(map_err)?.to_le_bytes());
            }
            Ok((data, 16))
        }
        (hound::SampleFormat::Int, 32) => {
            let mut data = Vec::with_capacity(reader.len() as usize * 4);
            for sample in reader.samples::<i32>() {
                let value = sample.map_err(map_err)? as f32 / 2_147_483_648.0;
                data.extend_from_slice(&value.to_le_bytes());
            }
            Ok((data, 32))
        }
        (hound::SampleFormat::Int, bits) => {
            let width = usize::from(bits.div_ceil(8));
            let mut data = Vec::with_capacity(reader.len() as usize * width);
            for sample in reader.samples::<i32>() {
                data.extend_from_slice(&sample.map_err(map_err)?.to_le_bytes()[..width]);
            }
            Ok((data, (width * 8) as u16))
        }
    }
}

impl MediaSource for WavSource {
    fn track_count(&self) -> usize {
        1
    }

    fn track_info(&self, index: usize) -> Option<TrackInfo> {
        (index == 0).then(|| self.track.clone())
    }

    fn select_track(&mut self, index: usize) -> Result<(), DecodeError> {
        if index != 0 {
            return Err(DecodeError::NoSuchTrack(index));
        }
        self.selected = true;
        Ok(())
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) {
        let time_us = u128::try_from(time_us).unwrap_or(0);
        let frame_us = time_us * u128::from(self.track.sample_rate);
        let chunk_us = self.chunk_frames as u128 * 1_000_000;
        let chunk = match mode {
            SeekMode::PreviousSync => frame_us / chunk_us,
            SeekMode::NextSync => frame_us.div_ceil(chunk_us),
            SeekMode::ClosestSync => (frame_us + chunk_us / 2) / chunk_us,
        };
        self.cursor = usize::try_from(chunk).unwrap_or(usize::MAX);
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> usize {
        if !self.selected || self.cursor >= self.chunk_count() {
            return 0;
        }
        let start = self.chunk_start(self.cursor);
        let end = (start + self.chunk_bytes).min(self.data.len());

        // Never split a frame
        let frame_bytes = self.track.format().bytes_per_frame();
        let room = buf.len() - buf.len() % frame_bytes;
        let len = (end - start).min(room);
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        len
    }

    fn sample_time_us(&self) -> Option<i64> {
        if !self.selected || self.cursor >= self.chunk_count() {
            return None;
        }
        let frames = self.cursor as u128 * self.chunk_frames as u128;
        let us = frames * 1_000_000 / u128::from(self.track.sample_rate);
        i64::try_from(us).ok()
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.chunk_count() {
            self.cursor += 1;
        }
        self.cursor < self.chunk_count()
    }
}
