//! Decoder engine for uncompressed PCM tracks.
//!
//! Input blocks are already PCM, so "decoding" is a copy from the input
//! buffer to the output buffer with the same index. The engine still runs
//! the full callback protocol: a format notification first, then input and
//! output notifications interleaved until the end-of-stream block comes out
//! or the client stops the codec.

use std::collections::VecDeque;

use super::{
    BufferInfo, Codec, CodecCallback, DecodeError, DecoderEngine, DecoderFactory, TrackInfo,
    MIME_AUDIO_RAW,
};

const DEFAULT_BUFFER_COUNT: usize = 4;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Input requests the client may leave unanswered in a row before the
/// engine gives up.
const MAX_IDLE_INPUT_REQUESTS: usize = 64;

pub struct PcmPassthroughEngine {
    buffer_count: usize,
    buffer_size: usize,
    track: Option<TrackInfo>,
}

impl Default for PcmPassthroughEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE)
    }
}

impl PcmPassthroughEngine {
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
            buffer_size: buffer_size.max(1),
            track: None,
        }
    }
}

impl DecoderEngine for PcmPassthroughEngine {
    fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError> {
        if track.mime_type != MIME_AUDIO_RAW {
            return Err(DecodeError::UnsupportedMime(track.mime_type.clone()));
        }
        track.format().validate()?;
        self.track = Some(track.clone());
        Ok(())
    }

    fn run(&mut self, callback: &mut dyn CodecCallback) -> Result<(), DecodeError> {
        let track = self.track.as_ref().ok_or(DecodeError::NotConfigured)?;
        let mut codec = PassthroughCodec::new(self.buffer_count, self.buffer_size);

        callback.on_output_format_changed(&mut codec, track.format());

        let mut idle_requests = 0;
        while !codec.stopped {
            if let Some((index, info)) = codec.ready.pop_front() {
                callback.on_output_buffer_available(&mut codec, index, info);
                continue;
            }

            // End of stream has come out and nobody stopped us
            if codec.input_ended {
                break;
            }

            let Some(index) = codec.free.pop_front() else {
                let error = DecodeError::Codec("every buffer is held by the client".into());
                callback.on_error(&mut codec, error.clone());
                return Err(error);
            };

            callback.on_input_buffer_available(&mut codec, index);
            if codec.in_flight[index] || codec.stopped {
                idle_requests = 0;
                continue;
            }

            codec.free.push_back(index);
            idle_requests += 1;
            if idle_requests > MAX_IDLE_INPUT_REQUESTS {
                let error = DecodeError::Codec("client never queues input".into());
                callback.on_error(&mut codec, error.clone());
                return Err(error);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.track = None;
    }
}

struct PassthroughCodec {
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
    /// Indices whose input was queued and whose output is not yet released.
    in_flight: Vec<bool>,
    free: VecDeque<usize>,
    ready: VecDeque<(usize, BufferInfo)>,
    input_ended: bool,
    stopped: bool,
}

impl PassthroughCodec {
    fn new(count: usize, size: usize) -> Self {
        Self {
            inputs: vec![vec![0; size]; count],
            outputs: vec![Vec::with_capacity(size); count],
            in_flight: vec![false; count],
            free: (0..count).collect(),
            ready: VecDeque::new(),
            input_ended: false,
            stopped: false,
        }
    }
}

impl Codec for PassthroughCodec {
    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        if self.in_flight.get(index).copied().unwrap_or(true) {
            return None;
        }
        self.inputs.get_mut(index).map(Vec::as_mut_slice)
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        end_of_stream: bool,
    ) {
        if self.stopped || self.input_ended || index >= self.inputs.len() || self.in_flight[index] {
            return;
        }
        let size = size.min(self.inputs[index].len());
        self.outputs[index].clear();
        self.outputs[index].extend_from_slice(&self.inputs[index][..size]);
        self.in_flight[index] = true;
        self.input_ended = end_of_stream;
        self.ready.push_back((
            index,
            BufferInfo {
                size,
                presentation_time_us,
                end_of_stream,
            },
        ));
    }

    fn output_buffer(&self, index: usize) -> Option<&[u8]> {
        if !self.in_flight.get(index).copied().unwrap_or(false) {
            return None;
        }
        self.outputs.get(index).map(Vec::as_slice)
    }

    fn release_output_buffer(&mut self, index: usize) {
        if let Some(flag) = self.in_flight.get_mut(index) {
            if *flag {
                *flag = false;
                self.free.push_back(index);
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Creates [`PcmPassthroughEngine`]s for `audio/raw` tracks.
#[derive(Debug, Clone, Copy)]
pub struct PcmDecoderFactory {
    buffer_count: usize,
    buffer_size: usize,
}

impl Default for PcmDecoderFactory {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl PcmDecoderFactory {
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            buffer_count,
            buffer_size,
        }
    }
}

impl DecoderFactory for PcmDecoderFactory {
    fn create(&self, track: &TrackInfo) -> Result<Box<dyn DecoderEngine>, DecodeError> {
        if track.mime_type != MIME_AUDIO_RAW {
            return Err(DecodeError::UnsupportedMime(track.mime_type.clone()));
        }
        Ok(Box::new(PcmPassthroughEngine::new(
            self.buffer_count,
            self.buffer_size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::PcmFormat;

    fn raw_track() -> TrackInfo {
        TrackInfo {
            mime_type: MIME_AUDIO_RAW.to_string(),
            duration_ms: 100,
            sample_rate: 8000,
            channel_count: 1,
            bit_depth: 16,
        }
    }

    /// Feeds `blocks` byte patterns, then end of stream. Records what comes out.
    #[derive(Default)]
    struct Recorder {
        blocks: Vec<Vec<u8>>,
        fed: usize,
        outputs: Vec<(Vec<u8>, bool)>,
        formats: Vec<PcmFormat>,
        hold_outputs: bool,
        errors: usize,
    }

    impl CodecCallback for Recorder {
        fn on_input_buffer_available(&mut self, codec: &mut dyn Codec, index: usize) {
            if let Some(block) = self.blocks.get(self.fed).cloned() {
                let buf = codec.input_buffer(index).unwrap();
                buf[..block.len()].copy_from_slice(&block);
                codec.queue_input_buffer(index, block.len(), 0, false);
                self.fed += 1;
            } else {
                codec.queue_input_buffer(index, 0, 0, true);
            }
        }

        fn on_output_buffer_available(
            &mut self,
            codec: &mut dyn Codec,
            index: usize,
            info: BufferInfo,
        ) {
            let bytes = codec.output_buffer(index).unwrap()[..info.size].to_vec();
            self.outputs.push((bytes, info.end_of_stream));
            if !self.hold_outputs {
                codec.release_output_buffer(index);
            }
            if info.end_of_stream {
                codec.stop();
            }
        }

        fn on_output_format_changed(&mut self, _codec: &mut dyn Codec, format: PcmFormat) {
            self.formats.push(format);
        }

        fn on_error(&mut self, _codec: &mut dyn Codec, _error: DecodeError) {
            self.errors += 1;
        }
    }

    #[test]
    fn copies_blocks_in_order() {
        let mut engine = PcmPassthroughEngine::new(2, 16);
        engine.configure(&raw_track()).unwrap();

        let mut recorder = Recorder {
            blocks: vec![vec![1, 2], vec![3, 4], vec![5, 6]],
            ..Default::default()
        };
        engine.run(&mut recorder).unwrap();

        assert_eq!(recorder.formats, vec![raw_track().format()]);
        let payloads: Vec<Vec<u8>> = recorder.outputs.iter().map(|(b, _)| b.clone()).collect();
        assert_eq!(payloads, vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![]]);
        assert_eq!(recorder.outputs.last().map(|(_, eos)| *eos), Some(true));
    }

    #[test]
    fn run_before_configure_fails() {
        let mut engine = PcmPassthroughEngine::default();
        let mut recorder = Recorder::default();
        assert_eq!(engine.run(&mut recorder), Err(DecodeError::NotConfigured));
    }

    #[test]
    fn held_outputs_starve_the_engine() {
        let mut engine = PcmPassthroughEngine::new(2, 16);
        engine.configure(&raw_track()).unwrap();

        let mut recorder = Recorder {
            blocks: vec![vec![1]; 8],
            hold_outputs: true,
            ..Default::default()
        };
        assert!(engine.run(&mut recorder).is_err());
        assert_eq!(recorder.errors, 1);
        assert_eq!(recorder.outputs.len(), 2);
    }

    #[test]
    fn factory_rejects_compressed_tracks() {
        let factory = PcmDecoderFactory::default();
        let mut track = raw_track();
        assert!(factory.create(&track).is_ok());

        track.mime_type = "audio/mpeg".into();
        assert!(matches!(
            factory.create(&track),
            Err(DecodeError::UnsupportedMime(_))
        ));
    }
}
