//! One file-decoding run.
//!
//! The session is the engine's callback. Input requests read one block per
//! visual step from the source; every decoded block becomes a low-pass + RMS
//! task on the blocking pool. Tasks are grouped into batches of
//! `batch_size` and handed to a single drainer task, which awaits them in
//! order and forwards the amplitudes to the subscriber. Having one drainer
//! keeps batches from overlapping and preserves file order.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state_machine::{DecodeState, SessionEffect, SessionEvent, SharedDecodeState};
use super::{
    BufferInfo, Codec, CodecCallback, DecodeError, DecoderEngine, MediaSource, PcmFormat, SeekMode,
    TrackInfo,
};
use crate::dsp;
use crate::settings::VisualizerSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Time between two extracted amplitudes.
    pub step_ms: u64,
    /// Filter tasks per delivered batch.
    pub batch_size: usize,
    pub cutoff_hz: f32,
}

impl SessionConfig {
    pub fn from_settings(settings: &VisualizerSettings, step_ms: u64) -> Self {
        Self {
            step_ms: step_ms.max(1),
            batch_size: settings.batch_size.max(1),
            cutoff_hz: settings.cutoff_hz(step_ms),
        }
    }
}

/// Counters kept by the decoding side of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub blocks_read: usize,
    pub blocks_decoded: usize,
    /// Blocks that could not be converted to float samples.
    pub blocks_dropped: usize,
    pub batches_submitted: usize,
}

/// Filter tasks for one batch, in file order.
struct PendingBatch {
    tasks: Vec<JoinHandle<f32>>,
    last: bool,
}

/// Owner-side view of a running session.
#[derive(Debug, Clone)]
pub struct SessionControl {
    id: Uuid,
    state: Arc<SharedDecodeState>,
    cancel: CancellationToken,
}

impl SessionControl {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DecodeState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<DecodeState> {
        self.state.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the session and mark it released. Undelivered amplitudes are
    /// discarded. Idempotent.
    pub fn release(&self) {
        self.cancel.cancel();
        self.state.apply(SessionEvent::Release);
    }
}

pub struct DecodeSession {
    id: Uuid,
    config: SessionConfig,
    source: Box<dyn MediaSource>,
    track: TrackInfo,
    format: PcmFormat,
    current_offset_ms: u64,
    source_exhausted: bool,
    state: Arc<SharedDecodeState>,
    cancel: CancellationToken,
    runtime: Handle,
    pending: Vec<JoinHandle<f32>>,
    batch_tx: Option<mpsc::UnboundedSender<PendingBatch>>,
    stats: SessionStats,
}

impl DecodeSession {
    /// Create a session reading `track` from `source` (already selected) and
    /// spawn its drainer on `runtime`. Amplitude batches arrive on
    /// `subscriber`, which closes once the session is over.
    pub fn new(
        source: Box<dyn MediaSource>,
        track: TrackInfo,
        config: SessionConfig,
        runtime: Handle,
        cancel: CancellationToken,
        subscriber: mpsc::Sender<Vec<f32>>,
    ) -> (Self, SessionControl) {
        let id = Uuid::new_v4();
        let state = Arc::new(SharedDecodeState::new());
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        runtime.spawn(drain_batches(id, batch_rx, subscriber, cancel.clone()));

        let control = SessionControl {
            id,
            state: state.clone(),
            cancel: cancel.clone(),
        };
        let session = Self {
            id,
            config,
            source,
            format: track.format(),
            track,
            current_offset_ms: 0,
            source_exhausted: false,
            state,
            cancel,
            runtime,
            pending: Vec::with_capacity(config.batch_size),
            batch_tx: Some(batch_tx),
            stats: SessionStats::default(),
        };
        (session, control)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DecodeState {
        self.state.current()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Drive `engine` to completion on the current thread, then release it.
    ///
    /// If the engine returns before signalling end of stream, whatever was
    /// decoded so far is still delivered.
    pub fn run(mut self, mut engine: Box<dyn DecoderEngine>) -> SessionStats {
        log::info!(
            "Decode session {} started: {} ({} ms, {} Hz, {} ch, step {} ms)",
            self.id,
            self.track.mime_type,
            self.track.duration_ms,
            self.track.sample_rate,
            self.track.channel_count,
            self.config.step_ms
        );

        if let Err(e) = engine.run(&mut self) {
            log::error!("Decode session {}: decoder failed: {}", self.id, e);
        }

        if !self.state.current().is_halted() {
            let event = if self.cancel.is_cancelled() {
                SessionEvent::Cancelled
            } else {
                log::warn!(
                    "Decode session {}: decoder returned before end of stream",
                    self.id
                );
                SessionEvent::EndOfStream
            };
            let effects = self.state.apply(event);
            self.run_effects(None, effects, None);
        }

        engine.release();

        log::info!(
            "Decode session {} finished ({}): {} blocks read, {} decoded, {} dropped, {} batches",
            self.id,
            self.state.current().as_str(),
            self.stats.blocks_read,
            self.stats.blocks_decoded,
            self.stats.blocks_dropped,
            self.stats.batches_submitted
        );
        self.stats
    }

    fn run_effects(
        &mut self,
        mut codec: Option<&mut dyn Codec>,
        effects: Vec<SessionEffect>,
        input_index: Option<usize>,
    ) {
        for effect in effects {
            match effect {
                SessionEffect::QueueEndOfStream => {
                    if let (Some(codec), Some(index)) = (codec.as_deref_mut(), input_index) {
                        codec.queue_input_buffer(index, 0, self.offset_us(), true);
                    }
                }
                SessionEffect::StopDecoder => {
                    if let Some(codec) = codec.as_deref_mut() {
                        codec.stop();
                    }
                }
                SessionEffect::FlushFinalBatch => self.submit_batch(true),
                SessionEffect::DiscardPending => self.discard_pending(),
            }
        }
    }

    fn halt_on_cancel(&mut self, codec: &mut dyn Codec) {
        let effects = self.state.apply(SessionEvent::Cancelled);
        self.run_effects(Some(codec), effects, None);
    }

    fn offset_us(&self) -> i64 {
        i64::try_from(self.current_offset_ms)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000)
    }

    /// Queue one low-pass + RMS task for a decoded block.
    fn schedule(&mut self, samples: Vec<f32>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let sample_rate = self.format.sample_rate;
        let cutoff_hz = self.config.cutoff_hz;
        let task = self.runtime.spawn_blocking(move || {
            dsp::rms(&dsp::low_pass_filter(&samples, sample_rate, cutoff_hz))
        });
        self.pending.push(task);
    }

    fn submit_batch(&mut self, last: bool) {
        if self.cancel.is_cancelled() {
            self.discard_pending();
            return;
        }
        let tasks = std::mem::take(&mut self.pending);
        if let Some(tx) = &self.batch_tx {
            if !tasks.is_empty() || last {
                self.stats.batches_submitted += usize::from(!tasks.is_empty());
                if tx.send(PendingBatch { tasks, last }).is_err() {
                    log::warn!("Decode session {}: drainer gone, batch dropped", self.id);
                }
            }
        }
        if last {
            self.batch_tx = None;
        }
    }

    fn discard_pending(&mut self) {
        for task in self.pending.drain(..) {
            task.abort();
        }
        self.batch_tx = None;
    }
}

impl CodecCallback for DecodeSession {
    fn on_input_buffer_available(&mut self, codec: &mut dyn Codec, index: usize) {
        if self.cancel.is_cancelled() {
            self.halt_on_cancel(codec);
            return;
        }

        let end_ms = self.track.duration_ms.saturating_add(self.config.step_ms);
        let past_end = self.current_offset_ms > end_ms;
        if self.state.current() != DecodeState::Executing || self.source_exhausted || past_end {
            let effects = self.state.apply(SessionEvent::SourceExhausted);
            self.run_effects(Some(codec), effects, Some(index));
            return;
        }

        self.source.seek_to(self.offset_us(), SeekMode::PreviousSync);
        let size = match codec.input_buffer(index) {
            Some(buf) => self.source.read_sample(buf),
            None => {
                log::warn!(
                    "Decode session {}: no input buffer at index {}",
                    self.id,
                    index
                );
                0
            }
        };
        if size == 0 {
            let effects = self.state.apply(SessionEvent::SourceExhausted);
            self.run_effects(Some(codec), effects, Some(index));
            return;
        }

        let presentation_time_us = self
            .source
            .sample_time_us()
            .unwrap_or_else(|| self.offset_us());
        codec.queue_input_buffer(index, size, presentation_time_us, false);
        self.stats.blocks_read += 1;

        if !self.source.advance() {
            self.source_exhausted = true;
        }
        self.current_offset_ms = self.current_offset_ms.saturating_add(self.config.step_ms);
    }

    fn on_output_buffer_available(
        &mut self,
        codec: &mut dyn Codec,
        index: usize,
        info: BufferInfo,
    ) {
        if self.cancel.is_cancelled() {
            codec.release_output_buffer(index);
            self.halt_on_cancel(codec);
            return;
        }
        if self.state.current().is_halted() {
            codec.release_output_buffer(index);
            return;
        }

        if info.size > 0 {
            let converted = codec.output_buffer(index).map(|bytes| {
                let len = info.size.min(bytes.len());
                dsp::to_float_samples(
                    &bytes[..len],
                    self.format.bit_depth,
                    self.format.channel_count,
                )
            });
            codec.release_output_buffer(index);

            match converted {
                Some(Ok(samples)) => {
                    self.stats.blocks_decoded += 1;
                    self.schedule(samples);
                }
                Some(Err(e)) => {
                    self.stats.blocks_dropped += 1;
                    log::warn!(
                        "Decode session {}: dropping block at {} us: {}",
                        self.id,
                        info.presentation_time_us,
                        e
                    );
                }
                None => {
                    self.stats.blocks_dropped += 1;
                    log::warn!(
                        "Decode session {}: no output buffer at index {}",
                        self.id,
                        index
                    );
                }
            }
        } else {
            codec.release_output_buffer(index);
        }

        if self.pending.len() >= self.config.batch_size {
            self.submit_batch(false);
        }

        if info.end_of_stream {
            let effects = self.state.apply(SessionEvent::EndOfStream);
            self.run_effects(Some(codec), effects, None);
        }
    }

    fn on_output_format_changed(&mut self, _codec: &mut dyn Codec, format: PcmFormat) {
        match format.validate() {
            Ok(()) => {
                if format != self.format {
                    log::debug!("Decode session {}: output format {:?}", self.id, format);
                    self.format = format;
                }
            }
            Err(e) => log::warn!(
                "Decode session {}: ignoring output format change: {}",
                self.id,
                e
            ),
        }
    }

    fn on_error(&mut self, _codec: &mut dyn Codec, error: DecodeError) {
        log::error!("Decode session {}: codec error: {}", self.id, error);
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        // Dropped without finishing (e.g. purged from the worker queue)
        if !self.state.current().is_halted() {
            let effects = self.state.apply(SessionEvent::Cancelled);
            self.run_effects(None, effects, None);
        }
        self.discard_pending();
    }
}

/// Await each batch's filter tasks in order and forward the amplitudes.
async fn drain_batches(
    session_id: Uuid,
    mut batches: mpsc::UnboundedReceiver<PendingBatch>,
    subscriber: mpsc::Sender<Vec<f32>>,
    cancel: CancellationToken,
) {
    let mut delivered_batches = 0usize;
    let mut delivered_values = 0usize;

    while let Some(batch) = batches.recv().await {
        if cancel.is_cancelled() {
            for task in &batch.tasks {
                task.abort();
            }
            continue;
        }

        let mut values = Vec::with_capacity(batch.tasks.len());
        for task in batch.tasks {
            match task.await {
                Ok(value) => values.push(value),
                Err(e) if e.is_cancelled() => {}
                Err(e) => log::warn!("Decode session {}: filter task failed: {}", session_id, e),
            }
        }

        if cancel.is_cancelled() {
            log::debug!(
                "Decode session {}: cancelled, discarding {} values",
                session_id,
                values.len()
            );
            continue;
        }
        if !values.is_empty() {
            delivered_values += values.len();
            delivered_batches += 1;
            if subscriber.send(values).await.is_err() {
                log::debug!("Decode session {}: subscriber gone", session_id);
                break;
            }
        }
        if batch.last {
            break;
        }
    }

    log::info!(
        "Decode session {}: delivered {} values in {} batches",
        session_id,
        delivered_values,
        delivered_batches
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{PcmPassthroughEngine, WavSource};

    /// One second of mono silence at 8kHz, as a WAV file in memory.
    fn silent_wav(bits: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: bits,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..8000 {
                if bits == 16 {
                    writer.write_sample(0i16).unwrap();
                } else {
                    writer.write_sample(0i32).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn start(
        source: WavSource,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> (DecodeSession, SessionControl, mpsc::Receiver<Vec<f32>>) {
        let track = source.track_info(0).unwrap();
        start_with_track(source, track, batch_size, cancel)
    }

    fn start_with_track(
        source: WavSource,
        track: TrackInfo,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> (DecodeSession, SessionControl, mpsc::Receiver<Vec<f32>>) {
        let config = SessionConfig {
            step_ms: 100,
            batch_size,
            cutoff_hz: 10.0,
        };
        let (tx, rx) = mpsc::channel(16);
        let runtime = Handle::current();
        let (session, control) =
            DecodeSession::new(Box::new(source), track, config, runtime, cancel, tx);
        (session, control, rx)
    }

    fn pcm_engine(track: &TrackInfo) -> Box<dyn DecoderEngine> {
        let mut engine = PcmPassthroughEngine::default();
        engine.configure(track).unwrap();
        Box::new(engine)
    }

    async fn run_to_end(
        session: DecodeSession,
        engine: Box<dyn DecoderEngine>,
    ) -> SessionStats {
        tokio::task::spawn_blocking(move || session.run(engine))
            .await
            .unwrap()
    }

    async fn collect(mut rx: mpsc::Receiver<Vec<f32>>) -> Vec<Vec<f32>> {
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        batches
    }

    /// Passes everything through to the session, but reports a malformed
    /// output format and a codec error just before the third output block.
    struct GlitchyEngine(PcmPassthroughEngine);

    struct GlitchyCallback<'a> {
        inner: &'a mut dyn CodecCallback,
        outputs: usize,
    }

    impl DecoderEngine for GlitchyEngine {
        fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError> {
            self.0.configure(track)
        }

        fn run(&mut self, callback: &mut dyn CodecCallback) -> Result<(), DecodeError> {
            let mut glitchy = GlitchyCallback {
                inner: callback,
                outputs: 0,
            };
            self.0.run(&mut glitchy)
        }

        fn release(&mut self) {
            self.0.release()
        }
    }

    impl CodecCallback for GlitchyCallback<'_> {
        fn on_input_buffer_available(&mut self, codec: &mut dyn Codec, index: usize) {
            self.inner.on_input_buffer_available(codec, index);
        }

        fn on_output_buffer_available(
            &mut self,
            codec: &mut dyn Codec,
            index: usize,
            info: BufferInfo,
        ) {
            self.outputs += 1;
            if self.outputs == 3 {
                let bogus = PcmFormat {
                    sample_rate: 0,
                    channel_count: 0,
                    bit_depth: 12,
                };
                self.inner.on_output_format_changed(codec, bogus);
                self.inner
                    .on_error(codec, DecodeError::Codec("transient glitch".to_string()));
            }
            self.inner.on_output_buffer_available(codec, index, info);
        }

        fn on_output_format_changed(&mut self, codec: &mut dyn Codec, format: PcmFormat) {
            self.inner.on_output_format_changed(codec, format);
        }

        fn on_error(&mut self, codec: &mut dyn Codec, error: DecodeError) {
            self.inner.on_error(codec, error);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decodes_one_value_per_step() {
        let mut source = WavSource::from_bytes(silent_wav(16)).unwrap();
        source.select_track(0).unwrap();
        let (session, control, rx) = start(source, 4, CancellationToken::new());
        let engine = pcm_engine(&session.track);

        let stats = run_to_end(session, engine).await;

        let batches = collect(rx).await;
        let values: Vec<f32> = batches.iter().flatten().copied().collect();
        assert_eq!(values.len(), 10);
        assert!(values.iter().all(|v| *v == 0.0));
        // 10 values in batches of 4: 4 + 4 + final 2
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(stats.blocks_decoded, 10);
        assert_eq!(stats.blocks_dropped, 0);
        assert_eq!(control.state(), DecodeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsupported_blocks_are_dropped() {
        let mut source = WavSource::from_bytes(silent_wav(24)).unwrap();
        source.select_track(0).unwrap();
        let (session, control, rx) = start(source, 4, CancellationToken::new());
        let engine = pcm_engine(&session.track);

        let stats = run_to_end(session, engine).await;

        assert!(collect(rx).await.is_empty());
        assert_eq!(stats.blocks_decoded, 0);
        assert_eq!(stats.blocks_dropped, 10);
        assert_eq!(control.state(), DecodeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_duration_decodes_to_the_end_of_the_source() {
        let mut source = WavSource::from_bytes(silent_wav(16)).unwrap();
        source.select_track(0).unwrap();
        let mut track = source.track_info(0).unwrap();
        track.duration_ms = u64::MAX;
        let (session, control, rx) =
            start_with_track(source, track, 4, CancellationToken::new());
        let engine = pcm_engine(&session.track);

        let stats = run_to_end(session, engine).await;

        let values: Vec<f32> = collect(rx).await.into_iter().flatten().collect();
        assert_eq!(values.len(), 10);
        assert_eq!(stats.blocks_decoded, 10);
        assert_eq!(control.state(), DecodeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_format_change_and_codec_error_do_not_stop_decoding() {
        let mut source = WavSource::from_bytes(silent_wav(16)).unwrap();
        source.select_track(0).unwrap();
        let (session, control, rx) = start(source, 4, CancellationToken::new());
        let mut engine = GlitchyEngine(PcmPassthroughEngine::default());
        engine.configure(&session.track).unwrap();

        let stats = run_to_end(session, Box::new(engine)).await;

        // A 12-bit format would have made every later block unconvertible
        let values: Vec<f32> = collect(rx).await.into_iter().flatten().collect();
        assert_eq!(values.len(), 10);
        assert!(values.iter().all(|v| *v == 0.0));
        assert_eq!(stats.blocks_decoded, 10);
        assert_eq!(stats.blocks_dropped, 0);
        assert_eq!(control.state(), DecodeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_session_delivers_nothing() {
        let mut source = WavSource::from_bytes(silent_wav(16)).unwrap();
        source.select_track(0).unwrap();
        let cancel = CancellationToken::new();
        let (session, control, rx) = start(source, 4, cancel.clone());
        let engine = pcm_engine(&session.track);
        cancel.cancel();

        let stats = run_to_end(session, engine).await;

        assert!(collect(rx).await.is_empty());
        assert_eq!(stats.blocks_decoded, 0);
        assert_eq!(control.state(), DecodeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_session_closes_subscriber() {
        let source = WavSource::from_bytes(silent_wav(16)).unwrap();
        let (session, control, rx) = start(source, 4, CancellationToken::new());
        drop(session);

        assert!(collect(rx).await.is_empty());
        assert_eq!(control.state(), DecodeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_marks_released() {
        let source = WavSource::from_bytes(silent_wav(16)).unwrap();
        let (_session, control, _rx) = start(source, 4, CancellationToken::new());
        control.release();
        control.release();
        assert_eq!(control.state(), DecodeState::Released);
        assert!(control.cancel_token().is_cancelled());
    }

    #[test]
    fn config_from_settings() {
        let settings = VisualizerSettings::default();
        let config = SessionConfig::from_settings(&settings, 50);
        assert_eq!(config.step_ms, 50);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.cutoff_hz, 20.0);
    }
}
