//! Visualizer facade.
//!
//! Ties a decode session to the worker thread and exposes the result as two
//! watch channels: the load state and the normalized amplitude series. Only
//! one session may be live at a time; a second `prepare` is rejected rather
//! than queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureAmplitudeReader, CaptureSource, CaptureState};
use crate::decode::{
    find_audio_track, DecodeError, DecodeSession, DecodeState, DecoderFactory, MediaSource,
    PcmDecoderFactory, SessionConfig, SessionControl,
};
use crate::dsp;
use crate::settings::VisualizerSettings;
use crate::worker::{LifecycleEvent, ShutdownOutcome, WorkerError, WorkerLifecycleController};

/// Batches buffered between a session's drainer and the accumulator
const BATCH_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum VisualizerError {
    #[error("A decode session is already active")]
    SessionAlreadyActive,
    #[error("Media source has no tracks")]
    NoTrack,
    #[error("Media source has no audio track (found: {0})")]
    InvalidSource(String),
    #[error("Step must be at least 1 ms")]
    InvalidStep,
    #[error(transparent)]
    Decoder(#[from] DecodeError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Load state of the amplitude series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VisualizerState {
    NotStarted,
    Running,
    Finished,
}

/// Raw amplitudes of the current session. `generation` changes whenever the
/// series is reset so batches from an older session can be recognized.
#[derive(Default)]
struct Accumulator {
    generation: u64,
    values: Vec<f32>,
}

/// Everything a forwarder task needs to publish results.
#[derive(Clone)]
struct Outputs {
    accumulator: Arc<Mutex<Accumulator>>,
    state: Arc<watch::Sender<VisualizerState>>,
    amplitudes: Arc<watch::Sender<Vec<f32>>>,
}

impl Outputs {
    /// Start a new series and return its generation.
    fn reset(&self) -> u64 {
        let mut acc = lock(&self.accumulator);
        acc.generation += 1;
        acc.values.clear();
        self.amplitudes.send_replace(Vec::new());
        self.state.send_replace(VisualizerState::NotStarted);
        acc.generation
    }
}

struct ActiveSession {
    control: SessionControl,
    forwarder: JoinHandle<()>,
}

impl ActiveSession {
    /// Live until released or until every batch has been forwarded.
    fn is_live(&self) -> bool {
        self.control.state() != DecodeState::Released && !self.forwarder.is_finished()
    }
}

pub struct Visualizer {
    settings: VisualizerSettings,
    runtime: Handle,
    scope: CancellationToken,
    factory: Arc<dyn DecoderFactory>,
    worker: WorkerLifecycleController,
    session: Mutex<Option<ActiveSession>>,
    outputs: Outputs,
    state_rx: watch::Receiver<VisualizerState>,
    amplitudes_rx: watch::Receiver<Vec<f32>>,
}

impl Visualizer {
    /// `runtime` hosts the filter tasks and forwarders; cancelling `scope`
    /// cancels every session and capture reader started from here.
    pub fn new(
        settings: VisualizerSettings,
        runtime: Handle,
        scope: CancellationToken,
        factory: Arc<dyn DecoderFactory>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(VisualizerState::NotStarted);
        let (amplitudes_tx, amplitudes_rx) = watch::channel(Vec::new());
        Self {
            worker: WorkerLifecycleController::from_settings(&settings),
            settings,
            runtime,
            scope,
            factory,
            session: Mutex::new(None),
            outputs: Outputs {
                accumulator: Arc::new(Mutex::new(Accumulator::default())),
                state: Arc::new(state_tx),
                amplitudes: Arc::new(amplitudes_tx),
            },
            state_rx,
            amplitudes_rx,
        }
    }

    /// Facade decoding uncompressed PCM sources such as [`WavSource`](crate::decode::WavSource).
    pub fn with_pcm_decoder(
        settings: VisualizerSettings,
        runtime: Handle,
        scope: CancellationToken,
    ) -> Self {
        Self::new(settings, runtime, scope, Arc::new(PcmDecoderFactory::default()))
    }

    pub fn settings(&self) -> &VisualizerSettings {
        &self.settings
    }

    /// Start extracting one amplitude per `step_ms` from `source`.
    ///
    /// Returns once the session is queued on the worker; results arrive on
    /// [`normalized_amplitudes`](Self::normalized_amplitudes).
    pub fn prepare(
        &self,
        mut source: Box<dyn MediaSource>,
        step_ms: u64,
    ) -> Result<(), VisualizerError> {
        if step_ms == 0 {
            return Err(VisualizerError::InvalidStep);
        }

        let mut slot = lock(&self.session);
        if slot.as_ref().is_some_and(ActiveSession::is_live) {
            return Err(VisualizerError::SessionAlreadyActive);
        }

        if source.track_count() == 0 {
            return Err(VisualizerError::NoTrack);
        }
        let (track_index, track) = find_audio_track(&*source).ok_or_else(|| {
            let found: Vec<String> = (0..source.track_count())
                .filter_map(|i| source.track_info(i).map(|t| t.mime_type))
                .collect();
            VisualizerError::InvalidSource(found.join(", "))
        })?;
        source.select_track(track_index)?;

        let mut engine = self.factory.create(&track)?;
        engine.configure(&track)?;
        let worker = self.worker.bind()?;

        let generation = self.outputs.reset();
        let cancel = self.scope.child_token();
        let config = SessionConfig::from_settings(&self.settings, step_ms);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let (session, control) = DecodeSession::new(
            source,
            track,
            config,
            self.runtime.clone(),
            cancel.clone(),
            batch_tx,
        );
        let session_id = control.id();

        let forwarder = self.runtime.spawn(forward_batches(
            self.outputs.clone(),
            generation,
            batch_rx,
            cancel.clone(),
        ));

        let runtime = self.runtime.clone();
        let posted = worker.post(move |ctx| {
            let done = CancellationToken::new();
            runtime.spawn(link_interrupt(
                ctx.interrupt_token().clone(),
                cancel,
                done.clone(),
            ));
            session.run(engine);
            done.cancel();
        });
        if let Err(e) = posted {
            control.release();
            self.outputs.reset();
            return Err(e.into());
        }

        log::info!(
            "Visualizer: session {} queued on '{}' (step {} ms)",
            session_id,
            worker.name(),
            step_ms
        );
        *slot = Some(ActiveSession { control, forwarder });
        Ok(())
    }

    pub fn state(&self) -> watch::Receiver<VisualizerState> {
        self.state_rx.clone()
    }

    /// The accumulated series, rescaled onto [0,1] on every update.
    pub fn normalized_amplitudes(&self) -> watch::Receiver<Vec<f32>> {
        self.amplitudes_rx.clone()
    }

    /// State of the most recent decode session, if there has been one.
    pub fn decode_state(&self) -> Option<DecodeState> {
        lock(&self.session).as_ref().map(|s| s.control.state())
    }

    /// Start a capture reader for `source`, driven by `state_rx`.
    pub fn capture_windows(
        &self,
        source: Arc<dyn CaptureSource>,
        state_rx: watch::Receiver<CaptureState>,
    ) -> mpsc::Receiver<Vec<f32>> {
        CaptureAmplitudeReader::from_settings(source, &self.settings).windows_on(
            &self.runtime,
            state_rx,
            self.scope.child_token(),
        )
    }

    /// Cancel the current session, drop its results and go back to
    /// `NotStarted`. Safe to call any number of times.
    pub fn clean_up(&self) {
        let slot = lock(&self.session);
        if let Some(active) = slot.as_ref() {
            if active.control.state() != DecodeState::Released {
                log::info!("Visualizer: releasing session {}", active.control.id());
            }
            active.control.release();
        }
        self.outputs.reset();
    }

    /// Forward the owner's lifecycle to the worker. Destroy also cleans up.
    pub fn on_lifecycle_event(&self, event: LifecycleEvent) -> Result<(), VisualizerError> {
        if event == LifecycleEvent::Destroy {
            self.clean_up();
        }
        self.worker.on_lifecycle_event(event)?;
        Ok(())
    }

    /// Clean up and tear the worker thread down.
    pub fn shutdown(&self) -> ShutdownOutcome {
        self.clean_up();
        self.worker.shutdown()
    }
}

impl Drop for Visualizer {
    fn drop(&mut self) {
        let outcome = self.shutdown();
        log::debug!("Visualizer dropped, worker shutdown: {:?}", outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append each batch to the accumulator and republish the normalized series.
async fn forward_batches(
    outputs: Outputs,
    generation: u64,
    mut batches: mpsc::Receiver<Vec<f32>>,
    cancel: CancellationToken,
) {
    while let Some(batch) = batches.recv().await {
        let mut acc = lock(&outputs.accumulator);
        if acc.generation != generation || cancel.is_cancelled() {
            continue;
        }
        acc.values.extend(batch);
        let normalized: Vec<f32> = dsp::normalize(&acc.values)
            .into_iter()
            .map(|v| v.clamp(0.0, 1.0))
            .collect();
        outputs.amplitudes.send_replace(normalized);
        outputs.state.send_if_modified(|state| {
            if *state == VisualizerState::NotStarted {
                *state = VisualizerState::Running;
                return true;
            }
            false
        });
    }

    let acc = lock(&outputs.accumulator);
    if acc.generation == generation {
        log::debug!("Visualizer: series complete with {} values", acc.values.len());
        outputs.state.send_replace(VisualizerState::Finished);
    }
}

/// Cancel `session` if the worker is interrupted while it runs.
async fn link_interrupt(
    interrupt: CancellationToken,
    session: CancellationToken,
    done: CancellationToken,
) {
    tokio::select! {
        _ = interrupt.cancelled() => {
            log::warn!("Visualizer: worker interrupted, cancelling session");
            session.cancel();
        }
        _ = session.cancelled() => {}
        _ = done.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_up_before_prepare_is_harmless() {
        let visualizer = Visualizer::with_pcm_decoder(
            VisualizerSettings::default(),
            Handle::current(),
            CancellationToken::new(),
        );
        visualizer.clean_up();
        visualizer.clean_up();
        assert_eq!(*visualizer.state().borrow(), VisualizerState::NotStarted);
        assert!(visualizer.normalized_amplitudes().borrow().is_empty());
        assert_eq!(visualizer.decode_state(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_batches_are_ignored() {
        let (state_tx, state_rx) = watch::channel(VisualizerState::NotStarted);
        let (amplitudes_tx, amplitudes_rx) = watch::channel(Vec::new());
        let outputs = Outputs {
            accumulator: Arc::new(Mutex::new(Accumulator::default())),
            state: Arc::new(state_tx),
            amplitudes: Arc::new(amplitudes_tx),
        };
        let old = outputs.reset();
        let current = outputs.reset();
        assert_ne!(old, current);

        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![1.0, 2.0]).await.unwrap();
        drop(tx);
        forward_batches(outputs.clone(), old, rx, CancellationToken::new()).await;
        assert!(amplitudes_rx.borrow().is_empty());
        assert_eq!(*state_rx.borrow(), VisualizerState::NotStarted);

        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![1.0, 3.0]).await.unwrap();
        tx.send(vec![2.0]).await.unwrap();
        drop(tx);
        forward_batches(outputs, current, rx, CancellationToken::new()).await;
        assert_eq!(*amplitudes_rx.borrow(), vec![0.0, 1.0, 0.5]);
        assert_eq!(*state_rx.borrow(), VisualizerState::Finished);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_bad_arguments_and_empty_sources() {
        let visualizer = Visualizer::with_pcm_decoder(
            VisualizerSettings::default(),
            Handle::current(),
            CancellationToken::new(),
        );
        struct Empty;
        impl MediaSource for Empty {
            fn track_count(&self) -> usize {
                0
            }
            fn track_info(&self, _: usize) -> Option<crate::decode::TrackInfo> {
                None
            }
            fn select_track(&mut self, index: usize) -> Result<(), DecodeError> {
                Err(DecodeError::NoSuchTrack(index))
            }
            fn seek_to(&mut self, _: i64, _: crate::decode::SeekMode) {}
            fn read_sample(&mut self, _: &mut [u8]) -> usize {
                0
            }
            fn sample_time_us(&self) -> Option<i64> {
                None
            }
            fn advance(&mut self) -> bool {
                false
            }
        }
        assert!(matches!(
            visualizer.prepare(Box::new(Empty), 0),
            Err(VisualizerError::InvalidStep)
        ));
        assert!(matches!(
            visualizer.prepare(Box::new(Empty), 100),
            Err(VisualizerError::NoTrack)
        ));
    }
}
