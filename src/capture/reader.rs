//! Capture amplitude ring buffer and tick loop

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{CaptureSource, CaptureState};
use crate::dsp;
use crate::settings::VisualizerSettings;

/// Windows buffered between the reader and a slow renderer
const WINDOW_CHANNEL_CAPACITY: usize = 16;

/// Smallest and largest sample seen since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicRange {
    pub min: i32,
    pub max: i32,
}

impl DynamicRange {
    fn new(sample: i32) -> Self {
        Self {
            min: sample,
            max: sample,
        }
    }

    fn include(&mut self, sample: i32) {
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }
}

/// Bounded FIFO of raw capture samples.
///
/// Holds at most `2 * window_size` samples; pushing at capacity evicts the
/// oldest one. The range only ever widens until [`clear`](Self::clear).
pub struct CaptureRingBuffer {
    samples: VecDeque<i32>,
    capacity: usize,
    range: Option<DynamicRange>,
}

impl CaptureRingBuffer {
    pub fn new(window_size: usize) -> Self {
        let capacity = window_size.max(1) * 2;
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            range: None,
        }
    }

    pub fn push(&mut self, sample: i32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        match self.range.as_mut() {
            Some(range) => range.include(sample),
            None => self.range = Some(DynamicRange::new(sample)),
        }
    }

    /// Current contents remapped onto [0,1] against the tracked range, then
    /// smoothed.
    pub fn window(&self, smoothing: f32) -> Vec<f32> {
        let raw: Vec<f32> = self.samples.iter().map(|&s| s as f32).collect();
        let normalized = match self.range {
            Some(range) => dsp::normalize_with_range(&raw, range.min as f32, range.max as f32),
            None => raw,
        };
        dsp::smooth(&normalized, smoothing)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.range = None;
    }

    pub fn range(&self) -> Option<DynamicRange> {
        self.range
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Polls a [`CaptureSource`] and emits normalized amplitude windows.
pub struct CaptureAmplitudeReader {
    source: Arc<dyn CaptureSource>,
    window_size: usize,
    tick: Duration,
    smoothing: f32,
}

impl CaptureAmplitudeReader {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        window_size: usize,
        tick: Duration,
        smoothing: f32,
    ) -> Self {
        Self {
            source,
            window_size,
            tick,
            smoothing,
        }
    }

    pub fn from_settings(source: Arc<dyn CaptureSource>, settings: &VisualizerSettings) -> Self {
        Self::new(
            source,
            settings.capture_window_size,
            settings.capture_tick(),
            settings.capture_smoothing,
        )
    }

    /// Spawn the tick loop on the current runtime and return its windows.
    ///
    /// The channel closes when the source reports no configured input, the
    /// state sender is dropped while idle, or `cancel` fires.
    pub fn windows(
        self,
        state_rx: watch::Receiver<CaptureState>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Vec<f32>> {
        self.windows_on(&Handle::current(), state_rx, cancel)
    }

    pub fn windows_on(
        self,
        runtime: &Handle,
        state_rx: watch::Receiver<CaptureState>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Vec<f32>> {
        let (tx, rx) = mpsc::channel(WINDOW_CHANNEL_CAPACITY);
        runtime.spawn(self.run(state_rx, tx, cancel));
        rx
    }

    pub async fn run(
        self,
        mut state_rx: watch::Receiver<CaptureState>,
        windows: mpsc::Sender<Vec<f32>>,
        cancel: CancellationToken,
    ) {
        let mut buffer = CaptureRingBuffer::new(self.window_size);
        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleared = false;

        log::debug!("Capture reader started (window {}, tick {:?})", self.window_size, self.tick);

        loop {
            let state = *state_rx.borrow_and_update();

            if state.is_capturing() {
                cleared = false;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if !state_rx.borrow().is_capturing() {
                    continue;
                }

                let Some(sample) = self.source.sample_once() else {
                    log::info!("Capture reader: input not configured, stopping");
                    break;
                };
                buffer.push(sample);
                if windows.send(buffer.window(self.smoothing)).await.is_err() {
                    break;
                }
            } else {
                if !cleared {
                    buffer.clear();
                    cleared = true;
                    if windows.send(Vec::new()).await.is_err() {
                        break;
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        buffer.clear();
        log::debug!("Capture reader stopped");
    }
}

/// Publish `source.current_state()` on a watch channel, polled every
/// `period` until `cancel` fires.
pub fn poll_capture_state(
    source: Arc<dyn CaptureSource>,
    period: Duration,
    cancel: CancellationToken,
) -> watch::Receiver<CaptureState> {
    let (tx, rx) = watch::channel(source.current_state());
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = tick.tick() => {
                    let state = source.current_state();
                    tx.send_if_modified(|current| {
                        let changed = *current != state;
                        *current = state;
                        changed
                    });
                }
            }
        }
    });
    rx
}
