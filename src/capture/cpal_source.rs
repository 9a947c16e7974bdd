//! Microphone capture source using CPAL.
//!
//! The input stream lives on a dedicated thread (CPAL streams are not `Send`
//! on every platform). The audio callback only folds each buffer into an
//! atomic peak, which `sample_once` swaps back to zero.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use super::{CaptureError, CaptureSource, CaptureState};

const STATE_RECORDING: u8 = 0;
const STATE_PAUSED: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct Shared {
    peak: AtomicI32,
    state: AtomicU8,
    configured: AtomicBool,
}

pub struct CpalCaptureSource {
    shared: Arc<Shared>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCaptureSource {
    /// Open the default input device and start recording.
    pub fn start() -> Result<Self, CaptureError> {
        let shared = Arc::new(Shared {
            peak: AtomicI32::new(0),
            state: AtomicU8::new(STATE_RECORDING),
            configured: AtomicBool::new(false),
        });
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), CaptureError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("capture-input".to_string())
            .spawn(move || {
                let stream = match open_stream(thread_shared.clone()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                thread_shared.configured.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                // Park until stop() or the source is dropped
                let _ = stop_rx.recv();
                drop(stream);
                thread_shared.configured.store(false, Ordering::SeqCst);
                log::info!("Capture input stream closed");
            })
            .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::StreamCreationFailed(
                    "capture thread exited during setup".to_string(),
                ))
            }
        }
    }

    pub fn pause(&self) {
        let _ = self.shared.state.compare_exchange(
            STATE_RECORDING,
            STATE_PAUSED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn resume(&self) {
        let _ = self.shared.state.compare_exchange(
            STATE_PAUSED,
            STATE_RECORDING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Close the input stream. Idempotent.
    pub fn stop(&mut self) {
        self.shared.state.store(STATE_STOPPED, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture input thread panicked");
            }
        }
    }
}

impl CaptureSource for CpalCaptureSource {
    fn sample_once(&self) -> Option<i32> {
        if !self.shared.configured.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.shared.peak.swap(0, Ordering::SeqCst))
    }

    fn current_state(&self) -> CaptureState {
        match self.shared.state.load(Ordering::SeqCst) {
            STATE_RECORDING => CaptureState::Recording,
            STATE_PAUSED => CaptureState::Paused,
            _ => CaptureState::Other,
        }
    }
}

impl Drop for CpalCaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(shared: Arc<Shared>) -> Result<Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| CaptureError::NoSupportedConfig)?;

    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let stream = match sample_format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, shared)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, shared)?,
        SampleFormat::F32 => build_stream::<f32>(&device, &config, shared)?,
        _ => return Err(CaptureError::NoSupportedConfig),
    };

    stream
        .play()
        .map_err(|e| CaptureError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;
    Ok(stream)
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if shared.state.load(Ordering::Relaxed) != STATE_RECORDING {
                    return;
                }
                let peak = data
                    .iter()
                    .map(|&s| i32::from(sample_to_i16(s)).abs())
                    .max()
                    .unwrap_or(0);
                shared.peak.fetch_max(peak, Ordering::Relaxed);
            },
            |err| log::error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))
}

/// Convert any sample type to i16.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let value = <f32 as cpal::Sample>::from_sample(sample);
    (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
    }
}
