//! `waveform-dump`: print the amplitude series of a WAV file.

use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use waveform_visualizer::decode::{DecodeError, WavSource};
use waveform_visualizer::dsp::{self, DspError};
use waveform_visualizer::settings::load_default_settings;
use waveform_visualizer::{Visualizer, VisualizerError, VisualizerState};

const USAGE: &str = "\
Usage: waveform-dump <file.wav> [--step MS] [--points N] [--json]
       waveform-dump --capture WINDOWS   (requires the cpal-capture feature)

  --step MS     time between two amplitudes (default from settings)
  --points N    reduce the series to N values
  --json        print a JSON array instead of one value per line

Set RUST_LOG=debug for verbose output.";

#[derive(Debug, Error)]
enum DumpError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Visualizer(#[from] VisualizerError),
    #[error(transparent)]
    Dsp(#[from] DspError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("Visualizer went away before finishing")]
    Interrupted,
    #[cfg(feature = "cpal-capture")]
    #[error(transparent)]
    Capture(#[from] waveform_visualizer::capture::CaptureError),
}

#[derive(Debug)]
enum Command {
    Decode {
        path: PathBuf,
        step_ms: Option<u64>,
        points: Option<usize>,
        json: bool,
    },
    Capture {
        windows: usize,
    },
}

fn parse_args(args: &[String]) -> Result<Command, DumpError> {
    let mut path = None;
    let mut step_ms = None;
    let mut points = None;
    let mut json = false;
    let mut capture = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--step" => step_ms = Some(parse_value(iter.next(), "--step")?),
            "--points" => points = Some(parse_value(iter.next(), "--points")?),
            "--capture" => capture = Some(parse_value(iter.next(), "--capture")?),
            "--json" => json = true,
            other if other.starts_with("--") => {
                return Err(DumpError::Usage(format!("Unknown option: {}", other)))
            }
            other => path = Some(PathBuf::from(other)),
        }
    }

    if let Some(windows) = capture {
        return Ok(Command::Capture { windows });
    }
    let path = path.ok_or_else(|| DumpError::Usage("Missing input file".to_string()))?;
    Ok(Command::Decode {
        path,
        step_ms,
        points,
        json,
    })
}

fn parse_value<T: std::str::FromStr>(value: Option<&String>, flag: &str) -> Result<T, DumpError> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| DumpError::Usage(format!("{} expects a positive number", flag)))
}

async fn dump_file(
    path: PathBuf,
    step_ms: Option<u64>,
    points: Option<usize>,
    json: bool,
) -> Result<(), DumpError> {
    let settings = load_default_settings();
    let step_ms = step_ms.unwrap_or(settings.step_ms);
    let source = WavSource::open(&path)?;

    let visualizer =
        Visualizer::with_pcm_decoder(settings, Handle::current(), CancellationToken::new());
    let mut state = visualizer.state();
    visualizer.prepare(Box::new(source), step_ms)?;

    state
        .wait_for(|s| *s == VisualizerState::Finished)
        .await
        .map_err(|_| DumpError::Interrupted)?;

    let mut amplitudes = visualizer.normalized_amplitudes().borrow().clone();
    if let Some(points) = points {
        amplitudes = dsp::decimate(&amplitudes, points)?;
    }

    log::info!("{}: {} amplitudes at {} ms", path.display(), amplitudes.len(), step_ms);

    if json {
        println!("{}", serde_json::to_string(&amplitudes)?);
    } else {
        for value in &amplitudes {
            println!("{:.4}", value);
        }
    }
    Ok(())
}

#[cfg(feature = "cpal-capture")]
async fn dump_capture(windows: usize) -> Result<(), DumpError> {
    use std::sync::Arc;
    use waveform_visualizer::capture::{poll_capture_state, CaptureSource, CpalCaptureSource};

    let settings = load_default_settings();
    let tick = settings.capture_tick();
    let visualizer =
        Visualizer::with_pcm_decoder(settings, Handle::current(), CancellationToken::new());

    let source: Arc<dyn CaptureSource> = Arc::new(CpalCaptureSource::start()?);
    let cancel = CancellationToken::new();
    let state_rx = poll_capture_state(source.clone(), tick, cancel.clone());
    let mut rx = visualizer.capture_windows(source, state_rx);

    for _ in 0..windows {
        let Some(window) = rx.recv().await else {
            break;
        };
        println!("{}", serde_json::to_string(&window)?);
    }
    cancel.cancel();
    visualizer.clean_up();
    Ok(())
}

#[cfg(not(feature = "cpal-capture"))]
async fn dump_capture(_windows: usize) -> Result<(), DumpError> {
    Err(DumpError::Usage(
        "Built without the cpal-capture feature".to_string(),
    ))
}

async fn run(command: Command) -> Result<(), DumpError> {
    match command {
        Command::Decode {
            path,
            step_ms,
            points,
            json,
        } => dump_file(path, step_ms, points, json).await,
        Command::Capture { windows } => dump_capture(windows).await,
    }
}

fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(DumpError::from)
        .and_then(|runtime| runtime.block_on(run(command)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_decode_options() {
        let argv = args(&["song.wav", "--step", "50", "--points", "200", "--json"]);
        let command = parse_args(&argv).unwrap();
        match command {
            Command::Decode {
                path,
                step_ms,
                points,
                json,
            } => {
                assert_eq!(path, PathBuf::from("song.wav"));
                assert_eq!(step_ms, Some(50));
                assert_eq!(points, Some(200));
                assert!(json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(parse_args(&args(&[])), Err(DumpError::Usage(_))));
        assert!(matches!(parse_args(&args(&["a.wav", "--step", "x"])), Err(DumpError::Usage(_))));
        assert!(matches!(parse_args(&args(&["a.wav", "--bogus"])), Err(DumpError::Usage(_))));
    }

    #[test]
    fn capture_needs_no_file() {
        assert!(matches!(
            parse_args(&args(&["--capture", "20"])),
            Ok(Command::Capture { windows: 20 })
        ));
    }
}
