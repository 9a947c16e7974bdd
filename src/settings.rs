use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SETTINGS_DIR_NAME: &str = "waveform-visualizer";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to create config directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerSettings {
    /// Time between two visual points when decoding a file.
    pub step_ms: u64,

    /// Number of per-block filter tasks collected before a batch is delivered.
    pub batch_size: usize,

    /// Low-pass cutoff is `cutoff_numerator / step_ms` Hz. Empirical; 1000 turns a
    /// 100ms step into a 10Hz envelope.
    pub cutoff_numerator: f32,

    /// Live capture window; the ring buffer holds twice this many samples.
    pub capture_window_size: usize,

    /// Interval between two reads of the capture source.
    pub capture_tick_ms: u64,

    /// Neighbor weight for the three-point smoothing of capture windows.
    pub capture_smoothing: f32,

    /// Thread name of the decode worker.
    pub worker_name: String,

    /// Join timeout after a graceful quit request.
    pub quit_timeout_ms: u64,

    /// Join timeout after a forced quit request. Longer than the graceful one.
    pub force_quit_timeout_ms: u64,

    /// Final join timeout after interrupting the worker.
    pub interrupt_timeout_ms: u64,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            step_ms: 100,
            batch_size: 100,
            cutoff_numerator: 1000.0,
            capture_window_size: 50,
            capture_tick_ms: 50,
            capture_smoothing: 0.3,
            worker_name: "waveform-decoder".to_string(),
            quit_timeout_ms: 1000,
            force_quit_timeout_ms: 2000,
            interrupt_timeout_ms: 250,
        }
    }
}

impl VisualizerSettings {
    pub fn capture_tick(&self) -> Duration {
        Duration::from_millis(self.capture_tick_ms.max(1))
    }

    /// Low-pass cutoff in Hz for a given visual step.
    pub fn cutoff_hz(&self, step_ms: u64) -> f32 {
        self.cutoff_numerator / step_ms.max(1) as f32
    }
}

/// Default location: `<config dir>/waveform-visualizer/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from `path`, falling back to defaults when the file is missing
/// or unreadable.
pub fn load_settings(path: &Path) -> VisualizerSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VisualizerSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VisualizerSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VisualizerSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VisualizerSettings::default()
        }
    }
}

/// Load settings from the default location.
pub fn load_default_settings() -> VisualizerSettings {
    match default_settings_path() {
        Ok(path) => load_settings(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            VisualizerSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &VisualizerSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the destination.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // rename() does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Write {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
