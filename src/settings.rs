use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio::{CopyStrategy, DeviceFormat, IoErrorPolicy};
use crate::error::{PipelineError, PipelineResult};

/// Default location of the raw PCM recording used by `record` and `play`
pub const DEFAULT_RECORDING_PATH: &str = "/sdcard/audio.wav";

/// Returns the path to the settings file: `~/.config/loopback-rs/settings.json`
pub fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("loopback-rs");
    path.push("settings.json");
    path
}

/// Frame geometry and playback delay shared by every pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sample_rate: u32,
    /// Capacity of one frame in bytes (882 = 20 ms)
    pub frame_bytes: usize,
    /// Amount of audio buffered before live playback starts
    pub playback_delay_ms: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            frame_bytes: 882,
            playback_delay_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Nominal duration of one frame, `frame_bytes * 1000 / sample_rate`
    pub fn frame_duration_ms(&self) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frame_bytes as u64 * 1000 / self.sample_rate as u64) as u32
    }

    /// Number of queued frames required before live playback starts
    pub fn delay_frames(&self) -> usize {
        let frame_ms = self.frame_duration_ms().max(1);
        ((self.playback_delay_ms / frame_ms) as usize).max(1)
    }

    pub fn device_format(&self) -> DeviceFormat {
        DeviceFormat {
            sample_rate: self.sample_rate,
            channels: 1,
            frame_bytes: self.frame_bytes,
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.sample_rate == 0 {
            return Err(PipelineError::InvalidConfig(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.frame_bytes == 0 || self.frame_bytes % 2 != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "frame_bytes must be a positive multiple of 2, got {}",
                self.frame_bytes
            )));
        }
        if self.frame_duration_ms() == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "a frame of {} bytes is shorter than 1 ms at {} Hz",
                self.frame_bytes, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Persisted application settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub pipeline: PipelineConfig,

    // Recording
    pub recording_path: PathBuf,
    pub copy_strategy: CopyStrategy,
    pub io_error_policy: IoErrorPolicy,

    // Devices (None = host default)
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            recording_path: PathBuf::from(DEFAULT_RECORDING_PATH),
            copy_strategy: CopyStrategy::default(),
            io_error_policy: IoErrorPolicy::default(),
            input_device: None,
            output_device: None,
        }
    }
}

impl AppSettings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(&settings_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) -> PipelineResult<PathBuf> {
        let path = settings_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> PipelineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, json)?;
        log::info!("Saved settings to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delay_is_fifty_frames() {
        let config = PipelineConfig::default();
        assert_eq!(config.frame_duration_ms(), 20);
        assert_eq!(config.delay_frames(), 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delay_frames_never_zero() {
        let config = PipelineConfig {
            playback_delay_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.delay_frames(), 1);
    }

    #[test]
    fn test_validate_rejects_odd_frame() {
        let config = PipelineConfig {
            frame_bytes: 881,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));

        let config = PipelineConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "pipeline": { "playback_delay_ms": 500 } }"#).unwrap();

        let settings = AppSettings::load_from(&path);
        assert_eq!(settings.pipeline.playback_delay_ms, 500);
        assert_eq!(settings.pipeline.frame_bytes, 882);
        assert_eq!(settings.recording_path, PathBuf::from(DEFAULT_RECORDING_PATH));
        assert_eq!(settings.io_error_policy, IoErrorPolicy::LogAndContinue);
    }

    #[test]
    fn test_garbage_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let settings = AppSettings::load_from(&path);
        assert_eq!(settings.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = AppSettings {
            copy_strategy: CopyStrategy::ArrayZero,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = AppSettings::load_from(&path);
        assert_eq!(loaded.copy_strategy, CopyStrategy::ArrayZero);
    }
}
