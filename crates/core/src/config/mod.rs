use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stage: StageConfig,
    pub audio: AudioTiming,
    pub transport: TransportConfig,
    pub assets: AssetConfig,
}

impl AppConfig {
    /// Loads a configuration file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Geometry and pacing of the render surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Width of the authoring grid all element coordinates live in.
    pub virtual_width: f32,
    pub virtual_height: f32,
    /// Pixel size of the render surface.
    pub output_width: u32,
    pub output_height: u32,
    pub target_fps: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            virtual_width: 1920.0,
            virtual_height: 1080.0,
            output_width: 1920,
            output_height: 1080,
            target_fps: 60,
        }
    }
}

impl StageConfig {
    /// Milliseconds between two frames at the target rate.
    pub fn frame_interval_ms(&self) -> f64 {
        1000.0 / f64::from(self.target_fps.max(1))
    }
}

/// Empirically tuned timings of the audio reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioTiming {
    /// Window after a start request during which stop requests are ignored.
    pub suppression_lock_ms: f64,
    /// How long a source change waits for the ready signal before applying
    /// the pending play/pause anyway.
    pub ready_timeout_ms: f64,
    /// Distance from the end of a non-looping track at which the ended
    /// notification is emitted without waiting for the native signal.
    pub ended_epsilon_ms: f64,
    /// Minimum spacing between two progress notifications for one element.
    /// Zero reports every time advance.
    pub progress_interval_ms: f64,
}

impl Default for AudioTiming {
    fn default() -> Self {
        Self {
            suppression_lock_ms: 800.0,
            ready_timeout_ms: 1500.0,
            ended_epsilon_ms: 30.0,
            progress_interval_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Origin accepted by the same-origin broadcast adapter.
    pub origin: String,
    /// Publish audio and trajectory notifications on the broadcast adapter
    /// as well. The host relay always carries them.
    pub notify_broadcast: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            origin: "app://stage".to_string(),
            notify_broadcast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub root: PathBuf,
    /// Delay before a failed image decode is attempted again.
    pub retry_ms: f64,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            retry_ms: 2000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_keep_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "audio": { "suppression_lock_ms": 250.0 } }"#).unwrap();

        assert_eq!(config.audio.suppression_lock_ms, 250.0);
        assert_eq!(config.audio.ready_timeout_ms, 1500.0);
        assert_eq!(config.stage, StageConfig::default());
    }

    #[test]
    fn frame_interval_follows_target_rate() {
        let stage = StageConfig {
            target_fps: 50,
            ..StageConfig::default()
        };
        assert!((stage.frame_interval_ms() - 20.0).abs() < 1e-9);
    }
}
