//! Session configuration.
//!
//! Loaded in order (later wins):
//! 1. Compiled defaults
//! 2. An explicit config file, or `./pi-cam-session.toml` if present
//! 3. Environment variables (`PI_CAM_*`)
//!
//! # Example Config
//!
//! ```toml
//! device_index = 0
//! output_dir = "captures"
//! thumbnail_width = 160
//! queue_capacity = 3
//! preference_retry_ms = 1000
//! default_mode = "standard"
//!
//! [burst]
//! burst_count = 5
//! exposure_range = [-30, 0, 30]
//! zoom_range = [100, 200, 300]
//! temporal_negative = 1
//! temporal_positive = 1
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::CaptureMode;

/// File looked up in the working directory when no path is given.
pub const LOCAL_CONFIG_FILE: &str = "pi-cam-session.toml";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`SessionConfig`].
    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// An environment override holds an unparseable value.
    #[error("Invalid value for {var}: {value}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Frame counts and ranges used by the burst capture modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Frames per high-performance burst.
    pub burst_count: u32,
    /// Exposure compensation steps, one frame each.
    pub exposure_range: Vec<i32>,
    /// Zoom levels, one frame each.
    pub zoom_range: Vec<u32>,
    /// Frames before the shutter moment in temporal bracketing.
    pub temporal_negative: u32,
    /// Frames after the shutter moment in temporal bracketing.
    pub temporal_positive: u32,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            burst_count: 5,
            exposure_range: vec![-30, 0, 30],
            zoom_range: vec![100, 200, 300],
            temporal_negative: 1,
            temporal_positive: 1,
        }
    }
}

/// Complete session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// V4L2 device index (0 for `/dev/video0`).
    pub device_index: u32,
    /// Directory captured images are written to.
    pub output_dir: PathBuf,
    /// Thumbnail width in pixels.
    pub thumbnail_width: u32,
    /// Save requests that may wait for the persistence worker.
    pub queue_capacity: usize,
    /// Delay between attempts to commit a deferred parameter change.
    pub preference_retry_ms: u64,
    /// Mode the session starts in.
    pub default_mode: CaptureMode,
    /// Burst mode profile.
    pub burst: BurstConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            output_dir: PathBuf::from("captures"),
            thumbnail_width: 160,
            queue_capacity: 3,
            preference_retry_ms: 1000,
            default_mode: CaptureMode::Standard,
            burst: BurstConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// With no `path`, `./pi-cam-session.toml` is read when it exists.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let local = Path::new(LOCAL_CONFIG_FILE);
        let file = match path {
            Some(path) => Some(path),
            None if local.exists() => Some(local),
            None => None,
        };

        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Parse a single config file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Apply `PI_CAM_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PI_CAM_DEVICE") {
            self.device_index = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "PI_CAM_DEVICE",
                value,
            })?;
        }
        if let Some(value) = lookup("PI_CAM_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("PI_CAM_THUMBNAIL_WIDTH") {
            self.thumbnail_width = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "PI_CAM_THUMBNAIL_WIDTH",
                value,
            })?;
        }
        Ok(())
    }

    /// Retry delay for deferred parameter commits.
    pub const fn preference_retry(&self) -> Duration {
        Duration::from_millis(self.preference_retry_ms)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.default_mode, CaptureMode::Standard);
        assert_eq!(config.preference_retry(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "thumbnail_width = 96\ndefault_mode = \"high-performance\"\n\n[burst]\nburst_count = 8"
        )
        .expect("write config");

        let config = SessionConfig::from_file(file.path()).expect("config should parse");
        assert_eq!(config.thumbnail_width, 96);
        assert_eq!(config.default_mode, CaptureMode::HighPerformanceBurst);
        assert_eq!(config.burst.burst_count, 8);
        assert_eq!(config.burst.exposure_range, vec![-30, 0, 30]);
        assert_eq!(config.queue_capacity, 3);
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "queue_capacity = \"many\"").expect("write config");

        let err = SessionConfig::from_file(file.path()).expect_err("config should not parse");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = SessionConfig::load_from(Some(Path::new("/nonexistent/pi-cam.toml")))
            .expect_err("missing file should fail");
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PI_CAM_DEVICE", "2"),
            ("PI_CAM_OUTPUT_DIR", "/tmp/shots"),
            ("PI_CAM_THUMBNAIL_WIDTH", "64"),
        ]
        .into_iter()
        .collect();

        let mut config = SessionConfig::default();
        config
            .apply_env_overrides(|var| env.get(var).map(|value| (*value).to_owned()))
            .expect("overrides should apply");
        assert_eq!(config.device_index, 2);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/shots"));
        assert_eq!(config.thumbnail_width, 64);
    }

    #[test]
    fn test_bad_env_override() {
        let mut config = SessionConfig::default();
        let err = config
            .apply_env_overrides(|var| (var == "PI_CAM_DEVICE").then(|| "front".to_owned()))
            .expect_err("override should fail");
        assert!(matches!(err, ConfigError::Env { var: "PI_CAM_DEVICE", .. }));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SessionConfig::default();
        let text = config.to_toml().expect("serialize");
        let parsed: SessionConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }
}
