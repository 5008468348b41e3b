use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::{FrameSinkConfig, PixelFormat};

/// Well-known control socket name shared with the controlling process.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/basestation-cameras-ipc";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub control: ControlConfig,
    pub grid: GridConfig,
    pub stream_defaults: StreamDefaultConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GridConfig {
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamDefaultConfig {
    pub latency_ms: u32,
    pub max_queued_frames: u32,
    pub pixel_format: PixelFormat,
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub id: String,
    #[serde(alias = "uri")]
    pub url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Camera Wall".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { rows: 2, cols: 2 }
    }
}

impl Default for StreamDefaultConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            max_queued_frames: 5,
            pixel_format: PixelFormat::Bgra,
            stop_timeout_ms: 5000,
        }
    }
}

impl StreamDefaultConfig {
    pub fn frame_sink(&self) -> FrameSinkConfig {
        FrameSinkConfig {
            max_queued_frames: self.max_queued_frames,
            drop_oldest: true,
            format: self.pixel_format,
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.grid.rows == 0 || self.grid.cols == 0 {
            return Err(format!(
                "grid must have at least one row and one column (got {}x{})",
                self.grid.rows, self.grid.cols
            ));
        }

        if self.stream_defaults.max_queued_frames == 0 {
            return Err("max_queued_frames must be greater than 0".to_string());
        }

        if self.control.enabled && self.control.socket_path.as_os_str().is_empty() {
            return Err("control socket_path cannot be empty".to_string());
        }

        let mut stream_ids = HashSet::new();
        for stream in &self.streams {
            if stream.id.is_empty() {
                return Err(format!("stream with url {:?} has an empty id", stream.url));
            }
            if !stream_ids.insert(stream.id.as_str()) {
                return Err(format!("Duplicate stream ID: {}", stream.id));
            }
        }

        Ok(())
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(crate::CameraWallError::Config(format!(
                "Configuration file not found: {:?}\n\
                Please create a config.toml file or specify the path with --config",
                path
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::CameraWallError::Config(format!(
                "Failed to read configuration file {:?}: {}",
                path, e
            ))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            crate::CameraWallError::Config(format!(
                "Failed to parse configuration file {:?}: {}",
                path, e
            ))
        })?;

        config.validate().map_err(crate::CameraWallError::Config)?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            info!("Loading configuration from {:?}", path);
            Self::from_file(path)
        } else {
            warn!("Configuration file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }
}
