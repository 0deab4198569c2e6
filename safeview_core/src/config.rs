//! Visualizer configuration and the configuration-service response shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a visualizer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// WebSocket endpoint streaming `scan_update` / `brake_update`
    pub stream_url: String,

    /// Fixed delay before each reconnect attempt (default: 10 s)
    pub reconnect_delay_ms: u64,

    /// Draw-loop rate in Hz (default: 60)
    pub frame_rate_hz: u32,

    /// Vertical field of view in degrees (default: 75)
    pub camera_fov_deg: f64,

    /// Initial camera height above the footprint in meters (default: 5)
    pub camera_distance: f64,

    /// Distance change per zoom step in meters (default: 0.5)
    pub zoom_step: f64,

    pub min_camera_distance: f64,
    pub max_camera_distance: f64,

    /// Capacity of the stream → controller event channel
    pub event_buffer: usize,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect_delay_ms: 10_000,
            frame_rate_hz: 60,
            camera_fov_deg: 75.0,
            camera_distance: 5.0,
            zoom_step: 0.5,
            min_camera_distance: 1.0,
            max_camera_distance: 50.0,
            event_buffer: 256,
        }
    }
}

impl VisualizerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate_hz.max(1)))
    }

    /// Rejects values the renderer or stream client cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_url.trim().is_empty() {
            return Err(ConfigError::Invalid("stream_url is empty".to_string()));
        }
        if self.frame_rate_hz == 0 {
            return Err(ConfigError::Invalid("frame_rate_hz must be > 0".to_string()));
        }
        if !(self.camera_fov_deg > 0.0 && self.camera_fov_deg < 180.0) {
            return Err(ConfigError::Invalid(format!(
                "camera_fov_deg {} outside (0, 180)",
                self.camera_fov_deg
            )));
        }
        if !(self.min_camera_distance > 0.0
            && self.min_camera_distance <= self.camera_distance
            && self.camera_distance <= self.max_camera_distance)
        {
            return Err(ConfigError::Invalid(
                "camera distances must satisfy 0 < min <= distance <= max".to_string(),
            ));
        }
        if !(self.zoom_step > 0.0) {
            return Err(ConfigError::Invalid("zoom_step must be > 0".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Footprint as returned by the configuration service.
///
/// Coordinates stay untyped until `GeometryModel` parses them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FootprintResponse {
    #[serde(alias = "footprint", default)]
    pub polygon: Vec<Vec<Value>>,
}

impl FootprintResponse {
    /// `[x, y]` pairs; entries of any other length are skipped.
    pub fn pairs(&self) -> Vec<[Value; 2]> {
        self.polygon
            .iter()
            .filter_map(|entry| match entry.as_slice() {
                [x, y] => Some([x.clone(), y.clone()]),
                _ => None,
            })
            .collect()
    }
}

/// Laser→base transform as returned by the configuration service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformResponse {
    #[serde(rename = "Position", default)]
    pub position: Option<Vec<Value>>,

    #[serde(rename = "Orientation", default)]
    pub orientation: Option<Vec<Value>>,
}

/// Reads and deserializes a JSON file.
pub fn load_json_file<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}
