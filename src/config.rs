use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, StreamError};
use crate::utils::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub cleaner: CleanerConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,  // ffmpeg -q:v, 2 (best) .. 31 (worst)
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_recordings_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,  // Interval between reconcile ticks
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,  // Settle delay before the first poll of a new segment
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,  // Graceful terminate wait before kill
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_container")]
    pub container: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    #[serde(default = "default_retention")]
    pub retention: String,  // Max age for recordings (e.g., "12h", "7d")
    #[serde(default = "default_cleanup_interval")]
    pub interval: String,
}

fn default_true() -> bool { true }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 5000 }
fn default_jpeg_quality() -> u8 { 5 }
fn default_frame_interval_ms() -> u64 { 33 } // ~30 FPS
fn default_recordings_directory() -> PathBuf { PathBuf::from("recordings") }
fn default_segment_duration_secs() -> u64 { 300 }
fn default_reconnect_delay_secs() -> u64 { 10 }
fn default_startup_grace_secs() -> u64 { 2 }
fn default_stop_timeout_secs() -> u64 { 10 }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_container() -> String { "mp4".to_string() }
fn default_retention() -> String { "7d".to_string() }
fn default_cleanup_interval() -> String { "1h".to_string() }

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            jpeg_quality: default_jpeg_quality(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: default_recordings_directory(),
            segment_duration_secs: default_segment_duration_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            startup_grace_secs: default_startup_grace_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            container: default_container(),
        }
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            interval: default_cleanup_interval(),
        }
    }
}

impl RecordingConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl CleanerConfig {
    pub fn retention(&self) -> Result<chrono::Duration> {
        parse_duration(&self.retention)
    }

    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.interval)?
            .to_std()
            .map_err(|e| StreamError::config(format!("Invalid cleaner interval: {}", e)))
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content, path.ends_with(".json"))?;
        info!("Loaded configuration from {} ({} cameras)", path, config.cameras.len());
        Ok(config)
    }

    pub fn parse(content: &str, json: bool) -> Result<Self> {
        let config: Config = if json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(StreamError::config("Camera id must not be empty"));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(StreamError::config(format!("Duplicate camera id '{}'", camera.id)));
            }
            url::Url::parse(&camera.url)?;
        }

        if self.recording.segment_duration_secs == 0 {
            return Err(StreamError::config("segment_duration_secs must be positive"));
        }
        if self.recording.reconnect_delay_secs == 0 {
            return Err(StreamError::config("reconnect_delay_secs must be positive"));
        }
        self.cleaner.retention()?;
        self.cleaner.interval()?;
        Ok(())
    }

    /// Cameras that get a stream worker and a recording slot, in configuration order.
    pub fn enabled_cameras(&self) -> Vec<CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled).cloned().collect()
    }
}
