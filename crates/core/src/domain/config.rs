//! Configuration management for micmon
//!
//! This module provides:
//! - The resolved [`Settings`] structure consumed by every component
//! - Layered resolution: built-in defaults, `default_config.toml`, the user
//!   file, then command-line overrides, merged table by table
//! - Validation, so an invalid file fails startup before any cycle runs
//! - Persisting the settings back (selected device indices included)

use crate::domain::audio::{Channel, SampleFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Topic names on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub left: String,
    pub right: String,
    pub status: String,
    pub ping: String,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            left: "microphones/left".to_string(),
            right: "microphones/right".to_string(),
            status: "microphones/status".to_string(),
            ping: "microphones/ping".to_string(),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topics: TopicSettings,
    /// Keepalive interval in seconds
    pub keepalive: u64,
    /// First reconnect delay in seconds
    pub reconnect_min_delay: f64,
    /// Reconnect delay cap in seconds
    pub reconnect_max_delay: f64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "mic_monitor".to_string(),
            topics: TopicSettings::default(),
            keepalive: 60,
            reconnect_min_delay: 1.0,
            reconnect_max_delay: 10.0,
        }
    }
}

/// Capture and classification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Frames per chunk
    pub chunk_size: usize,
    pub sample_format: SampleFormat,
    pub channels: u16,
    /// Sample rate in Hz
    pub rate: u32,
    /// Level above which a channel is active, in sample units
    pub threshold: f64,
    /// Release band below the threshold while active (0 = none)
    pub hysteresis: f64,
    /// Seconds between ticks
    pub check_interval: f64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            sample_format: SampleFormat::Int16,
            channels: 1,
            rate: 44100,
            threshold: 500.0,
            hysteresis: 0.0,
            check_interval: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSettings {
    /// Seconds between dashboard redraws
    pub refresh_rate: f64,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self { refresh_rate: 0.1 }
    }
}

/// Selected input devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MicrophoneSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_index: Option<usize>,
}

/// Fully resolved settings, immutable once the monitor starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub audio: AudioSettings,
    pub ui: UiSettings,
    pub microphones: MicrophoneSettings,
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

impl Settings {
    pub fn check_interval(&self) -> Duration {
        seconds(self.audio.check_interval, Duration::from_millis(200))
    }

    pub fn refresh_interval(&self) -> Duration {
        seconds(self.ui.refresh_rate, Duration::from_millis(100))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keepalive)
    }

    /// Reconnect backoff base and cap
    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        (
            seconds(self.mqtt.reconnect_min_delay, Duration::from_secs(1)),
            seconds(self.mqtt.reconnect_max_delay, Duration::from_secs(10)),
        )
    }

    pub fn topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::Left => &self.mqtt.topics.left,
            Channel::Right => &self.mqtt.topics.right,
        }
    }

    pub fn device_index(&self, channel: Channel) -> Option<usize> {
        match channel {
            Channel::Left => self.microphones.left_index,
            Channel::Right => self.microphones.right_index,
        }
    }

    pub fn set_device_index(&mut self, channel: Channel, index: usize) {
        match channel {
            Channel::Left => self.microphones.left_index = Some(index),
            Channel::Right => self.microphones.right_index = Some(index),
        }
    }

    /// Reject settings no component could run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mqtt = &self.mqtt;
        if mqtt.broker.trim().is_empty() {
            return invalid("mqtt.broker must not be empty".to_string());
        }
        if mqtt.port == 0 {
            return invalid("mqtt.port must be non-zero".to_string());
        }
        if mqtt.client_id.trim().is_empty() {
            return invalid("mqtt.client_id must not be empty".to_string());
        }
        for (name, topic) in [
            ("left", &mqtt.topics.left),
            ("right", &mqtt.topics.right),
            ("status", &mqtt.topics.status),
            ("ping", &mqtt.topics.ping),
        ] {
            if topic.trim().is_empty() {
                return invalid(format!("mqtt.topics.{} must not be empty", name));
            }
        }
        if mqtt.keepalive < 5 {
            return invalid(format!("mqtt.keepalive must be at least 5s, got {}", mqtt.keepalive));
        }
        if !(mqtt.reconnect_min_delay > 0.0) || !mqtt.reconnect_min_delay.is_finite() {
            return invalid("mqtt.reconnect_min_delay must be positive".to_string());
        }
        if !mqtt.reconnect_max_delay.is_finite() || mqtt.reconnect_max_delay < mqtt.reconnect_min_delay {
            return invalid("mqtt.reconnect_max_delay must be >= reconnect_min_delay".to_string());
        }

        let audio = &self.audio;
        if audio.chunk_size == 0 {
            return invalid("audio.chunk_size must be non-zero".to_string());
        }
        if audio.channels == 0 {
            return invalid("audio.channels must be non-zero".to_string());
        }
        if audio.rate == 0 {
            return invalid("audio.rate must be non-zero".to_string());
        }
        if !audio.threshold.is_finite() || audio.threshold < 0.0 {
            return invalid(format!("audio.threshold must be >= 0, got {}", audio.threshold));
        }
        if !audio.hysteresis.is_finite() || audio.hysteresis < 0.0 || audio.hysteresis > audio.threshold {
            return invalid(format!(
                "audio.hysteresis must be within [0, threshold], got {}",
                audio.hysteresis
            ));
        }
        if !(audio.check_interval > 0.0) || !audio.check_interval.is_finite() {
            return invalid("audio.check_interval must be positive".to_string());
        }
        if !(self.ui.refresh_rate > 0.0) || !self.ui.refresh_rate.is_finite() {
            return invalid("ui.refresh_rate must be positive".to_string());
        }
        Ok(())
    }
}

/// Command-line values that win over every file layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsOverrides {
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub left_mic: Option<usize>,
    pub right_mic: Option<usize>,
    pub threshold: Option<f64>,
}

impl SettingsOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(broker) = &self.broker {
            settings.mqtt.broker = broker.clone();
        }
        if let Some(port) = self.port {
            settings.mqtt.port = port;
        }
        if let Some(index) = self.left_mic {
            settings.microphones.left_index = Some(index);
        }
        if let Some(index) = self.right_mic {
            settings.microphones.right_index = Some(index);
        }
        if let Some(threshold) = self.threshold {
            settings.audio.threshold = threshold;
        }
    }
}

/// Recursively merge `overlay` into `base`, overlay winning on conflicts
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Loads, layers and saves settings files
///
/// `default_config.toml` and the user file both live next to the process by
/// default; the user file can be redirected with `--config`.
pub struct SettingsStore {
    defaults_path: PathBuf,
    user_path: PathBuf,
}

impl SettingsStore {
    pub const DEFAULT_CONFIG_FILE: &'static str = "default_config.toml";
    pub const USER_CONFIG_FILE: &'static str = "config.toml";

    pub fn new(defaults_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            defaults_path,
            user_path,
        }
    }

    /// Both files inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(
            dir.join(Self::DEFAULT_CONFIG_FILE),
            dir.join(Self::USER_CONFIG_FILE),
        )
    }

    /// Files in the working directory, with an optional user file override
    pub fn with_user_path(user_path: Option<PathBuf>) -> Self {
        Self::new(
            PathBuf::from(Self::DEFAULT_CONFIG_FILE),
            user_path.unwrap_or_else(|| PathBuf::from(Self::USER_CONFIG_FILE)),
        )
    }

    pub fn defaults_path(&self) -> &Path {
        &self.defaults_path
    }

    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    async fn read_layer(path: &Path) -> Result<Option<toml::Table>> {
        if !path.exists() {
            debug!(path = %path.display(), "Config layer absent");
            return Ok(None);
        }
        let contents = fs::read_to_string(path).await?;
        let table: toml::Table = toml::from_str(&contents)?;
        info!(path = %path.display(), "Loaded config layer");
        Ok(Some(table))
    }

    /// Resolve defaults, both files and overrides into validated settings
    #[instrument(skip(self, overrides))]
    pub async fn resolve(&self, overrides: &SettingsOverrides) -> Result<Settings> {
        let mut merged = match toml::Value::try_from(Settings::default())? {
            toml::Value::Table(table) => table,
            _ => toml::Table::new(),
        };

        for path in [&self.defaults_path, &self.user_path] {
            if let Some(layer) = Self::read_layer(path).await? {
                merge_tables(&mut merged, layer);
            }
        }

        let mut settings: Settings = toml::Value::Table(merged).try_into()?;
        overrides.apply(&mut settings);
        settings.validate()?;

        debug!(?settings, "Settings resolved");
        Ok(settings)
    }

    /// Write the full settings to the user file
    #[instrument(skip(self, settings))]
    pub async fn save(&self, settings: &Settings) -> Result<()> {
        Self::write_file(&self.user_path, settings).await
    }

    /// Create `default_config.toml` unless it already exists
    ///
    /// Returns whether a file was written.
    #[instrument(skip(self))]
    pub async fn write_defaults(&self) -> Result<bool> {
        if self.defaults_path.exists() {
            return Ok(false);
        }
        Self::write_file(&self.defaults_path, &Settings::default()).await?;
        Ok(true)
    }

    async fn write_file(path: &Path, settings: &Settings) -> Result<()> {
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let toml_str = toml::to_string_pretty(settings)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }
}
