//! Audio capture abstractions and domain models
//!
//! This module defines the channel identities, sample representations and the
//! capture interfaces that the monitor consumes. Implementations for real
//! devices live in the `infra` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while opening or reading a capture stream
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    /// No input device exists at the requested index
    #[error("Input device not found at index {0}")]
    DeviceNotFound(usize),

    /// The device refused the requested stream configuration
    #[error("Failed to open stream on '{device}': {reason}")]
    Open { device: String, reason: String },

    /// The backend reported a fault on a running stream
    #[error("Stream failed on '{device}': {reason}")]
    StreamFailed { device: String, reason: String },

    /// The stream stopped delivering data altogether
    #[error("Stream closed on '{0}'")]
    StreamClosed(String),

    /// No chunk arrived within the read deadline
    #[error("No audio from '{device}' for {waited:?}")]
    Stalled { device: String, waited: Duration },

    /// Host-level enumeration error
    #[error("Audio host error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// One of the two monitored inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Left,
    Right,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Left, Channel::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Left => "left",
            Channel::Right => "right",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sample representation the level is expressed in
///
/// Stored in configuration files as its numeric code (8, 16, 24, 32, 33).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
    Float32,
}

impl SampleFormat {
    /// Numeric code used in configuration files
    pub fn code(&self) -> u32 {
        match self {
            SampleFormat::Int8 => 8,
            SampleFormat::Int16 => 16,
            SampleFormat::Int24 => 24,
            SampleFormat::Int32 => 32,
            SampleFormat::Float32 => 33,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            8 => Some(SampleFormat::Int8),
            16 => Some(SampleFormat::Int16),
            // 34 is the packed 24-bit alias
            24 | 34 => Some(SampleFormat::Int24),
            32 => Some(SampleFormat::Int32),
            33 => Some(SampleFormat::Float32),
            _ => None,
        }
    }

    /// Magnitude of a full-scale sample in this representation
    pub fn full_scale(&self) -> f64 {
        match self {
            SampleFormat::Int8 => 128.0,
            SampleFormat::Int16 => 32_768.0,
            SampleFormat::Int24 => 8_388_608.0,
            SampleFormat::Int32 => 2_147_483_648.0,
            SampleFormat::Float32 => 1.0,
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat::Int16
    }
}

impl TryFrom<u32> for SampleFormat {
    type Error = String;

    fn try_from(code: u32) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown sample format code {}", code))
    }
}

impl From<SampleFormat> for u32 {
    fn from(format: SampleFormat) -> Self {
        format.code()
    }
}

/// One level measurement for a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub channel: Channel,
    pub level: f64,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

/// Current wall-clock time in whole seconds since the Unix epoch
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Information about an input device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the host's input device list
    pub index: usize,
    pub name: String,
    pub channels: u16,
    pub default_rate: Option<u32>,
}

/// Parameters for opening a capture stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub device_index: usize,
    /// Frames per chunk
    pub chunk_size: usize,
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
}

impl StreamRequest {
    /// Wall-clock length of one chunk
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.rate.max(1) as f64)
    }
}

/// An open input stream that yields fixed-size chunks
///
/// Samples are interleaved and normalized to `[-1.0, 1.0]`.
#[async_trait]
pub trait CaptureStream: Send {
    /// Name of the device backing this stream
    fn device_name(&self) -> &str;

    /// Wait for the next chunk of `chunk_size * channels` samples
    async fn read_chunk(&mut self) -> Result<Vec<f32>>;

    /// Stop the stream and release the device
    fn close(&mut self);
}

/// Source of input devices and capture streams
pub trait CaptureBackend: Send + Sync {
    /// List all input devices with their indices
    fn input_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a stream on the device at `request.device_index`
    fn open_stream(&self, request: &StreamRequest) -> Result<Box<dyn CaptureStream>>;

    /// Look up a device name, falling back to a placeholder
    fn device_name(&self, index: usize) -> String {
        self.input_devices()
            .ok()
            .and_then(|devices| devices.into_iter().find(|d| d.index == index))
            .map(|d| d.name)
            .unwrap_or_else(|| "Unknown Device".to_string())
    }
}
