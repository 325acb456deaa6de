//! Per-chunk level reduction

use crate::domain::audio::{unix_timestamp, CaptureStream, Channel, Reading, Result, SampleFormat};
use tracing::trace;

/// Mean absolute magnitude of normalized samples, scaled to `format`
///
/// An empty chunk has level 0.
pub fn mean_abs_level(samples: &[f32], format: SampleFormat) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| f64::from(s.abs())).sum();
    sum / samples.len() as f64 * format.full_scale()
}

/// Pulls one chunk per tick from a channel's stream and reduces it to a level
pub struct LevelSampler {
    channel: Channel,
    format: SampleFormat,
    stream: Box<dyn CaptureStream>,
}

impl LevelSampler {
    pub fn new(channel: Channel, format: SampleFormat, stream: Box<dyn CaptureStream>) -> Self {
        Self {
            channel,
            format,
            stream,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn device_name(&self) -> &str {
        self.stream.device_name()
    }

    /// Read exactly one chunk and reduce it
    ///
    /// Capture failures are returned as-is; a broken stream is never retried here.
    pub async fn sample(&mut self) -> Result<Reading> {
        let chunk = self.stream.read_chunk().await?;
        let level = mean_abs_level(&chunk, self.format);
        trace!(channel = %self.channel, level, samples = chunk.len(), "Sampled chunk");

        Ok(Reading {
            channel: self.channel,
            level,
            timestamp: unix_timestamp(),
        })
    }

    /// Release the underlying capture stream
    pub fn close(&mut self) {
        self.stream.close();
    }
}
