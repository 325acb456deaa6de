//! CPAL-based capture backend
//!
//! Provides a cross-platform interface to input devices using the CPAL library.
//! Devices are addressed by their position in the host's input device list.

use crate::audio::stream::CpalStream;
use cpal::traits::{DeviceTrait, HostTrait};
use micmon_core::domain::audio::{
    CaptureBackend, CaptureError, CaptureStream, DeviceInfo, Result, StreamRequest,
};
use tracing::{debug, info};

/// CPAL-based capture backend
#[derive(Debug, Clone)]
pub struct CpalBackend {
    host_id: cpal::HostId,
}

impl Default for CpalBackend {
    fn default() -> Self {
        info!("Initializing CPAL capture backend");
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        let host_id = cpal::default_host().id();
        debug!("Using audio host: {:?}", host_id);
        Self { host_id }
    }

    pub fn host_id(&self) -> cpal::HostId {
        self.host_id
    }

    fn describe(index: usize, device: &cpal::Device) -> DeviceInfo {
        #[allow(deprecated)]
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let default_config = device.default_input_config().ok();

        DeviceInfo {
            index,
            name,
            channels: default_config.as_ref().map(|c| c.channels()).unwrap_or(0),
            default_rate: default_config.as_ref().map(|c| c.sample_rate()),
        }
    }
}

impl CaptureBackend for CpalBackend {
    fn input_devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::host_from_id(self.host_id).map_err(|e| CaptureError::Host(e.to_string()))?;
        let devices: Vec<DeviceInfo> = host
            .input_devices()
            .map_err(|e| CaptureError::Host(e.to_string()))?
            .enumerate()
            .map(|(index, device)| Self::describe(index, &device))
            .collect();

        for device in &devices {
            debug!("Found input device {}: {}", device.index, device.name);
        }
        info!("Found {} input devices", devices.len());
        Ok(devices)
    }

    fn open_stream(&self, request: &StreamRequest) -> Result<Box<dyn CaptureStream>> {
        let stream = CpalStream::open(request)?;
        Ok(Box::new(stream))
    }
}
