//! Real-time capture streams delivering fixed-size chunks
//!
//! A `cpal::Stream` cannot move between threads on every platform, so each
//! [`CpalStream`] owns a dedicated capture thread that builds the stream, keeps
//! it alive, and drops it when told to stop. The audio callback slices incoming
//! samples into chunks of `chunk_size * channels` and hands them to the async
//! side over a bounded channel; a full channel drops the chunk (overrun).

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam::channel::{bounded, Receiver, Sender};
use micmon_core::domain::audio::{CaptureError, CaptureStream, Result, StreamRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

/// Chunks buffered between the callback and the sampling cycle
const CHUNK_QUEUE: usize = 64;

/// Lower bound for the read deadline
const MIN_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A chunk, or the reason the backend reported for a stream fault
type ChunkMessage = std::result::Result<Vec<f32>, String>;

/// Accumulates interleaved samples into fixed-size chunks
#[derive(Debug)]
pub struct ChunkAssembler {
    chunk_len: usize,
    pending: Vec<f32>,
}

impl ChunkAssembler {
    /// `frames` per chunk of `channels` interleaved samples
    pub fn new(frames: usize, channels: u16) -> Self {
        let chunk_len = frames.max(1) * usize::from(channels.max(1));
        Self {
            chunk_len,
            pending: Vec::with_capacity(chunk_len),
        }
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Feed samples; `emit` is called once per completed chunk
    pub fn push<I, F>(&mut self, samples: I, mut emit: F)
    where
        I: IntoIterator<Item = f32>,
        F: FnMut(Vec<f32>),
    {
        for sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.chunk_len {
                let chunk =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_len));
                emit(chunk);
            }
        }
    }
}

/// Capture stream on one input device
pub struct CpalStream {
    device: String,
    chunks: mpsc::Receiver<ChunkMessage>,
    read_timeout: Duration,
    overruns: Arc<AtomicU64>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    /// Open the device at `request.device_index` and start capturing
    ///
    /// Blocks until the capture thread reports that the stream is playing, or
    /// why it could not be opened.
    pub fn open(request: &StreamRequest) -> Result<Self> {
        info!(
            device_index = request.device_index,
            chunk_size = request.chunk_size,
            channels = request.channels,
            rate = request.rate,
            "Opening capture stream"
        );

        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (chunk_tx, chunk_rx) = mpsc::channel::<ChunkMessage>(CHUNK_QUEUE);
        let overruns = Arc::new(AtomicU64::new(0));

        let thread_request = request.clone();
        let thread_overruns = Arc::clone(&overruns);
        let thread = thread::Builder::new()
            .name(format!("capture-{}", request.device_index))
            .spawn(move || {
                run_capture(thread_request, chunk_tx, thread_overruns, ready_tx, stop_rx)
            })
            .map_err(|e| CaptureError::Open {
                device: format!("#{}", request.device_index),
                reason: format!("Failed to spawn capture thread: {}", e),
            })?;

        let device = match ready_rx.recv() {
            Ok(Ok(device)) => device,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::Open {
                    device: format!("#{}", request.device_index),
                    reason: "Capture thread exited before the stream started".to_string(),
                });
            }
        };

        info!(device = %device, "Capture stream started");

        Ok(Self {
            device,
            chunks: chunk_rx,
            read_timeout: MIN_READ_TIMEOUT.max(request.chunk_duration() * 4),
            overruns,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Chunks discarded because the reader fell behind
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn fault(&self, reason: String) -> CaptureError {
        CaptureError::StreamFailed {
            device: self.device.clone(),
            reason,
        }
    }
}

#[async_trait]
impl CaptureStream for CpalStream {
    fn device_name(&self) -> &str {
        &self.device
    }

    /// Returns the most recent complete chunk
    ///
    /// Anything older that piled up between ticks is discarded, so the level
    /// always reflects the newest audio.
    async fn read_chunk(&mut self) -> Result<Vec<f32>> {
        let mut latest = None;
        loop {
            match self.chunks.try_recv() {
                Ok(Ok(chunk)) => latest = Some(chunk),
                Ok(Err(reason)) => return Err(self.fault(reason)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return latest.ok_or_else(|| CaptureError::StreamClosed(self.device.clone()));
                }
            }
        }
        if let Some(chunk) = latest {
            return Ok(chunk);
        }

        match tokio::time::timeout(self.read_timeout, self.chunks.recv()).await {
            Ok(Some(Ok(chunk))) => Ok(chunk),
            Ok(Some(Err(reason))) => Err(self.fault(reason)),
            Ok(None) => Err(CaptureError::StreamClosed(self.device.clone())),
            Err(_) => Err(CaptureError::Stalled {
                device: self.device.clone(),
                waited: self.read_timeout,
            }),
        }
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(device = %self.device, "Capture thread panicked");
            }
            let overruns = self.overruns();
            if overruns > 0 {
                debug!(device = %self.device, overruns, "Capture stream closed with overruns");
            }
            info!(device = %self.device, "Capture stream closed");
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of the capture thread
fn run_capture(
    request: StreamRequest,
    chunks: mpsc::Sender<ChunkMessage>,
    overruns: Arc<AtomicU64>,
    ready: Sender<Result<String>>,
    stop: Receiver<()>,
) {
    let stream = match build_stream(&request, chunks, overruns) {
        Ok((device, stream)) => {
            let _ = ready.send(Ok(device));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Returns on an explicit stop or when the owning CpalStream is gone
    let _ = stop.recv();
    drop(stream);
}

fn build_stream(
    request: &StreamRequest,
    chunks: mpsc::Sender<ChunkMessage>,
    overruns: Arc<AtomicU64>,
) -> Result<(String, cpal::Stream)> {
    let host = cpal::default_host();
    let device = host
        .input_devices()
        .map_err(|e| CaptureError::Host(e.to_string()))?
        .nth(request.device_index)
        .ok_or(CaptureError::DeviceNotFound(request.device_index))?;

    #[allow(deprecated)]
    let name = device
        .name()
        .unwrap_or_else(|_| "Unknown Device".to_string());

    let open_error = |reason: String| CaptureError::Open {
        device: name.clone(),
        reason,
    };

    let sample_format = device
        .default_input_config()
        .map_err(|e| open_error(e.to_string()))?
        .sample_format();

    let config = cpal::StreamConfig {
        channels: request.channels,
        sample_rate: request.rate,
        buffer_size: cpal::BufferSize::Default,
    };

    debug!(device = %name, ?sample_format, ?config, "Building input stream");

    let assembler = ChunkAssembler::new(request.chunk_size, request.channels);
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_typed::<f32>(&device, &config, assembler, chunks, overruns),
        cpal::SampleFormat::F64 => build_typed::<f64>(&device, &config, assembler, chunks, overruns),
        cpal::SampleFormat::I8 => build_typed::<i8>(&device, &config, assembler, chunks, overruns),
        cpal::SampleFormat::I16 => build_typed::<i16>(&device, &config, assembler, chunks, overruns),
        cpal::SampleFormat::I32 => build_typed::<i32>(&device, &config, assembler, chunks, overruns),
        cpal::SampleFormat::U16 => build_typed::<u16>(&device, &config, assembler, chunks, overruns),
        other => {
            return Err(open_error(format!("Unsupported device sample format {:?}", other)));
        }
    }
    .map_err(|e| open_error(format!("Failed to build stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| open_error(format!("Failed to start stream: {}", e)))?;

    Ok((name, stream))
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: ChunkAssembler,
    chunks: mpsc::Sender<ChunkMessage>,
    overruns: Arc<AtomicU64>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let error_chunks = chunks.clone();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            assembler.push(data.iter().map(|s| s.to_sample::<f32>()), |chunk| {
                if chunks.try_send(Ok(chunk)).is_err() {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            });
        },
        move |err| {
            error!("Input stream error: {}", err);
            let _ = error_chunks.try_send(Err(err.to_string()));
        },
        None,
    )
}
