//! Per-channel sampling cycles and their lifecycle
//!
//! Each channel runs as its own task: sample one chunk, classify it, update the
//! shared snapshot, then hand any resulting event to the publisher. A capture
//! failure ends only that channel's task. Shutdown is ordered: stop the
//! cycles, disconnect the publisher, close the capture streams.

use micmon_core::domain::activity::ActivityStateMachine;
use micmon_core::domain::audio::{CaptureBackend, CaptureError, Channel, StreamRequest};
use micmon_core::domain::config::{ConfigError, Settings};
use micmon_core::domain::level::LevelSampler;
use micmon_core::domain::publish::{PublishError, Publisher};
use micmon_core::domain::snapshot::SharedSnapshot;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Errors that prevent the monitor from starting
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No input device selected for the {0} channel")]
    MissingDevice(Channel),

    #[error("Failed to open the {channel} capture stream: {source}")]
    Capture {
        channel: Channel,
        #[source]
        source: CaptureError,
    },
}

/// Stream parameters for one device, taken from the audio settings
pub fn stream_request(settings: &Settings, device_index: usize) -> StreamRequest {
    StreamRequest {
        device_index,
        chunk_size: settings.audio.chunk_size,
        sample_format: settings.audio.sample_format,
        channels: settings.audio.channels,
        rate: settings.audio.rate,
    }
}

/// Open one sampler per channel, left first
///
/// If the second stream fails to open, the first is closed again.
pub fn open_samplers(
    settings: &Settings,
    backend: &dyn CaptureBackend,
) -> Result<Vec<LevelSampler>, StartupError> {
    let mut samplers: Vec<LevelSampler> = Vec::with_capacity(Channel::ALL.len());

    for channel in Channel::ALL {
        let opened = settings
            .device_index(channel)
            .ok_or(StartupError::MissingDevice(channel))
            .and_then(|index| {
                backend
                    .open_stream(&stream_request(settings, index))
                    .map_err(|source| StartupError::Capture { channel, source })
            });

        match opened {
            Ok(stream) => {
                info!(%channel, device = %stream.device_name(), "Capture stream ready");
                samplers.push(LevelSampler::new(
                    channel,
                    settings.audio.sample_format,
                    stream,
                ));
            }
            Err(e) => {
                for sampler in &mut samplers {
                    sampler.close();
                }
                return Err(e);
            }
        }
    }

    Ok(samplers)
}

/// What a channel task hands back when it ends
pub struct ChannelExit {
    pub channel: Channel,
    pub sampler: LevelSampler,
    /// The capture error that stopped the cycle, if any
    pub fault: Option<CaptureError>,
}

/// Outcome of an ordered shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Channels that had already stopped on a capture error
    pub faults: Vec<(Channel, CaptureError)>,
    /// Failure while disconnecting the publisher
    pub publisher_error: Option<PublishError>,
    /// Capture streams closed during shutdown
    pub streams_closed: usize,
}

/// Runs the channel cycles and sequences their shutdown
pub struct Orchestrator {
    publisher: Arc<dyn Publisher>,
    shutdown: watch::Sender<bool>,
    running: Arc<watch::Sender<usize>>,
    cycles: Vec<JoinHandle<ChannelExit>>,
}

/// Decrements the running count when a cycle task ends, however it ends
struct CycleGuard(Arc<watch::Sender<usize>>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.send_modify(|running| *running = running.saturating_sub(1));
    }
}

impl Orchestrator {
    /// Spawn one cycle per sampler; must be called inside a runtime
    pub fn start(
        settings: &Settings,
        samplers: Vec<LevelSampler>,
        publisher: Arc<dyn Publisher>,
        snapshot: SharedSnapshot,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let interval = settings.check_interval();
        let running = Arc::new(watch::Sender::new(samplers.len()));

        let cycles = samplers
            .into_iter()
            .map(|sampler| {
                let channel = sampler.channel();
                let machine = ActivityStateMachine::new(
                    channel,
                    settings.topic(channel),
                    settings.audio.threshold,
                )
                .with_hysteresis(settings.audio.hysteresis);

                let guard = CycleGuard(Arc::clone(&running));
                let cycle = run_cycle(
                    sampler,
                    machine,
                    interval,
                    Arc::clone(&publisher),
                    snapshot.clone(),
                    shutdown_rx.clone(),
                );
                tokio::spawn(async move {
                    let _guard = guard;
                    cycle.await
                })
            })
            .collect();

        info!(?interval, threshold = settings.audio.threshold, "Monitoring started");

        Self {
            publisher,
            shutdown,
            running,
            cycles,
        }
    }

    /// Number of channel cycles still running
    pub fn running(&self) -> usize {
        *self.running.borrow()
    }

    /// Resolves once every channel cycle has ended on its own
    pub async fn all_halted(&self) {
        let mut running = self.running.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting
        let _ = running.wait_for(|count| *count == 0).await;
    }

    /// Stop cycles, disconnect the publisher, then close capture streams
    ///
    /// Every step runs even if an earlier one failed.
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Shutting down");
        let _ = self.shutdown.send(true);

        let mut report = ShutdownReport::default();
        let mut samplers = Vec::with_capacity(self.cycles.len());
        for cycle in self.cycles {
            match cycle.await {
                Ok(exit) => {
                    if let Some(fault) = exit.fault {
                        report.faults.push((exit.channel, fault));
                    }
                    samplers.push(exit.sampler);
                }
                Err(e) => error!(error = %e, "Channel task did not finish cleanly"),
            }
        }

        if let Err(e) = self.publisher.disconnect().await {
            warn!(error = %e, "Publisher disconnect failed");
            report.publisher_error = Some(e);
        }

        for mut sampler in samplers {
            sampler.close();
            report.streams_closed += 1;
        }

        info!(streams_closed = report.streams_closed, "Shutdown complete");
        report
    }
}

async fn run_cycle(
    mut sampler: LevelSampler,
    mut machine: ActivityStateMachine,
    interval: Duration,
    publisher: Arc<dyn Publisher>,
    snapshot: SharedSnapshot,
    mut shutdown: watch::Receiver<bool>,
) -> ChannelExit {
    let channel = sampler.channel();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(%channel, device = %sampler.device_name(), "Channel cycle started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match sampler.sample().await {
            Ok(reading) => {
                let outcome = machine.observe(&reading);
                snapshot.update(channel, outcome.state, reading.level, reading.timestamp);
                if let Some(event) = outcome.event {
                    publisher.publish(event);
                }
            }
            Err(fault) => {
                error!(
                    %channel,
                    device = %sampler.device_name(),
                    error = %fault,
                    "Capture failed, channel stopped"
                );
                snapshot.mark_halted(channel, fault.to_string());
                return ChannelExit {
                    channel,
                    sampler,
                    fault: Some(fault),
                };
            }
        }
    }

    info!(%channel, "Channel cycle stopped");
    ChannelExit {
        channel,
        sampler,
        fault: None,
    }
}
