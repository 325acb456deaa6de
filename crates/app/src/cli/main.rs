//! micmon CLI Application

use anyhow::Context;
use clap::Parser;
use micmon_app::devices::{format_device_table, prompt_device_index};
use micmon_app::orchestrator::{open_samplers, Orchestrator};
use micmon_app::ui::{self, DashboardInfo};
use micmon_core::domain::audio::{CaptureBackend, Channel};
use micmon_core::domain::config::{Settings, SettingsOverrides, SettingsStore};
use micmon_core::domain::publish::Publisher;
use micmon_core::domain::snapshot::SharedSnapshot;
use micmon_infra::audio::CpalBackend;
use micmon_infra::mqtt::{PublisherOptions, ResilientPublisher};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "micmon.log";

#[derive(Parser)]
#[command(name = "micmon")]
#[command(about = "Monitors two microphones and publishes their activity over MQTT", long_about = None)]
struct Cli {
    /// MQTT broker host
    #[arg(long)]
    broker: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    port: Option<u16>,

    /// Input device index for the left microphone
    #[arg(long)]
    left_mic: Option<usize>,

    /// Input device index for the right microphone
    #[arg(long)]
    right_mic: Option<usize>,

    /// Activity threshold in sample units
    #[arg(long)]
    threshold: Option<f64>,

    /// User configuration file (default: config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Write default_config.toml and exit
    #[arg(long)]
    create_default_config: bool,

    /// Run without the dashboard, logging to stderr
    #[arg(long)]
    headless: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            broker: self.broker.clone(),
            port: self.port,
            left_mic: self.left_mic,
            right_mic: self.right_mic,
            threshold: self.threshold,
        }
    }

    fn dashboard(&self) -> bool {
        !(self.headless || self.list_devices || self.create_default_config)
    }
}

fn init_logging(verbose: bool, to_file: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    if to_file {
        let file = File::create(LOG_FILE).with_context(|| format!("creating {}", LOG_FILE))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
    Ok(())
}

/// Prompt for any channel still lacking a device; returns whether one was chosen
async fn select_missing_devices(
    settings: &mut Settings,
    backend: &dyn CaptureBackend,
) -> anyhow::Result<bool> {
    let missing: Vec<Channel> = Channel::ALL
        .into_iter()
        .filter(|channel| settings.device_index(*channel).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let devices = backend.input_devices()?;
    let chosen = tokio::task::spawn_blocking(move || -> io::Result<Vec<(Channel, usize)>> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        print!("{}", format_device_table(&devices));
        missing
            .into_iter()
            .map(|channel| {
                prompt_device_index(channel, &devices, &mut input, &mut output)
                    .map(|index| (channel, index))
            })
            .collect()
    })
    .await??;

    for (channel, index) in chosen {
        info!(%channel, index, "Device selected");
        settings.set_device_index(channel, index);
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let dashboard = cli.dashboard();
    init_logging(cli.verbose, dashboard)?;

    info!("Microphone monitor starting");

    let store = SettingsStore::with_user_path(cli.config.clone());

    if cli.create_default_config {
        if store.write_defaults().await? {
            println!("Created {}", store.defaults_path().display());
        } else {
            println!("{} already exists", store.defaults_path().display());
        }
        return Ok(());
    }

    let backend = CpalBackend::default();

    if cli.list_devices {
        print!("{}", format_device_table(&backend.input_devices()?));
        return Ok(());
    }

    let mut settings = store.resolve(&cli.overrides()).await?;
    if select_missing_devices(&mut settings, &backend).await? {
        store.save(&settings).await?;
    }

    // Opening waits on each device's capture thread to report readiness
    let samplers = {
        let settings = settings.clone();
        let backend = backend.clone();
        tokio::task::spawn_blocking(move || open_samplers(&settings, &backend)).await??
    };
    let info = DashboardInfo::new(
        &settings,
        samplers
            .first()
            .map(|s| s.device_name().to_string())
            .unwrap_or_default(),
        samplers
            .get(1)
            .map(|s| s.device_name().to_string())
            .unwrap_or_default(),
    );

    let publisher: Arc<dyn Publisher> =
        ResilientPublisher::connect(PublisherOptions::from_settings(&settings));
    let snapshot = SharedSnapshot::new();
    let orchestrator =
        Orchestrator::start(&settings, samplers, Arc::clone(&publisher), snapshot.clone());

    let stop = Arc::new(AtomicBool::new(false));
    let mut dashboard_task = dashboard.then(|| {
        let publisher = Arc::clone(&publisher);
        let stop = Arc::clone(&stop);
        let refresh = settings.refresh_interval();
        tokio::task::spawn_blocking(move || {
            ui::run_dashboard(info, snapshot, publisher, refresh, stop)
        })
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Interrupted");
        }
        result = async {
            match dashboard_task.as_mut() {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            dashboard_task = None;
            match result {
                Ok(Ok(())) => info!("Dashboard closed"),
                Ok(Err(e)) => error!(error = %e, "Dashboard failed"),
                Err(e) => error!(error = %e, "Dashboard task failed"),
            }
        }
        _ = orchestrator.all_halted() => {
            error!("All channels halted");
        }
    }

    stop.store(true, Ordering::SeqCst);
    if let Some(task) = dashboard_task {
        if let Ok(Err(e)) = task.await {
            error!(error = %e, "Dashboard failed");
        }
    }

    let report = orchestrator.shutdown().await;
    for (channel, fault) in &report.faults {
        warn!(%channel, error = %fault, "Channel had stopped before shutdown");
    }

    if let Err(e) = store.save(&settings).await {
        error!(error = %e, "Failed to save settings");
    }

    info!("Microphone monitor stopped");
    Ok(())
}
