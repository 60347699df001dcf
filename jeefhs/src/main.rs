//! jeefhs - offline-first home sensor agent
//!
//! Collects environmental readings and motion events, drives the LEDs, fan
//! and buzzer, and records everything in the local event buffer. A background
//! sync daemon replicates the buffer to the cloud whenever it is reachable.
//!
//! Control commands are read from stdin, one per line:
//! `mode <HOME|AWAY|NIGHT>`, `set <device> <on|off>`, `buzz`, `status`.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/jeefhs/events.db (~/.local/share/jeefhs/events.db)
//! - Logs: $XDG_STATE_HOME/jeefhs/jeefhs.log.<date>, rotated daily
//! - Config: $XDG_CONFIG_HOME/jeefhs/config.toml (~/.config/jeefhs/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use clap::Parser;
use jeefhs_core::config::{DevicesConfig, SyncConfig};
use jeefhs_core::control::{Command, Dispatcher};
use jeefhs_core::devices::{DeviceController, DeviceSet, EnvironmentSensor, MotionSensor};
use jeefhs_core::logging::Output;
use jeefhs_core::{
    probe, store, Config, DaemonHandle, Error, EventRecorder, HttpCloudStore, LocalStore, Mode,
    ModeManager, SyncDaemon,
};
use process_lock::acquire_replicator_guard;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "jeefhs")]
#[command(about = "Offline-first home sensor agent")]
#[command(version)]
struct Args {
    /// Config file (default: ~/.config/jeefhs/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use simulated sensors and actuators regardless of config
    #[arg(long)]
    simulate: bool,

    /// Initial security mode
    #[arg(long, default_value = "HOME")]
    mode: Mode,
}

/// Producers report append failures here; the agent stops on the first one.
type FatalTx = mpsc::UnboundedSender<Error>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard = jeefhs_core::logging::init(&config.logging, Output::FileAndStderr)
        .context("failed to initialize logging")?;

    tracing::info!(device_id = %config.device.id, "jeefhs agent starting");

    // One replicator per database
    let db_path = config.store_path();
    let _replicator_guard =
        acquire_replicator_guard(&db_path).context("failed to acquire process lock")?;

    tracing::info!(path = %db_path.display(), "Opening event store");
    let store = LocalStore::open(&db_path).context("failed to open event store")?;
    store.migrate().context("failed to run event store migrations")?;
    let store = Arc::new(store);

    let DeviceSet {
        environment,
        motion,
        controller,
    } = DeviceSet::from_config(&config.devices, args.simulate)
        .context("failed to initialize devices")?;
    let controller = Arc::new(controller);

    let recorder = EventRecorder::new(Arc::clone(&store));
    let modes = Arc::new(ModeManager::new(args.mode));
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

    {
        let recorder = recorder.clone();
        let fatal_tx = fatal_tx.clone();
        modes.register_callback(move |mode| {
            if let Err(e) = recorder.record_mode_change(mode) {
                let _ = fatal_tx.send(e);
            }
        });
    }
    recorder
        .record_mode_change(modes.get_mode())
        .context("failed to record initial mode")?;

    let daemon = start_daemon(&config, &store)?;

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    tasks.spawn(environment_loop(
        environment,
        recorder.clone(),
        config.devices.clone(),
        fatal_tx.clone(),
    ));
    tasks.spawn(motion_loop(
        motion,
        recorder.clone(),
        Arc::clone(&modes),
        Arc::clone(&controller),
        config.devices.clone(),
        fatal_tx.clone(),
    ));
    if config.devices.heartbeat_interval_secs > 0 {
        tasks.spawn(heartbeat_loop(
            recorder.clone(),
            Arc::clone(&modes),
            config.devices.heartbeat_interval_secs,
            started,
            fatal_tx.clone(),
        ));
    }
    tasks.spawn(compaction_loop(Arc::clone(&store), config.sync.clone()));
    tasks.spawn(control_loop(
        Dispatcher::new(Arc::clone(&modes), Arc::clone(&controller), recorder),
        fatal_tx,
    ));

    let fatal = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
            None
        }
        Some(e) = fatal_rx.recv() => {
            tracing::error!(error = %e, "Event store append failed; stopping");
            Some(e)
        }
    };

    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    if let Some(daemon) = daemon {
        let stats = daemon.shutdown().await;
        tracing::info!(
            records_synced = stats.records_synced,
            write_failures = stats.write_failures,
            "Sync daemon finished"
        );
    }

    match fatal {
        Some(e) => Err(e).context("failed to record event"),
        None => {
            tracing::info!(uptime_secs = started.elapsed().as_secs(), "jeefhs agent stopped");
            Ok(())
        }
    }
}

fn start_daemon(config: &Config, store: &Arc<LocalStore>) -> Result<Option<DaemonHandle>> {
    if !config.cloud.is_ready() {
        tracing::warn!("cloud.endpoint not configured; events will be buffered locally only");
        return Ok(None);
    }

    let cloud = HttpCloudStore::new(&config.cloud, &config.device.id, config.sync.write_timeout())
        .context("failed to create cloud client")?;
    let probe = probe::from_config(&config.cloud).context("failed to create connectivity probe")?;
    let daemon = SyncDaemon::new(Arc::clone(store), Box::new(cloud), probe, config.sync.clone());
    Ok(Some(daemon.spawn()))
}

async fn shutdown_signal() {
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

fn every(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn environment_loop(
    mut sensor: Box<dyn EnvironmentSensor>,
    recorder: EventRecorder,
    config: DevicesConfig,
    fatal: FatalTx,
) {
    let mut ticker = every(config.env_interval_secs);
    loop {
        ticker.tick().await;
        let reading = match sensor.read() {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(error = %e, "Environmental reading failed");
                continue;
            }
        };

        tracing::debug!(
            temperature = reading.temperature_c,
            humidity = reading.humidity_pct,
            source = reading.source.as_str(),
            "Environmental reading"
        );
        if let Err(e) = recorder
            .record_async(move |r| r.record_environment(&reading))
            .await
        {
            let _ = fatal.send(e);
            return;
        }
    }
}

async fn motion_loop(
    mut sensor: Box<dyn MotionSensor>,
    recorder: EventRecorder,
    modes: Arc<ModeManager>,
    controller: Arc<DeviceController>,
    config: DevicesConfig,
    fatal: FatalTx,
) {
    let mut ticker = every(config.motion_interval_secs);
    let mut was_active = false;
    loop {
        ticker.tick().await;
        let active = match sensor.motion_detected() {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(error = %e, "Motion sensor read failed");
                continue;
            }
        };

        // One event per detection, not per poll while the PIR stays high
        let rising = active && !was_active;
        was_active = active;
        if !rising {
            continue;
        }

        let mode = modes.get_mode();
        let mut buzzer_triggered = false;
        if mode.arms_buzzer() {
            match controller.pulse_buzzer().await {
                Ok(()) => buzzer_triggered = true,
                Err(e) => tracing::warn!(error = %e, "Failed to pulse buzzer"),
            }
        }

        tracing::info!(mode = %mode, buzzer_triggered, "Motion detected");
        if let Err(e) = recorder
            .record_async(move |r| r.record_motion(mode, buzzer_triggered))
            .await
        {
            let _ = fatal.send(e);
            return;
        }
    }
}

async fn heartbeat_loop(
    recorder: EventRecorder,
    modes: Arc<ModeManager>,
    period_secs: u64,
    started: Instant,
    fatal: FatalTx,
) {
    let mut ticker = every(period_secs);
    loop {
        ticker.tick().await;
        let (uptime_secs, mode) = (started.elapsed().as_secs(), modes.get_mode());
        if let Err(e) = recorder
            .record_async(move |r| r.heartbeat(uptime_secs, mode))
            .await
        {
            let _ = fatal.send(e);
            return;
        }
    }
}

async fn compaction_loop(local: Arc<LocalStore>, config: SyncConfig) {
    let mut ticker = every(config.compact_interval_secs);
    loop {
        ticker.tick().await;
        let (db, horizon) = (Arc::clone(&local), config.retention_horizon());
        match store::blocking(move || db.compact(horizon)).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Compacted synced events"),
            Err(e) => tracing::error!(error = %e, "Compaction failed"),
        }
    }
}

async fn control_loop(dispatcher: Dispatcher, fatal: FatalTx) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // Running detached: no control input
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read control input");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                println!("error: {}", e);
                continue;
            }
        };

        match dispatcher.dispatch(command).await {
            Ok(reply) => println!("{}", reply),
            Err(e) if e.is_storage_fault() => {
                let _ = fatal.send(e);
                return;
            }
            Err(e) => println!("error: {}", e),
        }
    }
}
