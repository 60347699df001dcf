//! jeefhs-sync - inspect and maintain the local event buffer
//!
//! This tool provides commands for:
//! - Showing configuration and buffer counts
//! - Listing events still waiting for replication
//! - Running sync cycles by hand until the buffer is drained
//! - Compacting replicated events
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/jeefhs/events.db (~/.local/share/jeefhs/events.db)
//! - Logs: stderr with -v (the agent writes $XDG_STATE_HOME/jeefhs/jeefhs.log.<date>)
//! - Config: $XDG_CONFIG_HOME/jeefhs/config.toml (~/.config/jeefhs/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jeefhs_core::config;
use jeefhs_core::logging::Output;
use jeefhs_core::{probe, Config, DaemonState, HttpCloudStore, LocalStore, SyncDaemon};
use process_lock::acquire_replicator_guard;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jeefhs-sync")]
#[command(about = "Inspect and maintain the jeefhs event buffer")]
#[command(version)]
struct Args {
    /// Log to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ~/.config/jeefhs/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and buffer counts
    Status,

    /// List the oldest events not yet replicated
    Pending {
        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run sync cycles now until the buffer is drained or a cycle fails
    Flush {
        /// Check reachability and report what would be sent, without sending
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove replicated events older than the retention horizon
    Compact {
        /// Retention horizon in hours (default: from config)
        #[arg(long)]
        hours: Option<u64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

fn open_store(config: &Config) -> Result<LocalStore> {
    let db_path = config.store_path();
    let store = LocalStore::open(&db_path)
        .with_context(|| format!("failed to open event store at {}", db_path.display()))?;
    store.migrate().context("failed to run event store migrations")?;
    Ok(store)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let _log_guard = if args.verbose {
        Some(
            jeefhs_core::logging::init(&config.logging, Output::Stderr)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Pending { limit } => cmd_pending(&config, limit),
        Command::Flush { dry_run } => cmd_flush(&config, dry_run),
        Command::Compact { hours } => cmd_compact(&config, hours),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("jeefhs Sync Status");
    println!("==================");
    println!();
    println!("Device ID:       {}", config.device.id);
    println!("Database:        {}", config.store_path().display());
    println!(
        "Cloud endpoint:  {}",
        config.cloud.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if config.cloud.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Poll interval:   {}s", config.sync.poll_interval_secs);
    println!("Batch size:      {}", config.sync.batch_size);
    println!(
        "Backoff:         {}s .. {}s",
        config.sync.backoff_base_secs, config.sync.backoff_cap_secs
    );
    println!("Retention:       {}h", config.sync.retention_hours);
    println!(
        "Agent log:       {}",
        jeefhs_core::logging::log_file_path().display()
    );
    println!();

    let store = open_store(config)?;
    let stats = store.stats().context("failed to read store statistics")?;

    println!("Events stored:   {}", stats.total);
    println!("  Unsynced:      {}", stats.unsynced);
    println!("  Synced:        {}", stats.synced);
    println!(
        "Last sequence:   {}",
        stats
            .last_seq
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(oldest) = stats.oldest_unsynced_at {
        println!("Oldest unsynced: {}", oldest.to_rfc3339());
    }

    if !config.cloud.is_ready() {
        println!();
        println!("Cloud sync is not configured. Set it in config.toml:");
        println!();
        println!("  [cloud]");
        println!("  endpoint = \"https://your-cloud.example.com\"");
        println!("  api_key = \"...\"");
    }

    Ok(())
}

fn cmd_pending(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let records = store
        .read_unsynced(limit)
        .context("failed to read unsynced events")?;

    if records.is_empty() {
        println!("No pending events.");
        return Ok(());
    }

    println!("{:>8}  {:<32}  {:<16}  PAYLOAD", "SEQ", "CAPTURED AT", "CATEGORY");
    for record in &records {
        let payload = serde_json::to_string(&record.payload).context("failed to encode payload")?;
        println!(
            "{:>8}  {:<32}  {:<16}  {}",
            record.seq,
            record.captured_at.to_rfc3339(),
            record.category.as_str(),
            payload
        );
    }

    let total = store.count_unsynced().context("failed to count events")?;
    if total as usize > records.len() {
        println!("... {} more", total as usize - records.len());
    }
    Ok(())
}

fn cmd_flush(config: &Config, dry_run: bool) -> Result<()> {
    if !config.cloud.is_ready() {
        anyhow::bail!("cloud.endpoint is not configured; nothing to flush to");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let probe = probe::from_config(&config.cloud).context("failed to create connectivity probe")?;

    if dry_run {
        let store = open_store(config)?;
        let pending = store.count_unsynced().context("failed to count events")? as usize;
        let batches = pending.div_ceil(config.sync.batch_size);
        let reachable = runtime.block_on(probe.is_reachable());

        println!("Pending events:  {}", pending);
        println!("Batches needed:  {} (batch size {})", batches, config.sync.batch_size);
        println!("Cloud reachable: {}", if reachable { "yes" } else { "no" });
        println!("\nDry run - nothing sent");
        return Ok(());
    }

    let db_path = config.store_path();
    let _guard = acquire_replicator_guard(&db_path).context("failed to acquire process lock")?;

    let store = Arc::new(open_store(config)?);
    let cloud = HttpCloudStore::new(&config.cloud, &config.device.id, config.sync.write_timeout())
        .context("failed to create cloud client")?;
    let mut daemon = SyncDaemon::new(
        Arc::clone(&store),
        Box::new(cloud),
        probe,
        config.sync.clone(),
    );

    let last = runtime.block_on(daemon.drain());
    let stats = daemon.stats();

    println!("Batches written: {}", stats.batches_written);
    println!("Events synced:   {}", stats.records_synced);
    if stats.duplicates_acknowledged > 0 {
        println!("Already in cloud: {}", stats.duplicates_acknowledged);
    }
    let remaining = store.count_unsynced().context("failed to count events")?;
    println!("Still pending:   {}", remaining);

    match last.to {
        DaemonState::Backoff => anyhow::bail!(
            "flush stopped after a failure: {}",
            stats.last_error.as_deref().unwrap_or("unknown error")
        ),
        _ if stats.unreachable_probes > 0 => anyhow::bail!("cloud endpoint is unreachable"),
        _ => Ok(()),
    }
}

fn cmd_compact(config: &Config, hours: Option<u64>) -> Result<()> {
    let hours = hours.unwrap_or(config.sync.retention_hours);
    let store = open_store(config)?;
    let removed = store
        .compact(config::hours(hours))
        .context("failed to compact event store")?;

    println!("Removed {} synced event(s) older than {}h", removed, hours);
    Ok(())
}
