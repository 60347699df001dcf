//! # jeefhs-core
//!
//! Core library for jeefhs - an offline-first home sensor agent.
//!
//! This library provides:
//! - A durable local event buffer on SQLite
//! - A background sync daemon that replicates the buffer to a cloud store
//! - Connectivity probes and cloud store adapters
//! - Sensor/actuator abstractions, security modes and control commands
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Producers never talk to the network:
//! - **Producers** append events to [`LocalStore`]; an append either commits
//!   durably or returns an error.
//! - **[`SyncDaemon`]** reads the oldest unsynced rows, writes them to a
//!   [`CloudStore`] as one batch, and only then marks them synced.
//! - **Compaction** removes synced rows past the retention horizon.
//!
//! The cloud keys rows on `(device id, sequence number)`, so a batch that is
//! resent after an ambiguous failure never creates duplicates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jeefhs_core::{payload, Config, EventCategory, LocalStore};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let store = LocalStore::open(&config.store_path()).expect("failed to open store");
//! store.migrate().expect("failed to run migrations");
//!
//! let seq = store
//!     .append(
//!         EventCategory::Environmental,
//!         chrono::Utc::now(),
//!         &payload! { "temperature" => 21.5, "humidity" => 48.0 },
//!     )
//!     .expect("append failed");
//! println!("recorded event {}", seq);
//! let _store = Arc::new(store);
//! ```

// Re-export commonly used items at the crate root
pub use cloud::{BatchReceipt, CloudStore, HttpCloudStore, MemoryCloudStore};
pub use config::{Config, SyncConfig};
pub use daemon::{Backoff, DaemonHandle, DaemonState, DaemonStatus, SyncDaemon, SyncStats};
pub use error::{Error, Result};
pub use mode::{Mode, ModeManager};
pub use probe::ConnectivityProbe;
pub use recorder::EventRecorder;
pub use store::{LocalStore, StoreStats};
pub use types::*;

// Public modules
pub mod cloud;
pub mod config;
pub mod control;
pub mod daemon;
pub mod devices;
pub mod error;
pub mod logging;
pub mod mode;
pub mod probe;
pub mod recorder;
pub mod store;
pub mod types;
