//! # Devfleet Core
//!
//! Lifecycle orchestration for a fleet of shared mobile devices: every
//! device that comes back from a user is erased, supervised and loaded with
//! its required apps before it is handed out again.
//!
//! ## Architecture
//!
//! - [`store`]: locked JSON documents, the only shared state between
//!   concurrently running processes
//! - [`device`]: per-device records
//! - [`tasks`]: the persistent task queue
//! - [`ledger`]: recent automation failures
//! - [`apps`]: required-app catalog and install planning
//! - [`recovery`] and [`installer`]: GUI alert handling during installs
//! - [`tools`]: external collaborators (configuration tool, GUI adapter,
//!   tethering helper, notification sink)
//! - [`manager`]: the run loop tying it all together
//!
//! ## Examples
//!
//! ```no_run
//! use devfleet_core::{
//!     config::FleetConfig,
//!     manager::{Collaborators, DeviceManager},
//! };
//!
//! fn refresh() -> devfleet_core::error::Result<()> {
//!     let (config, _source) = FleetConfig::load_from_env()?;
//!     let collaborators = Collaborators::from_config(&config);
//!     let manager = DeviceManager::new(config, collaborators)?;
//!     manager.verify(true)?;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

/// Required-app catalog and install batching
pub mod apps;

/// Fleet configuration and timing constants
pub mod config;

/// Persistent device records
pub mod device;

/// Error types and error handling utilities
pub mod error;

/// App-install sessions through the GUI adapter
pub mod installer;

/// Recent failure log used for retry backoff
pub mod ledger;

/// Run loop, verification and operator controls
pub mod manager;

/// Known-alert rule table
pub mod recovery;

/// Locked JSON document store
pub mod store;

/// Persistent task queue
pub mod tasks;

/// External collaborators and their process-backed implementations
pub mod tools;

pub use config::{ConfigSource, FleetConfig, Timing};
pub use device::{Device, DeviceInfo, Wallpaper};
pub use error::{FleetError, Result};
pub use manager::{Collaborators, DeviceManager, FleetStatus, RunOutcome, RunState};
pub use tasks::{Ids, Task, TaskList};
