//! # runtracker-core
//!
//! Records runs: a run is created, made current, and location samples are
//! stored under it until it is stopped.
//!
//! ## Design Principles
//!
//! - **One owner of session state**: [`RunManager`] is the only writer of the
//!   current run, and the only route from a location source to the store.
//! - **Durable current run**: the current run id survives restarts through the
//!   session marker file.
//! - **Synchronous**: no async runtime. Delivery runs on a plain worker thread.
//! - **Explicit failures**: store and marker errors come back as
//!   [`TrackerError`], never as sentinel ids.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtracker_core::{ManualLocationSource, RunManager, RunStore, SessionMarker, StoragePaths, TrackerConfig};
//!
//! let paths = StoragePaths::resolve()?;
//! let config = TrackerConfig::load(&paths.config_file())?;
//! let store = RunStore::open(paths.database_file())?;
//! let marker = SessionMarker::new(paths.marker_file());
//! let source = Arc::new(ManualLocationSource::new("gps"));
//!
//! let manager = RunManager::open(store, marker, source, &config)?;
//! let run = manager.start_new_run()?;
//! ```

pub mod config;
pub mod duration;
pub mod error;
pub mod location;
pub mod manager;
pub mod marker;
pub mod run;
pub mod store;

pub use config::{
    DeliveryConfig, ProviderConfig, SessionConfig, StorageConfig, StoragePaths, TrackerConfig,
};
pub use duration::{format_duration, format_signed_duration, parse_hms};
pub use error::{Result, TrackerError};
pub use location::{
    DeliveryQueue, LocationEvent, LocationSource, ManualLocationSource, ProviderPolicy,
    ReplayLocationSource, SampleSink, SubscriptionHandle,
};
pub use manager::{InsertOutcome, RunManager, SessionStatus};
pub use marker::SessionMarker;
pub use run::{now_millis, LocationSample, Run, NO_RUN};
pub use store::{RunCursor, RunStore, SCHEMA_VERSION};
