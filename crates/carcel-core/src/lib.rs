//! Wiring for the Carcel event store.
//!
//! Loads `carcel.yaml`, installs the tracing subscriber, and opens the
//! configured backend as a single [`Persistence`] handle.
//!
//! - [`config`] -- YAML configuration with environment overrides
//! - [`telemetry`] -- `tracing-subscriber` setup
//! - [`persistence`] -- The assembled event log, snapshots, reconstructor and directory
//! - [`error`] -- [`CoreError`]

pub mod config;
pub mod error;
pub mod persistence;
pub mod telemetry;

pub use config::{BackendKind, CarcelConfig, ConfigError};
pub use error::CoreError;
pub use persistence::Persistence;
pub use telemetry::init_tracing;
