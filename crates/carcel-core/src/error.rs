//! Top-level error for callers that open and drive a full persistence stack.

use carcel_db::DbError;
use carcel_ledger::LedgerError;
use carcel_types::EventError;

use crate::config::ConfigError;

/// Every failure mode of [`Persistence`](crate::Persistence) and its setup.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// Opening, migrating or querying a database failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: DbError,
    },

    /// An event log, snapshot or recap operation failed.
    #[error("ledger error: {source}")]
    Ledger {
        /// The underlying ledger error.
        #[from]
        source: LedgerError,
    },

    /// An event could not be constructed.
    #[error("invalid event: {source}")]
    Event {
        /// The underlying validation error.
        #[from]
        source: EventError,
    },

    /// The tracing subscriber could not be installed.
    #[error("telemetry error: {message}")]
    Telemetry {
        /// Description of the failure.
        message: String,
    },
}
