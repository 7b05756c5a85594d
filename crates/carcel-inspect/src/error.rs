//! Error types for the inspect binary.

/// Top-level error for `carcel-inspect`.
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    /// Opening the configured stack failed.
    #[error("{source}")]
    Core {
        /// The underlying error.
        #[from]
        source: carcel_core::CoreError,
    },

    /// A ledger, snapshot or recap operation failed.
    #[error("{source}")]
    Ledger {
        /// The underlying error.
        #[from]
        source: carcel_ledger::LedgerError,
    },

    /// A game directory lookup failed.
    #[error("{source}")]
    Db {
        /// The underlying error.
        #[from]
        source: carcel_db::DbError,
    },

    /// Output could not be rendered.
    #[error("output error: {source}")]
    Json {
        /// The underlying error.
        #[from]
        source: serde_json::Error,
    },

    /// A command-line value is unusable.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// Cached snapshots disagree with the ledger.
    #[error("{count} snapshot(s) drifted from the ledger")]
    Drift {
        /// Number of drifted prisoners.
        count: usize,
    },
}
