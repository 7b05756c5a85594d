//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`sqlx`] errors with enough context to translate them into the ledger's
//! error taxonomy (see the `From<DbError> for LedgerError` impl).

use carcel_ledger::LedgerError;
use carcel_types::EventId;

/// Marker carried by every message raised by the append-only triggers.
pub const APPEND_ONLY_MARKER: &str = "append-only";

/// `PostgreSQL` SQLSTATE for `RAISE EXCEPTION` without an explicit code.
const PG_RAISE_EXCEPTION: &str = "P0001";

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A database operation failed.
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// A migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An event with this identifier is already stored.
    #[error("duplicate event {0}")]
    DuplicateEvent(EventId),

    /// A directory record with this key already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Record kind ("game", "prisoner").
        entity: &'static str,
        /// The duplicate key.
        id: String,
    },

    /// A directory record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record kind ("game", "prisoner").
        entity: &'static str,
        /// The key that was looked up.
        id: String,
    },

    /// A stored row cannot be turned back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The caller passed a value the schema cannot hold.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether this is a unique-key violation reported by the database.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sql(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }

    /// Whether this is a foreign-key violation reported by the database.
    pub fn is_foreign_key_violation(&self) -> bool {
        match self {
            Self::Sql(sqlx::Error::Database(db)) => db.is_foreign_key_violation(),
            _ => false,
        }
    }

    /// Whether an append-only trigger rejected the statement.
    pub fn is_append_only_rejection(&self) -> bool {
        match self {
            Self::Sql(sqlx::Error::Database(db)) => {
                db.message().contains(APPEND_ONLY_MARKER)
                    || db.code().as_deref() == Some(PG_RAISE_EXCEPTION)
            }
            _ => false,
        }
    }
}

/// Map a failed insert of `id` to [`DbError::DuplicateEvent`] when the
/// database reports a unique violation.
pub(crate) fn on_insert(err: sqlx::Error, id: EventId) -> DbError {
    let err = DbError::from(err);
    if err.is_unique_violation() {
        DbError::DuplicateEvent(id)
    } else {
        err
    }
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        if err.is_append_only_rejection() {
            tracing::error!(error = %err, "Storage rejected a change to a stored event");
            return Self::InvariantViolation {
                reason: err.to_string(),
            };
        }
        match err {
            DbError::DuplicateEvent(id) => Self::Conflict { id },
            DbError::NotFound { entity, id } => Self::NotFound { entity, id },
            DbError::Sql(
                sqlx::Error::Decode(_)
                | sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::TypeNotFound { .. },
            )
            | DbError::Serialization(_)
            | DbError::Corrupt(_)
            | DbError::AlreadyExists { .. }
            | DbError::InvalidInput(_) => {
                tracing::error!(error = %err, "Stored data violates the ledger contract");
                Self::InvariantViolation {
                    reason: err.to_string(),
                }
            }
            DbError::Sql(_) | DbError::Migration(_) | DbError::Config(_) => Self::Unavailable {
                reason: err.to_string(),
            },
        }
    }
}
