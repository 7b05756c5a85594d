//! The append-only event ledger for Carcel.
//!
//! Every state-changing occurrence in a game is recorded here as an
//! immutable [`Event`](carcel_types::Event). Mutable game state is never
//! stored authoritatively anywhere else: it is derived by replaying the
//! ledger.
//!
//! # Architecture
//!
//! - [`backend`] -- The [`LedgerBackend`] contract every storage medium implements.
//! - [`memory`] -- [`MemoryLedger`], the transient backend.
//! - [`mirror`] -- [`EventMirror`], a bounded in-memory copy of recent events per game.
//! - [`log`] -- [`EventLog`], the concurrency-safe facade readers and writers go through.
//! - [`deadline`] -- [`Deadline`], caller-supplied cancellation for every operation.
//! - `conformance` -- The ordering and idempotency suite every backend must pass
//!   (feature `conformance`).
//!
//! # Ordering
//!
//! Within a game, events are totally ordered by `(timestamp, sequence)`,
//! where `sequence` is the backend's insertion counter. Every backend
//! produces the same relative order for every query, so replays are
//! backend-independent.
//!
//! # Immutability
//!
//! No operation changes a stored event except [`LedgerBackend::mark_revealed`],
//! which flips `is_revealed` from `false` to `true` exactly once.

pub mod backend;
pub mod deadline;
pub mod log;
pub mod memory;
pub mod mirror;

#[cfg(any(test, feature = "conformance"))]
pub mod conformance;

pub use backend::{EventFilter, LedgerBackend, RevealOutcome, StoredEvent};
pub use deadline::Deadline;
pub use log::{EventLog, MirrorCheck};
pub use memory::MemoryLedger;
pub use mirror::EventMirror;

use carcel_types::{EventError, EventId};

/// Errors returned by ledger backends and the event log.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The event is malformed. Rejected before any I/O.
    #[error("invalid event: {0}")]
    Validation(#[from] EventError),

    /// An event with this identifier is already stored.
    #[error("event {id} already exists")]
    Conflict {
        /// The duplicate identifier.
        id: EventId,
    },

    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What kind of record was looked up ("event", "game", ...).
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The backend could not be reached or failed an I/O operation.
    #[error("ledger backend unavailable: {reason}")]
    Unavailable {
        /// Underlying cause.
        reason: String,
    },

    /// The append-only guarantee was breached. Not recoverable locally.
    #[error("ledger invariant violated: {reason}")]
    InvariantViolation {
        /// What was observed.
        reason: String,
    },

    /// The caller's deadline passed before the backend answered.
    ///
    /// For writes the outcome is unknown: retry with the same event, a
    /// [`LedgerError::Conflict`] then means the first attempt was durable.
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded {
        /// The operation that was cut short.
        operation: &'static str,
    },
}

impl LedgerError {
    /// Whether the caller may retry the identical request.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::DeadlineExceeded { .. }
        )
    }

    /// Whether the outcome of a write is unknown after this error.
    pub const fn is_indeterminate(&self) -> bool {
        self.is_retryable()
    }

    /// Shorthand for an unknown event.
    pub fn event_not_found(id: EventId) -> Self {
        Self::NotFound {
            entity: "event",
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use carcel_types::EventId;

    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(
            LedgerError::Unavailable {
                reason: "io".to_owned()
            }
            .is_retryable()
        );
        assert!(LedgerError::DeadlineExceeded { operation: "append" }.is_retryable());
        assert!(!LedgerError::Conflict { id: EventId::new() }.is_retryable());
        assert!(!LedgerError::event_not_found(EventId::new()).is_retryable());
        assert!(
            !LedgerError::InvariantViolation {
                reason: "x".to_owned()
            }
            .is_retryable()
        );
        assert!(!LedgerError::Validation(EventError::MissingField("kind")).is_retryable());
    }
}
