//! Durable storage for the Carcel event store (`SQLite` + `PostgreSQL`).
//!
//! Both media implement the same [`LedgerBackend`](carcel_ledger::LedgerBackend)
//! and [`SnapshotStore`](carcel_events::SnapshotStore) contracts and pass
//! the same conformance suite, so a replay reads identically whichever one
//! a deployment chooses.
//!
//! # Architecture
//!
//! ```text
//! EventLog / SnapshotProjector
//!     |
//!     +-- PostgreSQL (PostgresPool)     client-server, multi-host
//!     |     |-- PgEventStore            (append-only event_log + triggers)
//!     |     |-- PgSnapshotStore         (prisoner_snapshots cache)
//!     |     +-- PgGameDirectory         (games, prisoners)
//!     |
//!     +-- SQLite (SqliteDb)             embedded file, single host
//!           |-- SqliteEventStore
//!           |-- SqliteSnapshotStore
//!           +-- SqliteGameDirectory
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`sqlite`] -- `SQLite` connection pool and configuration
//! - [`event_store`] -- `PostgreSQL` ledger backend
//! - [`sqlite_event_store`] -- `SQLite` ledger backend
//! - [`snapshot_store`] -- Snapshot cache on both media
//! - [`game_store`] -- The game directory on both media (plus in-memory)
//! - [`error`] -- Shared error types

pub mod error;
pub mod event_store;
pub mod game_store;
pub mod postgres;
pub mod snapshot_store;
pub mod sqlite;
pub mod sqlite_event_store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use event_store::{EventRow, PgEventStore};
pub use game_store::{
    GameDirectory, HOURS_PER_DAY, MemoryGameDirectory, PgGameDirectory, SqliteGameDirectory,
};
pub use postgres::{PostgresConfig, PostgresPool};
pub use snapshot_store::{PgSnapshotStore, SnapshotRow, SqliteSnapshotStore};
pub use sqlite::{SqliteConfig, SqliteDb};
pub use sqlite_event_store::{SqliteEventRow, SqliteEventStore};
