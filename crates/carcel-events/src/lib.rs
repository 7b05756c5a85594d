//! State reconstruction and snapshots for the Carcel event store.
//!
//! Events are the source of truth; prisoner state is a pure function of
//! them. This crate holds that function, the recap built on top of it, and
//! the snapshot cache that makes current-state reads cheap.
//!
//! - [`reconstructor`] -- The fold, the recap, and [`Reconstructor`].
//! - [`snapshot`] -- The [`SnapshotStore`] contract and its in-memory store.
//! - [`projector`] -- [`SnapshotProjector`]: write-through projection, rebuild
//!   and drift detection.

pub mod projector;
pub mod reconstructor;
pub mod snapshot;

pub use projector::{SnapshotDrift, SnapshotProjector};
pub use reconstructor::{
    RecapOutcome, Reconstructor, apply_event, fold_game, fold_snapshots, rebuild_state,
    recap_entries, summarize,
};
pub use snapshot::{MemorySnapshotStore, SnapshotStore};
