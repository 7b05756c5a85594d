//! Shared type definitions for the Carcel event store.
//!
//! This crate is the single source of truth for the fact record and the
//! shapes derived from it. Client-facing types flow to `TypeScript` via
//! `ts-rs` for the game client and the VAR replay viewer.
//!
//! # Modules
//!
//! - [`ids`] -- Event identifiers and the game/actor key newtypes
//! - [`enums`] -- The event kind catalogue, impact classes, game status, archetypes
//! - [`structs`] -- Events, derived state, snapshots, recap lines, directory rows
//! - [`clock`] -- Clock, identifier generator and game calendar collaborators

pub mod clock;
pub mod enums;
pub mod ids;
pub mod structs;

pub use clock::{Clock, GameCalendar, IdGenerator, ManualClock, SystemClock, UuidV7Generator};
pub use enums::{Archetype, EventKind, GameStatus, ImpactClass, UnknownVariant};
pub use ids::{ActorId, EventId, GameId, SYSTEM_ACTOR_PREFIX, SYSTEM_TWINS};
pub use structs::{
    DerivedState, Event, GameRecord, INITIAL_EMPATHY, INITIAL_LOYALTY, LOYALTY_MAX, LOYALTY_MIN,
    NewEvent, Payload, PrisonerRecord, PrisonerSnapshot, RecapEntry, STAT_MAX, STAT_MIN,
    TIMESTAMP_SUBSEC_DIGITS, canonical_timestamp,
};

/// A malformed event, rejected before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// A required field is empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A target was given but is empty.
    #[error("target_id is present but blank")]
    BlankTarget,

    /// The timestamp carries more sub-second precision than storage keeps.
    #[error("timestamp {0} is finer than microseconds")]
    ImpreciseTimestamp(chrono::DateTime<chrono::Utc>),
}

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // Written to `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::EventId::export_all();
        let _ = crate::ids::GameId::export_all();
        let _ = crate::ids::ActorId::export_all();

        let _ = crate::enums::ImpactClass::export_all();
        let _ = crate::enums::GameStatus::export_all();
        let _ = crate::enums::Archetype::export_all();

        let _ = crate::structs::Event::export_all();
        let _ = crate::structs::DerivedState::export_all();
        let _ = crate::structs::PrisonerSnapshot::export_all();
        let _ = crate::structs::RecapEntry::export_all();
        let _ = crate::structs::GameRecord::export_all();
        let _ = crate::structs::PrisonerRecord::export_all();
    }
}
