//! Core records: the immutable [`Event`], the derived per-prisoner state,
//! its cached [`PrisonerSnapshot`] form, recap lines, and the game and
//! prisoner directory rows.

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::EventError;
use crate::clock::{Clock, IdGenerator, SystemClock, UuidV7Generator};
use crate::enums::{Archetype, EventKind, GameStatus, ImpactClass};
use crate::ids::{ActorId, EventId, GameId};

/// Kind-specific, schema-free event data.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Number of sub-second digits kept on event timestamps.
///
/// Every backend stores microseconds, so timestamps are truncated at
/// creation to compare equal after a round trip through any of them.
pub const TIMESTAMP_SUBSEC_DIGITS: u16 = 6;

/// Truncate a timestamp to the precision every backend preserves.
pub fn canonical_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(TIMESTAMP_SUBSEC_DIGITS)
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable fact in the ledger.
///
/// Every field except [`Event::is_revealed`] is frozen once the event has
/// been appended. Within a game, events are ordered by `timestamp` with the
/// backend's insertion sequence as the tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// The game session this fact belongs to.
    pub game_id: GameId,
    /// Wall-clock creation time, truncated to microseconds.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[ts(as = "String")]
    pub kind: EventKind,
    /// Who caused it, or a `SYSTEM_` actor for environment facts.
    pub actor_id: ActorId,
    /// Who it happened to, if anyone other than the actor.
    pub target_id: Option<ActorId>,
    /// Kind-specific data (deltas, sound ids, durations).
    #[ts(type = "Record<string, unknown>")]
    pub payload: Payload,
    /// In-fiction day index at the moment of the fact.
    pub game_day: u32,
    /// Whether the audience has been shown this fact.
    pub is_revealed: bool,
}

/// Parameters for [`Event::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// The game session.
    pub game_id: GameId,
    /// What happened.
    pub kind: EventKind,
    /// Who caused it.
    pub actor_id: ActorId,
    /// Who it happened to.
    pub target_id: Option<ActorId>,
    /// In-fiction day index.
    pub game_day: u32,
    /// Kind-specific data.
    pub payload: Payload,
}

impl NewEvent {
    /// Start a parameter set with the three required fields.
    pub fn new(game_id: impl Into<GameId>, kind: impl Into<EventKind>, actor_id: impl Into<ActorId>) -> Self {
        Self {
            game_id: game_id.into(),
            kind: kind.into(),
            actor_id: actor_id.into(),
            target_id: None,
            game_day: 0,
            payload: Payload::new(),
        }
    }

    /// Set the affected party.
    #[must_use]
    pub fn target(mut self, target_id: impl Into<ActorId>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Set the in-fiction day.
    #[must_use]
    pub const fn day(mut self, game_day: u32) -> Self {
        self.game_day = game_day;
        self
    }

    /// Add one payload entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }
}

impl Event {
    /// Create an event stamped by the system clock with a fresh v7 id.
    pub fn new(params: NewEvent) -> Result<Self, EventError> {
        Self::new_with(params, &SystemClock, &UuidV7Generator)
    }

    /// Create an event using caller-supplied time and id sources.
    ///
    /// Fails only if the kind, actor or game is missing.
    pub fn new_with(
        params: NewEvent,
        clock: &dyn Clock,
        ids: &dyn IdGenerator,
    ) -> Result<Self, EventError> {
        let event = Self {
            id: ids.next_id(),
            game_id: params.game_id,
            timestamp: canonical_timestamp(clock.now()),
            kind: params.kind,
            actor_id: params.actor_id,
            target_id: params.target_id,
            payload: params.payload,
            game_day: params.game_day,
            is_revealed: false,
        };
        event.validate()?;
        Ok(event)
    }

    /// Check the required fields and timestamp precision.
    ///
    /// A timestamp finer than [`TIMESTAMP_SUBSEC_DIGITS`] is rejected
    /// rather than truncated, so every backend stores the same instant.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.kind.is_blank() {
            return Err(EventError::MissingField("kind"));
        }
        if self.actor_id.is_blank() {
            return Err(EventError::MissingField("actor_id"));
        }
        if self.game_id.is_blank() {
            return Err(EventError::MissingField("game_id"));
        }
        if self.target_id.as_ref().is_some_and(ActorId::is_blank) {
            return Err(EventError::BlankTarget);
        }
        if self.timestamp != canonical_timestamp(self.timestamp) {
            return Err(EventError::ImpreciseTimestamp(self.timestamp));
        }
        Ok(())
    }

    /// Whether `prisoner` is the actor or the target.
    pub fn involves(&self, prisoner: &ActorId) -> bool {
        &self.actor_id == prisoner || self.target_id.as_ref() == Some(prisoner)
    }

    /// The party whose state a self-or-other effect lands on: the target
    /// if there is one, otherwise the actor.
    pub fn subject(&self) -> &ActorId {
        self.target_id.as_ref().unwrap_or(&self.actor_id)
    }

    /// Whether the fact was driven by the environment.
    pub fn is_environmental(&self) -> bool {
        self.actor_id.is_system()
    }

    /// Read an integer payload entry. Floats are truncated toward zero.
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        let value = self.payload.get(key)?;
        value.as_i64().or_else(|| {
            value
                .as_f64()
                .and_then(Decimal::from_f64)
                .and_then(|d| d.trunc().to_i64())
        })
    }

    /// Read a boolean payload entry.
    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(serde_json::Value::as_bool)
    }

    /// Read a monetary payload entry. Accepts numbers and decimal strings.
    pub fn payload_decimal(&self, key: &str) -> Option<Decimal> {
        let value = self.payload.get(key)?;
        if let Some(text) = value.as_str() {
            return text.parse().ok();
        }
        value
            .as_i64()
            .map(Decimal::from)
            .or_else(|| value.as_f64().and_then(Decimal::from_f64))
    }
}

// ---------------------------------------------------------------------------
// Derived state
// ---------------------------------------------------------------------------

/// Lower bound of hunger, thirst, sanity, dignity and empathy.
pub const STAT_MIN: i32 = 0;
/// Upper bound of hunger, thirst, sanity, dignity and empathy.
pub const STAT_MAX: i32 = 100;
/// Lower bound of loyalty.
pub const LOYALTY_MIN: i32 = -100;
/// Upper bound of loyalty.
pub const LOYALTY_MAX: i32 = 100;
/// Loyalty of a freshly registered prisoner.
pub const INITIAL_LOYALTY: i32 = 50;
/// Empathy of a freshly registered prisoner.
pub const INITIAL_EMPATHY: i32 = 50;

/// Per-prisoner aggregate produced by folding the ledger.
///
/// Never persisted on its own: it is either the value inside a
/// [`PrisonerSnapshot`] or an ephemeral query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DerivedState {
    /// The prisoner this state belongs to.
    pub prisoner_id: ActorId,
    /// 0 (starving) to 100 (fed).
    pub hunger: i32,
    /// 0 (parched) to 100 (hydrated).
    pub thirst: i32,
    /// 0 (broken) to 100 (lucid).
    pub sanity: i32,
    /// 0 to 100.
    pub dignity: i32,
    /// -100 (hostile) to 100 (devoted) towards the cellmate.
    pub loyalty: i32,
    /// 0 to 100.
    pub empathy: i32,
    /// In the isolation cell.
    pub is_isolated: bool,
    /// Player disconnected; the body stays in the cell.
    pub is_sleeper: bool,
    /// Suffering withdrawal.
    pub in_withdrawal: bool,
    /// Money this prisoner has put into (or taken out of) the pot.
    #[ts(as = "String")]
    pub pot_contribution: Decimal,
}

impl DerivedState {
    /// State of a prisoner before any event has touched them.
    pub fn initial(prisoner_id: impl Into<ActorId>) -> Self {
        Self {
            prisoner_id: prisoner_id.into(),
            hunger: STAT_MAX,
            thirst: STAT_MAX,
            sanity: STAT_MAX,
            dignity: STAT_MAX,
            loyalty: INITIAL_LOYALTY,
            empathy: INITIAL_EMPATHY,
            is_isolated: false,
            is_sleeper: false,
            in_withdrawal: false,
            pot_contribution: Decimal::ZERO,
        }
    }

    /// Bring every numeric field back into its domain.
    pub fn clamp(&mut self) {
        self.hunger = self.hunger.clamp(STAT_MIN, STAT_MAX);
        self.thirst = self.thirst.clamp(STAT_MIN, STAT_MAX);
        self.sanity = self.sanity.clamp(STAT_MIN, STAT_MAX);
        self.dignity = self.dignity.clamp(STAT_MIN, STAT_MAX);
        self.empathy = self.empathy.clamp(STAT_MIN, STAT_MAX);
        self.loyalty = self.loyalty.clamp(LOYALTY_MIN, LOYALTY_MAX);
        if self.pot_contribution.is_sign_negative() {
            self.pot_contribution = Decimal::ZERO;
        }
    }
}

/// Cached [`DerivedState`] of one prisoner in one game.
///
/// Rebuildable from the ledger at any time and never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PrisonerSnapshot {
    /// The game the prisoner is playing in.
    pub game_id: GameId,
    /// The cached state.
    pub state: DerivedState,
    /// When the cache row was last written.
    pub last_updated: DateTime<Utc>,
}

impl PrisonerSnapshot {
    /// The prisoner this snapshot describes.
    pub const fn prisoner_id(&self) -> &ActorId {
        &self.state.prisoner_id
    }
}

// ---------------------------------------------------------------------------
// Recap
// ---------------------------------------------------------------------------

/// One human-readable line of a prisoner's recap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RecapEntry {
    /// The event this line was made from.
    pub event_id: EventId,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[ts(as = "String")]
    pub kind: EventKind,
    /// Text shown to the player.
    pub summary: String,
    /// Good, bad or neutral for the prisoner (by kind only).
    pub impact: ImpactClass,
    /// Whether the audience has seen it.
    pub is_revealed: bool,
    /// In-fiction day.
    pub game_day: u32,
}

// ---------------------------------------------------------------------------
// Game directory
// ---------------------------------------------------------------------------

/// A row of the `games` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GameRecord {
    /// Game identifier.
    pub id: GameId,
    /// Current in-fiction day (1-based once running).
    pub current_day: u32,
    /// Current in-fiction hour (0..24).
    pub current_hour: u32,
    /// Lifecycle state.
    pub status: GameStatus,
    /// Winning prisoner, once finished.
    pub winner: Option<ActorId>,
    /// When the game was created.
    pub created_at: DateTime<Utc>,
}

impl GameRecord {
    /// A fresh game in the lobby.
    pub fn new(id: impl Into<GameId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            current_day: 0,
            current_hour: 0,
            status: GameStatus::Lobby,
            winner: None,
            created_at,
        }
    }
}

/// A row of the `prisoners` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PrisonerRecord {
    /// Prisoner (actor) identifier.
    pub id: ActorId,
    /// The game they play in.
    pub game_id: GameId,
    /// Display name.
    pub name: String,
    /// Class chosen at registration.
    pub archetype: Archetype,
    /// Pot contribution as last written by the game engine.
    #[ts(as = "String")]
    pub pot_contribution: Decimal,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn fixed_clock() -> ManualClock {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap();
        ManualClock::new(at + chrono::Duration::nanoseconds(123_456_789))
    }

    #[test]
    fn new_event_truncates_timestamp_to_micros() {
        let clock = fixed_clock();
        let event = Event::new_with(
            NewEvent::new("g1", EventKind::SanityChange, "P1").with("delta", -10),
            &clock,
            &UuidV7Generator,
        )
        .unwrap();
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 123_456_000);
        assert!(!event.is_revealed);
        assert_eq!(event.payload_i64("delta"), Some(-10));
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let err = Event::new(NewEvent::new("g1", "", "P1")).unwrap_err();
        assert_eq!(err, EventError::MissingField("kind"));
        let err = Event::new(NewEvent::new("g1", EventKind::Vote, " ")).unwrap_err();
        assert_eq!(err, EventError::MissingField("actor_id"));
        let err = Event::new(NewEvent::new("", EventKind::Vote, "P1")).unwrap_err();
        assert_eq!(err, EventError::MissingField("game_id"));
        let err = Event::new(NewEvent::new("g1", EventKind::Vote, "P1").target("")).unwrap_err();
        assert_eq!(err, EventError::BlankTarget);
    }

    #[test]
    fn sub_microsecond_timestamps_are_rejected() {
        let mut event = Event::new(NewEvent::new("g1", EventKind::Vote, "P1")).unwrap();
        event.timestamp = fixed_clock().now();
        assert_eq!(
            event.validate(),
            Err(EventError::ImpreciseTimestamp(event.timestamp))
        );
        event.timestamp = canonical_timestamp(event.timestamp);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn subject_prefers_target() {
        let event = Event::new(NewEvent::new("g1", EventKind::SanityChange, "SYSTEM_SANITY").target("P2")).unwrap();
        assert_eq!(event.subject().as_str(), "P2");
        assert!(event.is_environmental());
        assert!(event.involves(&ActorId::from("P2")));
        assert!(!event.involves(&ActorId::from("P1")));
    }

    #[test]
    fn payload_accessors_accept_floats_and_strings() {
        let event = Event::new(
            NewEvent::new("g1", EventKind::Steal, "P1")
                .with("amount", "12.50")
                .with("delta", -7.9)
                .with("is_isolated", true),
        )
        .unwrap();
        assert_eq!(event.payload_decimal("amount"), Some(Decimal::new(1250, 2)));
        assert_eq!(event.payload_i64("delta"), Some(-7));
        assert_eq!(event.payload_bool("is_isolated"), Some(true));
        assert_eq!(event.payload_i64("missing"), None);
    }

    #[test]
    fn clamp_respects_each_domain() {
        let mut state = DerivedState::initial("P1");
        state.sanity = -5;
        state.loyalty = -150;
        state.hunger = 130;
        state.pot_contribution = Decimal::new(-3, 0);
        state.clamp();
        assert_eq!(state.sanity, 0);
        assert_eq!(state.loyalty, -100);
        assert_eq!(state.hunger, 100);
        assert_eq!(state.pot_contribution, Decimal::ZERO);
    }

    #[test]
    fn event_json_uses_kind_tag() {
        let event = Event::new(NewEvent::new("g1", EventKind::ToiletUse, "P1").day(2)).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "TOILET_USE");
        assert_eq!(json["game_day"], 2);
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
