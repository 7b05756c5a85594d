//! The storage contract shared by every ledger medium.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use carcel_types::{ActorId, Event, EventId, EventKind, GameId};

use crate::LedgerError;

/// An event as stored, with the backend's insertion sequence.
///
/// The sequence breaks timestamp ties: two events with the same timestamp
/// replay in the order they were inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Monotonic insertion counter, unique per backend.
    pub sequence: u64,
    /// The stored fact.
    pub event: Event,
}

impl StoredEvent {
    /// The total-order key of this event within its game.
    pub const fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.event.timestamp, self.sequence)
    }
}

/// Sort events into replay order.
pub fn sort_for_replay(events: &mut [StoredEvent]) {
    events.sort_by_key(StoredEvent::order_key);
}

/// Which events of a game a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Events caused by this actor.
    Actor(ActorId),
    /// Events where this actor is the actor or the target.
    Involving(ActorId),
    /// Events of one in-fiction day.
    Day(u32),
    /// Events of one kind.
    Kind(EventKind),
    /// Events the audience has not been shown.
    Unrevealed,
}

impl EventFilter {
    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Actor(actor) => &event.actor_id == actor,
            Self::Involving(actor) => event.involves(actor),
            Self::Day(day) => event.game_day == *day,
            Self::Kind(kind) => &event.kind == kind,
            Self::Unrevealed => !event.is_revealed,
        }
    }

    /// Short label for logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Actor(_) => "actor",
            Self::Involving(_) => "involving",
            Self::Day(_) => "day",
            Self::Kind(_) => "kind",
            Self::Unrevealed => "unrevealed",
        }
    }
}

/// Result of the reveal mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevealOutcome {
    /// The flag went from `false` to `true`.
    Revealed,
    /// The event was already revealed. Nothing changed.
    AlreadyRevealed,
}

/// A durable append-and-query store for one storage medium.
///
/// Implementations must:
///
/// - never modify a stored event except through [`LedgerBackend::mark_revealed`];
/// - reject a duplicate identifier with [`LedgerError::Conflict`] and
///   store nothing;
/// - return every query in `(timestamp, sequence)` order;
/// - make [`LedgerBackend::append_batch`] all-or-nothing.
///
/// The `conformance` suite checks all of the above.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Short name for logs ("memory", "sqlite", "postgres").
    fn name(&self) -> &'static str;

    /// Insert one event. Returns its insertion sequence.
    async fn append(&self, event: &Event) -> Result<u64, LedgerError>;

    /// Insert several events atomically. Returns their sequences in
    /// argument order.
    async fn append_batch(&self, events: &[Event]) -> Result<Vec<u64>, LedgerError>;

    /// Events of `game_id` passing `filter`, in replay order.
    async fn query(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, LedgerError>;

    /// Look up one event by identifier.
    async fn get(&self, id: EventId) -> Result<Option<StoredEvent>, LedgerError>;

    /// Set `is_revealed`. Fails with [`LedgerError::NotFound`] for an
    /// unknown identifier; revealing twice is a no-op.
    async fn mark_revealed(&self, id: EventId) -> Result<RevealOutcome, LedgerError>;

    /// Every event of a game.
    async fn query_by_game(&self, game_id: &GameId) -> Result<Vec<Event>, LedgerError> {
        self.query_events(game_id, &EventFilter::All).await
    }

    /// Events caused by `actor_id`.
    async fn query_by_actor(
        &self,
        game_id: &GameId,
        actor_id: &ActorId,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query_events(game_id, &EventFilter::Actor(actor_id.clone()))
            .await
    }

    /// Events of one in-fiction day.
    async fn query_by_day(&self, game_id: &GameId, day: u32) -> Result<Vec<Event>, LedgerError> {
        self.query_events(game_id, &EventFilter::Day(day)).await
    }

    /// Events of one kind.
    async fn query_by_kind(
        &self,
        game_id: &GameId,
        kind: &EventKind,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query_events(game_id, &EventFilter::Kind(kind.clone()))
            .await
    }

    /// Events not yet revealed.
    async fn query_unrevealed(&self, game_id: &GameId) -> Result<Vec<Event>, LedgerError> {
        self.query_events(game_id, &EventFilter::Unrevealed).await
    }

    /// [`LedgerBackend::query`] without the sequences.
    async fn query_events(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, LedgerError> {
        Ok(self
            .query(game_id, filter)
            .await?
            .into_iter()
            .map(|stored| stored.event)
            .collect())
    }
}
