//! Prisoner snapshot storage.
//!
//! A snapshot is a cache of one prisoner's [`DerivedState`](carcel_types::DerivedState).
//! It is never a source of facts: whenever it disagrees with a replay of
//! the ledger, the replay wins and the snapshot is rebuilt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use carcel_ledger::LedgerError;
use carcel_types::{ActorId, Event, GameId, PrisonerSnapshot};

use crate::reconstructor::fold_snapshots;

/// Keyed store of one snapshot per (game, prisoner).
///
/// Upserts to different prisoners must not block each other.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Insert or replace the snapshot of one prisoner. Last writer wins.
    async fn upsert(&self, snapshot: &PrisonerSnapshot) -> Result<(), LedgerError>;

    /// The snapshot of one prisoner, if cached.
    async fn get_by_actor(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<Option<PrisonerSnapshot>, LedgerError>;

    /// Every cached snapshot of a game, ordered by prisoner id.
    async fn get_by_game(&self, game_id: &GameId) -> Result<Vec<PrisonerSnapshot>, LedgerError>;

    /// Replace all snapshots of a game with `snapshots`.
    async fn replace_game(
        &self,
        game_id: &GameId,
        snapshots: &[PrisonerSnapshot],
    ) -> Result<(), LedgerError>;

    /// Recompute every snapshot of a game from its complete, ordered event
    /// sequence and replace what was cached.
    async fn rebuild_from_events(
        &self,
        game_id: &GameId,
        events: &[Event],
        now: DateTime<Utc>,
    ) -> Result<Vec<PrisonerSnapshot>, LedgerError> {
        let snapshots = fold_snapshots(game_id, events, now);
        self.replace_game(game_id, &snapshots).await?;
        tracing::info!(
            game_id = %game_id,
            store = self.name(),
            prisoners = snapshots.len(),
            events = events.len(),
            "Snapshots rebuilt from events"
        );
        Ok(snapshots)
    }
}

/// In-memory [`SnapshotStore`], sharded by (game, prisoner).
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: DashMap<(GameId, ActorId), PrisonerSnapshot>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached snapshots across all games.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, snapshot: &PrisonerSnapshot) -> Result<(), LedgerError> {
        self.rows.insert(
            (snapshot.game_id.clone(), snapshot.state.prisoner_id.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn get_by_actor(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<Option<PrisonerSnapshot>, LedgerError> {
        Ok(self
            .rows
            .get(&(game_id.clone(), prisoner_id.clone()))
            .map(|row| row.value().clone()))
    }

    async fn get_by_game(&self, game_id: &GameId) -> Result<Vec<PrisonerSnapshot>, LedgerError> {
        let mut snapshots: Vec<PrisonerSnapshot> = self
            .rows
            .iter()
            .filter(|row| &row.key().0 == game_id)
            .map(|row| row.value().clone())
            .collect();
        snapshots.sort_by(|a, b| a.state.prisoner_id.cmp(&b.state.prisoner_id));
        Ok(snapshots)
    }

    async fn replace_game(
        &self,
        game_id: &GameId,
        snapshots: &[PrisonerSnapshot],
    ) -> Result<(), LedgerError> {
        self.rows.retain(|(game, prisoner), _| {
            game != game_id || snapshots.iter().any(|s| &s.state.prisoner_id == prisoner)
        });
        for snapshot in snapshots {
            self.upsert(snapshot).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use carcel_types::{DerivedState, EventKind, NewEvent};

    use super::*;
    use crate::reconstructor::rebuild_state;

    #[tokio::test]
    async fn upsert_is_last_writer_wins() {
        let store = MemorySnapshotStore::new();
        let game = GameId::from("g");
        let mut snapshot = PrisonerSnapshot {
            game_id: game.clone(),
            state: DerivedState::initial("P1"),
            last_updated: Utc::now(),
        };
        store.upsert(&snapshot).await.unwrap();
        snapshot.state.sanity = 12;
        store.upsert(&snapshot).await.unwrap();
        let cached = store.get_by_actor(&game, &ActorId::from("P1")).await.unwrap().unwrap();
        assert_eq!(cached.state.sanity, 12);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rebuild_equals_per_prisoner_replay() {
        let store = MemorySnapshotStore::new();
        let game = GameId::from("g");
        let events: Vec<Event> = [
            NewEvent::new("g", EventKind::SanityChange, "P1").with("delta", -10),
            NewEvent::new("g", EventKind::Betrayal, "P2").target("P1").with("loyalty_delta", -40),
            NewEvent::new("g", EventKind::ResourceIntake, "P2").with("thirst_delta", -5),
        ]
        .into_iter()
        .map(|params| Event::new(params).unwrap())
        .collect();

        // A stale row for a prisoner who no longer appears must go.
        store
            .upsert(&PrisonerSnapshot {
                game_id: game.clone(),
                state: DerivedState::initial("GHOST"),
                last_updated: Utc::now(),
            })
            .await
            .unwrap();

        store.rebuild_from_events(&game, &events, Utc::now()).await.unwrap();
        let cached = store.get_by_game(&game).await.unwrap();
        assert_eq!(cached.len(), 2);
        for snapshot in cached {
            let own: Vec<Event> = events
                .iter()
                .filter(|e| e.involves(snapshot.prisoner_id()))
                .cloned()
                .collect();
            let replayed = rebuild_state(&DerivedState::initial(snapshot.prisoner_id().clone()), &own);
            assert_eq!(snapshot.state, replayed);
        }
    }

    #[tokio::test]
    async fn games_do_not_share_snapshots() {
        let store = MemorySnapshotStore::new();
        for game in ["a", "b"] {
            store
                .upsert(&PrisonerSnapshot {
                    game_id: GameId::from(game),
                    state: DerivedState::initial("P1"),
                    last_updated: Utc::now(),
                })
                .await
                .unwrap();
        }
        store.replace_game(&GameId::from("a"), &[]).await.unwrap();
        assert!(store.get_by_game(&GameId::from("a")).await.unwrap().is_empty());
        assert_eq!(store.get_by_game(&GameId::from("b")).await.unwrap().len(), 1);
    }
}
