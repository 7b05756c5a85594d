//! Write-through projection of committed events into snapshots.
//!
//! The projector sits next to the [`EventLog`]: it appends through the
//! log and, once the write is durable, folds the event into the snapshot
//! of every prisoner it affects.
//!
//! # Exactness
//!
//! For each prisoner the projector remembers the order key of the newest
//! event already folded into the snapshot. An event newer than that is
//! applied incrementally. An event at or before it arrived out of order
//! (concurrent writers), so the prisoner is refolded from the ledger
//! instead. Either way the snapshot equals a replay once writes settle.
//!
//! A full [`SnapshotProjector::rebuild`] takes the game exclusively: it
//! waits for in-flight appends of that game and holds new ones back until
//! the snapshots are replaced.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use carcel_ledger::{Deadline, EventFilter, EventLog, LedgerError, StoredEvent};
use carcel_types::{ActorId, Clock, DerivedState, Event, GameId, PrisonerSnapshot};

use crate::reconstructor::{affected_prisoners, apply_event, fold_game, rebuild_state};
use crate::snapshot::SnapshotStore;

/// Order key of the newest event folded into a prisoner's snapshot.
type Cursor = Option<(DateTime<Utc>, u64)>;

/// One prisoner whose cached state disagrees with a fresh replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDrift {
    /// The prisoner.
    pub prisoner_id: ActorId,
    /// What a replay of the ledger yields.
    pub expected: DerivedState,
    /// What the store holds, if anything.
    pub cached: Option<DerivedState>,
}

/// Keeps a [`SnapshotStore`] in step with an [`EventLog`].
pub struct SnapshotProjector {
    log: EventLog,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    games: DashMap<GameId, Arc<RwLock<()>>>,
    cursors: DashMap<(GameId, ActorId), Arc<Mutex<Cursor>>>,
}

impl core::fmt::Debug for SnapshotProjector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnapshotProjector")
            .field("log", &self.log)
            .field("store", &self.store.name())
            .field("tracked_prisoners", &self.cursors.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotProjector {
    /// Create a projector writing into `store`, stamping rows with `clock`.
    pub fn new(log: EventLog, store: Arc<dyn SnapshotStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            log,
            store,
            clock,
            games: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    /// The log this projector appends through.
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// The store this projector writes.
    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    fn game_gate(&self, game_id: &GameId) -> Arc<RwLock<()>> {
        Arc::clone(self.games.entry(game_id.clone()).or_default().value())
    }

    fn cursor(&self, game_id: &GameId, prisoner_id: &ActorId) -> Arc<Mutex<Cursor>> {
        Arc::clone(
            self.cursors
                .entry((game_id.clone(), prisoner_id.clone()))
                .or_default()
                .value(),
        )
    }

    /// Append through the log, then project.
    ///
    /// The returned result is the append's. A projection failure after a
    /// durable append is logged and left for [`SnapshotProjector::detect_drift`].
    pub async fn append(&self, event: &Event, deadline: Deadline) -> Result<u64, LedgerError> {
        let gate = self.game_gate(&event.game_id);
        let _shared = gate.read().await;
        let sequence = self.log.append(event, deadline).await?;
        let stored = StoredEvent {
            sequence,
            event: event.clone(),
        };
        if let Err(err) = self.project(&stored, deadline).await {
            tracing::warn!(
                game_id = %event.game_id,
                event_id = %event.id,
                error = %err,
                "Snapshot projection failed after durable append"
            );
        }
        Ok(sequence)
    }

    /// Append a batch through the log, then project each event in order.
    pub async fn append_batch(
        &self,
        events: &[Event],
        deadline: Deadline,
    ) -> Result<Vec<u64>, LedgerError> {
        let mut game_ids: Vec<&GameId> = events.iter().map(|e| &e.game_id).collect();
        game_ids.sort();
        game_ids.dedup();
        let gates: Vec<Arc<RwLock<()>>> = game_ids.iter().map(|g| self.game_gate(g)).collect();
        let mut guards = Vec::with_capacity(gates.len());
        for gate in &gates {
            guards.push(gate.read().await);
        }

        let sequences = self.log.append_batch(events, deadline).await?;
        for (&sequence, event) in sequences.iter().zip(events) {
            let stored = StoredEvent {
                sequence,
                event: event.clone(),
            };
            if let Err(err) = self.project(&stored, deadline).await {
                tracing::warn!(
                    game_id = %event.game_id,
                    event_id = %event.id,
                    error = %err,
                    "Snapshot projection failed after durable batch"
                );
            }
        }
        drop(guards);
        Ok(sequences)
    }

    /// Fold one durable event into the snapshots it affects.
    pub async fn project(&self, stored: &StoredEvent, deadline: Deadline) -> Result<(), LedgerError> {
        let event = &stored.event;
        let key = stored.order_key();
        for prisoner_id in affected_prisoners(event) {
            let cell = self.cursor(&event.game_id, &prisoner_id);
            let mut cursor = cell.lock().await;

            let (state, folded_up_to) = if cursor.is_some_and(|newest| key <= newest) {
                tracing::debug!(
                    game_id = %event.game_id,
                    prisoner_id = %prisoner_id,
                    "Out-of-order event; refolding prisoner"
                );
                let history = self
                    .log
                    .query_stored(
                        &event.game_id,
                        &EventFilter::Involving(prisoner_id.clone()),
                        deadline,
                    )
                    .await?;
                let newest = history.iter().map(StoredEvent::order_key).max();
                let events: Vec<Event> = history.into_iter().map(|s| s.event).collect();
                let state = rebuild_state(&DerivedState::initial(prisoner_id.clone()), &events);
                (state, newest.max(*cursor))
            } else {
                let mut state = self
                    .store
                    .get_by_actor(&event.game_id, &prisoner_id)
                    .await?
                    .map_or_else(|| DerivedState::initial(prisoner_id.clone()), |s| s.state);
                apply_event(&mut state, event);
                (state, Some(key))
            };

            self.store
                .upsert(&PrisonerSnapshot {
                    game_id: event.game_id.clone(),
                    state,
                    last_updated: self.clock.now(),
                })
                .await?;
            *cursor = folded_up_to;
        }
        Ok(())
    }

    /// Current state of a prisoner: the snapshot if cached, otherwise the
    /// state of a prisoner no event has touched.
    pub async fn current_state(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<DerivedState, LedgerError> {
        Ok(self
            .store
            .get_by_actor(game_id, prisoner_id)
            .await?
            .map_or_else(|| DerivedState::initial(prisoner_id.clone()), |s| s.state))
    }

    /// Replace every snapshot of a game with a fresh replay.
    pub async fn rebuild(
        &self,
        game_id: &GameId,
        deadline: Deadline,
    ) -> Result<Vec<PrisonerSnapshot>, LedgerError> {
        let gate = self.game_gate(game_id);
        let _exclusive = gate.write().await;

        let stored = self
            .log
            .query_stored(game_id, &EventFilter::All, deadline)
            .await?;
        let mut newest: std::collections::HashMap<ActorId, (DateTime<Utc>, u64)> =
            std::collections::HashMap::new();
        for item in &stored {
            for prisoner_id in affected_prisoners(&item.event) {
                let slot = newest.entry(prisoner_id).or_insert_with(|| item.order_key());
                *slot = (*slot).max(item.order_key());
            }
        }
        let events: Vec<Event> = stored.into_iter().map(|s| s.event).collect();
        let snapshots = self
            .store
            .rebuild_from_events(game_id, &events, self.clock.now())
            .await?;

        self.cursors.retain(|(game, _), _| game != game_id);
        for (prisoner_id, key) in newest {
            *self.cursor(game_id, &prisoner_id).lock().await = Some(key);
        }
        Ok(snapshots)
    }

    /// Drop the locks and cursors kept for a game, once it has finished.
    ///
    /// Waits for in-flight appends of the game. Snapshots stay in the
    /// store; a later append projects onto them as it would after a
    /// restart.
    pub async fn forget(&self, game_id: &GameId) {
        let gate = self.game_gate(game_id);
        let _exclusive = gate.write().await;
        self.cursors.retain(|(game, _), _| game != game_id);
        self.games.remove(game_id);
        tracing::debug!(game_id = %game_id, "Projector released game");
    }

    /// Compare every cached snapshot of a game with a fresh replay.
    ///
    /// Runs with the game held exclusively so in-flight appends cannot
    /// show up as false drift.
    pub async fn detect_drift(
        &self,
        game_id: &GameId,
        deadline: Deadline,
    ) -> Result<Vec<SnapshotDrift>, LedgerError> {
        let gate = self.game_gate(game_id);
        let _exclusive = gate.write().await;

        let events = self.log.replay(game_id, deadline).await?;
        let expected = fold_game(game_id, &events);
        let cached = self.store.get_by_game(game_id).await?;

        let mut drift = Vec::new();
        for state in &expected {
            let found = cached
                .iter()
                .find(|s| s.state.prisoner_id == state.prisoner_id)
                .map(|s| s.state.clone());
            if found.as_ref() != Some(state) {
                drift.push(SnapshotDrift {
                    prisoner_id: state.prisoner_id.clone(),
                    expected: state.clone(),
                    cached: found,
                });
            }
        }
        for snapshot in &cached {
            let known = expected
                .iter()
                .any(|s| s.prisoner_id == snapshot.state.prisoner_id);
            let untouched = DerivedState::initial(snapshot.state.prisoner_id.clone());
            if !known && snapshot.state != untouched {
                drift.push(SnapshotDrift {
                    prisoner_id: snapshot.state.prisoner_id.clone(),
                    expected: untouched,
                    cached: Some(snapshot.state.clone()),
                });
            }
        }

        if drift.is_empty() {
            tracing::debug!(game_id = %game_id, prisoners = expected.len(), "Snapshots match replay");
        } else {
            tracing::warn!(game_id = %game_id, drifted = drift.len(), "Snapshot drift detected");
        }
        Ok(drift)
    }
}
