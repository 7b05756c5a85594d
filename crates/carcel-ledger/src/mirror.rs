//! Bounded in-memory copy of recent events, per game.
//!
//! The mirror is an owned value handed to an [`EventLog`](crate::EventLog),
//! never process-global state. It is only ever written after the backend
//! has acknowledged a write, so it can lag the backend but never lead it.
//!
//! A game's mirror is *complete* when it holds every event the backend
//! holds for that game. Only complete mirrors serve reads; incomplete ones
//! still answer [`EventMirror::recent`].
//!
//! Reveal flags only ever go from unrevealed to revealed. A reveal that
//! lands while its event is still on the way into the mirror (a hydrate in
//! flight, or an append not yet recorded) is remembered and applied when
//! the event arrives.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use carcel_types::{EventId, GameId};

use crate::backend::{EventFilter, StoredEvent};

#[derive(Debug, Default)]
struct MirrorLog {
    /// Events in replay order.
    events: Vec<StoredEvent>,
    /// Whether `events` is the game's entire history.
    complete: bool,
}

impl MirrorLog {
    fn insert(&mut self, stored: StoredEvent) {
        if let Some(existing) = self.events.iter_mut().find(|e| e.event.id == stored.event.id) {
            if stored.event.is_revealed {
                existing.event.is_revealed = true;
            }
            return;
        }
        let key = stored.order_key();
        let pos = self.events.partition_point(|e| e.order_key() <= key);
        self.events.insert(pos, stored);
    }

    fn enforce_capacity(&mut self, capacity: usize) -> usize {
        let excess = self.events.len().saturating_sub(capacity);
        if excess > 0 {
            self.events.drain(..excess);
            self.complete = false;
        }
        excess
    }
}

#[derive(Debug, Default)]
struct MirrorState {
    logs: HashMap<GameId, MirrorLog>,
    /// Bumped on every invalidation.
    epoch: u64,
    /// Reveals that found no mirrored copy, oldest first.
    pending_reveals: VecDeque<EventId>,
}

impl MirrorState {
    /// Apply a reveal that arrived before the event did.
    fn settle(&mut self, stored: &mut StoredEvent) {
        if let Some(pos) = self.pending_reveals.iter().position(|id| *id == stored.event.id) {
            self.pending_reveals.remove(pos);
            stored.event.is_revealed = true;
        }
    }
}

/// Per-game mirror of the ledger, bounded to `capacity` events per game.
#[derive(Debug)]
pub struct EventMirror {
    capacity: usize,
    state: RwLock<MirrorState>,
}

impl EventMirror {
    /// Create an empty mirror holding at most `capacity` events per game.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: RwLock::new(MirrorState::default()),
        }
    }

    /// Maximum events kept per game.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current invalidation epoch. Take it before fetching a history for
    /// [`EventMirror::load`].
    pub async fn epoch(&self) -> u64 {
        self.state.read().await.epoch
    }

    /// Replace a game's mirror with its full backend history.
    ///
    /// Events recorded while the history was being fetched are merged in.
    /// If any invalidation happened since `epoch` was read, the history may
    /// be missing an event whose append outcome was unknown, so nothing is
    /// loaded. Returns whether the game fits and is now complete.
    pub async fn load(&self, game_id: &GameId, mut history: Vec<StoredEvent>, epoch: u64) -> bool {
        let mut state = self.state.write().await;
        if state.epoch != epoch {
            tracing::debug!(game_id = %game_id, "Mirror invalidated during hydrate; load skipped");
            return false;
        }
        for stored in &mut history {
            state.settle(stored);
        }
        let log = state.logs.entry(game_id.clone()).or_default();
        let recorded_meanwhile = std::mem::take(&mut log.events);
        log.events = history;
        log.complete = true;
        for stored in recorded_meanwhile {
            log.insert(stored);
        }
        let evicted = log.enforce_capacity(self.capacity);
        if evicted > 0 {
            tracing::warn!(
                game_id = %game_id,
                evicted,
                capacity = self.capacity,
                "Game history exceeds mirror capacity; mirror kept partial"
            );
        }
        log.complete
    }

    /// Add durable events for one game.
    pub async fn record(&self, game_id: &GameId, stored: impl IntoIterator<Item = StoredEvent>) {
        let mut state = self.state.write().await;
        let mut settled: Vec<StoredEvent> = stored.into_iter().collect();
        for item in &mut settled {
            state.settle(item);
        }
        let log = state.logs.entry(game_id.clone()).or_default();
        for item in settled {
            log.insert(item);
        }
        log.enforce_capacity(self.capacity);
    }

    /// Drop everything mirrored for a game.
    pub async fn invalidate(&self, game_id: &GameId) {
        let mut state = self.state.write().await;
        state.epoch = state.epoch.wrapping_add(1);
        if state.logs.remove(game_id).is_some() {
            tracing::warn!(game_id = %game_id, "Mirror invalidated");
        }
    }

    /// Whether reads for this game can be served from the mirror.
    pub async fn is_complete(&self, game_id: &GameId) -> bool {
        self.state
            .read()
            .await
            .logs
            .get(game_id)
            .is_some_and(|log| log.complete)
    }

    /// Filtered events of a complete game, or `None` if the mirror is not
    /// complete for it.
    pub async fn query(&self, game_id: &GameId, filter: &EventFilter) -> Option<Vec<StoredEvent>> {
        let state = self.state.read().await;
        let log = state.logs.get(game_id).filter(|log| log.complete)?;
        Some(
            log.events
                .iter()
                .filter(|stored| filter.matches(&stored.event))
                .cloned()
                .collect(),
        )
    }

    /// The last `count` mirrored events of a game, oldest first.
    pub async fn recent(&self, game_id: &GameId, count: usize) -> Vec<StoredEvent> {
        let state = self.state.read().await;
        state.logs.get(game_id).map_or_else(Vec::new, |log| {
            let skip = log.events.len().saturating_sub(count);
            log.events.iter().skip(skip).cloned().collect()
        })
    }

    /// Everything mirrored for a game and whether it is complete.
    pub async fn snapshot(&self, game_id: &GameId) -> Option<(Vec<StoredEvent>, bool)> {
        let state = self.state.read().await;
        state
            .logs
            .get(game_id)
            .map(|log| (log.events.clone(), log.complete))
    }

    /// Whether a mirrored event of `game_id` is flagged revealed, or
    /// `None` if the event is not mirrored.
    pub async fn is_revealed(&self, game_id: &GameId, id: EventId) -> Option<bool> {
        let state = self.state.read().await;
        state
            .logs
            .get(game_id)?
            .events
            .iter()
            .find(|e| e.event.id == id)
            .map(|e| e.event.is_revealed)
    }

    /// Set the reveal flag on a mirrored event, wherever it is.
    ///
    /// Call only after the backend has acknowledged the reveal. If no
    /// mirrored copy exists yet, the reveal is kept (up to `capacity` of
    /// them) and applied when the event is recorded or loaded.
    pub async fn mark_revealed(&self, id: EventId) {
        let mut state = self.state.write().await;
        for log in state.logs.values_mut() {
            if let Some(stored) = log.events.iter_mut().find(|e| e.event.id == id) {
                stored.event.is_revealed = true;
                return;
            }
        }
        state.pending_reveals.push_back(id);
        while state.pending_reveals.len() > self.capacity {
            state.pending_reveals.pop_front();
        }
    }
}
