//! The transient in-memory backend.
//!
//! Holds every event in insertion order behind one reader/writer lock.
//! Used for tests, local play and as the reference the SQL backends are
//! compared against.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use carcel_types::{Event, EventId, GameId};

use crate::backend::{EventFilter, LedgerBackend, RevealOutcome, StoredEvent, sort_for_replay};
use crate::LedgerError;

#[derive(Debug, Default)]
struct MemoryInner {
    /// All entries, in insertion order.
    entries: Vec<StoredEvent>,
    /// Event id to position in `entries`.
    index: HashMap<EventId, usize>,
    /// Sequence of the last insert (0 = none yet).
    last_sequence: u64,
}

impl MemoryInner {
    fn next_sequence(&self, offset: u64) -> Result<u64, LedgerError> {
        self.last_sequence
            .checked_add(offset)
            .ok_or_else(|| LedgerError::InvariantViolation {
                reason: "insertion sequence exhausted".to_owned(),
            })
    }

    fn push(&mut self, sequence: u64, event: Event) {
        self.index.insert(event.id, self.entries.len());
        self.entries.push(StoredEvent { sequence, event });
        self.last_sequence = sequence;
    }
}

/// In-memory [`LedgerBackend`]. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: RwLock<MemoryInner>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events across all games.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Whether nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, event: &Event) -> Result<u64, LedgerError> {
        event.validate()?;
        let mut inner = self.inner.write().await;
        if inner.index.contains_key(&event.id) {
            return Err(LedgerError::Conflict { id: event.id });
        }
        let sequence = inner.next_sequence(1)?;
        inner.push(sequence, event.clone());
        tracing::debug!(
            game_id = %event.game_id,
            event_id = %event.id,
            sequence,
            "Appended event to memory ledger"
        );
        Ok(sequence)
    }

    async fn append_batch(&self, events: &[Event]) -> Result<Vec<u64>, LedgerError> {
        for event in events {
            event.validate()?;
        }
        let mut inner = self.inner.write().await;

        // Check the whole batch before touching anything.
        let mut seen = HashSet::with_capacity(events.len());
        for event in events {
            if inner.index.contains_key(&event.id) || !seen.insert(event.id) {
                return Err(LedgerError::Conflict { id: event.id });
            }
        }
        let count = u64::try_from(events.len()).unwrap_or(u64::MAX);
        inner.next_sequence(count)?;

        let mut sequences = Vec::with_capacity(events.len());
        for event in events {
            let sequence = inner.next_sequence(1)?;
            inner.push(sequence, event.clone());
            sequences.push(sequence);
        }
        tracing::debug!(count = sequences.len(), "Appended batch to memory ledger");
        Ok(sequences)
    }

    async fn query(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, LedgerError> {
        let mut events: Vec<StoredEvent> = {
            let inner = self.inner.read().await;
            inner
                .entries
                .iter()
                .filter(|stored| &stored.event.game_id == game_id && filter.matches(&stored.event))
                .cloned()
                .collect()
        };
        sort_for_replay(&mut events);
        Ok(events)
    }

    async fn get(&self, id: EventId) -> Result<Option<StoredEvent>, LedgerError> {
        let inner = self.inner.read().await;
        Ok(inner
            .index
            .get(&id)
            .and_then(|&pos| inner.entries.get(pos))
            .cloned())
    }

    async fn mark_revealed(&self, id: EventId) -> Result<RevealOutcome, LedgerError> {
        let mut inner = self.inner.write().await;
        let pos = *inner
            .index
            .get(&id)
            .ok_or_else(|| LedgerError::event_not_found(id))?;
        let stored = inner
            .entries
            .get_mut(pos)
            .ok_or_else(|| LedgerError::InvariantViolation {
                reason: format!("index points past the end of the ledger for {id}"),
            })?;
        if stored.event.is_revealed {
            return Ok(RevealOutcome::AlreadyRevealed);
        }
        stored.event.is_revealed = true;
        Ok(RevealOutcome::Revealed)
    }
}
