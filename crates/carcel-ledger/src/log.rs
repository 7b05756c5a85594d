//! The event log facade: the single in-process door to the ledger.
//!
//! # Write path
//!
//! 1. Validate the event. Malformed events never reach the backend.
//! 2. Write through to the backend under the caller's deadline.
//! 3. Only once the backend has acknowledged, record the event in the
//!    mirror (if one is attached).
//!
//! A failed append is never visible through any read path. If the outcome
//! of a write is unknown (deadline passed, backend unavailable) the mirror
//! for that game is dropped so that reads fall back to the backend. The
//! facade never retries: callers retry with the same event and treat a
//! [`LedgerError::Conflict`] on the retry as success.
//!
//! # Read path
//!
//! Reads are served from the mirror only when it is complete for the
//! game; otherwise they go to the backend. Both produce the same order.

use std::sync::Arc;
use std::time::Duration;

use carcel_types::{ActorId, Event, EventId, EventKind, GameId};

use crate::backend::{EventFilter, LedgerBackend, RevealOutcome, StoredEvent};
use crate::deadline::Deadline;
use crate::mirror::EventMirror;
use crate::LedgerError;

/// Result of comparing a game's mirror with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorCheck {
    /// No mirror, or nothing mirrored for this game.
    NotMirrored,
    /// Every mirrored event matches the backend, in the same order.
    Consistent {
        /// Number of mirrored events compared.
        checked: usize,
        /// Whether the mirror holds the whole game.
        complete: bool,
    },
}

/// Concurrency-safe gateway to a [`LedgerBackend`].
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
#[derive(Clone)]
pub struct EventLog {
    backend: Arc<dyn LedgerBackend>,
    mirror: Option<Arc<EventMirror>>,
    default_timeout: Option<Duration>,
}

impl core::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLog")
            .field("backend", &self.backend.name())
            .field("mirror", &self.mirror)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl EventLog {
    /// A log over `backend` with no mirror and no default deadline.
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self {
            backend,
            mirror: None,
            default_timeout: None,
        }
    }

    /// Attach a mirror.
    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<EventMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Deadline applied when the caller passes [`Deadline::NONE`].
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// The backend this log writes to.
    pub fn backend(&self) -> &Arc<dyn LedgerBackend> {
        &self.backend
    }

    /// The attached mirror, if any.
    pub const fn mirror(&self) -> Option<&Arc<EventMirror>> {
        self.mirror.as_ref()
    }

    fn deadline(&self, deadline: Deadline) -> Deadline {
        deadline.or_timeout(self.default_timeout)
    }

    async fn after_write_failure(&self, game_ids: &[&GameId], err: &LedgerError) {
        if let Some(mirror) = self.mirror.as_ref().filter(|_| err.is_indeterminate()) {
            for game_id in game_ids {
                mirror.invalidate(game_id).await;
            }
        }
        if let LedgerError::InvariantViolation { reason } = err {
            tracing::error!(backend = self.backend.name(), %reason, "Ledger invariant violated on write");
        }
    }

    /// Validate and durably append one event. Returns its sequence.
    pub async fn append(&self, event: &Event, deadline: Deadline) -> Result<u64, LedgerError> {
        event.validate()?;
        let result = self
            .deadline(deadline)
            .run("append", self.backend.append(event))
            .await;
        match result {
            Ok(sequence) => {
                if let Some(mirror) = &self.mirror {
                    let stored = StoredEvent {
                        sequence,
                        event: event.clone(),
                    };
                    mirror.record(&event.game_id, [stored]).await;
                }
                tracing::debug!(
                    game_id = %event.game_id,
                    event_id = %event.id,
                    kind = %event.kind,
                    sequence,
                    "Event appended"
                );
                Ok(sequence)
            }
            Err(err) => {
                self.after_write_failure(&[&event.game_id], &err).await;
                Err(err)
            }
        }
    }

    /// Validate and durably append several events as one unit.
    ///
    /// Either all are stored or none are. The mirror sees the batch only
    /// after the whole batch is durable.
    pub async fn append_batch(
        &self,
        events: &[Event],
        deadline: Deadline,
    ) -> Result<Vec<u64>, LedgerError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        for event in events {
            event.validate()?;
        }
        let result = self
            .deadline(deadline)
            .run("append_batch", self.backend.append_batch(events))
            .await;
        let mut game_ids: Vec<&GameId> = events.iter().map(|e| &e.game_id).collect();
        game_ids.sort();
        game_ids.dedup();

        match result {
            Ok(sequences) => {
                if sequences.len() != events.len() {
                    let err = LedgerError::InvariantViolation {
                        reason: format!(
                            "backend acknowledged {} of {} batched events",
                            sequences.len(),
                            events.len()
                        ),
                    };
                    tracing::error!(backend = self.backend.name(), %err, "Batch acknowledgement mismatch");
                    if let Some(mirror) = &self.mirror {
                        for game_id in &game_ids {
                            mirror.invalidate(game_id).await;
                        }
                    }
                    return Err(err);
                }
                if let Some(mirror) = &self.mirror {
                    for game_id in &game_ids {
                        let stored = sequences
                            .iter()
                            .zip(events)
                            .filter(|(_, e)| &&e.game_id == game_id)
                            .map(|(&sequence, event)| StoredEvent {
                                sequence,
                                event: event.clone(),
                            });
                        mirror.record(game_id, stored).await;
                    }
                }
                tracing::debug!(count = events.len(), "Event batch appended");
                Ok(sequences)
            }
            Err(err) => {
                self.after_write_failure(&game_ids, &err).await;
                Err(err)
            }
        }
    }

    /// Events of a game passing `filter`, in replay order, with sequences.
    pub async fn query_stored(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
        deadline: Deadline,
    ) -> Result<Vec<StoredEvent>, LedgerError> {
        let mirrored = match &self.mirror {
            Some(mirror) => mirror.query(game_id, filter).await,
            None => None,
        };
        if let Some(events) = mirrored {
            tracing::debug!(
                game_id = %game_id,
                filter = filter.label(),
                count = events.len(),
                "Query served from mirror"
            );
            return Ok(events);
        }
        let events = self
            .deadline(deadline)
            .run("query", self.backend.query(game_id, filter))
            .await?;
        tracing::debug!(
            game_id = %game_id,
            filter = filter.label(),
            count = events.len(),
            "Query served from backend"
        );
        Ok(events)
    }

    /// Events of a game passing `filter`, in replay order.
    pub async fn query(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
        deadline: Deadline,
    ) -> Result<Vec<Event>, LedgerError> {
        Ok(self
            .query_stored(game_id, filter, deadline)
            .await?
            .into_iter()
            .map(|stored| stored.event)
            .collect())
    }

    /// The whole game, in replay order.
    pub async fn replay(&self, game_id: &GameId, deadline: Deadline) -> Result<Vec<Event>, LedgerError> {
        self.query(game_id, &EventFilter::All, deadline).await
    }

    /// Events caused by `actor_id`.
    pub async fn get_by_actor(
        &self,
        game_id: &GameId,
        actor_id: &ActorId,
        deadline: Deadline,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query(game_id, &EventFilter::Actor(actor_id.clone()), deadline)
            .await
    }

    /// Events where `actor_id` is the actor or the target.
    pub async fn get_involving(
        &self,
        game_id: &GameId,
        actor_id: &ActorId,
        deadline: Deadline,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query(game_id, &EventFilter::Involving(actor_id.clone()), deadline)
            .await
    }

    /// Events of one in-fiction day.
    pub async fn get_by_day(
        &self,
        game_id: &GameId,
        day: u32,
        deadline: Deadline,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query(game_id, &EventFilter::Day(day), deadline).await
    }

    /// Events of one kind.
    pub async fn get_by_kind(
        &self,
        game_id: &GameId,
        kind: &EventKind,
        deadline: Deadline,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query(game_id, &EventFilter::Kind(kind.clone()), deadline)
            .await
    }

    /// Events the audience has not seen yet.
    pub async fn get_unrevealed(
        &self,
        game_id: &GameId,
        deadline: Deadline,
    ) -> Result<Vec<Event>, LedgerError> {
        self.query(game_id, &EventFilter::Unrevealed, deadline).await
    }

    /// One event by identifier.
    pub async fn get(&self, id: EventId, deadline: Deadline) -> Result<Event, LedgerError> {
        self.deadline(deadline)
            .run("get", self.backend.get(id))
            .await?
            .map(|stored| stored.event)
            .ok_or_else(|| LedgerError::event_not_found(id))
    }

    /// Reveal an event to the audience. Revealing twice is a no-op.
    pub async fn mark_revealed(
        &self,
        id: EventId,
        deadline: Deadline,
    ) -> Result<RevealOutcome, LedgerError> {
        let outcome = self
            .deadline(deadline)
            .run("mark_revealed", self.backend.mark_revealed(id))
            .await?;
        if let Some(mirror) = &self.mirror {
            mirror.mark_revealed(id).await;
        }
        tracing::debug!(event_id = %id, ?outcome, "Reveal applied");
        Ok(outcome)
    }

    /// Load a game's full history into the mirror.
    ///
    /// Returns the number of events loaded and whether the mirror is now
    /// complete for the game. Without a mirror this is a no-op.
    pub async fn hydrate(
        &self,
        game_id: &GameId,
        deadline: Deadline,
    ) -> Result<(usize, bool), LedgerError> {
        let Some(mirror) = &self.mirror else {
            return Ok((0, false));
        };
        let epoch = mirror.epoch().await;
        let history = self
            .deadline(deadline)
            .run("hydrate", self.backend.query(game_id, &EventFilter::All))
            .await?;
        let count = history.len();
        let complete = mirror.load(game_id, history, epoch).await;
        tracing::info!(game_id = %game_id, count, complete, "Mirror hydrated");
        Ok((count, complete))
    }

    /// Compare a game's mirror with the backend.
    ///
    /// Every mirrored event must exist in the backend with identical
    /// frozen fields, the same reveal flag and the same relative order. A
    /// complete mirror must also hold exactly as many events. On divergence
    /// the mirror for the game is dropped and
    /// [`LedgerError::InvariantViolation`] is returned.
    pub async fn verify_mirror(
        &self,
        game_id: &GameId,
        deadline: Deadline,
    ) -> Result<MirrorCheck, LedgerError> {
        let Some(mirror) = &self.mirror else {
            return Ok(MirrorCheck::NotMirrored);
        };
        let Some((mirrored, complete)) = mirror.snapshot(game_id).await else {
            return Ok(MirrorCheck::NotMirrored);
        };
        let durable = self
            .deadline(deadline)
            .run("verify_mirror", self.backend.query(game_id, &EventFilter::All))
            .await?;

        let outcome = match compare_mirror(&mirrored, complete, &durable) {
            Ok(reveal_lag) => {
                // A reveal may have committed between the two reads above.
                let mut checked = Ok(());
                for (id, revealed) in reveal_lag {
                    if mirror.is_revealed(game_id, id).await != Some(revealed) {
                        checked = Err(format!(
                            "event {id} reveal flag differs between mirror and backend"
                        ));
                        break;
                    }
                }
                checked
            }
            Err(reason) => Err(reason),
        };
        if let Err(reason) = outcome {
            mirror.invalidate(game_id).await;
            tracing::error!(
                game_id = %game_id,
                backend = self.backend.name(),
                %reason,
                "Mirror diverged from backend"
            );
            return Err(LedgerError::InvariantViolation { reason });
        }
        Ok(MirrorCheck::Consistent {
            checked: mirrored.len(),
            complete,
        })
    }
}

/// Whether two copies of the same event agree on every frozen field.
fn same_fact(a: &StoredEvent, b: &StoredEvent) -> bool {
    a.sequence == b.sequence
        && a.event.id == b.event.id
        && a.event.game_id == b.event.game_id
        && a.event.timestamp == b.event.timestamp
        && a.event.kind == b.event.kind
        && a.event.actor_id == b.event.actor_id
        && a.event.target_id == b.event.target_id
        && a.event.payload == b.event.payload
        && a.event.game_day == b.event.game_day
}

/// Check order and frozen fields. Returns the backend's reveal flag for
/// every mirrored event whose flag disagrees.
fn compare_mirror(
    mirrored: &[StoredEvent],
    complete: bool,
    durable: &[StoredEvent],
) -> Result<Vec<(EventId, bool)>, String> {
    if complete && mirrored.len() != durable.len() {
        return Err(format!(
            "complete mirror holds {} events, backend holds {}",
            mirrored.len(),
            durable.len()
        ));
    }
    let mut reveal_lag = Vec::new();
    let mut durable_iter = durable.iter();
    for stored in mirrored {
        let found = durable_iter.by_ref().find(|d| d.event.id == stored.event.id);
        match found {
            Some(d) if same_fact(d, stored) => {
                if d.event.is_revealed != stored.event.is_revealed {
                    reveal_lag.push((d.event.id, d.event.is_revealed));
                }
            }
            Some(_) => {
                return Err(format!("event {} differs between mirror and backend", stored.event.id));
            }
            None => {
                return Err(format!(
                    "event {} is missing from the backend or out of order",
                    stored.event.id
                ));
            }
        }
    }
    Ok(reveal_lag)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use carcel_types::{EventError, NewEvent};

    use super::*;
    use crate::memory::MemoryLedger;

    fn event(game: &str, actor: &str) -> Event {
        Event::new(NewEvent::new(game, EventKind::Vote, actor)).unwrap()
    }

    fn mirrored_log(backend: Arc<dyn LedgerBackend>) -> EventLog {
        EventLog::new(backend).with_mirror(Arc::new(EventMirror::new(100)))
    }

    /// A backend whose writes always fail.
    struct DownBackend;

    #[async_trait]
    impl LedgerBackend for DownBackend {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn append(&self, _event: &Event) -> Result<u64, LedgerError> {
            Err(LedgerError::Unavailable {
                reason: "connection refused".to_owned(),
            })
        }

        async fn append_batch(&self, _events: &[Event]) -> Result<Vec<u64>, LedgerError> {
            Err(LedgerError::Unavailable {
                reason: "connection refused".to_owned(),
            })
        }

        async fn query(
            &self,
            _game_id: &GameId,
            _filter: &EventFilter,
        ) -> Result<Vec<StoredEvent>, LedgerError> {
            Ok(Vec::new())
        }

        async fn get(&self, _id: EventId) -> Result<Option<StoredEvent>, LedgerError> {
            Ok(None)
        }

        async fn mark_revealed(&self, id: EventId) -> Result<RevealOutcome, LedgerError> {
            Err(LedgerError::event_not_found(id))
        }
    }

    #[tokio::test]
    async fn invalid_events_never_reach_the_backend() {
        let backend = Arc::new(MemoryLedger::new());
        let log = EventLog::new(backend.clone());
        let mut bad = event("g", "P1");
        bad.actor_id = ActorId::from("");
        let err = log.append(&bad, Deadline::NONE).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Validation(EventError::MissingField("actor_id"))
        ));
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn failed_append_is_not_visible_and_drops_mirror() {
        let log = mirrored_log(Arc::new(DownBackend));
        let game = GameId::from("g");
        log.hydrate(&game, Deadline::NONE).await.unwrap();
        assert!(log.mirror().unwrap().is_complete(&game).await);

        let err = log.append(&event("g", "P1"), Deadline::NONE).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!log.mirror().unwrap().is_complete(&game).await);
        assert!(log.replay(&game, Deadline::NONE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hydrated_mirror_serves_reads_in_backend_order() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryLedger::new());
        let log = mirrored_log(backend.clone());
        let game = GameId::from("g");
        let early = event("g", "P1");
        backend.append(&early).await.unwrap();
        log.hydrate(&game, Deadline::NONE).await.unwrap();

        let late = event("g", "P2");
        log.append(&late, Deadline::NONE).await.unwrap();
        let from_log = log.replay(&game, Deadline::NONE).await.unwrap();
        let from_backend = backend.query_by_game(&game).await.unwrap();
        assert_eq!(from_log, from_backend);
        assert_eq!(
            log.verify_mirror(&game, Deadline::NONE).await.unwrap(),
            MirrorCheck::Consistent {
                checked: 2,
                complete: true
            }
        );
    }

    #[tokio::test]
    async fn divergent_mirror_is_an_invariant_violation() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryLedger::new());
        let log = mirrored_log(backend.clone());
        let game = GameId::from("g");
        log.hydrate(&game, Deadline::NONE).await.unwrap();
        // Written behind the log's back: the complete mirror is now stale.
        backend.append(&event("g", "P1")).await.unwrap();

        let err = log.verify_mirror(&game, Deadline::NONE).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { .. }));
        assert_eq!(
            log.verify_mirror(&game, Deadline::NONE).await.unwrap(),
            MirrorCheck::NotMirrored
        );
    }

    #[tokio::test]
    async fn reveal_updates_mirror_and_backend() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryLedger::new());
        let log = mirrored_log(backend.clone());
        let game = GameId::from("g");
        log.hydrate(&game, Deadline::NONE).await.unwrap();
        let fact = event("g", "P1");
        log.append(&fact, Deadline::NONE).await.unwrap();

        assert_eq!(
            log.mark_revealed(fact.id, Deadline::NONE).await.unwrap(),
            RevealOutcome::Revealed
        );
        assert!(log.get_unrevealed(&game, Deadline::NONE).await.unwrap().is_empty());
        assert!(backend.query_unrevealed(&game).await.unwrap().is_empty());
        assert_eq!(
            log.mark_revealed(fact.id, Deadline::NONE).await.unwrap(),
            RevealOutcome::AlreadyRevealed
        );
    }

    /// A memory backend whose queries stall after reading.
    struct StallingQueries(MemoryLedger);

    #[async_trait]
    impl LedgerBackend for StallingQueries {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn append(&self, event: &Event) -> Result<u64, LedgerError> {
            self.0.append(event).await
        }

        async fn append_batch(&self, events: &[Event]) -> Result<Vec<u64>, LedgerError> {
            self.0.append_batch(events).await
        }

        async fn query(
            &self,
            game_id: &GameId,
            filter: &EventFilter,
        ) -> Result<Vec<StoredEvent>, LedgerError> {
            let events = self.0.query(game_id, filter).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(events)
        }

        async fn get(&self, id: EventId) -> Result<Option<StoredEvent>, LedgerError> {
            self.0.get(id).await
        }

        async fn mark_revealed(&self, id: EventId) -> Result<RevealOutcome, LedgerError> {
            self.0.mark_revealed(id).await
        }
    }

    #[tokio::test]
    async fn reveal_during_hydrate_is_not_lost() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(StallingQueries(MemoryLedger::new()));
        let log = mirrored_log(backend.clone());
        let game = GameId::from("g");
        let fact = event("g", "P1");
        backend.append(&fact).await.unwrap();

        let hydrating = tokio::spawn({
            let log = log.clone();
            let game = game.clone();
            async move { log.hydrate(&game, Deadline::NONE).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.mark_revealed(fact.id, Deadline::NONE).await.unwrap();
        assert_eq!(hydrating.await.unwrap().unwrap(), (1, true));

        assert!(log.get_unrevealed(&game, Deadline::NONE).await.unwrap().is_empty());
        assert_eq!(
            log.verify_mirror(&game, Deadline::NONE).await.unwrap(),
            MirrorCheck::Consistent {
                checked: 1,
                complete: true
            }
        );
    }

    #[tokio::test]
    async fn reveal_behind_the_logs_back_is_divergence() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryLedger::new());
        let log = mirrored_log(backend.clone());
        let game = GameId::from("g");
        log.hydrate(&game, Deadline::NONE).await.unwrap();
        let fact = event("g", "P1");
        log.append(&fact, Deadline::NONE).await.unwrap();
        backend.mark_revealed(fact.id).await.unwrap();

        let err = log.verify_mirror(&game, Deadline::NONE).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { .. }));
        assert!(log.get_unrevealed(&game, Deadline::NONE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_lookup_is_not_found() {
        let log = EventLog::new(Arc::new(MemoryLedger::new()));
        let err = log.get(EventId::new(), Deadline::NONE).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "event", .. }));
    }

    #[tokio::test]
    async fn batch_reaches_mirror_only_when_durable() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryLedger::new());
        let log = mirrored_log(backend);
        let game = GameId::from("g");
        log.hydrate(&game, Deadline::NONE).await.unwrap();
        let first = event("g", "P1");
        log.append(&first, Deadline::NONE).await.unwrap();

        let batch = vec![event("g", "P2"), first.clone()];
        let err = log.append_batch(&batch, Deadline::NONE).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { id } if id == first.id));
        assert_eq!(log.replay(&game, Deadline::NONE).await.unwrap().len(), 1);

        let batch = vec![event("g", "P2"), event("g", "P3")];
        let sequences = log.append_batch(&batch, Deadline::NONE).await.unwrap();
        assert_eq!(sequences.len(), 2);
        assert_eq!(log.replay(&game, Deadline::NONE).await.unwrap().len(), 3);
    }
}
