//! The subcommands. Each one reads or repairs through a [`Persistence`]
//! handle and returns a serializable report; `main` prints it.

use std::str::FromStr;

use clap::Args;
use serde::Serialize;

use carcel_core::Persistence;
use carcel_db::DbError;
use carcel_events::{RecapOutcome, SnapshotDrift};
use carcel_ledger::{Deadline, EventFilter, RevealOutcome};
use carcel_types::{
    ActorId, DerivedState, Event, EventId, EventKind, GameId, GameRecord, PrisonerRecord,
    PrisonerSnapshot,
};

use crate::error::InspectError;

/// At most one replay filter.
#[derive(Debug, Clone, Default, Args)]
#[group(multiple = false)]
pub struct FilterArgs {
    /// Only events caused by this actor.
    #[arg(long)]
    pub actor: Option<String>,

    /// Only events where this actor is the actor or the target.
    #[arg(long)]
    pub involving: Option<String>,

    /// Only events of this in-fiction day.
    #[arg(long)]
    pub day: Option<u32>,

    /// Only events of this kind (e.g. `BETRAYAL`).
    #[arg(long)]
    pub kind: Option<String>,

    /// Only events the audience has not seen yet.
    #[arg(long)]
    pub unrevealed: bool,
}

impl FilterArgs {
    /// The ledger filter these flags select.
    pub fn to_filter(&self) -> EventFilter {
        if let Some(actor) = &self.actor {
            EventFilter::Actor(ActorId::new(actor.as_str()))
        } else if let Some(actor) = &self.involving {
            EventFilter::Involving(ActorId::new(actor.as_str()))
        } else if let Some(day) = self.day {
            EventFilter::Day(day)
        } else if let Some(kind) = &self.kind {
            EventFilter::Kind(EventKind::parse(kind))
        } else if self.unrevealed {
            EventFilter::Unrevealed
        } else {
            EventFilter::All
        }
    }
}

/// A filtered replay, ready for the VAR viewer.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// The game replayed.
    pub game_id: GameId,
    /// Which filter was applied.
    pub filter: &'static str,
    /// Number of events.
    pub count: usize,
    /// The events, in replay order.
    pub events: Vec<Event>,
}

/// Events of a game in replay order.
pub async fn replay(
    store: &Persistence,
    game_id: &GameId,
    filter: &EventFilter,
    deadline: Deadline,
) -> Result<ReplayReport, InspectError> {
    let events = store.log().query(game_id, filter, deadline).await?;
    Ok(ReplayReport {
        game_id: game_id.clone(),
        filter: filter.label(),
        count: events.len(),
        events,
    })
}

/// The login recap of one prisoner. Never fails: an unreadable history
/// is reported as such.
pub async fn recap(
    store: &Persistence,
    game_id: &GameId,
    prisoner_id: &ActorId,
    since_day: u32,
    deadline: Deadline,
) -> RecapOutcome {
    store
        .reconstructor()
        .reality_recap(game_id, prisoner_id, since_day, deadline)
        .await
}

/// Current state of one prisoner, or a fresh fold of every prisoner.
pub async fn state(
    store: &Persistence,
    game_id: &GameId,
    prisoner_id: Option<&ActorId>,
    deadline: Deadline,
) -> Result<Vec<DerivedState>, InspectError> {
    match prisoner_id {
        Some(prisoner_id) => Ok(vec![
            store.current_state(game_id, prisoner_id, deadline).await?,
        ]),
        None => Ok(store.reconstructor().rebuild_game(game_id, deadline).await?),
    }
}

/// Snapshots written by a rebuild.
#[derive(Debug, Serialize)]
pub struct RebuildReport {
    /// The game rebuilt.
    pub game_id: GameId,
    /// Number of snapshots written.
    pub rebuilt: usize,
    /// The new snapshots.
    pub snapshots: Vec<PrisonerSnapshot>,
}

/// Replace a game's snapshots with a fresh replay.
pub async fn rebuild(
    store: &Persistence,
    game_id: &GameId,
    deadline: Deadline,
) -> Result<RebuildReport, InspectError> {
    let snapshots = store.projector().rebuild(game_id, deadline).await?;
    tracing::info!(game_id = %game_id, count = snapshots.len(), "Snapshots rebuilt");
    Ok(RebuildReport {
        game_id: game_id.clone(),
        rebuilt: snapshots.len(),
        snapshots,
    })
}

/// One prisoner whose snapshot disagrees with the ledger.
#[derive(Debug, Serialize)]
pub struct DriftEntry {
    /// The prisoner.
    pub prisoner_id: ActorId,
    /// State according to the ledger.
    pub expected: DerivedState,
    /// State according to the cache, if cached.
    pub cached: Option<DerivedState>,
}

impl From<SnapshotDrift> for DriftEntry {
    fn from(drift: SnapshotDrift) -> Self {
        Self {
            prisoner_id: drift.prisoner_id,
            expected: drift.expected,
            cached: drift.cached,
        }
    }
}

/// Result of comparing a game's snapshots with its ledger.
#[derive(Debug, Serialize)]
pub struct VerifyReport {
    /// The game checked.
    pub game_id: GameId,
    /// Prisoners whose snapshot is stale or missing.
    pub drifted: Vec<DriftEntry>,
}

/// Compare every snapshot of a game with a fresh replay.
pub async fn verify(
    store: &Persistence,
    game_id: &GameId,
    deadline: Deadline,
) -> Result<VerifyReport, InspectError> {
    let drifted: Vec<DriftEntry> = store
        .projector()
        .detect_drift(game_id, deadline)
        .await?
        .into_iter()
        .map(DriftEntry::from)
        .collect();
    Ok(VerifyReport {
        game_id: game_id.clone(),
        drifted,
    })
}

/// Outcome of a reveal.
#[derive(Debug, Serialize)]
pub struct RevealReport {
    /// The event revealed.
    pub event_id: EventId,
    /// Whether anything changed.
    pub outcome: RevealOutcome,
}

/// Mark one event as shown to the audience.
pub async fn reveal(
    store: &Persistence,
    event_id: &str,
    deadline: Deadline,
) -> Result<RevealReport, InspectError> {
    let id = EventId::from_str(event_id).map_err(|e| InspectError::InvalidArgument {
        message: format!("event id {event_id:?}: {e}"),
    })?;
    let outcome = store.log().mark_revealed(id, deadline).await?;
    Ok(RevealReport {
        event_id: id,
        outcome,
    })
}

/// A game's directory entry and roster.
#[derive(Debug, Serialize)]
pub struct GameReport {
    /// The game row.
    pub game: GameRecord,
    /// Registered prisoners.
    pub prisoners: Vec<PrisonerRecord>,
}

/// Look up a game in the directory.
pub async fn game(store: &Persistence, game_id: &GameId) -> Result<GameReport, InspectError> {
    let directory = store.directory();
    let game = directory
        .get_game(game_id)
        .await?
        .ok_or_else(|| DbError::NotFound {
            entity: "game",
            id: game_id.to_string(),
        })?;
    let prisoners = directory.list_prisoners(game_id).await?;
    Ok(GameReport { game, prisoners })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use carcel_core::CarcelConfig;
    use carcel_ledger::LedgerError;
    use carcel_types::{Archetype, ManualClock, NewEvent, SYSTEM_TWINS};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;

    async fn open() -> (Persistence, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap(),
        ));
        let config = CarcelConfig::parse_with_env("", |_| None).unwrap();
        let store = Persistence::open_with_clock(config, clock.clone())
            .await
            .unwrap();
        (store, clock)
    }

    async fn seed(store: &Persistence, clock: &ManualClock, game: &GameId) -> Vec<Event> {
        let params = [
            NewEvent::new(game.clone(), "SANITY_CHANGE", SYSTEM_TWINS)
                .target("p-1")
                .day(1)
                .with("delta", -10),
            NewEvent::new(game.clone(), "BETRAYAL", "p-2")
                .target("p-1")
                .day(1)
                .with("empathy_delta", -5)
                .with("loyalty_delta", -30),
            NewEvent::new(game.clone(), "LOYALTY_CHANGE", SYSTEM_TWINS)
                .target("p-2")
                .day(2)
                .with("delta", 5),
        ];
        let mut events = Vec::new();
        for p in params {
            events.push(store.record(p, Deadline::NONE).await.unwrap());
            clock.advance(Duration::seconds(1));
        }
        events
    }

    #[test]
    fn flags_select_one_filter() {
        assert_eq!(FilterArgs::default().to_filter(), EventFilter::All);
        let by_day = FilterArgs {
            day: Some(3),
            ..FilterArgs::default()
        };
        assert_eq!(by_day.to_filter(), EventFilter::Day(3));
        let by_kind = FilterArgs {
            kind: Some("BETRAYAL".to_owned()),
            ..FilterArgs::default()
        };
        assert_eq!(
            by_kind.to_filter(),
            EventFilter::Kind(EventKind::parse("BETRAYAL"))
        );
        let unrevealed = FilterArgs {
            unrevealed: true,
            ..FilterArgs::default()
        };
        assert_eq!(unrevealed.to_filter(), EventFilter::Unrevealed);
    }

    #[tokio::test]
    async fn replay_applies_filter_in_order() {
        let (store, clock) = open().await;
        let game = GameId::new("g-1");
        let events = seed(&store, &clock, &game).await;

        let all = replay(&store, &game, &EventFilter::All, Deadline::NONE)
            .await
            .unwrap();
        assert_eq!(all.count, 3);
        assert_eq!(all.events, events);

        let involving = replay(
            &store,
            &game,
            &EventFilter::Involving(ActorId::new("p-2")),
            Deadline::NONE,
        )
        .await
        .unwrap();
        assert_eq!(involving.filter, "involving");
        let ids: Vec<EventId> = involving.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![events[1].id, events[2].id]);
    }

    #[tokio::test]
    async fn recap_reports_betrayal_to_victim() {
        let (store, clock) = open().await;
        let game = GameId::new("g-1");
        seed(&store, &clock, &game).await;

        let RecapOutcome::Ready(entries) =
            recap(&store, &game, &ActorId::new("p-1"), 1, Deadline::NONE).await
        else {
            panic!("recap unavailable");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].kind, EventKind::parse("BETRAYAL"));
        // Environment events reach every prisoner's recap.
        assert_eq!(entries[2].kind, EventKind::parse("LOYALTY_CHANGE"));
    }

    #[tokio::test]
    async fn verify_finds_and_rebuild_clears_drift() {
        let (store, clock) = open().await;
        let game = GameId::new("g-1");
        seed(&store, &clock, &game).await;
        assert!(verify(&store, &game, Deadline::NONE).await.unwrap().drifted.is_empty());

        let mut tampered = store
            .snapshots()
            .get_by_actor(&game, &ActorId::new("p-1"))
            .await
            .unwrap()
            .unwrap();
        tampered.state.sanity = 3;
        store.snapshots().upsert(&tampered).await.unwrap();

        let report = verify(&store, &game, Deadline::NONE).await.unwrap();
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(report.drifted[0].prisoner_id, ActorId::new("p-1"));
        assert_eq!(report.drifted[0].expected.sanity, 90);

        let rebuilt = rebuild(&store, &game, Deadline::NONE).await.unwrap();
        assert_eq!(rebuilt.rebuilt, 2);
        assert!(verify(&store, &game, Deadline::NONE).await.unwrap().drifted.is_empty());
    }

    #[tokio::test]
    async fn state_of_whole_game_matches_each_prisoner() {
        let (store, clock) = open().await;
        let game = GameId::new("g-1");
        seed(&store, &clock, &game).await;

        let everyone = state(&store, &game, None, Deadline::NONE).await.unwrap();
        assert_eq!(everyone.len(), 2);
        for expected in everyone {
            let one = state(&store, &game, Some(&expected.prisoner_id), Deadline::NONE)
                .await
                .unwrap();
            assert_eq!(one, vec![expected]);
        }
    }

    #[tokio::test]
    async fn reveal_is_idempotent_and_checks_ids() {
        let (store, clock) = open().await;
        let game = GameId::new("g-1");
        let events = seed(&store, &clock, &game).await;
        let id = events[0].id.to_string();

        let first = reveal(&store, &id, Deadline::NONE).await.unwrap();
        assert_eq!(first.outcome, RevealOutcome::Revealed);
        let second = reveal(&store, &id, Deadline::NONE).await.unwrap();
        assert_eq!(second.outcome, RevealOutcome::AlreadyRevealed);

        let err = reveal(&store, "not-a-uuid", Deadline::NONE).await.unwrap_err();
        assert!(matches!(err, InspectError::InvalidArgument { .. }));

        let unknown = EventId::new().to_string();
        let err = reveal(&store, &unknown, Deadline::NONE).await.unwrap_err();
        assert!(matches!(
            err,
            InspectError::Ledger {
                source: LedgerError::NotFound { .. }
            }
        ));
    }

    #[tokio::test]
    async fn game_report_lists_roster() {
        let (store, _clock) = open().await;
        let game = GameId::new("g-1");
        let directory = store.directory();
        directory
            .create_game(&GameRecord::new(game.clone(), Utc::now()))
            .await
            .unwrap();
        directory
            .register_prisoner(&PrisonerRecord {
                id: ActorId::new("p-1"),
                game_id: game.clone(),
                name: "Lola".to_owned(),
                archetype: Archetype::Deceiver,
                pot_contribution: Decimal::ZERO,
            })
            .await
            .unwrap();

        let report = super::game(&store, &game).await.unwrap();
        assert_eq!(report.prisoners.len(), 1);
        assert_eq!(report.game.id, game);

        let err = super::game(&store, &GameId::new("missing")).await.unwrap_err();
        assert!(matches!(
            err,
            InspectError::Db {
                source: DbError::NotFound { .. }
            }
        ));
    }
}
