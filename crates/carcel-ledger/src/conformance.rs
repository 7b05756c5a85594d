//! Cross-backend conformance suite.
//!
//! Every [`LedgerBackend`] must pass [`run_all`]. Each check works in its
//! own freshly named game, so the suite can run against a shared database.
//! Checks panic on failure, like any test assertion.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use carcel_types::{
    ActorId, Event, EventError, EventId, EventKind, GameId, ManualClock, NewEvent, UuidV7Generator,
};

use crate::backend::{EventFilter, LedgerBackend, RevealOutcome};
use crate::LedgerError;

/// A game id no other check uses.
fn fresh_game(check: &str) -> GameId {
    GameId::new(format!("conf-{check}-{}", EventId::new()))
}

fn at_fixed_time(params: NewEvent, clock: &ManualClock) -> Event {
    Event::new_with(params, clock, &UuidV7Generator).expect("valid event")
}

fn fixed_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 21, 0, 0).unwrap())
}

/// Run every check against `backend`.
pub async fn run_all(backend: Arc<dyn LedgerBackend>) {
    append_then_replay_round_trips_every_field(backend.as_ref()).await;
    equal_timestamps_replay_in_insertion_order(backend.as_ref()).await;
    concurrent_appends_read_back_in_a_stable_order(Arc::clone(&backend)).await;
    duplicate_append_conflicts_and_stores_once(backend.as_ref()).await;
    batch_is_all_or_nothing(backend.as_ref()).await;
    filters_are_projections_of_the_replay(backend.as_ref()).await;
    reveal_is_one_way_and_idempotent(backend.as_ref()).await;
    sub_microsecond_timestamps_are_rejected(backend.as_ref()).await;
    games_are_partitioned(backend.as_ref()).await;
}

/// Every field survives storage, including unknown kinds and payloads.
pub async fn append_then_replay_round_trips_every_field(backend: &dyn LedgerBackend) {
    let game = fresh_game("roundtrip");
    let clock = fixed_clock();
    clock.advance(chrono::Duration::microseconds(123_457));
    let with_target = at_fixed_time(
        NewEvent::new(game.clone(), EventKind::SanityChange, "SYSTEM_SANITY")
            .target("P1")
            .day(3)
            .with("delta", -10)
            .with("reason", "lights on all night"),
        &clock,
    );
    let unknown_kind = at_fixed_time(
        NewEvent::new(game.clone(), "RED_PHONE_ANSWER", "P2").day(4),
        &clock,
    );
    backend.append(&with_target).await.unwrap();
    backend.append(&unknown_kind).await.unwrap();

    let replay = backend.query_by_game(&game).await.unwrap();
    assert_eq!(replay, vec![with_target.clone(), unknown_kind.clone()]);
    let fetched = backend.get(unknown_kind.id).await.unwrap().unwrap();
    assert_eq!(fetched.event, unknown_kind);
    assert_eq!(
        fetched.event.kind,
        EventKind::Other("RED_PHONE_ANSWER".to_owned())
    );
    assert!(backend.get(EventId::new()).await.unwrap().is_none());
}

/// Ties on timestamp are broken by insertion, never by id or retry order.
pub async fn equal_timestamps_replay_in_insertion_order(backend: &dyn LedgerBackend) {
    let game = fresh_game("ties");
    let clock = fixed_clock();
    let events: Vec<Event> = (0..8)
        .map(|i| {
            at_fixed_time(
                NewEvent::new(game.clone(), EventKind::NoiseEvent, "SYSTEM_TWINS").with("n", i),
                &clock,
            )
        })
        .collect();
    // Insert in reverse id order so an id-based tie-break would show.
    for event in events.iter().rev() {
        backend.append(event).await.unwrap();
    }
    let expected: Vec<EventId> = events.iter().rev().map(|e| e.id).collect();
    let replay: Vec<EventId> = backend
        .query_by_game(&game)
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(replay, expected);

    // An earlier timestamp inserted last still sorts first.
    let earlier = fixed_clock();
    earlier.advance(chrono::Duration::seconds(-1));
    let late_arrival = at_fixed_time(
        NewEvent::new(game.clone(), EventKind::TimeTick, "SYSTEM_TWINS"),
        &earlier,
    );
    backend.append(&late_arrival).await.unwrap();
    let replay = backend.query_by_game(&game).await.unwrap();
    assert_eq!(replay.first().map(|e| e.id), Some(late_arrival.id));
}

/// Concurrent writers: every read observes the same total order.
pub async fn concurrent_appends_read_back_in_a_stable_order(backend: Arc<dyn LedgerBackend>) {
    let game = fresh_game("concurrent");
    let clock = Arc::new(fixed_clock());
    let mut handles = Vec::new();
    for writer in 0..4 {
        let backend = Arc::clone(&backend);
        let game = game.clone();
        let clock = Arc::clone(&clock);
        handles.push(tokio::spawn(async move {
            for n in 0..10 {
                let event = at_fixed_time(
                    NewEvent::new(game.clone(), EventKind::SocialAction, format!("P{writer}"))
                        .with("n", n),
                    &clock,
                );
                backend.append(&event).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let first = backend.query(&game, &EventFilter::All).await.unwrap();
    assert_eq!(first.len(), 40);
    for _ in 0..3 {
        let again = backend.query(&game, &EventFilter::All).await.unwrap();
        assert_eq!(again, first);
    }
    let keys: Vec<_> = first.iter().map(crate::StoredEvent::order_key).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    // Per-writer issue order is preserved under equal timestamps.
    for writer in 0..4 {
        let actor = ActorId::new(format!("P{writer}"));
        let ns: Vec<i64> = first
            .iter()
            .filter(|s| s.event.actor_id == actor)
            .filter_map(|s| s.event.payload_i64("n"))
            .collect();
        assert_eq!(ns, (0..10).collect::<Vec<i64>>());
    }
}

/// The same event twice: one row and a `Conflict`.
pub async fn duplicate_append_conflicts_and_stores_once(backend: &dyn LedgerBackend) {
    let game = fresh_game("dup");
    let event = Event::new(NewEvent::new(game.clone(), EventKind::Vote, "P1")).unwrap();
    backend.append(&event).await.unwrap();
    let err = backend.append(&event).await.unwrap_err();
    assert!(matches!(err, LedgerError::Conflict { id } if id == event.id));
    assert_eq!(backend.query_by_game(&game).await.unwrap().len(), 1);
}

/// A batch containing one duplicate stores nothing.
pub async fn batch_is_all_or_nothing(backend: &dyn LedgerBackend) {
    let game = fresh_game("batch");
    let existing = Event::new(NewEvent::new(game.clone(), EventKind::Vote, "P1")).unwrap();
    backend.append(&existing).await.unwrap();

    let fresh = Event::new(NewEvent::new(game.clone(), EventKind::Vote, "P2")).unwrap();
    let err = backend
        .append_batch(&[fresh.clone(), existing.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict { .. }));
    assert_eq!(backend.query_by_game(&game).await.unwrap().len(), 1);

    let other = Event::new(NewEvent::new(game.clone(), EventKind::Vote, "P3")).unwrap();
    let sequences = backend.append_batch(&[fresh, other]).await.unwrap();
    assert_eq!(sequences.len(), 2);
    assert!(sequences[0] < sequences[1]);
    assert_eq!(backend.query_by_game(&game).await.unwrap().len(), 3);
}

/// Nanosecond timestamps are refused, so no backend can order by
/// precision another one drops.
pub async fn sub_microsecond_timestamps_are_rejected(backend: &dyn LedgerBackend) {
    let game = fresh_game("precision");
    let clock = fixed_clock();
    let mut fine = at_fixed_time(NewEvent::new(game.clone(), EventKind::Vote, "P1"), &clock);
    fine.timestamp = fine
        .timestamp
        .checked_add_signed(chrono::Duration::nanoseconds(900))
        .unwrap();
    let err = backend.append(&fine).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Validation(EventError::ImpreciseTimestamp(_))
    ));

    let exact = at_fixed_time(NewEvent::new(game.clone(), EventKind::Vote, "P2"), &clock);
    let err = backend
        .append_batch(&[exact.clone(), fine])
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert!(backend.query_by_game(&game).await.unwrap().is_empty());

    backend.append(&exact).await.unwrap();
    assert_eq!(backend.query_by_game(&game).await.unwrap(), vec![exact]);
}

/// Filtered queries equal filtering the full replay.
pub async fn filters_are_projections_of_the_replay(backend: &dyn LedgerBackend) {
    let game = fresh_game("filters");
    let clock = fixed_clock();
    let specs: [(EventKind, &str, Option<&str>, u32); 6] = [
        (EventKind::ResourceIntake, "P1", None, 1),
        (EventKind::Betrayal, "P2", Some("P1"), 1),
        (EventKind::NoiseEvent, "SYSTEM_TWINS", None, 2),
        (EventKind::ResourceIntake, "P2", None, 2),
        (EventKind::SanityChange, "SYSTEM_SANITY", Some("P1"), 3),
        (EventKind::Insult, "P1", Some("P2"), 3),
    ];
    for (kind, actor, target, day) in specs {
        clock.advance(chrono::Duration::milliseconds(1));
        let mut params = NewEvent::new(game.clone(), kind, actor).day(day);
        if let Some(target) = target {
            params = params.target(target);
        }
        backend.append(&at_fixed_time(params, &clock)).await.unwrap();
    }
    let all = backend.query_by_game(&game).await.unwrap();
    backend.mark_revealed(all[1].id).await.unwrap();
    let all = backend.query_by_game(&game).await.unwrap();

    let filters = [
        EventFilter::Actor(ActorId::from("P1")),
        EventFilter::Involving(ActorId::from("P1")),
        EventFilter::Day(2),
        EventFilter::Kind(EventKind::ResourceIntake),
        EventFilter::Unrevealed,
    ];
    for filter in filters {
        let expected: Vec<Event> = all.iter().filter(|e| filter.matches(e)).cloned().collect();
        let got = backend.query_events(&game, &filter).await.unwrap();
        assert_eq!(got, expected, "filter {filter:?}");
    }
    assert_eq!(
        backend.query_by_actor(&game, &ActorId::from("P1")).await.unwrap().len(),
        2
    );
    assert_eq!(backend.query_by_day(&game, 3).await.unwrap().len(), 2);
    assert_eq!(
        backend
            .query_by_kind(&game, &EventKind::ResourceIntake)
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(backend.query_unrevealed(&game).await.unwrap().len(), 5);
}

/// Unrevealed to revealed, once; unknown ids are `NotFound`.
pub async fn reveal_is_one_way_and_idempotent(backend: &dyn LedgerBackend) {
    let game = fresh_game("reveal");
    let event = Event::new(NewEvent::new(game.clone(), EventKind::Steal, "P1").target("P2")).unwrap();
    backend.append(&event).await.unwrap();
    assert_eq!(backend.query_unrevealed(&game).await.unwrap().len(), 1);

    assert_eq!(
        backend.mark_revealed(event.id).await.unwrap(),
        RevealOutcome::Revealed
    );
    assert!(backend.query_unrevealed(&game).await.unwrap().is_empty());
    assert_eq!(
        backend.mark_revealed(event.id).await.unwrap(),
        RevealOutcome::AlreadyRevealed
    );

    let stored = backend.query_by_game(&game).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_revealed);
    let mut unchanged = event.clone();
    unchanged.is_revealed = true;
    assert_eq!(stored[0], unchanged);

    let err = backend.mark_revealed(EventId::new()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
}

/// Queries never leak events of another game.
pub async fn games_are_partitioned(backend: &dyn LedgerBackend) {
    let first = fresh_game("part-a");
    let second = fresh_game("part-b");
    backend
        .append(&Event::new(NewEvent::new(first.clone(), EventKind::Vote, "P1")).unwrap())
        .await
        .unwrap();
    backend
        .append(&Event::new(NewEvent::new(second.clone(), EventKind::Vote, "P1")).unwrap())
        .await
        .unwrap();
    let events = backend.query_by_game(&first).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events.iter().all(|e| e.game_id == first));
    assert!(
        backend
            .query_by_actor(&fresh_game("part-none"), &ActorId::from("P1"))
            .await
            .unwrap()
            .is_empty()
    );
}
