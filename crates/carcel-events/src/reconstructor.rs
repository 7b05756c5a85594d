//! The deterministic fold from events to prisoner state, and the recap.
//!
//! # Fold rules
//!
//! The *subject* of an event is its target if it has one, otherwise its
//! actor. Each rule only touches the prisoner whose state is being folded,
//! so folding a prisoner's involving events gives the same result as
//! folding the whole game.
//!
//! | Kind | Payload | Effect |
//! |------|---------|--------|
//! | `SANITY_CHANGE` | `delta` | subject sanity |
//! | `LOYALTY_CHANGE` | `delta` | subject loyalty |
//! | `RESOURCE_INTAKE` | `hunger_delta`, `thirst_delta` | subject hunger, thirst |
//! | `TOILET_USE` | `dignity_delta` (default -15) | subject dignity |
//! | `PRIVACY_BREACH` | `dignity_delta` | subject dignity |
//! | `ISOLATION_CHANGED` | `is_isolated` | subject flag |
//! | `WITHDRAWAL_CHANGED` | `active` | subject flag |
//! | `CONNECTION_CHANGED` | `connected` | subject sleeper = not connected |
//! | `BETRAYAL` | `empathy_delta`, `loyalty_delta` | actor empathy, target loyalty |
//! | `SOCIAL_ACTION` | `pot_delta` | actor and target pot |
//! | `STEAL` / `SNITCH` | `amount` / `pot_stolen` | target pot to actor pot |
//! | `FINAL_DILEMMA_DECISION` | `winnings` | actor pot, absolute |
//!
//! Every other kind, including kinds this build does not know, is a no-op.
//! All numeric fields are clamped after every event.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use carcel_ledger::{Deadline, EventLog, LedgerError};
use carcel_types::{
    ActorId, DerivedState, Event, EventKind, GameId, ImpactClass, PrisonerSnapshot, RecapEntry,
};

/// Dignity lost on a `TOILET_USE` without an explicit delta.
pub const DEFAULT_TOILET_DIGNITY_DELTA: i64 = -15;

fn shift(value: i32, delta: i64) -> i32 {
    let moved = i64::from(value).saturating_add(delta);
    i32::try_from(moved).unwrap_or(if moved.is_negative() { i32::MIN } else { i32::MAX })
}

/// Apply one event to `state`, then clamp.
///
/// Effects that land on other prisoners are ignored.
pub fn apply_event(state: &mut DerivedState, event: &Event) {
    let is_subject = event.subject() == &state.prisoner_id;
    let is_actor = event.actor_id == state.prisoner_id;
    let is_target = event.target_id.as_ref() == Some(&state.prisoner_id);

    match &event.kind {
        EventKind::SanityChange if is_subject => {
            state.sanity = shift(state.sanity, event.payload_i64("delta").unwrap_or(0));
        }
        EventKind::LoyaltyChange if is_subject => {
            state.loyalty = shift(state.loyalty, event.payload_i64("delta").unwrap_or(0));
        }
        EventKind::ResourceIntake if is_subject => {
            state.hunger = shift(state.hunger, event.payload_i64("hunger_delta").unwrap_or(0));
            state.thirst = shift(state.thirst, event.payload_i64("thirst_delta").unwrap_or(0));
        }
        EventKind::ToiletUse if is_subject => {
            let delta = event
                .payload_i64("dignity_delta")
                .unwrap_or(DEFAULT_TOILET_DIGNITY_DELTA);
            state.dignity = shift(state.dignity, delta);
        }
        EventKind::PrivacyBreach if is_subject => {
            state.dignity = shift(state.dignity, event.payload_i64("dignity_delta").unwrap_or(0));
        }
        EventKind::IsolationChanged if is_subject => {
            if let Some(isolated) = event.payload_bool("is_isolated") {
                state.is_isolated = isolated;
            }
        }
        EventKind::WithdrawalChanged if is_subject => {
            if let Some(active) = event.payload_bool("active") {
                state.in_withdrawal = active;
            }
        }
        EventKind::ConnectionChanged if is_subject => {
            if let Some(connected) = event.payload_bool("connected") {
                state.is_sleeper = !connected;
            }
        }
        EventKind::Betrayal => {
            if is_actor {
                state.empathy = shift(state.empathy, event.payload_i64("empathy_delta").unwrap_or(0));
            }
            if is_target {
                state.loyalty = shift(state.loyalty, event.payload_i64("loyalty_delta").unwrap_or(0));
            }
        }
        EventKind::SocialAction if is_actor || is_target => {
            if let Some(delta) = event.payload_decimal("pot_delta") {
                state.pot_contribution = state.pot_contribution.saturating_add(delta);
            }
        }
        EventKind::Steal | EventKind::Snitch => {
            let key = if event.kind == EventKind::Steal {
                "amount"
            } else {
                "pot_stolen"
            };
            let amount = event.payload_decimal(key).unwrap_or(Decimal::ZERO);
            if is_actor && !is_target {
                state.pot_contribution = state.pot_contribution.saturating_add(amount);
            } else if is_target && !is_actor {
                state.pot_contribution = state.pot_contribution.saturating_sub(amount);
            }
        }
        EventKind::FinalDilemmaDecision if is_actor => {
            if let Some(winnings) = event.payload_decimal("winnings") {
                state.pot_contribution = winnings;
            }
        }
        _ => {}
    }
    state.clamp();
}

/// Fold `events` (in replay order) over a copy of `initial`.
pub fn rebuild_state(initial: &DerivedState, events: &[Event]) -> DerivedState {
    let mut state = initial.clone();
    for event in events {
        apply_event(&mut state, event);
    }
    state
}

/// Prisoners an event can change: its actor and target, minus system actors.
pub fn affected_prisoners(event: &Event) -> Vec<ActorId> {
    let mut prisoners = Vec::with_capacity(2);
    if !event.actor_id.is_system() {
        prisoners.push(event.actor_id.clone());
    }
    if let Some(target) = event
        .target_id
        .as_ref()
        .filter(|t| !t.is_system() && **t != event.actor_id)
    {
        prisoners.push(target.clone());
    }
    prisoners
}

/// Fold a complete game into one state per participating prisoner,
/// ordered by prisoner id. Events of other games are ignored.
pub fn fold_game(game_id: &GameId, events: &[Event]) -> Vec<DerivedState> {
    let mut states: BTreeMap<ActorId, DerivedState> = BTreeMap::new();
    for event in events.iter().filter(|e| &e.game_id == game_id) {
        for prisoner in affected_prisoners(event) {
            let state = states
                .entry(prisoner)
                .or_insert_with_key(|id| DerivedState::initial(id.clone()));
            apply_event(state, event);
        }
    }
    states.into_values().collect()
}

/// [`fold_game`] wrapped as snapshots written at `now`.
pub fn fold_snapshots(game_id: &GameId, events: &[Event], now: DateTime<Utc>) -> Vec<PrisonerSnapshot> {
    fold_game(game_id, events)
        .into_iter()
        .map(|state| PrisonerSnapshot {
            game_id: game_id.clone(),
            state,
            last_updated: now,
        })
        .collect()
}

/// Player-facing line describing `event` from `observer`'s point of view.
pub fn summarize(event: &Event, observer: &ActorId) -> String {
    let to_me = event.target_id.as_ref() == Some(observer);
    let by_me = &event.actor_id == observer;
    let text = match &event.kind {
        EventKind::NoiseEvent => "Los Gemelos desataron una tortura de ruido.",
        EventKind::AudioTorture => "Un sonido insoportable llenó la celda.",
        EventKind::SanityChange if to_me || (by_me && event.target_id.is_none()) => {
            "Tu cordura fue afectada."
        }
        EventKind::SanityChange => "La cordura de otro prisionero fue afectada.",
        EventKind::LoyaltyChange => "La lealtad en la celda cambió.",
        EventKind::Betrayal if to_me => "Tu compañero te traicionó.",
        EventKind::Betrayal if by_me => "Traicionaste a tu compañero.",
        EventKind::Betrayal => "Hubo una traición...",
        EventKind::ResourceIntake if by_me => "Comiste o bebiste algo.",
        EventKind::ResourceIntake => "Alguien comió o bebió.",
        EventKind::ToiletUse if by_me => "Usaste el retrete a la vista de todos.",
        EventKind::ToiletUse => "Alguien usó el retrete.",
        EventKind::PrivacyBreach if to_me => "Tu intimidad quedó expuesta.",
        EventKind::Steal if to_me => "Te robaron.",
        EventKind::Steal if by_me => "Robaste a otro prisionero.",
        EventKind::Snitch if to_me => "Alguien te delató.",
        EventKind::Insult if to_me => "Te insultaron.",
        EventKind::DoorLock => "La puerta de la celda se cerró.",
        EventKind::DoorOpen => "La puerta de la celda se abrió.",
        EventKind::LockdownBang => "Golpes contra los barrotes durante el encierro.",
        EventKind::IsolationChanged if to_me || by_me => "Tu situación de aislamiento cambió.",
        EventKind::FinalDilemmaStart => "Comenzó el dilema final.",
        EventKind::FinalDilemmaDecision => "Se tomó una decisión en el dilema final.",
        EventKind::OraclePainfulTruth => "El oráculo reveló una verdad dolorosa.",
        EventKind::TimeTick => "El tiempo pasó.",
        _ => "Algo ocurrió en la prisión.",
    };
    text.to_owned()
}

/// Whether `event` belongs in `prisoner`'s recap.
///
/// The prisoner must be the actor or the target, or the event must be
/// environment-driven, whoever it hit.
pub fn is_relevant(event: &Event, prisoner: &ActorId) -> bool {
    event.involves(prisoner) || event.is_environmental()
}

/// Recap lines for `prisoner` from day `since_day` on, in replay order.
pub fn recap_entries(events: &[Event], prisoner: &ActorId, since_day: u32) -> Vec<RecapEntry> {
    events
        .iter()
        .filter(|e| e.game_day >= since_day && is_relevant(e, prisoner))
        .map(|e| RecapEntry {
            event_id: e.id,
            timestamp: e.timestamp,
            kind: e.kind.clone(),
            summary: summarize(e, prisoner),
            impact: ImpactClass::of(&e.kind),
            is_revealed: e.is_revealed,
            game_day: e.game_day,
        })
        .collect()
}

/// Outcome of a recap that must never surface a partial result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "entries", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecapOutcome {
    /// The complete, ordered recap.
    Ready(Vec<RecapEntry>),
    /// History could not be read; show "history temporarily unavailable".
    HistoryUnavailable,
}

/// Rebuilds state and recaps from the event log.
#[derive(Debug, Clone)]
pub struct Reconstructor {
    log: EventLog,
}

impl Reconstructor {
    /// Create a reconstructor reading through `log`.
    pub const fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// A prisoner's state, folded from every event that involves them.
    pub async fn rebuild_prisoner(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        deadline: Deadline,
    ) -> Result<DerivedState, LedgerError> {
        let events = self.log.get_involving(game_id, prisoner_id, deadline).await?;
        tracing::debug!(
            game_id = %game_id,
            prisoner_id = %prisoner_id,
            count = events.len(),
            "Rebuilding prisoner state"
        );
        Ok(rebuild_state(&DerivedState::initial(prisoner_id.clone()), &events))
    }

    /// Every participating prisoner's state, folded from the full replay.
    pub async fn rebuild_game(
        &self,
        game_id: &GameId,
        deadline: Deadline,
    ) -> Result<Vec<DerivedState>, LedgerError> {
        let events = self.log.replay(game_id, deadline).await?;
        Ok(fold_game(game_id, &events))
    }

    /// Recap of everything relevant to `prisoner_id` since `since_day`.
    pub async fn recap(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        since_day: u32,
        deadline: Deadline,
    ) -> Result<Vec<RecapEntry>, LedgerError> {
        let events = self.log.replay(game_id, deadline).await?;
        Ok(recap_entries(&events, prisoner_id, since_day))
    }

    /// [`Reconstructor::recap`] for the login screen: any failure becomes
    /// [`RecapOutcome::HistoryUnavailable`].
    pub async fn reality_recap(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        since_day: u32,
        deadline: Deadline,
    ) -> RecapOutcome {
        match self.recap(game_id, prisoner_id, since_day, deadline).await {
            Ok(entries) => RecapOutcome::Ready(entries),
            Err(err) => {
                if matches!(err, LedgerError::InvariantViolation { .. }) {
                    tracing::error!(game_id = %game_id, prisoner_id = %prisoner_id, error = %err, "Recap aborted");
                } else {
                    tracing::warn!(game_id = %game_id, prisoner_id = %prisoner_id, error = %err, "Recap unavailable");
                }
                RecapOutcome::HistoryUnavailable
            }
        }
    }
}
