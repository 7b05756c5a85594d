//! `PostgreSQL` ledger backend over the append-only `event_log` table.
//!
//! Every query is ordered by `(timestamp, seq)`, where `seq` is an identity
//! column assigned at insert. `TIMESTAMPTZ` keeps microseconds, the same
//! precision events are created with, so the order matches every other
//! backend. The table carries triggers that reject deletes and any change
//! other than revealing an event (see `migrations/postgres`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::QueryScalar;
use sqlx::types::Json;
use uuid::Uuid;

use carcel_ledger::{EventFilter, LedgerBackend, LedgerError, RevealOutcome, StoredEvent};
use carcel_types::{ActorId, Event, EventId, EventKind, GameId, Payload};

use crate::error::{self, DbError};
use crate::postgres::PostgresPool;

const SELECT_EVENTS: &str = r"SELECT seq, id, game_id, timestamp, event_type, actor_id, target_id, payload, game_day, is_revealed
      FROM event_log";

const INSERT_EVENT: &str = r"INSERT INTO event_log (id, game_id, timestamp, event_type, actor_id, target_id, payload, game_day, is_revealed)
      VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
      RETURNING seq";

/// The single bound argument of a filter clause.
pub(crate) enum FilterArg<'a> {
    /// An actor id or kind tag.
    Text(&'a str),
    /// A game day.
    Day(i64),
}

/// SQL fragment narrowing a game's events to `filter`.
///
/// `param` is the placeholder of the filter's argument; it may appear more
/// than once in the fragment, so backends must use numbered placeholders.
pub(crate) fn filter_clause<'a>(
    filter: &'a EventFilter,
    param: &str,
) -> (String, Option<FilterArg<'a>>) {
    match filter {
        EventFilter::All => (String::new(), None),
        EventFilter::Actor(actor) => (
            format!(" AND actor_id = {param}"),
            Some(FilterArg::Text(actor.as_str())),
        ),
        EventFilter::Involving(actor) => (
            format!(" AND (actor_id = {param} OR target_id = {param})"),
            Some(FilterArg::Text(actor.as_str())),
        ),
        EventFilter::Day(day) => (
            format!(" AND game_day = {param}"),
            Some(FilterArg::Day(i64::from(*day))),
        ),
        EventFilter::Kind(kind) => (
            format!(" AND event_type = {param}"),
            Some(FilterArg::Text(kind.as_str())),
        ),
        EventFilter::Unrevealed => (" AND NOT is_revealed".to_owned(), None),
    }
}

/// Read a stored insertion sequence back.
pub(crate) fn sequence_from_db(seq: i64) -> Result<u64, DbError> {
    u64::try_from(seq).map_err(|e| DbError::Corrupt(format!("sequence {seq}: {e}")))
}

/// Read a stored game day back.
pub(crate) fn day_from_db(day: i64) -> Result<u32, DbError> {
    u32::try_from(day).map_err(|e| DbError::Corrupt(format!("game day {day}: {e}")))
}

/// Read a stored payload back. SQL `NULL` or JSON `null` is an empty payload.
pub(crate) fn payload_from_db(value: serde_json::Value) -> Result<Payload, DbError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(Payload::new()),
        other => Err(DbError::Corrupt(format!(
            "payload is not an object: {other}"
        ))),
    }
}

/// A row from the `event_log` table.
///
/// Uses runtime types rather than compile-time checked types to
/// avoid requiring a live database during builds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Insertion sequence (identity column).
    pub seq: i64,
    /// Event identifier.
    pub id: Uuid,
    /// Game the event belongs to.
    pub game_id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Kind tag.
    pub event_type: String,
    /// Causing actor.
    pub actor_id: String,
    /// Affected actor, if any.
    pub target_id: Option<String>,
    /// Kind-specific data.
    pub payload: serde_json::Value,
    /// In-fiction day.
    pub game_day: i64,
    /// Audience visibility.
    pub is_revealed: bool,
}

impl EventRow {
    /// Convert the row back into a stored event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Corrupt`] if a column holds a value the event
    /// model cannot represent.
    pub fn into_stored(self) -> Result<StoredEvent, DbError> {
        Ok(StoredEvent {
            sequence: sequence_from_db(self.seq)?,
            event: Event {
                id: EventId::from(self.id),
                game_id: GameId::new(self.game_id),
                timestamp: self.timestamp,
                kind: EventKind::parse(&self.event_type),
                actor_id: ActorId::new(self.actor_id),
                target_id: self.target_id.map(ActorId::new),
                payload: payload_from_db(self.payload)?,
                game_day: day_from_db(self.game_day)?,
                is_revealed: self.is_revealed,
            },
        })
    }
}

/// Bind every column of `event` to the insert statement.
fn insert_event(event: &Event) -> QueryScalar<'_, Postgres, i64, PgArguments> {
    sqlx::query_scalar(INSERT_EVENT)
        .bind(event.id.into_inner())
        .bind(event.game_id.as_str())
        .bind(event.timestamp)
        .bind(event.kind.as_str())
        .bind(event.actor_id.as_str())
        .bind(event.target_id.as_ref().map(ActorId::as_str))
        .bind(Json(&event.payload))
        .bind(i64::from(event.game_day))
        .bind(event.is_revealed)
}

/// [`LedgerBackend`] over a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Create an event store sharing `pool`.
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Insert one event and return its sequence.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateEvent`] if the identifier is taken.
    pub async fn insert(&self, event: &Event) -> Result<u64, DbError> {
        let seq = insert_event(event)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| error::on_insert(e, event.id))?;
        let sequence = sequence_from_db(seq)?;
        tracing::debug!(
            game_id = %event.game_id,
            event_id = %event.id,
            kind = %event.kind,
            sequence,
            "Inserted event"
        );
        Ok(sequence)
    }

    /// Insert events in one transaction: either all of them are committed
    /// or none are.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateEvent`] for the first identifier that is
    /// already taken (including twice within `events`).
    pub async fn insert_batch(&self, events: &[Event]) -> Result<Vec<u64>, DbError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut sequences = Vec::with_capacity(events.len());
        for event in events {
            let seq = insert_event(event)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| error::on_insert(e, event.id))?;
            sequences.push(sequence_from_db(seq)?);
        }
        tx.commit().await?;

        tracing::debug!(count = events.len(), "Inserted event batch");
        Ok(sequences)
    }

    /// Events of a game passing `filter`, in replay order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sql`] if the query fails, or
    /// [`DbError::Corrupt`] if a row cannot be read back.
    pub async fn select(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, DbError> {
        let (clause, arg) = filter_clause(filter, "$2");
        let sql = format!("{SELECT_EVENTS} WHERE game_id = $1{clause} ORDER BY timestamp, seq");

        let query = sqlx::query_as::<_, EventRow>(&sql).bind(game_id.as_str());
        let query = match arg {
            Some(FilterArg::Text(value)) => query.bind(value),
            Some(FilterArg::Day(day)) => query.bind(day),
            None => query,
        };
        let rows = query.fetch_all(&self.pool).await?;
        let events = rows
            .into_iter()
            .map(EventRow::into_stored)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            game_id = %game_id,
            filter = filter.label(),
            count = events.len(),
            "Queried events"
        );
        Ok(events)
    }

    /// Look up one event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sql`] if the query fails.
    pub async fn select_one(&self, id: EventId) -> Result<Option<StoredEvent>, DbError> {
        let sql = format!("{SELECT_EVENTS} WHERE id = $1");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await?;
        row.map(EventRow::into_stored).transpose()
    }

    /// Flip `is_revealed` to true.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown identifier.
    pub async fn reveal(&self, id: EventId) -> Result<RevealOutcome, DbError> {
        let result =
            sqlx::query(r"UPDATE event_log SET is_revealed = TRUE WHERE id = $1 AND NOT is_revealed")
                .bind(id.into_inner())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(event_id = %id, "Revealed event");
            return Ok(RevealOutcome::Revealed);
        }

        let exists: bool =
            sqlx::query_scalar(r"SELECT EXISTS (SELECT 1 FROM event_log WHERE id = $1)")
                .bind(id.into_inner())
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(RevealOutcome::AlreadyRevealed)
        } else {
            Err(DbError::NotFound {
                entity: "event",
                id: id.to_string(),
            })
        }
    }
}

#[async_trait]
impl LedgerBackend for PgEventStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn append(&self, event: &Event) -> Result<u64, LedgerError> {
        event.validate()?;
        self.insert(event).await.map_err(LedgerError::from)
    }

    async fn append_batch(&self, events: &[Event]) -> Result<Vec<u64>, LedgerError> {
        for event in events {
            event.validate()?;
        }
        self.insert_batch(events).await.map_err(LedgerError::from)
    }

    async fn query(
        &self,
        game_id: &GameId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, LedgerError> {
        self.select(game_id, filter).await.map_err(LedgerError::from)
    }

    async fn get(&self, id: EventId) -> Result<Option<StoredEvent>, LedgerError> {
        self.select_one(id).await.map_err(LedgerError::from)
    }

    async fn mark_revealed(&self, id: EventId) -> Result<RevealOutcome, LedgerError> {
        self.reveal(id).await.map_err(LedgerError::from)
    }
}
