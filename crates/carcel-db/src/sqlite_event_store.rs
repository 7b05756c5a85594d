//! `SQLite` ledger backend over the embedded `event_log` table.
//!
//! Timestamps are stored as integer microseconds so ordering is numeric,
//! never lexical, and ties fall back to the `AUTOINCREMENT` sequence.
//! Identifiers and payloads are stored as text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::SqlitePool;
use sqlx::query::QueryScalar;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use carcel_ledger::{EventFilter, LedgerBackend, LedgerError, RevealOutcome, StoredEvent};
use carcel_types::{ActorId, Event, EventId, EventKind, GameId, Payload};

use crate::error::{self, DbError};
use crate::event_store::{FilterArg, day_from_db, filter_clause, sequence_from_db};
use crate::sqlite::SqliteDb;

const SELECT_EVENTS: &str = r"SELECT seq, id, game_id, timestamp_us, event_type, actor_id, target_id, payload, game_day, is_revealed
      FROM event_log";

const INSERT_EVENT: &str = r"INSERT INTO event_log (id, game_id, timestamp_us, event_type, actor_id, target_id, payload, game_day, is_revealed)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
      RETURNING seq";

/// A row from the `SQLite` `event_log` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqliteEventRow {
    /// Insertion sequence.
    pub seq: i64,
    /// Event identifier, hyphenated.
    pub id: String,
    /// Game the event belongs to.
    pub game_id: String,
    /// Creation time in microseconds since the Unix epoch.
    pub timestamp_us: i64,
    /// Kind tag.
    pub event_type: String,
    /// Causing actor.
    pub actor_id: String,
    /// Affected actor, if any.
    pub target_id: Option<String>,
    /// Kind-specific data as JSON text.
    pub payload: String,
    /// In-fiction day.
    pub game_day: i64,
    /// Audience visibility.
    pub is_revealed: bool,
}

impl SqliteEventRow {
    /// Convert the row back into a stored event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Corrupt`] or [`DbError::Serialization`] if a
    /// column cannot be read back.
    pub fn into_stored(self) -> Result<StoredEvent, DbError> {
        let id = EventId::from_str(&self.id)
            .map_err(|e| DbError::Corrupt(format!("event id {}: {e}", self.id)))?;
        let timestamp = DateTime::from_timestamp_micros(self.timestamp_us).ok_or_else(|| {
            DbError::Corrupt(format!("timestamp {} out of range", self.timestamp_us))
        })?;
        let payload: Payload = serde_json::from_str(&self.payload)?;

        Ok(StoredEvent {
            sequence: sequence_from_db(self.seq)?,
            event: Event {
                id,
                game_id: GameId::new(self.game_id),
                timestamp,
                kind: EventKind::parse(&self.event_type),
                actor_id: ActorId::new(self.actor_id),
                target_id: self.target_id.map(ActorId::new),
                payload,
                game_day: day_from_db(self.game_day)?,
                is_revealed: self.is_revealed,
            },
        })
    }
}

/// Bind every column of `event` to the insert statement.
fn insert_event(event: &Event) -> Result<QueryScalar<'_, Sqlite, i64, SqliteArguments<'_>>, DbError> {
    let payload = serde_json::to_string(&event.payload)?;
    Ok(sqlx::query_scalar(INSERT_EVENT)
        .bind(event.id.to_string())
        .bind(event.game_id.as_str())
        .bind(event.timestamp.timestamp_micros())
        .bind(event.kind.as_str())
        .bind(event.actor_id.as_str())
        .bind(event.target_id.as_ref().map(ActorId::as_str))
        .bind(payload)
        .bind(i64::from(event.game_day))
        .bind(event.is_revealed))
}

/// [`LedgerBackend`] over an `SQLite` file.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Create an event store sharing the pool of `db`.
    pub fn new(db: &SqliteDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Insert one event and return its sequence.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateEvent`] if the identifier is taken.
    pub async fn insert(&self, event: &Event) -> Result<u64, DbError> {
        let seq = insert_event(event)?
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
            let seq = insert_event(event)?
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
        let (clause, arg) = filter_clause(filter, "?2");
        let sql =
            format!("{SELECT_EVENTS} WHERE game_id = ?1{clause} ORDER BY timestamp_us, seq");

        let query = sqlx::query_as::<_, SqliteEventRow>(&sql).bind(game_id.as_str());
        let query = match arg {
            Some(FilterArg::Text(value)) => query.bind(value),
            Some(FilterArg::Day(day)) => query.bind(day),
            None => query,
        };
        let rows = query.fetch_all(&self.pool).await?;
        let events = rows
            .into_iter()
            .map(SqliteEventRow::into_stored)
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
        let sql = format!("{SELECT_EVENTS} WHERE id = ?1");
        let row = sqlx::query_as::<_, SqliteEventRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(SqliteEventRow::into_stored).transpose()
    }

    /// Flip `is_revealed` to true.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown identifier.
    pub async fn reveal(&self, id: EventId) -> Result<RevealOutcome, DbError> {
        let key = id.to_string();
        let result =
            sqlx::query(r"UPDATE event_log SET is_revealed = 1 WHERE id = ?1 AND is_revealed = 0")
                .bind(&key)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(event_id = %id, "Revealed event");
            return Ok(RevealOutcome::Revealed);
        }

        let exists: bool =
            sqlx::query_scalar(r"SELECT EXISTS (SELECT 1 FROM event_log WHERE id = ?1)")
                .bind(&key)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(RevealOutcome::AlreadyRevealed)
        } else {
            Err(DbError::NotFound {
                entity: "event",
                id: key,
            })
        }
    }
}

#[async_trait]
impl LedgerBackend for SqliteEventStore {
    fn name(&self) -> &'static str {
        "sqlite"
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
