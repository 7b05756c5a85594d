//! Snapshot persistence for derived prisoner state.
//!
//! One row per (game, prisoner) in `prisoner_snapshots`. Writes are plain
//! upserts: the table is a cache that can always be rebuilt from the
//! ledger, so last-writer-wins is acceptable here and nowhere else.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, SqlitePool};

use carcel_events::SnapshotStore;
use carcel_ledger::LedgerError;
use carcel_types::{ActorId, DerivedState, GameId, PrisonerSnapshot};

use crate::error::DbError;
use crate::postgres::PostgresPool;
use crate::sqlite::SqliteDb;

const SNAPSHOT_COLUMNS: &str = "game_id, prisoner_id, hunger, thirst, sanity, dignity, loyalty, empathy, is_isolated, is_sleeper, in_withdrawal, pot_contribution, last_updated";

/// A row from the `prisoner_snapshots` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    /// Game the prisoner plays in.
    pub game_id: String,
    /// Prisoner identifier.
    pub prisoner_id: String,
    /// Hunger level.
    pub hunger: i32,
    /// Thirst level.
    pub thirst: i32,
    /// Sanity level.
    pub sanity: i32,
    /// Dignity level.
    pub dignity: i32,
    /// Loyalty towards the cellmate.
    pub loyalty: i32,
    /// Empathy level.
    pub empathy: i32,
    /// In the isolation cell.
    pub is_isolated: bool,
    /// Disconnected.
    pub is_sleeper: bool,
    /// Suffering withdrawal.
    pub in_withdrawal: bool,
    /// Money put into the pot.
    pub pot_contribution: Decimal,
    /// When the row was last written.
    pub last_updated: DateTime<Utc>,
}

impl From<SnapshotRow> for PrisonerSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            game_id: GameId::new(row.game_id),
            state: DerivedState {
                prisoner_id: ActorId::new(row.prisoner_id),
                hunger: row.hunger,
                thirst: row.thirst,
                sanity: row.sanity,
                dignity: row.dignity,
                loyalty: row.loyalty,
                empathy: row.empathy,
                is_isolated: row.is_isolated,
                is_sleeper: row.is_sleeper,
                in_withdrawal: row.in_withdrawal,
                pot_contribution: row.pot_contribution,
            },
            last_updated: row.last_updated,
        }
    }
}

/// `SQLite` flavour of [`SnapshotRow`]: the pot is stored as decimal text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqliteSnapshotRow {
    /// Game the prisoner plays in.
    pub game_id: String,
    /// Prisoner identifier.
    pub prisoner_id: String,
    /// Hunger level.
    pub hunger: i32,
    /// Thirst level.
    pub thirst: i32,
    /// Sanity level.
    pub sanity: i32,
    /// Dignity level.
    pub dignity: i32,
    /// Loyalty towards the cellmate.
    pub loyalty: i32,
    /// Empathy level.
    pub empathy: i32,
    /// In the isolation cell.
    pub is_isolated: bool,
    /// Disconnected.
    pub is_sleeper: bool,
    /// Suffering withdrawal.
    pub in_withdrawal: bool,
    /// Money put into the pot, as decimal text.
    pub pot_contribution: String,
    /// When the row was last written.
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<SqliteSnapshotRow> for SnapshotRow {
    type Error = DbError;

    fn try_from(row: SqliteSnapshotRow) -> Result<Self, Self::Error> {
        let pot_contribution = Decimal::from_str(&row.pot_contribution).map_err(|e| {
            DbError::Corrupt(format!("pot contribution {}: {e}", row.pot_contribution))
        })?;
        Ok(Self {
            game_id: row.game_id,
            prisoner_id: row.prisoner_id,
            hunger: row.hunger,
            thirst: row.thirst,
            sanity: row.sanity,
            dignity: row.dignity,
            loyalty: row.loyalty,
            empathy: row.empathy,
            is_isolated: row.is_isolated,
            is_sleeper: row.is_sleeper,
            in_withdrawal: row.in_withdrawal,
            pot_contribution,
            last_updated: row.last_updated,
        })
    }
}

fn from_sqlite(row: SqliteSnapshotRow) -> Result<PrisonerSnapshot, DbError> {
    SnapshotRow::try_from(row).map(PrisonerSnapshot::from)
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// [`SnapshotStore`] over `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Create a snapshot store sharing `pool`.
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Insert or overwrite one snapshot, on any executor.
    async fn write<'e, E>(executor: E, snapshot: &PrisonerSnapshot) -> Result<(), DbError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let state = &snapshot.state;
        sqlx::query(
            r"INSERT INTO prisoner_snapshots
              (game_id, prisoner_id, hunger, thirst, sanity, dignity, loyalty, empathy, is_isolated, is_sleeper, in_withdrawal, pot_contribution, last_updated)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
              ON CONFLICT (game_id, prisoner_id) DO UPDATE SET
                hunger = EXCLUDED.hunger,
                thirst = EXCLUDED.thirst,
                sanity = EXCLUDED.sanity,
                dignity = EXCLUDED.dignity,
                loyalty = EXCLUDED.loyalty,
                empathy = EXCLUDED.empathy,
                is_isolated = EXCLUDED.is_isolated,
                is_sleeper = EXCLUDED.is_sleeper,
                in_withdrawal = EXCLUDED.in_withdrawal,
                pot_contribution = EXCLUDED.pot_contribution,
                last_updated = EXCLUDED.last_updated",
        )
        .bind(snapshot.game_id.as_str())
        .bind(state.prisoner_id.as_str())
        .bind(state.hunger)
        .bind(state.thirst)
        .bind(state.sanity)
        .bind(state.dignity)
        .bind(state.loyalty)
        .bind(state.empathy)
        .bind(state.is_isolated)
        .bind(state.is_sleeper)
        .bind(state.in_withdrawal)
        .bind(state.pot_contribution)
        .bind(snapshot.last_updated)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn fetch_one(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<Option<PrisonerSnapshot>, DbError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM prisoner_snapshots WHERE game_id = $1 AND prisoner_id = $2"
        );
        let row = sqlx::query_as::<_, SnapshotRow>(&sql)
            .bind(game_id.as_str())
            .bind(prisoner_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PrisonerSnapshot::from))
    }

    async fn fetch_game(&self, game_id: &GameId) -> Result<Vec<PrisonerSnapshot>, DbError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM prisoner_snapshots WHERE game_id = $1 ORDER BY prisoner_id"
        );
        let rows = sqlx::query_as::<_, SnapshotRow>(&sql)
            .bind(game_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PrisonerSnapshot::from).collect())
    }

    async fn replace(
        &self,
        game_id: &GameId,
        snapshots: &[PrisonerSnapshot],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(r"DELETE FROM prisoner_snapshots WHERE game_id = $1")
            .bind(game_id.as_str())
            .execute(&mut *tx)
            .await?;
        for snapshot in snapshots {
            Self::write(&mut *tx, snapshot).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(&self, snapshot: &PrisonerSnapshot) -> Result<(), LedgerError> {
        Self::write(&self.pool, snapshot)
            .await
            .map_err(LedgerError::from)
    }

    async fn get_by_actor(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<Option<PrisonerSnapshot>, LedgerError> {
        self.fetch_one(game_id, prisoner_id)
            .await
            .map_err(LedgerError::from)
    }

    async fn get_by_game(&self, game_id: &GameId) -> Result<Vec<PrisonerSnapshot>, LedgerError> {
        self.fetch_game(game_id).await.map_err(LedgerError::from)
    }

    async fn replace_game(
        &self,
        game_id: &GameId,
        snapshots: &[PrisonerSnapshot],
    ) -> Result<(), LedgerError> {
        self.replace(game_id, snapshots)
            .await
            .map_err(LedgerError::from)
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// [`SnapshotStore`] over `SQLite`.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Create a snapshot store sharing the pool of `db`.
    pub fn new(db: &SqliteDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    async fn write<'e, E>(executor: E, snapshot: &PrisonerSnapshot) -> Result<(), DbError>
    where
        E: sqlx::SqliteExecutor<'e>,
    {
        let state = &snapshot.state;
        sqlx::query(
            r"INSERT INTO prisoner_snapshots
              (game_id, prisoner_id, hunger, thirst, sanity, dignity, loyalty, empathy, is_isolated, is_sleeper, in_withdrawal, pot_contribution, last_updated)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
              ON CONFLICT (game_id, prisoner_id) DO UPDATE SET
                hunger = excluded.hunger,
                thirst = excluded.thirst,
                sanity = excluded.sanity,
                dignity = excluded.dignity,
                loyalty = excluded.loyalty,
                empathy = excluded.empathy,
                is_isolated = excluded.is_isolated,
                is_sleeper = excluded.is_sleeper,
                in_withdrawal = excluded.in_withdrawal,
                pot_contribution = excluded.pot_contribution,
                last_updated = excluded.last_updated",
        )
        .bind(snapshot.game_id.as_str())
        .bind(state.prisoner_id.as_str())
        .bind(state.hunger)
        .bind(state.thirst)
        .bind(state.sanity)
        .bind(state.dignity)
        .bind(state.loyalty)
        .bind(state.empathy)
        .bind(state.is_isolated)
        .bind(state.is_sleeper)
        .bind(state.in_withdrawal)
        .bind(state.pot_contribution.to_string())
        .bind(snapshot.last_updated)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn fetch_one(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<Option<PrisonerSnapshot>, DbError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM prisoner_snapshots WHERE game_id = ?1 AND prisoner_id = ?2"
        );
        let row = sqlx::query_as::<_, SqliteSnapshotRow>(&sql)
            .bind(game_id.as_str())
            .bind(prisoner_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(from_sqlite).transpose()
    }

    async fn fetch_game(&self, game_id: &GameId) -> Result<Vec<PrisonerSnapshot>, DbError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM prisoner_snapshots WHERE game_id = ?1 ORDER BY prisoner_id"
        );
        let rows = sqlx::query_as::<_, SqliteSnapshotRow>(&sql)
            .bind(game_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(from_sqlite).collect()
    }

    async fn replace(
        &self,
        game_id: &GameId,
        snapshots: &[PrisonerSnapshot],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(r"DELETE FROM prisoner_snapshots WHERE game_id = ?1")
            .bind(game_id.as_str())
            .execute(&mut *tx)
            .await?;
        for snapshot in snapshots {
            Self::write(&mut *tx, snapshot).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(&self, snapshot: &PrisonerSnapshot) -> Result<(), LedgerError> {
        Self::write(&self.pool, snapshot)
            .await
            .map_err(LedgerError::from)
    }

    async fn get_by_actor(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
    ) -> Result<Option<PrisonerSnapshot>, LedgerError> {
        self.fetch_one(game_id, prisoner_id)
            .await
            .map_err(LedgerError::from)
    }

    async fn get_by_game(&self, game_id: &GameId) -> Result<Vec<PrisonerSnapshot>, LedgerError> {
        self.fetch_game(game_id).await.map_err(LedgerError::from)
    }

    async fn replace_game(
        &self,
        game_id: &GameId,
        snapshots: &[PrisonerSnapshot],
    ) -> Result<(), LedgerError> {
        self.replace(game_id, snapshots)
            .await
            .map_err(LedgerError::from)
    }
}
