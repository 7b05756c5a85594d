//! The game directory: `games` and `prisoners` tables.
//!
//! Unlike the ledger these are ordinary mutable records (the game clock,
//! status, winner and the engine's view of each prisoner's pot). They are
//! metadata about sessions, not facts, and are never replayed.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sqlx::{PgPool, SqlitePool};

use carcel_types::{ActorId, Archetype, GameId, GameRecord, GameStatus, PrisonerRecord};

use crate::error::DbError;
use crate::event_store::day_from_db;
use crate::postgres::PostgresPool;
use crate::sqlite::SqliteDb;

/// Hours in an in-fiction day.
pub const HOURS_PER_DAY: u32 = 24;

/// Session metadata shared by the game engine and operators.
#[async_trait]
pub trait GameDirectory: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Register a new game.
    ///
    /// Fails with [`DbError::AlreadyExists`] if the id is taken.
    async fn create_game(&self, game: &GameRecord) -> Result<(), DbError>;

    /// Look up a game.
    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, DbError>;

    /// Move the game clock and mark a lobby game as running.
    ///
    /// Fails with [`DbError::InvalidInput`] if `hour` is not below
    /// [`HOURS_PER_DAY`], or [`DbError::NotFound`] for an unknown game.
    async fn update_clock(&self, game_id: &GameId, day: u32, hour: u32) -> Result<(), DbError>;

    /// Mark the game finished, recording the winner if there is one.
    async fn finish_game(&self, game_id: &GameId, winner: Option<&ActorId>)
    -> Result<(), DbError>;

    /// Add a prisoner to an existing game.
    ///
    /// Fails with [`DbError::NotFound`] if the game does not exist, or
    /// [`DbError::AlreadyExists`] if the prisoner is already registered.
    async fn register_prisoner(&self, prisoner: &PrisonerRecord) -> Result<(), DbError>;

    /// Overwrite the pot contribution the engine last computed.
    async fn update_pot_contribution(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        amount: Decimal,
    ) -> Result<(), DbError>;

    /// Prisoners of a game, ordered by id.
    async fn list_prisoners(&self, game_id: &GameId) -> Result<Vec<PrisonerRecord>, DbError>;
}

fn check_hour(hour: u32) -> Result<(), DbError> {
    if hour < HOURS_PER_DAY {
        Ok(())
    } else {
        Err(DbError::InvalidInput(format!(
            "hour {hour} is outside 0..{HOURS_PER_DAY}"
        )))
    }
}

fn game_not_found(game_id: &GameId) -> DbError {
    DbError::NotFound {
        entity: "game",
        id: game_id.to_string(),
    }
}

fn prisoner_not_found(prisoner_id: &ActorId) -> DbError {
    DbError::NotFound {
        entity: "prisoner",
        id: prisoner_id.to_string(),
    }
}

/// Translate constraint violations of a prisoner insert.
fn on_register(err: sqlx::Error, prisoner: &PrisonerRecord) -> DbError {
    let err = DbError::from(err);
    if err.is_foreign_key_violation() {
        game_not_found(&prisoner.game_id)
    } else if err.is_unique_violation() {
        DbError::AlreadyExists {
            entity: "prisoner",
            id: prisoner.id.to_string(),
        }
    } else {
        err
    }
}

fn on_create(err: sqlx::Error, game: &GameRecord) -> DbError {
    let err = DbError::from(err);
    if err.is_unique_violation() {
        DbError::AlreadyExists {
            entity: "game",
            id: game.id.to_string(),
        }
    } else {
        err
    }
}

/// A row from the `games` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GameRow {
    /// Game identifier.
    pub id: String,
    /// Current day.
    pub current_day: i64,
    /// Current hour.
    pub current_hour: i64,
    /// Status tag.
    pub status: String,
    /// Winner, once finished.
    pub winner_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<GameRow> for GameRecord {
    type Error = DbError;

    fn try_from(row: GameRow) -> Result<Self, Self::Error> {
        let status = GameStatus::from_str(&row.status)
            .map_err(|e| DbError::Corrupt(format!("game status: {e}")))?;
        Ok(Self {
            id: GameId::new(row.id),
            current_day: day_from_db(row.current_day)?,
            current_hour: u32::try_from(row.current_hour)
                .map_err(|e| DbError::Corrupt(format!("hour {}: {e}", row.current_hour)))?,
            status,
            winner: row.winner_id.map(ActorId::new),
            created_at: row.created_at,
        })
    }
}

fn prisoner_from_parts(
    id: String,
    game_id: String,
    name: String,
    archetype: &str,
    pot_contribution: Decimal,
) -> Result<PrisonerRecord, DbError> {
    let archetype = Archetype::from_str(archetype)
        .map_err(|e| DbError::Corrupt(format!("archetype: {e}")))?;
    Ok(PrisonerRecord {
        id: ActorId::new(id),
        game_id: GameId::new(game_id),
        name,
        archetype,
        pot_contribution,
    })
}

/// A row from the `prisoners` table (`PostgreSQL`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PrisonerRow {
    /// Prisoner identifier.
    pub id: String,
    /// Game identifier.
    pub game_id: String,
    /// Display name.
    pub name: String,
    /// Archetype tag.
    pub archetype: String,
    /// Pot contribution.
    pub pot_contribution: Decimal,
}

/// A row from the `prisoners` table (`SQLite`, pot as decimal text).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlitePrisonerRow {
    /// Prisoner identifier.
    pub id: String,
    /// Game identifier.
    pub game_id: String,
    /// Display name.
    pub name: String,
    /// Archetype tag.
    pub archetype: String,
    /// Pot contribution as decimal text.
    pub pot_contribution: String,
}

// =============================================================================
// In-memory
// =============================================================================

/// Transient [`GameDirectory`] for tests and the memory backend.
#[derive(Debug, Default)]
pub struct MemoryGameDirectory {
    games: DashMap<GameId, GameRecord>,
    prisoners: DashMap<(GameId, ActorId), PrisonerRecord>,
}

impl MemoryGameDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GameDirectory for MemoryGameDirectory {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_game(&self, game: &GameRecord) -> Result<(), DbError> {
        match self.games.entry(game.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DbError::AlreadyExists {
                entity: "game",
                id: game.id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(game.clone());
                Ok(())
            }
        }
    }

    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, DbError> {
        Ok(self.games.get(game_id).map(|g| g.value().clone()))
    }

    async fn update_clock(&self, game_id: &GameId, day: u32, hour: u32) -> Result<(), DbError> {
        check_hour(hour)?;
        let mut game = self
            .games
            .get_mut(game_id)
            .ok_or_else(|| game_not_found(game_id))?;
        game.current_day = day;
        game.current_hour = hour;
        if game.status == GameStatus::Lobby {
            game.status = GameStatus::Running;
        }
        Ok(())
    }

    async fn finish_game(
        &self,
        game_id: &GameId,
        winner: Option<&ActorId>,
    ) -> Result<(), DbError> {
        let mut game = self
            .games
            .get_mut(game_id)
            .ok_or_else(|| game_not_found(game_id))?;
        game.status = GameStatus::Finished;
        game.winner = winner.cloned();
        Ok(())
    }

    async fn register_prisoner(&self, prisoner: &PrisonerRecord) -> Result<(), DbError> {
        if !self.games.contains_key(&prisoner.game_id) {
            return Err(game_not_found(&prisoner.game_id));
        }
        match self
            .prisoners
            .entry((prisoner.game_id.clone(), prisoner.id.clone()))
        {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DbError::AlreadyExists {
                entity: "prisoner",
                id: prisoner.id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(prisoner.clone());
                Ok(())
            }
        }
    }

    async fn update_pot_contribution(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        amount: Decimal,
    ) -> Result<(), DbError> {
        let mut prisoner = self
            .prisoners
            .get_mut(&(game_id.clone(), prisoner_id.clone()))
            .ok_or_else(|| prisoner_not_found(prisoner_id))?;
        prisoner.pot_contribution = amount;
        Ok(())
    }

    async fn list_prisoners(&self, game_id: &GameId) -> Result<Vec<PrisonerRecord>, DbError> {
        let mut prisoners: Vec<PrisonerRecord> = self
            .prisoners
            .iter()
            .filter(|row| &row.key().0 == game_id)
            .map(|row| row.value().clone())
            .collect();
        prisoners.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(prisoners)
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// [`GameDirectory`] over `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PgGameDirectory {
    pool: PgPool,
}

impl PgGameDirectory {
    /// Create a directory sharing `pool`.
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }
}

#[async_trait]
impl GameDirectory for PgGameDirectory {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn create_game(&self, game: &GameRecord) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO games (id, current_day, current_hour, status, winner_id, created_at)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(game.id.as_str())
        .bind(i64::from(game.current_day))
        .bind(i64::from(game.current_hour))
        .bind(game.status.as_str())
        .bind(game.winner.as_ref().map(ActorId::as_str))
        .bind(game.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| on_create(e, game))?;
        tracing::debug!(game_id = %game.id, "Created game");
        Ok(())
    }

    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, DbError> {
        let row = sqlx::query_as::<_, GameRow>(
            r"SELECT id, current_day, current_hour, status, winner_id, created_at
              FROM games
              WHERE id = $1",
        )
        .bind(game_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(GameRecord::try_from).transpose()
    }

    async fn update_clock(&self, game_id: &GameId, day: u32, hour: u32) -> Result<(), DbError> {
        check_hour(hour)?;
        let result = sqlx::query(
            r"UPDATE games
              SET current_day = $2,
                  current_hour = $3,
                  status = CASE WHEN status = 'LOBBY' THEN 'RUNNING' ELSE status END
              WHERE id = $1",
        )
        .bind(game_id.as_str())
        .bind(i64::from(day))
        .bind(i64::from(hour))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(game_not_found(game_id));
        }
        Ok(())
    }

    async fn finish_game(
        &self,
        game_id: &GameId,
        winner: Option<&ActorId>,
    ) -> Result<(), DbError> {
        let result =
            sqlx::query(r"UPDATE games SET status = 'FINISHED', winner_id = $2 WHERE id = $1")
                .bind(game_id.as_str())
                .bind(winner.map(ActorId::as_str))
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(game_not_found(game_id));
        }
        tracing::info!(game_id = %game_id, winner = ?winner, "Game finished");
        Ok(())
    }

    async fn register_prisoner(&self, prisoner: &PrisonerRecord) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO prisoners (id, game_id, name, archetype, pot_contribution)
              VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(prisoner.id.as_str())
        .bind(prisoner.game_id.as_str())
        .bind(&prisoner.name)
        .bind(prisoner.archetype.as_str())
        .bind(prisoner.pot_contribution)
        .execute(&self.pool)
        .await
        .map_err(|e| on_register(e, prisoner))?;
        Ok(())
    }

    async fn update_pot_contribution(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        amount: Decimal,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r"UPDATE prisoners SET pot_contribution = $3 WHERE game_id = $1 AND id = $2",
        )
        .bind(game_id.as_str())
        .bind(prisoner_id.as_str())
        .bind(amount)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(prisoner_not_found(prisoner_id));
        }
        Ok(())
    }

    async fn list_prisoners(&self, game_id: &GameId) -> Result<Vec<PrisonerRecord>, DbError> {
        let rows = sqlx::query_as::<_, PrisonerRow>(
            r"SELECT id, game_id, name, archetype, pot_contribution
              FROM prisoners
              WHERE game_id = $1
              ORDER BY id",
        )
        .bind(game_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                prisoner_from_parts(
                    row.id,
                    row.game_id,
                    row.name,
                    &row.archetype,
                    row.pot_contribution,
                )
            })
            .collect()
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// [`GameDirectory`] over `SQLite`.
#[derive(Debug, Clone)]
pub struct SqliteGameDirectory {
    pool: SqlitePool,
}

impl SqliteGameDirectory {
    /// Create a directory sharing the pool of `db`.
    pub fn new(db: &SqliteDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl GameDirectory for SqliteGameDirectory {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_game(&self, game: &GameRecord) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO games (id, current_day, current_hour, status, winner_id, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(game.id.as_str())
        .bind(i64::from(game.current_day))
        .bind(i64::from(game.current_hour))
        .bind(game.status.as_str())
        .bind(game.winner.as_ref().map(ActorId::as_str))
        .bind(game.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| on_create(e, game))?;
        tracing::debug!(game_id = %game.id, "Created game");
        Ok(())
    }

    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, DbError> {
        let row = sqlx::query_as::<_, GameRow>(
            r"SELECT id, current_day, current_hour, status, winner_id, created_at
              FROM games
              WHERE id = ?1",
        )
        .bind(game_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(GameRecord::try_from).transpose()
    }

    async fn update_clock(&self, game_id: &GameId, day: u32, hour: u32) -> Result<(), DbError> {
        check_hour(hour)?;
        let result = sqlx::query(
            r"UPDATE games
              SET current_day = ?2,
                  current_hour = ?3,
                  status = CASE WHEN status = 'LOBBY' THEN 'RUNNING' ELSE status END
              WHERE id = ?1",
        )
        .bind(game_id.as_str())
        .bind(i64::from(day))
        .bind(i64::from(hour))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(game_not_found(game_id));
        }
        Ok(())
    }

    async fn finish_game(
        &self,
        game_id: &GameId,
        winner: Option<&ActorId>,
    ) -> Result<(), DbError> {
        let result =
            sqlx::query(r"UPDATE games SET status = 'FINISHED', winner_id = ?2 WHERE id = ?1")
                .bind(game_id.as_str())
                .bind(winner.map(ActorId::as_str))
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(game_not_found(game_id));
        }
        tracing::info!(game_id = %game_id, winner = ?winner, "Game finished");
        Ok(())
    }

    async fn register_prisoner(&self, prisoner: &PrisonerRecord) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO prisoners (id, game_id, name, archetype, pot_contribution)
              VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(prisoner.id.as_str())
        .bind(prisoner.game_id.as_str())
        .bind(&prisoner.name)
        .bind(prisoner.archetype.as_str())
        .bind(prisoner.pot_contribution.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| on_register(e, prisoner))?;
        Ok(())
    }

    async fn update_pot_contribution(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        amount: Decimal,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r"UPDATE prisoners SET pot_contribution = ?3 WHERE game_id = ?1 AND id = ?2",
        )
        .bind(game_id.as_str())
        .bind(prisoner_id.as_str())
        .bind(amount.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(prisoner_not_found(prisoner_id));
        }
        Ok(())
    }

    async fn list_prisoners(&self, game_id: &GameId) -> Result<Vec<PrisonerRecord>, DbError> {
        let rows = sqlx::query_as::<_, SqlitePrisonerRow>(
            r"SELECT id, game_id, name, archetype, pot_contribution
              FROM prisoners
              WHERE game_id = ?1
              ORDER BY id",
        )
        .bind(game_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let pot = Decimal::from_str(&row.pot_contribution).map_err(|e| {
                    DbError::Corrupt(format!("pot contribution {}: {e}", row.pot_contribution))
                })?;
                prisoner_from_parts(row.id, row.game_id, row.name, &row.archetype, pot)
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn prisoner(game: &str, id: &str) -> PrisonerRecord {
        PrisonerRecord {
            id: ActorId::from(id),
            game_id: GameId::from(game),
            name: id.to_lowercase(),
            archetype: Archetype::Veteran,
            pot_contribution: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn clock_update_starts_a_lobby_game() {
        let dir = MemoryGameDirectory::new();
        let game = GameId::from("g1");
        dir.create_game(&GameRecord::new("g1", Utc::now())).await.unwrap();
        dir.update_clock(&game, 2, 7).await.unwrap();
        let record = dir.get_game(&game).await.unwrap().unwrap();
        assert_eq!((record.current_day, record.current_hour), (2, 7));
        assert_eq!(record.status, GameStatus::Running);
        assert!(matches!(
            dir.update_clock(&game, 2, 24).await,
            Err(DbError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn prisoners_need_an_existing_game() {
        let dir = MemoryGameDirectory::new();
        assert!(matches!(
            dir.register_prisoner(&prisoner("nope", "P1")).await,
            Err(DbError::NotFound { entity: "game", .. })
        ));
        dir.create_game(&GameRecord::new("g1", Utc::now())).await.unwrap();
        dir.register_prisoner(&prisoner("g1", "P2")).await.unwrap();
        dir.register_prisoner(&prisoner("g1", "P1")).await.unwrap();
        assert!(matches!(
            dir.register_prisoner(&prisoner("g1", "P1")).await,
            Err(DbError::AlreadyExists { .. })
        ));
        let ids: Vec<String> = dir
            .list_prisoners(&GameId::from("g1"))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn finish_records_winner() {
        let dir = MemoryGameDirectory::new();
        let game = GameId::from("g1");
        dir.create_game(&GameRecord::new("g1", Utc::now())).await.unwrap();
        dir.finish_game(&game, Some(&ActorId::from("P2"))).await.unwrap();
        let record = dir.get_game(&game).await.unwrap().unwrap();
        assert_eq!(record.status, GameStatus::Finished);
        assert_eq!(record.winner, Some(ActorId::from("P2")));
        assert!(dir.finish_game(&GameId::from("other"), None).await.is_err());
    }
}
