//! Opening a complete persistence stack from configuration.
//!
//! [`Persistence`] owns one backend's worth of stores and the components
//! layered on them: the [`EventLog`] (with its mirror and default
//! deadline), the [`SnapshotProjector`], the [`Reconstructor`] and the
//! [`GameDirectory`]. The memory, `SQLite` and `PostgreSQL` stacks differ
//! only in which stores are plugged in.

use std::sync::Arc;
use std::time::Duration;

use carcel_db::{
    GameDirectory, MemoryGameDirectory, PgEventStore, PgGameDirectory, PgSnapshotStore,
    PostgresConfig, PostgresPool, SqliteConfig, SqliteDb, SqliteEventStore, SqliteGameDirectory,
    SqliteSnapshotStore,
};
use carcel_events::{MemorySnapshotStore, Reconstructor, SnapshotProjector, SnapshotStore};
use carcel_ledger::{Deadline, EventLog, EventMirror, LedgerBackend, LedgerError, MemoryLedger};
use carcel_types::{
    ActorId, Clock, DerivedState, Event, GameCalendar, GameId, GameRecord, NewEvent, SystemClock,
    UuidV7Generator,
};

use crate::config::{BackendKind, CarcelConfig, StorageConfig};
use crate::error::CoreError;

/// Connection handle kept for shutdown.
enum Connection {
    Memory,
    Sqlite(SqliteDb),
    Postgres(PostgresPool),
}

/// The three stores of one medium.
struct Stores {
    connection: Connection,
    ledger: Arc<dyn LedgerBackend>,
    snapshots: Arc<dyn SnapshotStore>,
    directory: Arc<dyn GameDirectory>,
}

impl Stores {
    fn memory() -> Self {
        Self {
            connection: Connection::Memory,
            ledger: Arc::new(MemoryLedger::new()),
            snapshots: Arc::new(MemorySnapshotStore::new()),
            directory: Arc::new(MemoryGameDirectory::new()),
        }
    }

    async fn sqlite(storage: &StorageConfig) -> Result<Self, CoreError> {
        let config = SqliteConfig::new(&storage.sqlite_path)
            .with_max_connections(storage.max_connections)
            .with_busy_timeout(storage.connect_timeout());
        let db = SqliteDb::open(&config).await?;
        if storage.run_migrations {
            db.run_migrations().await?;
        }
        Ok(Self {
            ledger: Arc::new(SqliteEventStore::new(&db)),
            snapshots: Arc::new(SqliteSnapshotStore::new(&db)),
            directory: Arc::new(SqliteGameDirectory::new(&db)),
            connection: Connection::Sqlite(db),
        })
    }

    /// Statements outliving `statement_timeout` are cancelled server-side.
    async fn postgres(
        storage: &StorageConfig,
        statement_timeout: Option<Duration>,
    ) -> Result<Self, CoreError> {
        let config = PostgresConfig::new(storage.postgres_url.as_str())
            .with_max_connections(storage.max_connections)
            .with_acquire_timeout(storage.connect_timeout())
            .with_statement_timeout(statement_timeout);
        let pool = PostgresPool::connect(&config).await?;
        if storage.run_migrations {
            pool.run_migrations().await?;
        }
        Ok(Self {
            ledger: Arc::new(PgEventStore::new(&pool)),
            snapshots: Arc::new(PgSnapshotStore::new(&pool)),
            directory: Arc::new(PgGameDirectory::new(&pool)),
            connection: Connection::Postgres(pool),
        })
    }
}

/// A ready-to-use event store.
pub struct Persistence {
    config: CarcelConfig,
    connection: Connection,
    clock: Arc<dyn Clock>,
    log: EventLog,
    snapshots: Arc<dyn SnapshotStore>,
    directory: Arc<dyn GameDirectory>,
    projector: SnapshotProjector,
    reconstructor: Reconstructor,
}

impl core::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Persistence")
            .field("backend", &self.config.storage.backend)
            .field("log", &self.log)
            .field("snapshots", &self.snapshots.name())
            .field("directory", &self.directory.name())
            .finish_non_exhaustive()
    }
}

impl Persistence {
    /// Open the configured backend, stamping events with the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Db`] if the database cannot be opened or
    /// migrated.
    pub async fn open(config: CarcelConfig) -> Result<Self, CoreError> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open the configured backend with a caller-supplied clock.
    ///
    /// # Errors
    ///
    /// As [`Persistence::open`].
    pub async fn open_with_clock(
        config: CarcelConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let stores = match config.storage.backend {
            BackendKind::Memory => Stores::memory(),
            BackendKind::Sqlite => Stores::sqlite(&config.storage).await?,
            BackendKind::Postgres => {
                Stores::postgres(&config.storage, config.event_log.default_deadline()).await?
            }
        };

        let mut log = EventLog::new(stores.ledger);
        if config.event_log.mirror_capacity > 0 {
            log = log.with_mirror(Arc::new(EventMirror::new(config.event_log.mirror_capacity)));
        }
        if let Some(timeout) = config.event_log.default_deadline() {
            log = log.with_default_timeout(timeout);
        }

        let projector = SnapshotProjector::new(
            log.clone(),
            Arc::clone(&stores.snapshots),
            Arc::clone(&clock),
        );
        let reconstructor = Reconstructor::new(log.clone());

        tracing::info!(
            backend = %config.storage.backend,
            mirror_capacity = config.event_log.mirror_capacity,
            write_through = config.snapshots.write_through,
            "Persistence opened"
        );

        Ok(Self {
            config,
            connection: stores.connection,
            clock,
            log,
            snapshots: stores.snapshots,
            directory: stores.directory,
            projector,
            reconstructor,
        })
    }

    /// The configuration this stack was opened with.
    pub const fn config(&self) -> &CarcelConfig {
        &self.config
    }

    /// The event log facade.
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// The snapshot cache.
    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    /// The game directory.
    pub fn directory(&self) -> &Arc<dyn GameDirectory> {
        &self.directory
    }

    /// The snapshot projector.
    pub const fn projector(&self) -> &SnapshotProjector {
        &self.projector
    }

    /// The reconstructor.
    pub const fn reconstructor(&self) -> &Reconstructor {
        &self.reconstructor
    }

    /// The clock events are stamped with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The calendar of `game`, starting at its creation.
    pub fn calendar_for(&self, game: &GameRecord) -> Option<GameCalendar> {
        self.config
            .calendar
            .day_length()
            .and_then(|length| GameCalendar::new(game.created_at, length))
    }

    /// Append one event, projecting it into the snapshots when
    /// write-through is on.
    pub async fn append(&self, event: &Event, deadline: Deadline) -> Result<u64, LedgerError> {
        if self.config.snapshots.write_through {
            self.projector.append(event, deadline).await
        } else {
            self.log.append(event, deadline).await
        }
    }

    /// Append a batch atomically, projecting it when write-through is on.
    pub async fn append_batch(
        &self,
        events: &[Event],
        deadline: Deadline,
    ) -> Result<Vec<u64>, LedgerError> {
        if self.config.snapshots.write_through {
            self.projector.append_batch(events, deadline).await
        } else {
            self.log.append_batch(events, deadline).await
        }
    }

    /// Stamp `params` with the clock and a fresh id, then append.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Event`] for malformed parameters, or
    /// [`CoreError::Ledger`] if the append fails.
    pub async fn record(&self, params: NewEvent, deadline: Deadline) -> Result<Event, CoreError> {
        let event = Event::new_with(params, self.clock.as_ref(), &UuidV7Generator)?;
        self.append(&event, deadline).await?;
        Ok(event)
    }

    /// A prisoner's current state: from the snapshot cache under
    /// write-through, otherwise folded from the ledger.
    pub async fn current_state(
        &self,
        game_id: &GameId,
        prisoner_id: &ActorId,
        deadline: Deadline,
    ) -> Result<DerivedState, LedgerError> {
        if self.config.snapshots.write_through {
            self.projector.current_state(game_id, prisoner_id).await
        } else {
            self.reconstructor
                .rebuild_prisoner(game_id, prisoner_id, deadline)
                .await
        }
    }

    /// Mark a game finished in the directory and release the projector's
    /// per-game state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Db`] if the directory update fails.
    pub async fn finish_game(&self, game_id: &GameId, winner: Option<&ActorId>) -> Result<(), CoreError> {
        self.directory.finish_game(game_id, winner).await?;
        self.projector.forget(game_id).await;
        tracing::info!(game_id = %game_id, winner = ?winner, "Game finished");
        Ok(())
    }

    /// Close the database pool, if any.
    pub async fn close(self) {
        match self.connection {
            Connection::Memory => {}
            Connection::Sqlite(db) => db.close().await,
            Connection::Postgres(pool) => pool.close().await,
        }
        tracing::info!(backend = %self.config.storage.backend, "Persistence closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use carcel_ledger::EventFilter;
    use carcel_types::{ManualClock, SYSTEM_TWINS};
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn memory_config(extra: &str) -> CarcelConfig {
        CarcelConfig::parse_with_env(extra, no_env).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn memory_stack_projects_on_write() {
        let clock = clock();
        let store = Persistence::open_with_clock(memory_config(""), clock.clone())
            .await
            .unwrap();
        let game = GameId::new("g-1");

        store
            .record(
                NewEvent::new(game.clone(), "SANITY_CHANGE", SYSTEM_TWINS)
                    .target("p-1")
                    .day(1)
                    .with("delta", -20),
                Deadline::NONE,
            )
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        store
            .record(
                NewEvent::new(game.clone(), "STEAL", "p-2")
                    .target("p-1")
                    .day(1)
                    .with("amount", 5),
                Deadline::NONE,
            )
            .await
            .unwrap();

        let cached = store.snapshots().get_by_game(&game).await.unwrap();
        assert_eq!(cached.len(), 2);

        let state = store
            .current_state(&game, &ActorId::new("p-1"), Deadline::NONE)
            .await
            .unwrap();
        assert_eq!(state.sanity, 80);
        let rebuilt = store
            .reconstructor()
            .rebuild_prisoner(&game, &ActorId::new("p-1"), Deadline::NONE)
            .await
            .unwrap();
        assert_eq!(state, rebuilt);
    }

    #[tokio::test]
    async fn finishing_a_game_records_the_winner() {
        let clock = clock();
        let store = Persistence::open_with_clock(memory_config(""), clock.clone())
            .await
            .unwrap();
        let game = GameId::new("g-1");
        store
            .directory()
            .create_game(&GameRecord::new("g-1", clock.now()))
            .await
            .unwrap();
        store
            .record(NewEvent::new(game.clone(), "VOTE", "p-1").day(1), Deadline::NONE)
            .await
            .unwrap();

        store.finish_game(&game, Some(&ActorId::new("p-1"))).await.unwrap();
        let record = store.directory().get_game(&game).await.unwrap().unwrap();
        assert_eq!(record.status, carcel_types::GameStatus::Finished);
        assert_eq!(record.winner, Some(ActorId::new("p-1")));

        let missing = store.finish_game(&GameId::new("g-404"), None).await;
        assert!(matches!(missing, Err(CoreError::Db { .. })));
    }

    #[tokio::test]
    async fn without_write_through_state_is_folded_on_read() {
        let store = Persistence::open_with_clock(
            memory_config("snapshots:\n  write_through: false\n"),
            clock(),
        )
        .await
        .unwrap();
        let game = GameId::new("g-1");
        store
            .record(
                NewEvent::new(game.clone(), "SANITY_CHANGE", SYSTEM_TWINS)
                    .target("p-1")
                    .day(1)
                    .with("delta", -35),
                Deadline::NONE,
            )
            .await
            .unwrap();

        assert!(store.snapshots().get_by_game(&game).await.unwrap().is_empty());
        let state = store
            .current_state(&game, &ActorId::new("p-1"), Deadline::NONE)
            .await
            .unwrap();
        assert_eq!(state.sanity, 65);
    }

    #[tokio::test]
    async fn mirror_follows_configuration() {
        let mirrored = Persistence::open(memory_config("")).await.unwrap();
        assert!(mirrored.log().mirror().is_some());

        let bare = Persistence::open(memory_config("event_log:\n  mirror_capacity: 0\n"))
            .await
            .unwrap();
        assert!(bare.log().mirror().is_none());
    }

    #[tokio::test]
    async fn malformed_event_is_rejected_before_append() {
        let store = Persistence::open(memory_config("")).await.unwrap();
        let err = store
            .record(NewEvent::new("g-1", "SANITY_CHANGE", ""), Deadline::NONE)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Event { .. }));
        assert!(
            store
                .log()
                .replay(&GameId::new("g-1"), Deadline::NONE)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn sqlite_stack_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carcel.db");
        let mut config = memory_config("storage:\n  backend: sqlite\n");
        config.storage.sqlite_path = path;
        let game = GameId::new("g-sqlite");

        let store = Persistence::open_with_clock(config.clone(), clock())
            .await
            .unwrap();
        let event = store
            .record(
                NewEvent::new(game.clone(), "LOYALTY_CHANGE", SYSTEM_TWINS)
                    .target("p-1")
                    .day(2)
                    .with("delta", 10),
                Deadline::NONE,
            )
            .await
            .unwrap();
        store.close().await;

        let reopened = Persistence::open_with_clock(config, clock()).await.unwrap();
        let replay = reopened
            .log()
            .query(&game, &EventFilter::All, Deadline::NONE)
            .await
            .unwrap();
        assert_eq!(replay, vec![event]);
        let state = reopened
            .current_state(&game, &ActorId::new("p-1"), Deadline::NONE)
            .await
            .unwrap();
        assert_eq!(state.loyalty, 60);
        reopened.close().await;
    }

    #[tokio::test]
    async fn calendar_counts_days_from_creation() {
        let store = Persistence::open(memory_config("calendar:\n  day_length_secs: 60\n"))
            .await
            .unwrap();
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap();
        let calendar = store
            .calendar_for(&GameRecord::new("g-1", created))
            .unwrap();
        assert_eq!(calendar.day_at(created), 1);
        assert_eq!(calendar.day_at(created.checked_add_signed(Duration::seconds(150)).unwrap()), 3);
    }
}
