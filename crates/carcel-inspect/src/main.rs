//! Operator tool for a Carcel event store.
//!
//! Opens the store described by `carcel.yaml` (plus environment
//! overrides) and runs one subcommand, printing its report as JSON on
//! stdout.
//!
//! # Subcommands
//!
//! - `replay` -- a game's events in replay order, optionally filtered (VAR export)
//! - `recap` -- a prisoner's login recap
//! - `state` -- current state of one prisoner, or a fresh fold of the whole game
//! - `rebuild` -- replace a game's snapshots with a fresh replay
//! - `verify` -- compare snapshots with the ledger; exits non-zero on drift
//! - `reveal` -- mark one event as shown to the audience
//! - `game` -- a game's directory entry and roster

mod commands;
mod error;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use carcel_core::{CarcelConfig, Persistence, init_tracing};
use carcel_ledger::Deadline;
use carcel_types::{ActorId, GameId};

use crate::commands::FilterArgs;
use crate::error::InspectError;

#[derive(Debug, Parser)]
#[command(name = "carcel-inspect")]
#[command(about = "Inspect and repair a Carcel event store", long_about = None)]
struct Cli {
    /// Configuration file. Missing means defaults.
    #[arg(long, short, default_value = "carcel.yaml")]
    config: PathBuf,

    /// Storage backend (memory, sqlite, postgres), overriding the file.
    #[arg(long)]
    backend: Option<String>,

    /// Deadline for each store operation, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a game's events in replay order.
    Replay {
        /// Game identifier.
        #[arg(long)]
        game: String,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print a prisoner's recap.
    Recap {
        /// Game identifier.
        #[arg(long)]
        game: String,

        /// Prisoner identifier.
        #[arg(long)]
        prisoner: String,

        /// First in-fiction day to include.
        #[arg(long, default_value_t = 1)]
        since_day: u32,
    },
    /// Print current state.
    State {
        /// Game identifier.
        #[arg(long)]
        game: String,

        /// Only this prisoner. Without it, every prisoner is folded afresh.
        #[arg(long)]
        prisoner: Option<String>,
    },
    /// Replace a game's snapshots with a fresh replay.
    Rebuild {
        /// Game identifier.
        #[arg(long)]
        game: String,
    },
    /// Compare a game's snapshots with its ledger.
    Verify {
        /// Game identifier.
        #[arg(long)]
        game: String,
    },
    /// Mark an event as revealed to the audience.
    Reveal {
        /// Event identifier (UUID).
        #[arg(long)]
        event: String,
    },
    /// Print a game's directory entry and roster.
    Game {
        /// Game identifier.
        #[arg(long)]
        game: String,
    },
}

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, the store, or the command fails,
/// or if `verify` finds drift.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = CarcelConfig::from_file_or_default(&cli.config)?;
    if let Some(backend) = &cli.backend {
        config.storage.backend = backend.parse()?;
        config.validate()?;
    }
    init_tracing(&config.logging)?;

    let deadline = cli
        .timeout_ms
        .map_or(Deadline::NONE, |ms| Deadline::after(Duration::from_millis(ms)));

    let store = Persistence::open(config).await?;
    let result = run(&store, cli.command, deadline).await;
    store.close().await;
    result.map_err(Into::into)
}

async fn run(store: &Persistence, command: Command, deadline: Deadline) -> Result<(), InspectError> {
    match command {
        Command::Replay { game, filter } => {
            let report =
                commands::replay(store, &GameId::new(game), &filter.to_filter(), deadline).await?;
            emit(&report)
        }
        Command::Recap {
            game,
            prisoner,
            since_day,
        } => {
            let outcome = commands::recap(
                store,
                &GameId::new(game),
                &ActorId::new(prisoner),
                since_day,
                deadline,
            )
            .await;
            emit(&outcome)
        }
        Command::State { game, prisoner } => {
            let prisoner = prisoner.map(ActorId::new);
            let states =
                commands::state(store, &GameId::new(game), prisoner.as_ref(), deadline).await?;
            emit(&states)
        }
        Command::Rebuild { game } => {
            emit(&commands::rebuild(store, &GameId::new(game), deadline).await?)
        }
        Command::Verify { game } => {
            let report = commands::verify(store, &GameId::new(game), deadline).await?;
            emit(&report)?;
            if report.drifted.is_empty() {
                Ok(())
            } else {
                Err(InspectError::Drift {
                    count: report.drifted.len(),
                })
            }
        }
        Command::Reveal { event } => emit(&commands::reveal(store, &event, deadline).await?),
        Command::Game { game } => emit(&commands::game(store, &GameId::new(game)).await?),
    }
}

fn emit<T: Serialize>(value: &T) -> Result<(), InspectError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
