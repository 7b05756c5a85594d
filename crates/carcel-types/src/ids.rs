//! Type-safe identifier wrappers.
//!
//! Events carry a [`Uuid`] identifier generated app-side with UUID v7: a
//! millisecond timestamp prefix followed by random bits, so identifiers
//! are collision-resistant across concurrent creation and sort roughly by
//! creation time in database indexes.
//!
//! Games and actors are identified by opaque strings chosen by the game
//! server (`"P1"`, `"game-2026-03"`). They get their own newtypes so that
//! a game id can never be passed where an actor id is expected.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl core::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

/// Generates a newtype wrapper around an opaque string key.
macro_rules! define_key {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub String);

        impl $name {
            /// Wrap a string key.
            pub fn new(key: impl Into<String>) -> Self {
                Self(key.into())
            }

            /// Borrow the key as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the key is empty (or whitespace only) and therefore missing.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(key: &str) -> Self {
                Self(key.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(key: String) -> Self {
                Self(key)
            }
        }
    };
}

define_id! {
    /// Unique identifier for an event in the ledger. Never reused.
    EventId
}

define_key! {
    /// Identifier of a game session. Partition key for every ledger query.
    GameId
}

define_key! {
    /// Identifier of the entity that caused or suffered an event: a
    /// prisoner, or one of the reserved `SYSTEM_` actors.
    ActorId
}

/// Prefix shared by all environment-driven actors.
pub const SYSTEM_ACTOR_PREFIX: &str = "SYSTEM_";

/// The Twins: the default environment actor for facts nobody caused.
pub const SYSTEM_TWINS: &str = "SYSTEM_TWINS";

impl ActorId {
    /// The default system actor ([`SYSTEM_TWINS`]).
    pub fn system() -> Self {
        Self::new(SYSTEM_TWINS)
    }

    /// Whether this actor is environment-driven rather than a prisoner.
    pub fn is_system(&self) -> bool {
        self.0.starts_with(SYSTEM_ACTOR_PREFIX)
    }
}
