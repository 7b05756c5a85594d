//! Enumeration types: the event kind catalogue and the small closed sets
//! stored alongside games and prisoners.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Generates the [`EventKind`] enum together with its wire tags.
///
/// Each known kind maps to exactly one `SCREAMING_SNAKE_CASE` tag. Tags
/// that are not in the table parse into [`EventKind::Other`] so that facts
/// written by a newer game server survive a round trip through an older
/// reader unchanged.
macro_rules! event_kinds {
    (
        $(
            $(#[$meta:meta])*
            $variant:ident => $tag:literal,
        )*
    ) => {
        /// The category of a fact recorded in the ledger.
        ///
        /// Serialized as its tag string (e.g. `"SANITY_CHANGE"`).
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum EventKind {
            $(
                $(#[$meta])*
                $variant,
            )*
            /// A kind this build does not know. The tag is kept verbatim.
            Other(String),
        }

        impl EventKind {
            /// Every kind this build knows, in catalogue order.
            pub fn known_kinds() -> Vec<Self> {
                vec![$(Self::$variant,)*]
            }

            /// The wire tag of this kind.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $tag,)*
                    Self::Other(tag) => tag,
                }
            }

            /// Parse a wire tag. Never fails: unknown tags become [`EventKind::Other`].
            pub fn parse(tag: &str) -> Self {
                match tag {
                    $($tag => Self::$variant,)*
                    other => Self::Other(other.to_owned()),
                }
            }
        }
    };
}

event_kinds! {
    /// A prisoner ate or drank.
    ResourceIntake => "RESOURCE_INTAKE",
    /// The Twins played noise through the speakers.
    NoiseEvent => "NOISE_EVENT",
    /// A social interaction between two prisoners.
    SocialAction => "SOCIAL_ACTION",
    /// A vote cast by a prisoner or the audience.
    Vote => "VOTE",
    /// A prisoner betrayed another.
    Betrayal => "BETRAYAL",
    /// A prisoner's privacy was exposed.
    PrivacyBreach => "PRIVACY_BREACH",
    /// The game clock advanced.
    TimeTick => "TIME_TICK",
    /// A prisoner's sanity changed.
    SanityChange => "SANITY_CHANGE",
    /// A prisoner's loyalty towards their cellmate changed.
    LoyaltyChange => "LOYALTY_CHANGE",
    /// A prisoner used the toilet in full view.
    ToiletUse => "TOILET_USE",
    /// A cell door was locked.
    DoorLock => "DOOR_LOCK",
    /// A cell door was opened.
    DoorOpen => "DOOR_OPEN",
    /// An unavoidable sound was played at a prisoner.
    AudioTorture => "AUDIO_TORTURE",
    /// A prisoner made an aggressive gesture.
    AggressiveEmote => "AGGRESSIVE_EMOTE",
    /// A prisoner banged the bars during lockdown.
    LockdownBang => "LOCKDOWN_BANG",
    /// A prisoner insulted another.
    Insult => "INSULT",
    /// A prisoner stole from another.
    Steal => "STEAL",
    /// The final dilemma was presented.
    FinalDilemmaStart => "FINAL_DILEMMA_START",
    /// A prisoner locked in their final dilemma decision.
    FinalDilemmaDecision => "FINAL_DILEMMA_DECISION",
    /// The oracle told a prisoner something painful.
    OraclePainfulTruth => "ORACLE_PAINFUL_TRUTH",
    /// A prisoner entered or left the isolation cell.
    IsolationChanged => "ISOLATION_CHANGED",
    /// A prisoner entered or left withdrawal.
    WithdrawalChanged => "WITHDRAWAL_CHANGED",
    /// A player connected or disconnected (sleeper state).
    ConnectionChanged => "CONNECTION_CHANGED",
    /// An item moved between prisoners.
    ItemTransfer => "ITEM_TRANSFER",
    /// A prisoner used up an item.
    ItemConsumed => "ITEM_CONSUMED",
    /// A prisoner informed on another.
    Snitch => "SNITCH",
    /// A hidden item was found.
    LootAcquired => "LOOT_ACQUIRED",
    /// A prisoner meditated.
    Meditate => "MEDITATE",
    /// An audience poll was opened.
    PollCreated => "POLL_CREATED",
    /// An audience poll was closed.
    PollResolved => "POLL_RESOLVED",
}

impl EventKind {
    /// Whether this build has a named variant for the kind.
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Whether the kind is missing (an empty [`EventKind::Other`] tag).
    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(tag) => tag,
            known => known.as_str().to_owned(),
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of how an event affects the observing prisoner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "bindings/")]
pub enum ImpactClass {
    /// Good news for the prisoner.
    Positive,
    /// Bad news for the prisoner.
    Negative,
    /// Informational.
    Neutral,
}

impl ImpactClass {
    /// Classify an event by kind alone.
    ///
    /// Payload magnitude and direction are ignored: a `RESOURCE_INTAKE` with
    /// a negative delta is still `Positive`, a `SANITY_CHANGE` that restores
    /// sanity is still `Negative`.
    pub const fn of(kind: &EventKind) -> Self {
        match kind {
            EventKind::ResourceIntake | EventKind::LootAcquired | EventKind::Meditate => {
                Self::Positive
            }
            EventKind::NoiseEvent
            | EventKind::SanityChange
            | EventKind::Betrayal
            | EventKind::AudioTorture
            | EventKind::PrivacyBreach
            | EventKind::Insult
            | EventKind::Steal
            | EventKind::Snitch
            | EventKind::LockdownBang
            | EventKind::OraclePainfulTruth => Self::Negative,
            _ => Self::Neutral,
        }
    }
}

/// Prisoner class, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum Archetype {
    /// Iron stomach, regains sanity when alone.
    Veteran,
    /// Cannot eat solids.
    Mystic,
    /// Needs less sleep.
    Chaos,
    /// Feeds on conflict.
    Toxic,
    /// Short fuse.
    Explosive,
    /// Thefts surface late.
    Deceiver,
}

impl Archetype {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Veteran => "Veteran",
            Self::Mystic => "Mystic",
            Self::Chaos => "Chaos",
            Self::Toxic => "Toxic",
            Self::Explosive => "Explosive",
            Self::Deceiver => "Deceiver",
        }
    }
}

impl core::str::FromStr for Archetype {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Veteran" => Ok(Self::Veteran),
            "Mystic" => Ok(Self::Mystic),
            "Chaos" => Ok(Self::Chaos),
            "Toxic" => Ok(Self::Toxic),
            "Explosive" => Ok(Self::Explosive),
            "Deceiver" => Ok(Self::Deceiver),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

/// Lifecycle of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "bindings/")]
pub enum GameStatus {
    /// Created, waiting for prisoners.
    Lobby,
    /// In progress.
    Running,
    /// Over. A winner may have been recorded.
    Finished,
}

impl GameStatus {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lobby => "LOBBY",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        }
    }
}

impl core::str::FromStr for GameStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOBBY" => Ok(Self::Lobby),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

/// A stored string did not name any variant of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_tag_parses_back_to_its_kind() {
        for kind in EventKind::known_kinds() {
            assert_eq!(EventKind::parse(kind.as_str()), kind);
            assert!(kind.is_known());
        }
    }

    #[test]
    fn unknown_tags_are_preserved() {
        let kind = EventKind::parse("RED_PHONE_ANSWER");
        assert_eq!(kind, EventKind::Other("RED_PHONE_ANSWER".to_owned()));
        assert_eq!(kind.as_str(), "RED_PHONE_ANSWER");
        assert!(!kind.is_known());
    }

    #[test]
    fn kind_serializes_as_tag() {
        let json = serde_json::to_string(&EventKind::SanityChange).ok();
        assert_eq!(json.as_deref(), Some("\"SANITY_CHANGE\""));
        let back: Option<EventKind> = serde_json::from_str("\"ELIXIR_GIVEN\"").ok();
        assert_eq!(back, Some(EventKind::Other("ELIXIR_GIVEN".to_owned())));
    }

    #[test]
    fn impact_ignores_payload_direction() {
        assert_eq!(ImpactClass::of(&EventKind::ResourceIntake), ImpactClass::Positive);
        assert_eq!(ImpactClass::of(&EventKind::SanityChange), ImpactClass::Negative);
        assert_eq!(ImpactClass::of(&EventKind::TimeTick), ImpactClass::Neutral);
        assert_eq!(
            ImpactClass::of(&EventKind::Other("X".to_owned())),
            ImpactClass::Neutral
        );
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [GameStatus::Lobby, GameStatus::Running, GameStatus::Finished] {
            assert_eq!(status.as_str().parse::<GameStatus>().ok(), Some(status));
        }
        assert!("Warden".parse::<Archetype>().is_err());
    }
}
