//! Time and identifier collaborators used when events are created.
//!
//! The ledger never reads the system clock directly: event construction
//! takes a [`Clock`] and an [`IdGenerator`] so tests can pin both. The
//! in-fiction day is derived from wall-clock time by a [`GameCalendar`].

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::ids::EventId;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock stopped at `at`.
    pub const fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Move the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut guard) => *guard = at,
            Err(poisoned) => *poisoned.into_inner() = at,
        }
    }

    /// Move the clock forward. Saturates at the representable maximum.
    pub fn advance(&self, by: Duration) {
        let current = self.now();
        self.set(current.checked_add_signed(by).unwrap_or(current));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Source of event identifiers.
pub trait IdGenerator: Send + Sync {
    /// A fresh identifier, never returned before.
    fn next_id(&self) -> EventId;
}

/// UUID v7: millisecond prefix plus random suffix.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next_id(&self) -> EventId {
        EventId::new()
    }
}

/// Maps wall-clock instants to the 1-based in-fiction day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameCalendar {
    started_at: DateTime<Utc>,
    day_length: Duration,
}

impl GameCalendar {
    /// A calendar whose day 1 starts at `started_at`.
    ///
    /// Returns `None` if `day_length` is not positive.
    pub fn new(started_at: DateTime<Utc>, day_length: Duration) -> Option<Self> {
        (day_length > Duration::zero()).then_some(Self {
            started_at,
            day_length,
        })
    }

    /// When day 1 began.
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The day in progress at `at`. Instants before the start are day 1.
    pub fn day_at(&self, at: DateTime<Utc>) -> u32 {
        let elapsed = at.signed_duration_since(self.started_at);
        if elapsed <= Duration::zero() {
            return 1;
        }
        let whole_days = elapsed
            .num_milliseconds()
            .checked_div(self.day_length.num_milliseconds())
            .unwrap_or(0);
        u32::try_from(whole_days)
            .unwrap_or(u32::MAX)
            .saturating_add(1)
    }

    /// The day in progress according to `clock`.
    pub fn today(&self, clock: &dyn Clock) -> u32 {
        self.day_at(clock.now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(start());
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start() + Duration::minutes(5));
    }

    #[test]
    fn calendar_counts_whole_days_from_one() {
        let calendar = GameCalendar::new(start(), Duration::minutes(20)).unwrap();
        assert_eq!(calendar.day_at(start()), 1);
        assert_eq!(calendar.day_at(start() + Duration::minutes(19)), 1);
        assert_eq!(calendar.day_at(start() + Duration::minutes(20)), 2);
        assert_eq!(calendar.day_at(start() + Duration::minutes(65)), 4);
        assert_eq!(calendar.day_at(start() - Duration::hours(1)), 1);
    }

    #[test]
    fn calendar_rejects_empty_days() {
        assert!(GameCalendar::new(start(), Duration::zero()).is_none());
    }

    #[test]
    fn v7_ids_are_distinct() {
        let ids = UuidV7Generator;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
