//! Caller-supplied deadlines.
//!
//! Every ledger operation takes a [`Deadline`]. When it passes, the
//! in-flight backend future is dropped and the caller gets
//! [`LedgerError::DeadlineExceeded`]. A dropped SQL transaction rolls back;
//! a dropped single-statement insert may or may not have committed, which
//! is why a timed-out append must be retried with the same event id.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::LedgerError;

/// An optional point in time after which an operation is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub const NONE: Self = Self(None);

    /// Expire `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Expire at `instant`.
    pub const fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// The expiry instant, if any.
    pub const fn instant(self) -> Option<Instant> {
        self.0
    }

    /// Whether a deadline is set.
    pub const fn is_set(self) -> bool {
        self.0.is_some()
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(self) -> bool {
        self.0.is_some_and(|at| at <= Instant::now())
    }

    /// This deadline, or `fallback` from now if none is set.
    pub fn or_timeout(self, fallback: Option<Duration>) -> Self {
        match (self.0, fallback) {
            (Some(_), _) | (None, None) => self,
            (None, Some(timeout)) => Self::after(timeout),
        }
    }

    /// Drive `operation` to completion unless the deadline passes first.
    pub async fn run<T, F>(self, operation: &'static str, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        let Some(at) = self.0 else {
            return fut.await;
        };
        tokio::time::timeout_at(at, fut).await.map_err(|elapsed| {
            tracing::warn!(operation, %elapsed, "ledger operation hit its deadline");
            LedgerError::DeadlineExceeded { operation }
        })?
    }
}
