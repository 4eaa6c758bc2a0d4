//! Skew-corrected clock

use chrono::{DateTime, Duration, Utc};

/// Wall clock corrected against a remote time source.
///
/// The skew is measured once, from a pair of readings taken at the same
/// instant, and applied to every later local reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    skew: Duration,
}

impl Clock {
    /// Uncorrected system clock.
    #[must_use]
    pub fn system() -> Self {
        Self {
            skew: Duration::zero(),
        }
    }

    /// Clock corrected by `remote_now - local_now`.
    #[must_use]
    pub fn with_skew(local_now: DateTime<Utc>, remote_now: DateTime<Utc>) -> Self {
        Self {
            skew: remote_now - local_now,
        }
    }

    /// Get the correction applied to local readings.
    #[must_use]
    pub const fn skew(&self) -> Duration {
        self.skew
    }

    /// Correct a local reading, saturating at the representable range.
    #[must_use]
    pub fn correct(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        local.checked_add_signed(self.skew).unwrap_or(if self.skew < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
    }

    /// Corrected current time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.correct(Utc::now())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
