//! Release ramp window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time window over which an experiment's conclusion is rolled out.
///
/// Progress grows linearly from 0 at `start_date` to 1 at `end_date`. A
/// subject whose rank is at or below the current progress receives the
/// conclusion instead of its grouping result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

impl Release {
    /// Create a release window.
    #[must_use]
    pub const fn new(start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    /// Get the ramp start.
    #[must_use]
    pub const fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Get the ramp end.
    #[must_use]
    pub const fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }

    /// Fraction of the ramp elapsed at `now`.
    ///
    /// Negative before the ramp starts and greater than 1 after it ends. A
    /// zero-length ramp jumps straight from `-inf` to `+inf` at its start.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        let span = (self.end_date - self.start_date).num_milliseconds();
        let elapsed = (now - self.start_date).num_milliseconds();
        if span <= 0 {
            return if elapsed >= 0 {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            };
        }
        elapsed as f64 / span as f64
    }
}
