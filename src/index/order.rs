//! Priority orderings
//!
//! Ties are broken by each experiment's name hash, never by insertion
//! order, so registration order cannot change priority.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::experiment::Experiment;

/// Ascending by `start_date`, then by name hash.
pub fn by_start_date(a: &Experiment, b: &Experiment) -> Ordering {
    a.start_date()
        .cmp(&b.start_date())
        .then_with(|| a.name_hash().cmp(&b.name_hash()))
}

/// Ascending by [`release_date`], then by name hash.
pub fn by_release_date(a: &Experiment, b: &Experiment) -> Ordering {
    release_date(a)
        .cmp(&release_date(b))
        .then_with(|| a.name_hash().cmp(&b.name_hash()))
}

/// The later of the end date and the release ramp's start.
pub fn release_date(x: &Experiment) -> DateTime<Utc> {
    x.release()
        .map_or(x.end_date(), |release| x.end_date().max(release.start_date()))
}

/// True once the experiment has ended or its release ramp has begun.
pub fn is_released(x: &Experiment, now: DateTime<Utc>) -> bool {
    x.end_date() < now || x.release().is_some_and(|release| release.start_date() < now)
}
