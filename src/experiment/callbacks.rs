//! Host callback seams
//!
//! Eligibility, grouping and event observation are supplied by the host.
//! Closures implement these traits through blanket impls, so most callers
//! never name them directly.

use serde_json::Value;

use super::Experiment;
use crate::{Assignment, Subject};

/// Decides whether a subject qualifies for an experiment.
///
/// Implementations must be synchronous and must not call back into the
/// engine. Returning `Err` is treated as "not eligible".
pub trait Eligibility: Send + Sync {
    /// Evaluate the predicate for `subject`.
    ///
    /// # Errors
    ///
    /// Any host failure; the engine logs it and skips the experiment.
    fn is_eligible(&self, subject: &Subject) -> anyhow::Result<bool>;
}

impl<F> Eligibility for F
where
    F: Fn(&Subject) -> anyhow::Result<bool> + Send + Sync,
{
    fn is_eligible(&self, subject: &Subject) -> anyhow::Result<bool> {
        self(subject)
    }
}

/// Assigns values for an experiment's independent variables.
///
/// The experiment is passed in so implementations can use its salted
/// bucketing helpers, its subject key and its defaults.
pub trait Grouping: Send + Sync {
    /// Produce the assignment for `subject`.
    ///
    /// # Errors
    ///
    /// Any host failure; the engine falls back to the default value.
    fn group(&self, experiment: &Experiment, subject: &Subject) -> anyhow::Result<Assignment>;
}

impl<F> Grouping for F
where
    F: Fn(&Experiment, &Subject) -> anyhow::Result<Assignment> + Send + Sync,
{
    fn group(&self, experiment: &Experiment, subject: &Subject) -> anyhow::Result<Assignment> {
        self(experiment, subject)
    }
}

/// Receives events forwarded by `Engine::mark`.
pub trait Observer: Send + Sync {
    /// Handle one occurrence of the observed event.
    fn observe(&self, experiment: &Experiment, data: &Value, subject: &Subject);
}

impl<F> Observer for F
where
    F: Fn(&Experiment, &Value, &Subject) + Send + Sync,
{
    fn observe(&self, experiment: &Experiment, data: &Value, subject: &Subject) {
        self(experiment, data, subject);
    }
}

pub(super) struct Never;

impl Eligibility for Never {
    fn is_eligible(&self, _subject: &Subject) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub(super) struct EmptyGrouping;

impl Grouping for EmptyGrouping {
    fn group(&self, _experiment: &Experiment, _subject: &Subject) -> anyhow::Result<Assignment> {
        Ok(Assignment::new())
    }
}
