//! Engine - the `choose` resolution protocol
//!
//! The engine owns two [`ExperimentIndex`]es: the catalog of every
//! configured experiment, and the enrolled subset the subject pool has been
//! bucketed into. Resolution tries, in order:
//!
//! 1. **Sticky**: the first live experiment already enrolled for the variable
//! 2. **Eligible**: the earliest-starting eligible catalog experiment that
//!    conflicts with nothing enrolled
//! 3. **Released**: the most recently concluded catalog experiment
//!
//! The winner's `choose` result supplies the value; any assignment failure
//! falls back to the configured default and leaves enrollment untouched.
//!
//! ## Concurrency
//!
//! `Engine` is `Send + Sync`. Each experiment synchronizes its own runtime
//! state and the enrolled index sits behind an `RwLock`. Sticky lookups take
//! the read lock; a fresh selection holds the write lock across the conflict
//! check, the experiment's `choose` and the enrollment. Host callbacks run
//! under that lock and must not re-enter the engine.

mod builder;
mod clock;

pub use builder::EngineBuilder;
pub use clock::Clock;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Enrollments;
use crate::experiment::{Experiment, ExperimentReport};
use crate::index::ExperimentIndex;
use crate::{merge, Assignment, Error, Result, Subject};

/// Which resolution tier produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// An experiment the pool was already enrolled in
    Sticky,
    /// A newly eligible experiment
    Eligible,
    /// A concluded or ramping experiment
    Released,
    /// The configured default
    Default,
}

/// Outcome of one resolution, with the reason behind it.
#[derive(Debug)]
pub struct Decision {
    value: Option<Value>,
    source: Source,
    experiment: Option<String>,
    error: Option<Error>,
}

impl Decision {
    /// Get the resolved value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Take the resolved value.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    /// Get the tier that produced the value.
    #[must_use]
    pub const fn source(&self) -> Source {
        self.source
    }

    /// Get the experiment that was consulted, if any.
    #[must_use]
    pub fn experiment(&self) -> Option<&str> {
        self.experiment.as_deref()
    }

    /// Get the assignment failure that forced the default, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// True if the value came from the configured defaults.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.source == Source::Default
    }
}

/// Experiment assignment engine.
#[derive(Debug)]
pub struct Engine {
    experiments: ExperimentIndex,
    enrolled: RwLock<ExperimentIndex>,
    defaults: Assignment,
    subject: Subject,
    clock: Clock,
}

impl Engine {
    /// Create a new engine builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Skew-corrected current time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Get the clock.
    #[must_use]
    pub const fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Get the fallback value per variable.
    #[must_use]
    pub const fn defaults(&self) -> &Assignment {
        &self.defaults
    }

    /// Get the engine-wide subject attributes.
    #[must_use]
    pub const fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Get the catalog of every configured experiment.
    #[must_use]
    pub const fn experiments(&self) -> &ExperimentIndex {
        &self.experiments
    }

    /// Get a configured experiment by name.
    #[must_use]
    pub fn experiment(&self, name: &str) -> Option<&Arc<Experiment>> {
        self.experiments.get(name)
    }

    /// Every subject attribute any experiment declares, sorted.
    #[must_use]
    pub fn attributes(&self) -> Vec<String> {
        self.experiments.attributes()
    }

    /// Every variable any experiment sets, sorted.
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        self.experiments.variables()
    }

    /// Names of enrolled experiments, sorted.
    #[must_use]
    pub fn enrolled(&self) -> Vec<String> {
        self.read_enrolled().names()
    }

    /// True if `subject` is committed to experiment `name`.
    #[must_use]
    pub fn is_enrolled(&self, name: &str, subject: &Subject) -> bool {
        let subject = merge(&self.subject, subject);
        self.read_enrolled().is_committed(name, &subject)
    }

    /// Value for `variable`, or the configured default.
    #[must_use]
    pub fn choose(&self, variable: &str, subject: &Subject, now: DateTime<Utc>) -> Option<Value> {
        self.decide(variable, subject, now).into_value()
    }

    /// [`Engine::choose`] at the clock's current time.
    #[must_use]
    pub fn choose_now(&self, variable: &str, subject: &Subject) -> Option<Value> {
        self.choose(variable, subject, self.now())
    }

    /// Resolve `variable` for `subject` and report how it was resolved.
    ///
    /// Never fails: assignment errors are carried in the [`Decision`] and the
    /// value falls back to the default.
    ///
    /// A sticky match is resolved under the enrolled read lock only. Any other
    /// resolution holds the enrolled write lock from the conflict check until
    /// the enrollment is recorded, so two callers can never enroll the pool
    /// in conflicting experiments.
    pub fn decide(&self, variable: &str, subject: &Subject, now: DateTime<Utc>) -> Decision {
        let subject = merge(&self.subject, subject);
        let default = self.defaults.get(variable).cloned();

        let sticky = self
            .read_enrolled()
            .get_first_live_for(variable, &subject, now)
            .map(Arc::clone);
        if let Some(experiment) = sticky {
            let outcome = experiment.choose(&subject, now);
            return Self::settle(variable, &experiment, Source::Sticky, outcome, default);
        }

        let mut enrolled = self.write_enrolled();
        let Some((experiment, source)) = self.select(variable, &subject, &enrolled, now) else {
            debug!(variable, "no experiment claims variable, using default");
            return Decision {
                value: default,
                source: Source::Default,
                experiment: None,
                error: None,
            };
        };
        let outcome = experiment.choose(&subject, now);
        if outcome.is_ok() && source != Source::Sticky && experiment.live(now) {
            enrolled.enroll(Arc::clone(&experiment), Some(experiment.key(&subject)));
        }
        drop(enrolled);

        Self::settle(variable, &experiment, source, outcome, default)
    }

    fn select(
        &self,
        variable: &str,
        subject: &Subject,
        enrolled: &ExperimentIndex,
        now: DateTime<Utc>,
    ) -> Option<(Arc<Experiment>, Source)> {
        // another caller may have enrolled since the read lock was released
        if let Some(x) = enrolled.get_first_live_for(variable, subject, now) {
            return Some((Arc::clone(x), Source::Sticky));
        }
        if let Some(x) = self
            .experiments
            .get_first_eligible(variable, subject, enrolled, now)
        {
            return Some((Arc::clone(x), Source::Eligible));
        }
        self.experiments
            .get_released(variable, now)
            .map(|x| (Arc::clone(x), Source::Released))
    }

    fn settle(
        variable: &str,
        experiment: &Experiment,
        source: Source,
        outcome: Result<Assignment>,
        default: Option<Value>,
    ) -> Decision {
        match outcome {
            Ok(assignment) => match assignment.get(variable) {
                Some(value) => {
                    debug!(variable, experiment = experiment.name(), ?source, "chose value");
                    Decision {
                        value: Some(value.clone()),
                        source,
                        experiment: Some(experiment.name().to_string()),
                        error: None,
                    }
                }
                None => Decision {
                    value: default,
                    source: Source::Default,
                    experiment: Some(experiment.name().to_string()),
                    error: None,
                },
            },
            Err(err) => {
                warn!(variable, experiment = experiment.name(), %err, "assignment failed, using default");
                Decision {
                    value: default,
                    source: Source::Default,
                    experiment: Some(experiment.name().to_string()),
                    error: Some(err),
                }
            }
        }
    }

    /// Enroll `subject` in experiment `name`.
    ///
    /// Returns `Ok(false)` when the experiment is not live at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownExperiment`] if no such experiment exists.
    pub fn enroll(&self, name: &str, subject: &Subject, now: DateTime<Utc>) -> Result<bool> {
        let experiment = self
            .experiments
            .get(name)
            .ok_or_else(|| Error::UnknownExperiment(name.to_string()))?;
        let subject = merge(&self.subject, subject);
        Ok(self.commit(experiment, &subject, now))
    }

    /// Enroll `subject` in a configured experiment, given the experiment
    /// itself rather than its name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownExperiment`] if `experiment` is not the one
    /// this engine registered under its name.
    pub fn enroll_experiment(
        &self,
        experiment: &Arc<Experiment>,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.experiments.get(experiment.name()) {
            Some(registered) if Arc::ptr_eq(registered, experiment) => {
                let subject = merge(&self.subject, subject);
                Ok(self.commit(registered, &subject, now))
            }
            _ => Err(Error::UnknownExperiment(experiment.name().to_string())),
        }
    }

    /// [`Engine::enroll`] at the clock's current time.
    ///
    /// # Errors
    ///
    /// See [`Engine::enroll`].
    pub fn enroll_now(&self, name: &str, subject: &Subject) -> Result<bool> {
        self.enroll(name, subject, self.now())
    }

    fn commit(&self, experiment: &Arc<Experiment>, subject: &Subject, now: DateTime<Utc>) -> bool {
        if !experiment.live(now) {
            return false;
        }
        let key = experiment.key(subject);
        self.write_enrolled()
            .enroll(Arc::clone(experiment), Some(key));
        true
    }

    pub(crate) fn replay(&self, enrollments: Enrollments, now: DateTime<Utc>) {
        match enrollments {
            Enrollments::Names(names) => {
                for name in names {
                    if let Err(err) = self.enroll(&name, &Subject::new(), now) {
                        warn!(%err, "skipping enrollment replay");
                    }
                }
            }
            Enrollments::Subjects(records) => {
                for (key, name) in records {
                    match self.experiments.get(&name) {
                        Some(x) if x.live(now) => {
                            self.write_enrolled().enroll(Arc::clone(x), Some(key));
                        }
                        Some(_) => debug!(experiment = %name, "replayed experiment not live"),
                        None => warn!(experiment = %name, "skipping enrollment replay of unknown experiment"),
                    }
                }
            }
        }
    }

    /// Forward `event` to enrolled, active experiments observing it.
    ///
    /// Returns the number of experiments notified.
    pub fn mark(&self, event: &str, data: &Value, subject: &Subject) -> usize {
        let subject = merge(&self.subject, subject);
        let observers: Vec<Arc<Experiment>> = {
            let enrolled = self.read_enrolled();
            enrolled
                .filter(|x| x.is_active() && x.observes(event))
                .into_iter()
                .filter(|x| enrolled.is_committed(x.name(), &subject))
                .cloned()
                .collect()
        };
        observers
            .iter()
            .filter(|x| x.mark(event, data, &subject))
            .count()
    }

    /// Report records for active enrolled experiments, in name order.
    #[must_use]
    pub fn report(&self) -> Vec<ExperimentReport> {
        self.read_enrolled().report()
    }

    fn read_enrolled(&self) -> RwLockReadGuard<'_, ExperimentIndex> {
        self.enrolled.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_enrolled(&self) -> RwLockWriteGuard<'_, ExperimentIndex> {
        self.enrolled.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment(variable: &str, value: Value) -> Assignment {
        Assignment::from([(variable.to_string(), value)])
    }

    #[test]
    fn test_decision_reports_source() {
        let engine = Engine::builder()
            .experiment(
                Experiment::builder("foo")
                    .independent_variables(["x"])
                    .always_eligible()
                    .grouping(|_, _| Ok(assignment("x", json!(2)))),
            )
            .build()
            .unwrap();
        let now = engine.now();
        let first = engine.decide("x", &Subject::new(), now);
        assert_eq!(first.source(), Source::Eligible);
        assert_eq!(first.experiment(), Some("foo"));
        let second = engine.decide("x", &Subject::new(), now);
        assert_eq!(second.source(), Source::Sticky);
        assert_eq!(second.value(), Some(&json!(2)));
    }

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }
}
