//! Experiment Index - registry, conflict graph and priority queries
//!
//! ## Design
//!
//! Experiments are held by name and, for every independent variable they
//! set, in a per-variable list sorted by `(start_date, name hash)`. Adding an
//! experiment links it as conflicting with every current owner of each of
//! its variables, both ways.
//!
//! The same type backs two roles in the engine:
//!
//! ```text
//! catalog  ── every configured experiment, fixed after construction
//! enrolled ── experiments subjects have been bucketed into, grows only
//! ```

mod order;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::experiment::{Experiment, ExperimentReport};
use crate::{Error, Result, Subject};

pub use order::{by_release_date, by_start_date, release_date};

/// How many experiments may claim the same variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimPolicy {
    /// Any number; competition is resolved by conflicts and priority
    #[default]
    Shared,
    /// Legacy mode: a second claim is a configuration error
    Exclusive,
}

/// What an enrollment is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stickiness {
    /// An enrollment covers every subject served by the engine
    #[default]
    Pool,
    /// An enrollment covers only the subject key that was bucketed
    Subject,
}

/// Registry of experiments keyed by name and by output variable.
#[derive(Debug, Default)]
pub struct ExperimentIndex {
    experiments_by_name: BTreeMap<String, Arc<Experiment>>,
    experiments_by_variable: BTreeMap<String, Vec<Arc<Experiment>>>,
    active_subject_keys: FxHashMap<String, FxHashSet<String>>,
    claim_policy: ClaimPolicy,
    stickiness: Stickiness,
}

impl ExperimentIndex {
    /// Create an empty index with shared claims and pool stickiness.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the claim policy.
    #[must_use]
    pub const fn with_claim_policy(mut self, claim_policy: ClaimPolicy) -> Self {
        self.claim_policy = claim_policy;
        self
    }

    /// Set the enrollment stickiness.
    #[must_use]
    pub const fn with_stickiness(mut self, stickiness: Stickiness) -> Self {
        self.stickiness = stickiness;
        self
    }

    /// Get the claim policy.
    #[must_use]
    pub const fn claim_policy(&self) -> ClaimPolicy {
        self.claim_policy
    }

    /// Get the enrollment stickiness.
    #[must_use]
    pub const fn stickiness(&self) -> Stickiness {
        self.stickiness
    }

    /// Number of registered experiments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments_by_name.len()
    }

    /// True if no experiment is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments_by_name.is_empty()
    }

    /// Register an experiment.
    ///
    /// Returns `Ok(false)` if an experiment with the same name is already
    /// registered; the first registration is canonical.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VariableAlreadyClaimed`] under
    /// [`ClaimPolicy::Exclusive`] when one of the experiment's variables is
    /// already owned.
    pub fn add(&mut self, experiment: Arc<Experiment>) -> Result<bool> {
        if self.contains(experiment.name()) {
            debug!(experiment = experiment.name(), "duplicate experiment ignored");
            return Ok(false);
        }
        if self.claim_policy == ClaimPolicy::Exclusive {
            for variable in experiment.independent_variables() {
                if let Some(owner) = self.get_by_variable(variable).first() {
                    return Err(Error::VariableAlreadyClaimed {
                        variable: variable.clone(),
                        owner: owner.name().to_string(),
                        claimant: experiment.name().to_string(),
                    });
                }
            }
        }
        self.insert(experiment);
        Ok(true)
    }

    fn insert(&mut self, experiment: Arc<Experiment>) -> bool {
        if self.contains(experiment.name()) {
            return false;
        }
        for variable in experiment.independent_variables() {
            let experiments = self
                .experiments_by_variable
                .entry(variable.clone())
                .or_default();
            if !experiments.is_empty() {
                debug!(
                    experiment = experiment.name(),
                    variable = %variable,
                    owners = experiments.len(),
                    "linking conflicting experiments"
                );
            }
            experiment.set_conflict(experiments);
            experiments.push(Arc::clone(&experiment));
            experiments.sort_by(|a, b| by_start_date(a, b));
        }
        self.experiments_by_name
            .insert(experiment.name().to_string(), experiment);
        true
    }

    /// Record that `experiment` has claimed a subject.
    ///
    /// The experiment is registered if new. Under [`Stickiness::Subject`]
    /// the subject key is remembered so later lookups can confirm it; under
    /// [`Stickiness::Pool`] the key is ignored.
    pub fn enroll(&mut self, experiment: Arc<Experiment>, subject_key: Option<String>) {
        let name = experiment.name().to_string();
        if self.insert(experiment) {
            debug!(experiment = %name, "enrolled");
        }
        if self.stickiness == Stickiness::Subject {
            if let Some(key) = subject_key {
                self.active_subject_keys.entry(name).or_default().insert(key);
            }
        }
    }

    /// Get an experiment by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<Experiment>> {
        self.experiments_by_name.get(name)
    }

    /// True if an experiment named `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.experiments_by_name.contains_key(name)
    }

    /// True if `subject_key` was enrolled into experiment `name`.
    #[must_use]
    pub fn has_subject_key(&self, name: &str, subject_key: &str) -> bool {
        self.active_subject_keys
            .get(name)
            .is_some_and(|keys| keys.contains(subject_key))
    }

    /// True if `subject` is committed to experiment `name` under this
    /// index's stickiness.
    #[must_use]
    pub fn is_committed(&self, name: &str, subject: &Subject) -> bool {
        match self.stickiness {
            Stickiness::Pool => self.contains(name),
            Stickiness::Subject => self
                .get(name)
                .is_some_and(|x| self.has_subject_key(name, &x.key(subject))),
        }
    }

    /// Experiments matching `predicate`, in name order.
    pub fn filter<P>(&self, mut predicate: P) -> Vec<&Arc<Experiment>>
    where
        P: FnMut(&Experiment) -> bool,
    {
        self.experiments_by_name
            .values()
            .filter(|x| predicate(x))
            .collect()
    }

    /// Registered experiment names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.experiments_by_name.keys().cloned().collect()
    }

    /// Every subject attribute declared by any experiment, sorted.
    #[must_use]
    pub fn attributes(&self) -> Vec<String> {
        self.experiments_by_name
            .values()
            .flat_map(|x| x.subject_attributes().iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every variable set by any experiment, sorted.
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        self.experiments_by_variable.keys().cloned().collect()
    }

    /// Experiments setting `variable`, in priority order.
    #[must_use]
    pub fn get_by_variable(&self, variable: &str) -> &[Arc<Experiment>] {
        self.experiments_by_variable
            .get(variable)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// First experiment for `variable` that is live at `now`.
    #[must_use]
    pub fn get_first_live(&self, variable: &str, now: DateTime<Utc>) -> Option<&Arc<Experiment>> {
        self.get_by_variable(variable).iter().find(|x| x.live(now))
    }

    /// First live experiment for `variable` that `subject` is committed to.
    ///
    /// Under [`Stickiness::Pool`] this is [`ExperimentIndex::get_first_live`].
    #[must_use]
    pub fn get_first_live_for(
        &self,
        variable: &str,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Option<&Arc<Experiment>> {
        self.get_by_variable(variable)
            .iter()
            .find(|x| x.live(now) && self.is_committed(x.name(), subject))
    }

    /// First experiment by start date that `subject` is eligible for and
    /// that conflicts with nothing the subject is committed to in `enrolled`.
    ///
    /// A failing eligibility predicate counts as "not eligible".
    #[must_use]
    pub fn get_first_eligible(
        &self,
        variable: &str,
        subject: &Subject,
        enrolled: &Self,
        now: DateTime<Utc>,
    ) -> Option<&Arc<Experiment>> {
        self.get_by_variable(variable).iter().find(|x| {
            if x.any_conflict(|name| enrolled.is_committed(name, subject)) {
                return false;
            }
            match x.try_eligible(subject, now) {
                Ok(eligible) => eligible,
                Err(err) => {
                    warn!(experiment = x.name(), %err, "eligibility check failed");
                    false
                }
            }
        })
    }

    /// Most recently released experiment for `variable`.
    ///
    /// Candidates have ended, or have started their release ramp, before
    /// `now`; the one with the latest [`release_date`] wins.
    #[must_use]
    pub fn get_released(&self, variable: &str, now: DateTime<Utc>) -> Option<&Arc<Experiment>> {
        self.get_by_variable(variable)
            .iter()
            .filter(|x| order::is_released(x, now))
            .max_by(|a, b| by_release_date(a, b))
    }

    /// Experiments that have grouped at least one subject.
    #[must_use]
    pub fn active(&self) -> Vec<&Arc<Experiment>> {
        self.filter(Experiment::is_active)
    }

    /// Report records for the active experiments, in name order.
    #[must_use]
    pub fn report(&self) -> Vec<ExperimentReport> {
        self.active().into_iter().map(|x| x.report()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment(name: &str, variables: &[&str]) -> Arc<Experiment> {
        Arc::new(
            Experiment::builder(name)
                .independent_variables(variables.iter().copied())
                .build(),
        )
    }

    #[test]
    fn test_index_default() {
        let index = ExperimentIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.claim_policy(), ClaimPolicy::Shared);
        assert_eq!(index.stickiness(), Stickiness::Pool);
        assert!(index.get_by_variable("x").is_empty());
    }

    #[test]
    fn test_exclusive_rejects_second_claim() {
        let mut index = ExperimentIndex::new().with_claim_policy(ClaimPolicy::Exclusive);
        assert!(index.add(experiment("a", &["x"])).unwrap());
        let err = index.add(experiment("b", &["y", "x"])).unwrap_err();
        assert!(matches!(err, Error::VariableAlreadyClaimed { ref owner, .. } if owner == "a"));
        // rejected experiment leaves no trace
        assert!(!index.contains("b"));
        assert!(index.get_by_variable("y").is_empty());
    }

    #[test]
    fn test_subject_stickiness_requires_key() {
        let mut index = ExperimentIndex::new().with_stickiness(Stickiness::Subject);
        let x = Arc::new(
            Experiment::builder("a")
                .subject_attributes(["id"])
                .independent_variables(["v"])
                .build(),
        );
        let alice = Subject::from([("id".to_string(), serde_json::json!("alice"))]);
        let bob = Subject::from([("id".to_string(), serde_json::json!("bob"))]);
        index.enroll(Arc::clone(&x), Some(x.key(&alice)));
        assert!(index.is_committed("a", &alice));
        assert!(!index.is_committed("a", &bob));
    }
}
