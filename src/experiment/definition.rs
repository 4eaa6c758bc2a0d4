//! Experiment - one experiment's definition plus runtime state

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde_json::Value;

use super::callbacks::{EmptyGrouping, Eligibility, Grouping, Never, Observer};
use super::{ExperimentReport, Release};
use crate::bucket::Bucket;
use crate::{Assignment, Error, Result, Subject};

/// A single experiment.
///
/// The definition (window, ramp, attributes, variables, callbacks) is fixed
/// at construction. The runtime state is internally synchronized so a shared
/// `Arc<Experiment>` can be chosen from concurrently:
///
/// - `active` flips to `true` on the first successful grouping and never
///   resets.
/// - `choices` accumulates one assignment per subject key and is never
///   pruned.
/// - `conflicts_with` holds the names of experiments that share an output
///   variable; it is always kept symmetric by [`Experiment::set_conflict`].
pub struct Experiment {
    name: String,
    bucket: Bucket,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    release: Option<Release>,
    conclusion: Assignment,
    subject_attributes: BTreeSet<String>,
    independent_variables: BTreeSet<String>,
    defaults: Assignment,
    eligibility: Box<dyn Eligibility>,
    grouping: Box<dyn Grouping>,
    observers: BTreeMap<String, Box<dyn Observer>>,
    conflicts_with: DashSet<String>,
    active: AtomicBool,
    choices: DashMap<String, Assignment>,
    marks: DashMap<String, u64>,
}

impl Experiment {
    /// Create a builder for an experiment named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(name)
    }

    /// Get the experiment name (also the bucketing salt).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the start of the live window.
    #[must_use]
    pub const fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Get the end of the live window.
    ///
    /// When a release ramp is configured this is the ramp's end.
    #[must_use]
    pub const fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }

    /// Get the release ramp, if configured.
    #[must_use]
    pub const fn release(&self) -> Option<&Release> {
        self.release.as_ref()
    }

    /// Get the concluded assignment.
    #[must_use]
    pub const fn conclusion(&self) -> &Assignment {
        &self.conclusion
    }

    /// Get the attribute names a subject must carry.
    #[must_use]
    pub const fn subject_attributes(&self) -> &BTreeSet<String> {
        &self.subject_attributes
    }

    /// Get the variable names this experiment may set.
    #[must_use]
    pub const fn independent_variables(&self) -> &BTreeSet<String> {
        &self.independent_variables
    }

    /// Get the fallback values visible to the grouping function.
    #[must_use]
    pub const fn defaults(&self) -> &Assignment {
        &self.defaults
    }

    /// Get the salted bucket used for all randomness in this experiment.
    #[must_use]
    pub const fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// True once any subject has been grouped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Names of conflicting experiments, sorted.
    #[must_use]
    pub fn conflicts_with(&self) -> Vec<String> {
        let mut names: Vec<String> = self.conflicts_with.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }

    /// True if `predicate` holds for any conflicting experiment name.
    ///
    /// Visits names in no particular order and stops at the first match.
    pub fn any_conflict<P>(&self, mut predicate: P) -> bool
    where
        P: FnMut(&str) -> bool,
    {
        self.conflicts_with.iter().any(|name| predicate(name.key()))
    }

    /// True if this experiment conflicts with `name`.
    #[must_use]
    pub fn conflicts_with_name(&self, name: &str) -> bool {
        self.conflicts_with.contains(name)
    }

    /// Snapshot of recorded choices keyed by subject key.
    #[must_use]
    pub fn choices(&self) -> BTreeMap<String, Assignment> {
        self.choices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Recorded choice for one subject key.
    #[must_use]
    pub fn choice(&self, subject_key: &str) -> Option<Assignment> {
        self.choices.get(subject_key).map(|entry| entry.value().clone())
    }

    // ------------------------------------------------------------------
    // Bucketing helpers, salted by the experiment name
    // ------------------------------------------------------------------

    /// 52-bit hash of `key`.
    #[must_use]
    pub fn hash(&self, key: &str) -> u64 {
        self.bucket.hash(key)
    }

    /// Hash of the experiment's own name; the sort tiebreaker.
    #[must_use]
    pub fn name_hash(&self) -> u64 {
        self.bucket.hash("")
    }

    /// Uniform value in `[0, 1)` for `key`.
    #[must_use]
    pub fn lucky_number(&self, key: &str) -> f64 {
        self.bucket.lucky_number(key)
    }

    /// Uniform value in `[min, max]` for `key`.
    #[must_use]
    pub fn random_double(&self, key: &str, min: f64, max: f64) -> f64 {
        self.bucket.random_double(key, min, max)
    }

    /// Uniform integer in `[min, max]` for `key`.
    #[must_use]
    pub fn random_int(&self, key: &str, min: i64, max: i64) -> i64 {
        self.bucket.random_int(key, min, max)
    }

    /// Bernoulli trial with success probability `percent`.
    #[must_use]
    pub fn bernoulli_trial(&self, percent: f64, key: &str) -> bool {
        self.bucket.bernoulli_trial(percent, key)
    }

    /// Deterministic pick from `choices`.
    #[must_use]
    pub fn uniform_choice<'a, T>(&self, choices: &'a [T], key: &str) -> Option<&'a T> {
        self.bucket.uniform_choice(choices, key)
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// True if `start_date <= now <= end_date`.
    #[must_use]
    pub fn live(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now <= self.end_date
    }

    /// Subject key built only from the declared subject attributes.
    ///
    /// Attributes are visited in sorted order and rendered as
    /// `name=value` pairs joined by `&`; absent attributes are skipped.
    #[must_use]
    pub fn key(&self, subject: &Subject) -> String {
        self.subject_attributes
            .iter()
            .filter_map(|attr| subject.get(attr).map(|value| format!("{attr}={value}")))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Declared attributes absent from `subject`, sorted.
    #[must_use]
    pub fn missing_attributes(&self, subject: &Subject) -> Vec<String> {
        self.subject_attributes
            .iter()
            .filter(|attr| !subject.contains_key(*attr))
            .cloned()
            .collect()
    }

    /// Fraction of the release ramp elapsed; 0 when no ramp is configured.
    #[must_use]
    pub fn release_progress(&self, now: DateTime<Utc>) -> f64 {
        self.release.map_or(0.0, |release| release.progress(now))
    }

    /// Eligibility with host failures surfaced.
    ///
    /// Checks the live window, then attribute presence, then the host
    /// predicate. The predicate is never invoked when the subject is
    /// missing a declared attribute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Eligibility`] if the host predicate fails.
    pub fn try_eligible(&self, subject: &Subject, now: DateTime<Utc>) -> Result<bool> {
        if !self.live(now) || !self.missing_attributes(subject).is_empty() {
            return Ok(false);
        }
        self.eligibility
            .is_eligible(subject)
            .map_err(|err| Error::Eligibility {
                experiment: self.name.clone(),
                source: err.into(),
            })
    }

    /// Eligibility where a failing predicate counts as "not eligible".
    #[must_use]
    pub fn eligible(&self, subject: &Subject, now: DateTime<Utc>) -> bool {
        self.try_eligible(subject, now).unwrap_or(false)
    }

    /// Resolve the assignment for `subject` at `now`.
    ///
    /// With a release ramp, subjects whose rank is at or below the ramp
    /// progress get the conclusion. Without one, the conclusion applies once
    /// the experiment has ended. Everyone else is grouped.
    ///
    /// # Errors
    ///
    /// Propagates [`Experiment::choose_grouping`] failures.
    pub fn choose(&self, subject: &Subject, now: DateTime<Utc>) -> Result<Assignment> {
        if let Some(release) = &self.release {
            let rank = self.lucky_number(&self.key(subject));
            if rank <= release.progress(now) {
                return Ok(self.conclusion.clone());
            }
        } else if now > self.end_date {
            return Ok(self.conclusion.clone());
        }
        self.choose_grouping(subject)
    }

    /// Run the grouping function and record the result.
    ///
    /// On failure neither `active` nor `choices` is touched.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingAttributes`] if the subject lacks a declared attribute
    /// - [`Error::Grouping`] if the host function fails
    /// - [`Error::IncompleteGrouping`] if the result omits a declared variable
    pub fn choose_grouping(&self, subject: &Subject) -> Result<Assignment> {
        let missing = self.missing_attributes(subject);
        if !missing.is_empty() {
            return Err(Error::MissingAttributes {
                experiment: self.name.clone(),
                missing,
            });
        }

        let result = self
            .grouping
            .group(self, subject)
            .map_err(|err| Error::Grouping {
                experiment: self.name.clone(),
                source: err.into(),
            })?;

        let missing: Vec<String> = self
            .independent_variables
            .iter()
            .filter(|variable| !result.contains_key(*variable))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::IncompleteGrouping {
                experiment: self.name.clone(),
                missing,
            });
        }

        self.active.store(true, Ordering::Release);
        self.choices.insert(self.key(subject), result.clone());
        Ok(result)
    }

    /// Mark every experiment in `others` as conflicting with this one, both ways.
    pub fn set_conflict(&self, others: &[Arc<Self>]) {
        for other in others {
            if other.name == self.name {
                continue;
            }
            self.conflicts_with.insert(other.name.clone());
            other.conflicts_with.insert(self.name.clone());
        }
    }

    // ------------------------------------------------------------------
    // Events and reporting
    // ------------------------------------------------------------------

    /// True if an observer is registered for `event`.
    #[must_use]
    pub fn observes(&self, event: &str) -> bool {
        self.observers.contains_key(event)
    }

    /// Forward `event` to its observer and count it.
    ///
    /// Returns `false` when nothing observes `event`.
    pub fn mark(&self, event: &str, data: &Value, subject: &Subject) -> bool {
        let Some(observer) = self.observers.get(event) else {
            return false;
        };
        observer.observe(self, data, subject);
        *self.marks.entry(event.to_string()).or_insert(0) += 1;
        true
    }

    /// Event counts recorded by [`Experiment::mark`].
    #[must_use]
    pub fn marks(&self) -> BTreeMap<String, u64> {
        self.marks
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Summary of this experiment's recorded state.
    #[must_use]
    pub fn report(&self) -> ExperimentReport {
        ExperimentReport::new(self.name.clone(), self.choices(), self.marks())
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("release", &self.release)
            .field("subject_attributes", &self.subject_attributes)
            .field("independent_variables", &self.independent_variables)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Builder for `Experiment`.
pub struct ExperimentBuilder {
    name: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    release: Option<Release>,
    conclusion: Assignment,
    subject_attributes: BTreeSet<String>,
    independent_variables: BTreeSet<String>,
    defaults: Assignment,
    eligibility: Box<dyn Eligibility>,
    grouping: Box<dyn Grouping>,
    observers: BTreeMap<String, Box<dyn Observer>>,
}

impl ExperimentBuilder {
    /// Create a builder with the default window: live from the minimum
    /// timestamp until the maximum, never eligible, grouping to `{}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_date: DateTime::<Utc>::MIN_UTC,
            end_date: DateTime::<Utc>::MAX_UTC,
            release: None,
            conclusion: Assignment::new(),
            subject_attributes: BTreeSet::new(),
            independent_variables: BTreeSet::new(),
            defaults: Assignment::new(),
            eligibility: Box::new(Never),
            grouping: Box::new(EmptyGrouping),
            observers: BTreeMap::new(),
        }
    }

    /// Get the name this builder will produce.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the start of the live window.
    #[must_use]
    pub const fn start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = start_date;
        self
    }

    /// Set the end of the live window (overridden by a release ramp).
    #[must_use]
    pub const fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = end_date;
        self
    }

    /// Configure a release ramp.
    #[must_use]
    pub const fn release(mut self, release: Release) -> Self {
        self.release = Some(release);
        self
    }

    /// Set the concluded assignment.
    #[must_use]
    pub fn conclusion(mut self, conclusion: Assignment) -> Self {
        self.conclusion = conclusion;
        self
    }

    /// Declare the attributes a subject must carry.
    #[must_use]
    pub fn subject_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subject_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the variables this experiment may set.
    #[must_use]
    pub fn independent_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.independent_variables = variables.into_iter().map(Into::into).collect();
        self
    }

    /// Set fallback values visible to the grouping function.
    #[must_use]
    pub fn defaults(mut self, defaults: Assignment) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set the eligibility predicate.
    #[must_use]
    pub fn eligibility<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Subject) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.eligibility = Box::new(predicate);
        self
    }

    /// Set an eligibility strategy object.
    #[must_use]
    pub fn eligibility_strategy(mut self, strategy: impl Eligibility + 'static) -> Self {
        self.eligibility = Box::new(strategy);
        self
    }

    /// Make every subject carrying the declared attributes eligible.
    #[must_use]
    pub fn always_eligible(self) -> Self {
        self.eligibility(|_| Ok(true))
    }

    /// Set the grouping function.
    #[must_use]
    pub fn grouping<F>(mut self, grouping: F) -> Self
    where
        F: Fn(&Experiment, &Subject) -> anyhow::Result<Assignment> + Send + Sync + 'static,
    {
        self.grouping = Box::new(grouping);
        self
    }

    /// Set a grouping strategy object.
    #[must_use]
    pub fn grouping_strategy(mut self, strategy: impl Grouping + 'static) -> Self {
        self.grouping = Box::new(strategy);
        self
    }

    /// Register an observer for `event`, replacing any previous one.
    #[must_use]
    pub fn observe<F>(mut self, event: impl Into<String>, observer: F) -> Self
    where
        F: Fn(&Experiment, &Value, &Subject) + Send + Sync + 'static,
    {
        self.observers.insert(event.into(), Box::new(observer));
        self
    }

    /// Layer `defaults` underneath this experiment's own defaults.
    pub(crate) fn inherit_defaults(&mut self, defaults: &Assignment) {
        for (variable, value) in defaults {
            self.defaults
                .entry(variable.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Build the `Experiment`.
    #[must_use]
    pub fn build(self) -> Experiment {
        let end_date = self.release.map_or(self.end_date, |r| r.end_date());
        Experiment {
            bucket: Bucket::new(self.name.clone()),
            name: self.name,
            start_date: self.start_date,
            end_date,
            release: self.release,
            conclusion: self.conclusion,
            subject_attributes: self.subject_attributes,
            independent_variables: self.independent_variables,
            defaults: self.defaults,
            eligibility: self.eligibility,
            grouping: self.grouping,
            observers: self.observers,
            conflicts_with: DashSet::new(),
            active: AtomicBool::new(false),
            choices: DashMap::new(),
            marks: DashMap::new(),
        }
    }
}

impl fmt::Debug for ExperimentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentBuilder")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
