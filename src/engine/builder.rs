//! Engine builder

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::info;

use super::{Clock, Engine};
use crate::config::{Enrollments, EngineConfig, ExperimentDefinition};
use crate::experiment::ExperimentBuilder;
use crate::index::{ClaimPolicy, ExperimentIndex, Stickiness};
use crate::{Assignment, Error, Result, Subject};

/// Builder for `Engine`.
///
/// Experiments are registered in the order they are added; a later
/// experiment with an already-used name is ignored.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    experiments: Vec<ExperimentBuilder>,
    defaults: Assignment,
    subject: Subject,
    clock: Clock,
    enrolled: Option<Enrollments>,
    claim_policy: ClaimPolicy,
    stickiness: Stickiness,
    unknown: Vec<String>,
}

impl EngineBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a parsed configuration.
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        let clock = match (config.local_now, config.remote_now) {
            (Some(local), Some(remote)) => Clock::with_skew(local, remote),
            _ => Clock::system(),
        };
        let mut builder = Self::new()
            .definitions(config.experiments)
            .defaults(config.defaults)
            .subject(config.subject)
            .clock(clock)
            .exclusive_variables(config.exclusive_variables)
            .stickiness(config.stickiness);
        builder.enrolled = config.enrolled;
        builder
    }

    /// Add an experiment.
    #[must_use]
    pub fn experiment(mut self, experiment: ExperimentBuilder) -> Self {
        self.experiments.push(experiment);
        self
    }

    /// Add several experiments, in order.
    #[must_use]
    pub fn experiments<I>(mut self, experiments: I) -> Self
    where
        I: IntoIterator<Item = ExperimentBuilder>,
    {
        self.experiments.extend(experiments);
        self
    }

    /// Add experiments from configuration data.
    #[must_use]
    pub fn definitions<I>(self, definitions: I) -> Self
    where
        I: IntoIterator<Item = ExperimentDefinition>,
    {
        self.experiments(definitions.into_iter().map(ExperimentDefinition::into_builder))
    }

    /// Attach callbacks (or any other setting) to the experiment `name`.
    ///
    /// Naming an experiment that was never added makes `build` fail.
    #[must_use]
    pub fn configure<F>(mut self, name: &str, f: F) -> Self
    where
        F: FnOnce(ExperimentBuilder) -> ExperimentBuilder,
    {
        match self.experiments.iter().position(|x| x.name() == name) {
            Some(idx) => {
                let experiment = self.experiments.remove(idx);
                self.experiments.insert(idx, f(experiment));
            }
            None => self.unknown.push(name.to_string()),
        }
        self
    }

    /// Set the fallback value per variable.
    #[must_use]
    pub fn defaults(mut self, defaults: Assignment) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set engine-wide subject attributes.
    #[must_use]
    pub fn subject(mut self, subject: Subject) -> Self {
        self.subject = subject;
        self
    }

    /// Set the clock.
    #[must_use]
    pub const fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Correct the clock by `remote_now - local_now`.
    #[must_use]
    pub fn skew(self, local_now: DateTime<Utc>, remote_now: DateTime<Utc>) -> Self {
        self.clock(Clock::with_skew(local_now, remote_now))
    }

    /// Enrollments to replay once the engine is built.
    #[must_use]
    pub fn enrolled(mut self, enrolled: Enrollments) -> Self {
        self.enrolled = Some(enrolled);
        self
    }

    /// Legacy mode: reject a second experiment claiming the same variable.
    #[must_use]
    pub const fn exclusive_variables(mut self, exclusive: bool) -> Self {
        self.claim_policy = if exclusive {
            ClaimPolicy::Exclusive
        } else {
            ClaimPolicy::Shared
        };
        self
    }

    /// Set what an enrollment is bound to.
    #[must_use]
    pub const fn stickiness(mut self, stickiness: Stickiness) -> Self {
        self.stickiness = stickiness;
        self
    }

    /// Build the `Engine`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownExperiment`] if `configure` named a missing experiment
    /// - [`Error::VariableAlreadyClaimed`] in exclusive mode
    /// - [`Error::InvalidConfig`] if bare enrollment names are replayed under
    ///   [`Stickiness::Subject`], which needs a subject key per enrollment
    pub fn build(self) -> Result<Engine> {
        if let Some(name) = self.unknown.first() {
            return Err(Error::UnknownExperiment(name.clone()));
        }
        if self.stickiness == Stickiness::Subject {
            if let Some(Enrollments::Names(names)) = &self.enrolled {
                if !names.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "enrollments for subject stickiness must map subject keys to experiments, got names: {}",
                        names.join(", ")
                    )));
                }
            }
        }

        let mut catalog = ExperimentIndex::new().with_claim_policy(self.claim_policy);
        for mut experiment in self.experiments {
            experiment.inherit_defaults(&self.defaults);
            catalog.add(Arc::new(experiment.build()))?;
        }

        let engine = Engine {
            experiments: catalog,
            enrolled: RwLock::new(ExperimentIndex::new().with_stickiness(self.stickiness)),
            defaults: self.defaults,
            subject: self.subject,
            clock: self.clock,
        };
        if let Some(enrolled) = self.enrolled {
            engine.replay(enrolled, engine.now());
        }

        info!(
            experiments = engine.experiments.len(),
            variables = engine.experiments.variables().len(),
            enrolled = engine.enrolled().len(),
            "engine ready"
        );
        Ok(engine)
    }
}
