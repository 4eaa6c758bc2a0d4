//! Experiment Report - summary of an active experiment

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Assignment;

/// Summary record for one active experiment.
///
/// Produced by `Experiment::report` for downstream analytics; the
/// formatting of these records is left to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentReport {
    name: String,
    choices: BTreeMap<String, Assignment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    marks: BTreeMap<String, u64>,
}

impl ExperimentReport {
    /// Create a report record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        choices: BTreeMap<String, Assignment>,
        marks: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            name: name.into(),
            choices,
            marks,
        }
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the recorded choices keyed by subject key.
    #[must_use]
    pub const fn choices(&self) -> &BTreeMap<String, Assignment> {
        &self.choices
    }

    /// Get the choice for a single subject key, if recorded.
    #[must_use]
    pub fn choice(&self, subject_key: &str) -> Option<&Assignment> {
        self.choices.get(subject_key)
    }

    /// Get event counts forwarded through `mark`.
    #[must_use]
    pub const fn marks(&self) -> &BTreeMap<String, u64> {
        &self.marks
    }
}
