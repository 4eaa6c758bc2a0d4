//! Engine configuration
//!
//! Already-parsed configuration arriving from the host. Only data lives
//! here; eligibility, grouping and observer callbacks are attached by name on
//! [`EngineBuilder::configure`](crate::EngineBuilder::configure).
//!
//! ```rust
//! use trueno_ab::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{
//!     "experiments": [
//!         { "name": "foo", "startDate": "2014-01-01", "independentVariables": ["x"] }
//!     ],
//!     "defaults": { "x": 1 }
//! }"#)?;
//! assert_eq!(config.experiments[0].name, "foo");
//! # Ok::<(), trueno_ab::Error>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::experiment::{ExperimentBuilder, Release};
use crate::index::Stickiness;
use crate::{Assignment, Error, Result, Subject};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Experiment definitions, in registration order
    #[serde(default)]
    pub experiments: Vec<ExperimentDefinition>,
    /// Fallback value per variable
    #[serde(default)]
    pub defaults: Assignment,
    /// Engine-wide subject attributes, merged under every call's subject
    #[serde(default)]
    pub subject: Subject,
    /// Local clock reading taken alongside `remote_now`
    #[serde(default, with = "flexible_time::option")]
    pub local_now: Option<DateTime<Utc>>,
    /// Authoritative clock reading used to correct local skew
    #[serde(default, with = "flexible_time::option")]
    pub remote_now: Option<DateTime<Utc>>,
    /// Enrollments to replay at construction
    #[serde(default)]
    pub enrolled: Option<Enrollments>,
    /// Legacy mode: one experiment per variable
    #[serde(default)]
    pub exclusive_variables: bool,
    /// What an enrollment is bound to
    #[serde(default)]
    pub stickiness: Stickiness,
}

impl EngineConfig {
    /// Validate and deserialize a configuration value.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the value is not an object or its
    ///   `experiments` member is not an array
    /// - [`Error::Json`] if any field has the wrong shape
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::InvalidConfig(
                "configuration must be an object".to_string(),
            ));
        };
        if object.get("experiments").is_some_and(|x| !x.is_array()) {
            return Err(Error::InvalidConfig(
                "experiments must be an array".to_string(),
            ));
        }
        Ok(Self::deserialize(value)?)
    }

    /// Parse and validate a JSON configuration document.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_value`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }
}

/// Data part of one experiment's definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentDefinition {
    /// Unique name, also the bucketing salt
    pub name: String,
    /// Start of the live window
    #[serde(default, with = "flexible_time::option")]
    pub start_date: Option<DateTime<Utc>>,
    /// End of the live window
    #[serde(default, with = "flexible_time::option")]
    pub end_date: Option<DateTime<Utc>>,
    /// Release ramp window
    #[serde(default)]
    pub release: Option<ReleaseDefinition>,
    /// Value(s) assigned once concluded
    #[serde(default)]
    pub conclusion: Assignment,
    /// Attributes a subject must carry
    #[serde(default)]
    pub subject_attributes: NameSet,
    /// Variables this experiment may set
    #[serde(default)]
    pub independent_variables: NameSet,
    /// Experiment-specific fallback values
    #[serde(default)]
    pub defaults: Assignment,
}

impl ExperimentDefinition {
    /// Convert into a builder, ready for callbacks to be attached.
    #[must_use]
    pub fn into_builder(self) -> ExperimentBuilder {
        let mut builder = ExperimentBuilder::new(self.name)
            .conclusion(self.conclusion)
            .subject_attributes(self.subject_attributes.0)
            .independent_variables(self.independent_variables.0)
            .defaults(self.defaults);
        if let Some(start_date) = self.start_date {
            builder = builder.start_date(start_date);
        }
        if let Some(end_date) = self.end_date {
            builder = builder.end_date(end_date);
        }
        if let Some(release) = self.release {
            builder = builder.release(release.into());
        }
        builder
    }
}

/// Release ramp as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDefinition {
    /// Ramp start
    #[serde(with = "flexible_time")]
    pub start_date: DateTime<Utc>,
    /// Ramp end
    #[serde(with = "flexible_time")]
    pub end_date: DateTime<Utc>,
}

impl From<ReleaseDefinition> for Release {
    fn from(def: ReleaseDefinition) -> Self {
        Self::new(def.start_date, def.end_date)
    }
}

/// Set of names written either as a list or as the keys of a mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawNames", into = "Vec<String>")]
pub struct NameSet(BTreeSet<String>);

impl NameSet {
    /// Iterate the names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no names.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for NameSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<NameSet> for Vec<String> {
    fn from(names: NameSet) -> Self {
        names.0.into_iter().collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNames {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl From<RawNames> for NameSet {
    fn from(raw: RawNames) -> Self {
        match raw {
            RawNames::List(names) => names.into_iter().collect(),
            RawNames::Map(map) => map.into_keys().collect(),
        }
    }
}

/// Enrollment records replayed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Enrollments {
    /// Experiment names the subject pool is enrolled in
    Names(Vec<String>),
    /// Subject key to experiment name
    Subjects(BTreeMap<String, String>),
}

/// Timestamps as RFC 3339, bare `YYYY-MM-DD` (midnight UTC), naive
/// `YYYY-MM-DDTHH:MM:SS` (UTC) or integer epoch milliseconds.
mod flexible_time {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    fn parse(raw: Raw) -> Result<DateTime<Utc>, String> {
        match raw {
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| format!("timestamp out of range: {ms}")),
            Raw::Text(text) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
                    return Ok(dt.with_timezone(&Utc));
                }
                if let Ok(naive) = NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S") {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
                NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .ok_or_else(|| format!("unrecognized timestamp: {text}"))
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        parse(Raw::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::{parse, Raw};
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(parse)
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}
