//! # Trueno-AB: Deterministic Experiment Assignment
//!
//! **Version**: 0.1.0
//!
//! Trueno-AB assigns experiment variants (values of named output variables)
//! to subjects while enforcing live windows, eligibility rules, mutual
//! exclusion between competing experiments, and gradual release ramps.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Heijunka**: Salted SHA-256 bucketing spreads subjects evenly, with no
//!   stored per-subject randomness
//! - **Poka-Yoke safety**: Configuration errors are rejected at construction;
//!   host callback failures always degrade to the configured default
//! - **Jidoka**: Conflict graph stops a subject from entering two experiments
//!   that set the same variable
//!
//! ## Resolution Priority
//!
//! ```text
//! choose(variable, subject)
//!   1. enrolled.get_first_live          (sticky)
//!   2. catalog.get_first_eligible       (earliest start, no conflicts)
//!   3. catalog.get_released             (latest concluded rollout)
//!   4. defaults[variable]
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use trueno_ab::{Assignment, Engine, Subject};
//! use trueno_ab::experiment::Experiment;
//! use serde_json::json;
//!
//! let engine = Engine::builder()
//!     .experiment(
//!         Experiment::builder("foo")
//!             .independent_variables(["x"])
//!             .always_eligible()
//!             .grouping(|_, _| Ok(Assignment::from([("x".to_string(), json!(2))]))),
//!     )
//!     .defaults(Assignment::from([("z".to_string(), json!(1))]))
//!     .build()?;
//!
//! assert_eq!(engine.choose_now("x", &Subject::new()), Some(json!(2)));
//! assert_eq!(engine.choose_now("z", &Subject::new()), Some(json!(1)));
//! # Ok::<(), trueno_ab::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;

pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod index;

pub use engine::{Clock, Decision, Engine, EngineBuilder, Source};
pub use error::{Error, ErrorKind, Result};

/// Named attributes describing the entity being bucketed
pub type Subject = BTreeMap<String, serde_json::Value>;

/// Variable name to assigned value
pub type Assignment = BTreeMap<String, serde_json::Value>;

/// Layer `overrides` on top of `base`; `overrides` wins on conflict.
#[must_use]
pub fn merge(base: &Subject, overrides: &Subject) -> Subject {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
