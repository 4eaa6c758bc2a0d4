//! Single-experiment model
//!
//! An [`Experiment`] owns its definition (live window, optional release
//! ramp, required subject attributes, output variables, host callbacks) and
//! the runtime state accumulated while subjects are bucketed.
//!
//! ## Resolution
//!
//! ```text
//! choose(subject, now)
//!   ├─ release ramp?  rank(key) <= progress(now)  → conclusion
//!   ├─ no ramp?       now > end_date              → conclusion
//!   └─ otherwise      choose_grouping(subject)    → grouping result
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::experiment::Experiment;
//! use trueno_ab::{Assignment, Subject};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let x = Experiment::builder("button-color")
//!     .subject_attributes(["user_id"])
//!     .independent_variables(["color"])
//!     .always_eligible()
//!     .grouping(|x, subject| {
//!         let color = x.uniform_choice(&["red", "blue"], &x.key(subject)).copied();
//!         Ok(Assignment::from([("color".to_string(), json!(color))]))
//!     })
//!     .build();
//!
//! let subject = Subject::from([("user_id".to_string(), json!(42))]);
//! let now = Utc::now();
//! assert!(x.eligible(&subject, now));
//! let first = x.choose(&subject, now).unwrap();
//! assert_eq!(first, x.choose(&subject, now).unwrap());
//! assert!(x.is_active());
//! ```

mod callbacks;
mod definition;
mod release;
mod report;

pub use callbacks::{Eligibility, Grouping, Observer};
pub use definition::{Experiment, ExperimentBuilder};
pub use release::Release;
pub use report::ExperimentReport;
