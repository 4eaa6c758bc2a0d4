//! Error types for Trueno-AB
//!
//! Two families live here and they must never be confused:
//! - **Configuration** errors are fatal and surface from `EngineBuilder::build`
//!   before any choosing begins.
//! - **Assignment** errors are recoverable. `Engine::choose` converts them into
//!   "use the default, do not enroll"; they are only visible through
//!   `Engine::decide` or when calling `Experiment::choose` directly.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed failure raised by a host callback
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected at construction; the engine never partially initializes
    Configuration,
    /// Could not assign a value; the caller falls back to the default
    Assignment,
}

/// Trueno-AB error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Legacy exclusive mode: a variable may only be owned by one experiment
    #[error("Variable '{variable}' is already claimed by experiment '{owner}'\nExperiment '{claimant}' cannot also set it while exclusive variables are enabled")]
    VariableAlreadyClaimed {
        /// Contested variable
        variable: String,
        /// Experiment registered first
        owner: String,
        /// Experiment that was rejected
        claimant: String,
    },

    /// No experiment with that name is registered
    #[error("Unknown experiment: {0}")]
    UnknownExperiment(String),

    /// Subject lacks attributes the experiment declares
    #[error("Experiment '{experiment}' requires subject attributes: {}", missing.join(", "))]
    MissingAttributes {
        /// Experiment name
        experiment: String,
        /// Attribute names absent from the subject
        missing: Vec<String>,
    },

    /// Grouping result omitted declared independent variables
    #[error("Experiment '{experiment}': grouping must return: {}", missing.join(", "))]
    IncompleteGrouping {
        /// Experiment name
        experiment: String,
        /// Variables absent from the grouping result
        missing: Vec<String>,
    },

    /// Host eligibility predicate failed
    #[error("Eligibility check failed for experiment '{experiment}': {source}")]
    Eligibility {
        /// Experiment name
        experiment: String,
        /// Error raised by the host callback
        source: CallbackError,
    },

    /// Host grouping function failed
    #[error("Grouping failed for experiment '{experiment}': {source}")]
    Grouping {
        /// Experiment name
        experiment: String,
        /// Error raised by the host callback
        source: CallbackError,
    },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error as fatal configuration or recoverable assignment
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_)
            | Self::VariableAlreadyClaimed { .. }
            | Self::UnknownExperiment(_)
            | Self::Json(_) => ErrorKind::Configuration,
            Self::MissingAttributes { .. }
            | Self::IncompleteGrouping { .. }
            | Self::Eligibility { .. }
            | Self::Grouping { .. } => ErrorKind::Assignment,
        }
    }

    /// True when the engine should silently fall back to the default value
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Assignment)
    }
}
