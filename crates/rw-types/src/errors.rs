use thiserror::Error;

use crate::trial::{TrialId, TrialStatus};

/// Main error type for the Rungwise system
#[derive(Error, Debug)]
pub enum RwError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Surrogate error: {0}")]
    Surrogate(#[from] SurrogateError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Observation ledger errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Trial {trial_id} already reported resource level {resource}")]
    DuplicateResourceLevel { trial_id: TrialId, resource: u64 },

    #[error("Trial {trial_id} reported resource level {resource} after level {last}")]
    NonIncreasingResource {
        trial_id: TrialId,
        resource: u64,
        last: u64,
    },

    #[error("Trial {trial_id} reported a non-finite metric value: {value}")]
    InvalidMetric { trial_id: TrialId, value: f64 },
}

/// Surrogate model and acquisition errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurrogateError {
    #[error("Refit failed: {message}")]
    RefitFailed { message: String },

    #[error("Matrix of size {dim} is not positive definite")]
    NotPositiveDefinite { dim: usize },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Candidate pool is empty after {attempts} sampling attempts")]
    EmptyCandidatePool { attempts: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Unknown trial in surrogate data: {trial_id}")]
    UnknownTrial { trial_id: TrialId },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Scheduler and trial lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Trial not found: {trial_id}")]
    UnknownTrial { trial_id: TrialId },

    #[error("Invalid transition for trial {trial_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        trial_id: TrialId,
        from: TrialStatus,
        to: TrialStatus,
    },

    #[error("Invalid rung system: {message}")]
    InvalidRungSystem { message: String },
}

/// Errors surfaced by execution backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("trial not found on backend: {trial_id}")]
    TrialNotFound { trial_id: TrialId },

    #[error("backend does not support pause/resume")]
    PauseUnsupported,

    #[error("no free worker for trial {trial_id}")]
    NoCapacity { trial_id: TrialId },

    #[error("backend internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for Rungwise operations
pub type RwResult<T> = Result<T, RwError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::RwError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::RwError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RwError::Config(format!($($arg)*))
    };
}
