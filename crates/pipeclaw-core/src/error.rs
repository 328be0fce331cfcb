//! PipeClaw error taxonomy.
//!
//! One enum for the whole workspace. The variants map to how the engine
//! reacts: `Config` is fatal at load time (the task is never armed),
//! `ClaimConflict` is benign and swallowed inside claim routines, `Step`
//! carries the retryable flag the dispatcher must honor, and
//! `InvalidStepResult` is always non-retryable (retrying would reproduce
//! the same bug).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PipeclawError>;

/// All errors produced by the PipeClaw engine.
#[derive(Debug, Error)]
pub enum PipeclawError {
    /// Malformed schedule/retry policy or task definition. Fatal at load.
    #[error("Config error: {0}")]
    Config(String),

    /// Another worker won the claim race for a record. Callers retry the
    /// poll; this never propagates past the claim routine.
    #[error("Claim conflict: {0}")]
    ClaimConflict(String),

    /// A pipeline step failed. `retryable = false` overrides the task's
    /// retry policy.
    #[error("Step '{step}' failed: {message}")]
    Step {
        step: String,
        message: String,
        retryable: bool,
    },

    /// A step returned malformed values (e.g. a non-table `context`).
    #[error("Invalid result from step '{step}': {reason}")]
    InvalidStepResult { step: String, reason: String },

    /// Record store failure (SQLite, serialization, …).
    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PipeclawError {
    /// Whether the dispatcher may reschedule a retry after this error.
    /// Only step failures that did not opt out are retryable; a malformed
    /// step result never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Step { retryable, .. } => *retryable,
            Self::Store(_) => true,
            _ => false,
        }
    }

    /// Shorthand for a retryable step failure.
    pub fn step(step: &str, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a step failure that must not be retried.
    pub fn step_fatal(step: &str, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.to_string(),
            message: message.into(),
            retryable: false,
        }
    }
}
