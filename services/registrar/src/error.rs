//! Step error types.
//!
//! Fatal errors carry the provider's message verbatim behind a prefix naming
//! the phase that failed. Their `Display` output is exactly the line shown to
//! the user.

use thiserror::Error;

use crate::waiter::WaitError;

/// Fatal errors of the registration step. Each one halts the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// The create-image request was rejected.
    #[error("Error registering AMI: {0}")]
    Registration(String),

    /// The image never became available within the polling budget.
    #[error("Error waiting for AMI: {0}")]
    AvailabilityTimeout(String),

    /// The image failed, vanished, or the run was cancelled while waiting.
    #[error("Error waiting for AMI: {0}")]
    AvailabilityFailure(String),

    /// Fetching the authoritative record after the wait failed.
    #[error("Error searching for AMI: {0}")]
    MetadataFetch(String),
}

impl From<WaitError> for StepError {
    fn from(err: WaitError) -> Self {
        if err.is_timeout() {
            Self::AvailabilityTimeout(err.to_string())
        } else {
            Self::AvailabilityFailure(err.to_string())
        }
    }
}

/// Deregistration failed during rollback. Reported, never escalated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Error deregistering AMI, may still be around: {0}")]
pub struct RollbackWarning(pub String);
