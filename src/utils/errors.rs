// src/utils/errors.rs
//! Engine error types
//!
//! Failures are contained at the smallest scope that can decide a job's
//! fate: store errors abort the current poll iteration, process errors
//! become `stderr` work-log lines, and precondition violations cancel the
//! single job that hit them.

use thiserror::Error;

/// Convenience result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors produced by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Reading or writing job/log rows failed
    #[error("storage failure: {0}")]
    StorageFailed(String),

    /// The VM boot script could not be spawned
    #[error("failed to spawn VM process: {0}")]
    ProcessSpawnFailed(String),

    /// A VM process already exists for this job
    #[error("a VM is already running for job {0}")]
    AlreadyRunning(String),

    /// Job (or log stream) does not exist
    #[error("job not found: {0}")]
    NotFound(String),

    /// A submission failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or is out of range
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// Anything else that went wrong at runtime
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl EngineError {
    /// Whether this error is a benign not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}
