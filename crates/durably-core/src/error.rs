//! Error taxonomy for the engine core.
//!
//! Every variant here corresponds to one row of the error-handling table in
//! the specification: validation failures, step throws, the cancellation
//! sentinel, unknown-job dispatch, heartbeat failures, and illegal state
//! transitions requested by API callers.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DurablyError {
    #[error("invalid input for job `{job_name}`: {message}")]
    InvalidInput { job_name: String, message: String },

    #[error("invalid output for run {run_id}: {message}")]
    InvalidOutput { run_id: String, message: String },

    #[error("run {run_id} step `{step_name}` failed: {message}")]
    StepFailed {
        run_id: String,
        step_name: String,
        message: String,
    },

    #[error("run {run_id} was cancelled")]
    Cancelled { run_id: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job `{name}` is already registered with a different definition")]
    JobConflict { name: String },

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("cannot {op} run {run_id} in status `{status}`")]
    IllegalState {
        op: String,
        run_id: String,
        status: String,
    },

    #[error("triggerAndWait timed out waiting for run {run_id}")]
    Timeout { run_id: String },

    #[error("{0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl DurablyError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

impl From<serde_json::Error> for DurablyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
