use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy surfaced by every pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Reading or writing an artifact (or the session database) failed.
    #[error("storage error ({context}): {reason}")]
    Storage { context: String, reason: String },

    /// A precondition is missing: no uploaded image, no segments, unknown segment.
    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator could not produce a result for the given input.
    #[error("processing failed ({context}): {reason}")]
    Processing { context: String, reason: String },

    /// Malformed or unsupported input supplied by the user.
    #[error("invalid input: {0}")]
    Validation(String),
}

impl PipelineError {
    pub fn storage(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Storage {
            context: context.into(),
            reason: err.to_string(),
        }
    }

    pub fn processing(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Processing {
            context: context.into(),
            reason: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::storage("session database", err)
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        PipelineError::storage("session database migration", err)
    }
}

/// Errors reported by the external model collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("input rejected: {0}")]
    InvalidInput(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
