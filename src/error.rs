//! Error taxonomy shared by converters, storage and the worker.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::format::ConversionPair;
use crate::job::TransitionError;

/// Failure reported by a [`Converter`](crate::converter::Converter).
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Input is missing, not a regular file, or empty.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The input was readable but could not be interpreted.
    #[error("corrupt or unreadable input: {0}")]
    CorruptInput(String),

    #[error("{0}")]
    ToolUnavailable(String),

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("conversion produced no output: {0}")]
    OutputMissing(String),

    /// The cancellation token fired while the conversion was running.
    #[error("conversion cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConvertError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvertError::ToolUnavailable(_)
                | ConvertError::ToolFailed { .. }
                | ConvertError::OutputMissing(_)
                | ConvertError::Io(_)
        )
    }
}

/// Lookup failure in the converter registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("conversion from '{}' to '{}' is not supported", .0.from, .0.to)]
pub struct NotSupported(pub ConversionPair);

/// Failure of a storage backend operation. The message of the underlying
/// backend is always preserved.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("upload of '{key}' failed: {message}")]
    Upload { key: String, message: String },

    #[error("upload of '{key}' could not be verified: {reason}")]
    Unverified { key: String, reason: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Failure while materialising the final artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("converter reported no pages")]
    NoPages,

    #[error("produced file {0} does not exist")]
    MissingOutput(String),

    #[error("failed to bundle pages into {archive}: {message}")]
    Bundle { archive: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of a failed job attempt, classified for the retry policy.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    NotSupported(#[from] NotSupported),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("soft time limit of {}s exceeded", .0.as_secs())]
    SoftTimeLimitExceeded(Duration),

    #[error("hard time limit of {}s exceeded, execution terminated", .0.as_secs())]
    HardTimeLimitExceeded(Duration),

    #[error("worker execution aborted: {0}")]
    Aborted(String),
}

impl ExecutionError {
    /// Transient failures are retried; everything else fails the job at once.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Convert(err) => err.is_retryable(),
            ExecutionError::Aborted(_) => true,
            _ => false,
        }
    }
}
