//! Error types for task execution.
//!
//! Errors carry context that chains through layers:
//! Task → Stage → Operation → Detail
//!
//! Programming errors (double whitelist, tainted cache hit, unbalanced
//! scopes) are not represented here: they panic.

use std::io;

use thiserror::Error;

use crate::models::{StageName, TaskPhase, GENERIC_FAILURE};
use crate::registry::RegistryError;

/// Signal raised by the status reporter when the task has been aborted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The task has been aborted.")]
pub struct Cancelled;

/// Error returned by a stage collaborator.
#[derive(Error, Debug)]
pub enum StageError {
    /// Bad input or policy violation; shown to the owner verbatim.
    #[error("{0}")]
    User(String),

    /// Failure of the remote site or authentication layer.
    #[error("{context}: {message}")]
    Infrastructure { context: String, message: String },

    /// The task was aborted at a status checkpoint.
    #[error("The task has been aborted.")]
    Cancelled,

    /// An external command failed.
    #[error("{tool} failed with exit code {exit_code}: {message}")]
    CommandFailed {
        tool: String,
        exit_code: i32,
        message: String,
    },

    /// File I/O error.
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl StageError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn infrastructure(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Infrastructure {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn command_failed(
        tool: impl Into<String>,
        exit_code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            tool: tool.into(),
            exit_code,
            message: message.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Cancelled> for StageError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Result type for stage collaborators.
pub type StageResult<T> = Result<T, StageError>;

/// Failure to set up a resource scope.
#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Could not create a unique working directory after {attempts} attempts")]
    WorkDirExhausted { attempts: u32 },

    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl ScopeError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

/// Top-level error of a task execution.
#[derive(Error, Debug)]
pub enum TaskError {
    /// A stage failed.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: StageError,
    },

    /// Entering the authentication scope failed.
    #[error("Authentication failed: {0}")]
    Auth(#[source] StageError),

    /// The task was aborted outside of a stage.
    #[error("The task has been aborted.")]
    Cancelled,

    /// A resource scope could not be set up.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// Disk headroom never became available.
    #[error("Not enough free disk space after {attempts} attempts")]
    ResourceExhausted { attempts: u32 },

    /// The durable store failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl TaskError {
    pub fn stage(stage: StageName, source: StageError) -> Self {
        Self::Stage { stage, source }
    }

    /// Whether this error is the abort signal, wherever it was raised.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Stage { source, .. } | Self::Auth(source) => source.is_cancelled(),
            _ => false,
        }
    }

    /// Terminal phase and user-visible text for this error.
    pub fn classify(&self) -> Failure {
        let source = match self {
            Self::Stage { source, .. } | Self::Auth(source) => source,
            Self::Cancelled => return Failure::aborted(),
            Self::ResourceExhausted { .. } => {
                return Failure::failed(
                    "The worker is out of disk space. Please try again later.",
                )
            }
            Self::Scope(_) | Self::Registry(_) => return Failure::failed(GENERIC_FAILURE),
        };

        match source {
            StageError::User(message) => Failure::failed(message.clone()),
            StageError::Infrastructure { .. } => Failure::failed(source.to_string()),
            StageError::Cancelled => Failure::aborted(),
            StageError::CommandFailed { .. } | StageError::Io { .. } => {
                Failure::failed(GENERIC_FAILURE)
            }
        }
    }
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// How a failed execution is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub phase: TaskPhase,
    pub text: String,
}

impl Failure {
    fn failed(text: impl Into<String>) -> Self {
        Self {
            phase: TaskPhase::Failed,
            text: text.into(),
        }
    }

    fn aborted() -> Self {
        Self {
            phase: TaskPhase::Aborted,
            text: String::new(),
        }
    }
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_shown_verbatim() {
        let err = TaskError::stage(
            StageName::Upload,
            StageError::user("File already exists. Please choose another name."),
        );
        let failure = err.classify();
        assert_eq!(failure.phase, TaskPhase::Failed);
        assert_eq!(failure.text, "File already exists. Please choose another name.");
    }

    #[test]
    fn infrastructure_errors_keep_context() {
        let err = TaskError::Auth(StageError::infrastructure("Login failed", "HTTP 503"));
        assert_eq!(err.classify().text, "Login failed: HTTP 503");
    }

    #[test]
    fn cancellation_is_aborted_everywhere() {
        let in_stage = TaskError::stage(StageName::Download, Cancelled.into());
        assert!(in_stage.is_cancelled());
        assert_eq!(in_stage.classify().phase, TaskPhase::Aborted);
        assert_eq!(TaskError::from(Cancelled).classify().phase, TaskPhase::Aborted);
    }

    #[test]
    fn unexpected_errors_get_generic_text() {
        let err = TaskError::stage(
            StageName::Encode,
            StageError::command_failed("ffmpeg", 1, "Invalid data found"),
        );
        let failure = err.classify();
        assert_eq!(failure.text, GENERIC_FAILURE);
        assert!(!failure.text.contains("ffmpeg"));
    }

    #[test]
    fn stage_error_displays_context() {
        let err = StageError::command_failed("yt-dlp", 2, "Unsupported URL");
        let msg = err.to_string();
        assert!(msg.contains("yt-dlp"));
        assert!(msg.contains("exit code 2"));
    }
}
