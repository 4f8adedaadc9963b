//! Errors raised by a shard's command backend.

use gitshard_core::{CommandStatusPayload, NotFoundPayload, RepoName, RpcStatus};
use thiserror::Error;

/// Git exit status for a bad object name.
pub const GIT_FATAL_EXIT_STATUS: i32 = 128;

const BAD_OBJECT_MESSAGE: &str = "git command failed";

fn bad_object_stderr(spec: &str) -> String {
    format!("fatal: not a valid object name {}", spec)
}

/// Failure of a backend operation, before it is rendered for either
/// protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("repository not found: {repo}")]
    RepoNotFound {
        repo: RepoName,
        clone_in_progress: bool,
        clone_progress: String,
    },

    #[error("revision not found: {repo}@{spec}")]
    RevisionNotFound { repo: RepoName, spec: String },

    #[error("{message} (exit status {exit_status})")]
    Command {
        message: String,
        exit_status: i32,
        stderr: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn repo_not_found(repo: RepoName) -> Self {
        BackendError::RepoNotFound {
            repo,
            clone_in_progress: false,
            clone_progress: String::new(),
        }
    }

    pub fn command(message: impl Into<String>, exit_status: i32, stderr: impl Into<String>) -> Self {
        BackendError::Command {
            message: message.into(),
            exit_status,
            stderr: stderr.into(),
        }
    }

    /// The failure git reports for a name that does not resolve.
    pub fn bad_object(spec: &str) -> Self {
        Self::command(BAD_OBJECT_MESSAGE, GIT_FATAL_EXIT_STATUS, bad_object_stderr(spec))
    }

    /// The failure `git rev-parse` reports for an argument that is neither
    /// a revision nor a path.
    pub fn ambiguous_argument(arg: &str) -> Self {
        Self::command(
            BAD_OBJECT_MESSAGE,
            GIT_FATAL_EXIT_STATUS,
            format!(
                "fatal: ambiguous argument '{}': unknown revision or path not in the working tree.",
                arg
            ),
        )
    }

    /// Command status as carried by `X-Exec-*` headers. Revision misses
    /// travel as git's own failure so the text heuristic can recover them.
    pub fn command_status(&self) -> Option<CommandStatusPayload> {
        match self {
            BackendError::Command {
                message,
                exit_status,
                stderr,
            } => Some(CommandStatusPayload {
                message: message.clone(),
                exit_status: *exit_status,
                stderr: stderr.clone(),
            }),
            BackendError::RevisionNotFound { spec, .. } => Some(CommandStatusPayload {
                message: BAD_OBJECT_MESSAGE.to_string(),
                exit_status: GIT_FATAL_EXIT_STATUS,
                stderr: bad_object_stderr(spec),
            }),
            _ => None,
        }
    }

    /// Render as a binary RPC status.
    pub fn to_status(&self) -> RpcStatus {
        match self {
            BackendError::RepoNotFound {
                repo,
                clone_in_progress,
                clone_progress,
            } => RpcStatus::repo_not_found(NotFoundPayload {
                repo: repo.clone(),
                clone_in_progress: *clone_in_progress,
                clone_progress: clone_progress.clone(),
            }),
            BackendError::RevisionNotFound { repo, spec } => {
                RpcStatus::revision_not_found(repo.clone(), spec.clone())
            }
            BackendError::Command {
                message,
                exit_status,
                stderr,
            } => RpcStatus::command_failed(CommandStatusPayload {
                message: message.clone(),
                exit_status: *exit_status,
                stderr: stderr.clone(),
            }),
            BackendError::InvalidArgument(message) => RpcStatus::invalid_argument(message.clone()),
            BackendError::Unavailable(message) => RpcStatus::unavailable(message.clone()),
            BackendError::Internal(message) => RpcStatus::internal(message.clone()),
        }
    }

    /// Whether the failure belongs to the request item rather than to the
    /// shard as a whole.
    pub fn is_item_error(&self) -> bool {
        matches!(
            self,
            BackendError::RepoNotFound { .. }
                | BackendError::RevisionNotFound { .. }
                | BackendError::Command { .. }
        )
    }
}

impl From<BackendError> for RpcStatus {
    fn from(err: BackendError) -> Self {
        err.to_status()
    }
}
