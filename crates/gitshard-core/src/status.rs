//! Error status carried on the wire.
//!
//! Shards report failures as an [`RpcStatus`]: a coarse code, a message and
//! optional structured details. The legacy HTTP surface carries the same
//! information as a 404 [`NotFoundPayload`] or `X-Exec-*` headers.

use crate::repo::RepoName;
use serde::{Deserialize, Serialize};

/// Header naming the failed command's error message.
pub const EXEC_ERROR_HEADER: &str = "X-Exec-Error";
/// Header carrying the failed command's exit status.
pub const EXEC_EXIT_STATUS_HEADER: &str = "X-Exec-Exit-Status";
/// Header carrying the failed command's standard error.
pub const EXEC_STDERR_HEADER: &str = "X-Exec-Stderr";

/// Coarse status code of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Canceled,
    DeadlineExceeded,
    NotFound,
    InvalidArgument,
    Aborted,
    Unavailable,
    Unimplemented,
    Internal,
    Unknown,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Canceled => "canceled",
            StatusCode::DeadlineExceeded => "deadline exceeded",
            StatusCode::NotFound => "not found",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::Aborted => "aborted",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Payload describing a repository the shard does not have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotFoundPayload {
    pub repo: RepoName,
    #[serde(default)]
    pub clone_in_progress: bool,
    #[serde(default)]
    pub clone_progress: String,
}

/// Exit status and standard error of a failed git command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatusPayload {
    pub message: String,
    pub exit_status: i32,
    pub stderr: String,
}

/// Structured detail attached to a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusDetail {
    RepoNotFound(NotFoundPayload),
    RevisionNotFound { repo: RepoName, spec: String },
    CommandStatus(CommandStatusPayload),
}

/// Serializable error returned by every binary RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
    #[serde(default)]
    pub details: Vec<StatusDetail>,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attach a structured detail.
    pub fn with_detail(mut self, detail: StatusDetail) -> Self {
        self.details.push(detail);
        self
    }

    pub fn repo_not_found(payload: NotFoundPayload) -> Self {
        Self::new(StatusCode::NotFound, format!("repository not found: {}", payload.repo))
            .with_detail(StatusDetail::RepoNotFound(payload))
    }

    pub fn revision_not_found(repo: RepoName, spec: impl Into<String>) -> Self {
        let spec = spec.into();
        Self::new(StatusCode::NotFound, format!("revision not found: {}@{}", repo, spec))
            .with_detail(StatusDetail::RevisionNotFound { repo, spec })
    }

    pub fn command_failed(payload: CommandStatusPayload) -> Self {
        Self::new(StatusCode::Aborted, payload.message.clone())
            .with_detail(StatusDetail::CommandStatus(payload))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}
