//! Domain error taxonomy.
//!
//! Callers only ever see [`DomainError`]; which protocol produced a failure
//! is not observable from the variant.

use crate::repo::RepoName;
use crate::status::StatusCode;
use thiserror::Error;

/// Maximum bytes of standard error kept in a [`DomainError::CommandFailed`].
pub const STDERR_EXCERPT_LIMIT: usize = 200;

const TRUNCATION_MARKER: &str = "... (truncated)";

/// Stable error taxonomy returned by every client operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("repository not found: {repo}")]
    RepoNotExist {
        repo: RepoName,
        clone_in_progress: bool,
        clone_progress: String,
    },

    #[error("revision not found: {repo}@{spec}")]
    RevisionNotFound { repo: RepoName, spec: String },

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("command failed with exit status {exit_code}: {message}: {stderr_excerpt}")]
    CommandFailed {
        message: String,
        exit_code: i32,
        stderr_excerpt: String,
    },

    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl DomainError {
    /// Build a `CommandFailed`, capping standard error to an excerpt.
    pub fn command_failed(message: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        DomainError::CommandFailed {
            message: message.into(),
            exit_code,
            stderr_excerpt: excerpt(stderr, STDERR_EXCERPT_LIMIT),
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        DomainError::Transport(TransportError {
            kind,
            message: message.into(),
        })
    }

    /// Repository or revision does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DomainError::RepoNotExist { .. } | DomainError::RevisionNotFound { .. }
        )
    }

    /// Whether the failure should reach error reporting. Not-found outcomes
    /// are expected during normal traffic and are excluded.
    pub fn should_report(&self) -> bool {
        !self.is_not_found() && !matches!(self, DomainError::Canceled)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DomainError::Transport(TransportError {
                kind: TransportErrorKind::Unavailable,
                ..
            })
        )
    }
}

/// Failure of the transport itself, with the underlying cause as text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Shard unreachable or temporarily refusing work.
    Unavailable,
    /// Shard answered with a status outside the taxonomy.
    Status(StatusCode),
    /// Legacy endpoint answered with an unexpected HTTP status.
    HttpStatus(u16),
    /// Response could not be decoded.
    Decode,
    /// No shard address is configured.
    NoShards,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Unavailable => f.write_str("unavailable"),
            TransportErrorKind::Status(code) => write!(f, "status {}", code),
            TransportErrorKind::HttpStatus(code) => write!(f, "http status {}", code),
            TransportErrorKind::Decode => f.write_str("decode"),
            TransportErrorKind::NoShards => f.write_str("no shards"),
            TransportErrorKind::Other => f.write_str("other"),
        }
    }
}

/// Error of one shard in a best-effort fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub addr: String,
    pub error: DomainError,
}

/// Every failure of a best-effort fan-out, keyed by shard address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError {
    failures: Vec<ShardFailure>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, addr: impl Into<String>, error: DomainError) {
        self.failures.push(ShardFailure {
            addr: addr.into(),
            error,
        });
    }

    pub fn failures(&self) -> &[ShardFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `None` when nothing failed.
    pub fn into_option(self) -> Option<MultiError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} shard(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n\t* {}: {}", failure.addr, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Truncate `text` to at most `limit` bytes on a char boundary, marking the cut.
pub fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}
