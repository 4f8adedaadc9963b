//! Mapping of raw transport failures onto [`DomainError`].
//!
//! This is the only place that builds taxonomy variants from wire data.
//! Precedence: cancellation, then deadline, then structured details, then a
//! generic transport error.

use gitshard_core::{
    CommandStatusPayload, DomainError, NotFoundPayload, RepoName, RpcStatus, StatusCode,
    StatusDetail, TransportErrorKind,
};

/// Substrings of git output that mean a revision does not exist.
const REVISION_NOT_FOUND_MARKERS: &[&str] = &["not a valid object"];

/// Failure as observed by a transport, before translation.
#[derive(Debug)]
pub enum RawError {
    /// The call context was cancelled.
    Canceled,
    /// The call context deadline passed.
    DeadlineExceeded,
    /// Binary RPC returned an error status.
    Status(RpcStatus),
    /// Binary RPC framework failure.
    Rpc(tarpc::client::RpcError),
    /// Legacy 404 with a not-found payload.
    NotFound(NotFoundPayload),
    /// Legacy non-200 carrying `X-Exec-*` headers.
    CommandStatus(CommandStatusPayload),
    /// Legacy non-200 without structured data; `body` is already truncated.
    HttpStatus { status: u16, body: String },
    Http(reqwest::Error),
    Decode(String),
}

impl From<RpcStatus> for RawError {
    fn from(status: RpcStatus) -> Self {
        RawError::Status(status)
    }
}

impl From<tarpc::client::RpcError> for RawError {
    fn from(err: tarpc::client::RpcError) -> Self {
        RawError::Rpc(err)
    }
}

impl From<reqwest::Error> for RawError {
    fn from(err: reqwest::Error) -> Self {
        RawError::Http(err)
    }
}

impl From<RawError> for DomainError {
    fn from(raw: RawError) -> Self {
        translate(raw)
    }
}

/// Translate a raw failure into the domain taxonomy.
pub fn translate(raw: RawError) -> DomainError {
    match raw {
        RawError::Canceled => DomainError::Canceled,
        RawError::DeadlineExceeded => DomainError::DeadlineExceeded,
        RawError::Status(status) => translate_status(status),
        RawError::Rpc(err) => translate_rpc(err),
        RawError::NotFound(payload) => repo_not_exist(payload),
        RawError::CommandStatus(payload) => command_failed(payload),
        RawError::HttpStatus { status, body } => DomainError::transport(
            http_status_kind(status),
            format!("unexpected status {}: {}", status, body),
        ),
        RawError::Http(err) => translate_http(err),
        RawError::Decode(message) => DomainError::transport(TransportErrorKind::Decode, message),
    }
}

fn translate_status(status: RpcStatus) -> DomainError {
    match status.code {
        StatusCode::Canceled => return DomainError::Canceled,
        StatusCode::DeadlineExceeded => return DomainError::DeadlineExceeded,
        _ => {}
    }

    for detail in status.details {
        match detail {
            StatusDetail::RepoNotFound(payload) => return repo_not_exist(payload),
            StatusDetail::RevisionNotFound { repo, spec } => {
                return DomainError::RevisionNotFound { repo, spec }
            }
            StatusDetail::CommandStatus(payload) => return command_failed(payload),
        }
    }

    let kind = match status.code {
        StatusCode::Unavailable => TransportErrorKind::Unavailable,
        code => TransportErrorKind::Status(code),
    };
    DomainError::transport(kind, status.message)
}

fn translate_rpc(err: tarpc::client::RpcError) -> DomainError {
    match err {
        tarpc::client::RpcError::DeadlineExceeded => DomainError::DeadlineExceeded,
        // Shutdown, send and receive failures all mean the connection is gone.
        other => DomainError::transport(TransportErrorKind::Unavailable, other.to_string()),
    }
}

/// Gateway and overload statuses are as transient as a refused connection.
fn http_status_kind(status: u16) -> TransportErrorKind {
    match status {
        502..=504 => TransportErrorKind::Unavailable,
        other => TransportErrorKind::HttpStatus(other),
    }
}

fn translate_http(err: reqwest::Error) -> DomainError {
    if err.is_timeout() {
        return DomainError::DeadlineExceeded;
    }
    let kind = if err.is_connect() {
        TransportErrorKind::Unavailable
    } else if err.is_decode() {
        TransportErrorKind::Decode
    } else {
        TransportErrorKind::Other
    };
    DomainError::transport(kind, err.to_string())
}

fn repo_not_exist(payload: NotFoundPayload) -> DomainError {
    DomainError::RepoNotExist {
        repo: payload.repo,
        clone_in_progress: payload.clone_in_progress,
        clone_progress: payload.clone_progress,
    }
}

fn command_failed(payload: CommandStatusPayload) -> DomainError {
    DomainError::command_failed(payload.message, payload.exit_status, &payload.stderr)
}

/// Whether git output says a revision does not exist.
///
/// Text matching is the only signal some shard responses give for this.
pub fn is_revision_not_found(text: &str) -> bool {
    let lower = text.to_lowercase();
    REVISION_NOT_FOUND_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// The argument `git rev-parse` calls ambiguous, i.e. neither a revision
/// nor a path.
pub fn ambiguous_revision(text: &str) -> Option<&str> {
    const MARKER: &str = "ambiguous argument '";
    let start = text.find(MARKER)? + MARKER.len();
    let len = text[start..].find('\'')?;
    Some(&text[start..start + len])
}

/// Reclassify a command failure as `RevisionNotFound` when its output
/// matches [`is_revision_not_found`]. Other errors pass through.
pub fn classify_revision_error(err: DomainError, repo: &RepoName, spec: &str) -> DomainError {
    match err {
        DomainError::CommandFailed {
            ref message,
            ref stderr_excerpt,
            ..
        } if is_revision_not_found(stderr_excerpt) || is_revision_not_found(message) => {
            DomainError::RevisionNotFound {
                repo: repo.clone(),
                spec: spec.to_string(),
            }
        }
        DomainError::Transport(ref transport) if is_revision_not_found(&transport.message) => {
            DomainError::RevisionNotFound {
                repo: repo.clone(),
                spec: spec.to_string(),
            }
        }
        other => other,
    }
}
