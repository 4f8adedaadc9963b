//! Per-call context: protocol selection, cancellation and deadline.

use gitshard_core::DomainError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wire protocol used to reach a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Binary RPC (tarpc over bincode).
    #[default]
    Rpc,
    /// Legacy HTTP/JSON.
    Http,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Rpc => f.write_str("rpc"),
            Protocol::Http => f.write_str("http"),
        }
    }
}

/// Context threaded through every client operation.
///
/// Cloning shares the cancellation token; [`CallContext::child`] derives a
/// token that can be cancelled without touching the parent.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub protocol: Protocol,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    retry_attempts: Option<u32>,
}

impl CallContext {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keep the earlier of the existing and the given deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Override the retry ceiling; `1` disables retries.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn retry_attempts(&self) -> Option<u32> {
        self.retry_attempts
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context whose token is cancelled with the parent but can also be
    /// cancelled on its own.
    pub fn child(&self) -> CallContext {
        CallContext {
            protocol: self.protocol,
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            retry_attempts: self.retry_attempts,
        }
    }

    /// Error for a context that is already done, if any.
    pub fn err(&self) -> Option<DomainError> {
        if self.cancel.is_cancelled() {
            Some(DomainError::Canceled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(DomainError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Drive `fut` until it completes, the context is cancelled or the
    /// deadline passes. Cancellation wins over an expired deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, DomainError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DomainError::Canceled),
            _ = sleep_until(self.deadline) => Err(DomainError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Resolves at `deadline`, or never when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
