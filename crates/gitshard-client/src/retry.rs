//! Retry of idempotent operations.
//!
//! Each logical operation is classified once. Operations with side effects
//! are never retried, nor are command streams and patch uploads. Read-only
//! queries (search initiation included) and idempotent updates are retried
//! on `Unavailable` with bounded exponential backoff.

use crate::config::ClientConfig;
use crate::context::CallContext;
use gitshard_core::DomainError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Every logical client operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Exec,
    Archive,
    Search,
    GetObject,
    DiskInfo,
    IsRepoCloneable,
    RepoClone,
    RepoCloneProgress,
    RepoInfo,
    ListCloned,
    IsRepoCloned,
    ResolveRevisions,
    RepoUpdate,
    RepoDelete,
    BatchLog,
    CreateCommitFromPatch,
    ListGitolite,
    ReposStats,
    IsPerforcePathCloneable,
    CheckPerforceCredentials,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Exec => "exec",
            Operation::Archive => "archive",
            Operation::Search => "search",
            Operation::GetObject => "get_object",
            Operation::DiskInfo => "disk_info",
            Operation::IsRepoCloneable => "is_repo_cloneable",
            Operation::RepoClone => "repo_clone",
            Operation::RepoCloneProgress => "repo_clone_progress",
            Operation::RepoInfo => "repo_info",
            Operation::ListCloned => "list_cloned",
            Operation::IsRepoCloned => "is_repo_cloned",
            Operation::ResolveRevisions => "resolve_revisions",
            Operation::RepoUpdate => "repo_update",
            Operation::RepoDelete => "repo_delete",
            Operation::BatchLog => "batch_log",
            Operation::CreateCommitFromPatch => "create_commit_from_patch",
            Operation::ListGitolite => "list_gitolite",
            Operation::ReposStats => "repos_stats",
            Operation::IsPerforcePathCloneable => "is_perforce_path_cloneable",
            Operation::CheckPerforceCredentials => "check_perforce_credentials",
        }
    }

    /// Whether a failed attempt may be repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Operation::Exec
            | Operation::Archive
            | Operation::RepoClone
            | Operation::RepoDelete
            | Operation::CreateCommitFromPatch => false,
            Operation::Search
            | Operation::GetObject
            | Operation::DiskInfo
            | Operation::IsRepoCloneable
            | Operation::RepoCloneProgress
            | Operation::RepoInfo
            | Operation::ListCloned
            | Operation::IsRepoCloned
            | Operation::ResolveRevisions
            | Operation::RepoUpdate
            | Operation::BatchLog
            | Operation::ListGitolite
            | Operation::ReposStats
            | Operation::IsPerforcePathCloneable
            | Operation::CheckPerforceCredentials => true,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Attempt ceiling and backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for one call of `op`. Non-retryable operations get a single
    /// attempt; the call context may lower or raise the ceiling.
    pub fn for_call(op: Operation, config: &ClientConfig, ctx: &CallContext) -> Self {
        let max_attempts = if op.is_retryable() {
            ctx.retry_attempts().unwrap_or(config.retry_attempts).max(1)
        } else {
            1
        };
        Self {
            max_attempts,
            initial_delay: config.retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Backoff before attempt `attempt + 1` (attempts count from 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `call` under `policy`, retrying `Unavailable` failures. Backoff
/// sleeps end early with `Canceled` or `DeadlineExceeded`.
pub async fn with_retry<T, F, Fut>(
    ctx: &CallContext,
    op: Operation,
    policy: RetryPolicy,
    mut call: F,
) -> Result<T, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_unavailable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                debug!(
                    op = op.name(),
                    attempt,
                    ?delay,
                    "Retrying after transient failure: {}",
                    err
                );
                ctx.run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitshard_core::TransportErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> ClientConfig {
        ClientConfig {
            retry_delay_ms: 1,
            max_retry_delay_ms: 4,
            ..ClientConfig::default()
        }
    }

    fn unavailable() -> DomainError {
        DomainError::transport(TransportErrorKind::Unavailable, "connection refused")
    }

    #[test]
    fn test_classification() {
        assert!(!Operation::RepoDelete.is_retryable());
        assert!(!Operation::RepoClone.is_retryable());
        assert!(!Operation::Exec.is_retryable());
        assert!(!Operation::CreateCommitFromPatch.is_retryable());
        assert!(Operation::DiskInfo.is_retryable());
        assert!(Operation::GetObject.is_retryable());
        assert!(Operation::BatchLog.is_retryable());
        assert!(Operation::RepoInfo.is_retryable());
        assert!(Operation::ListCloned.is_retryable());
        assert!(Operation::IsRepoCloned.is_retryable());
        assert!(Operation::ResolveRevisions.is_retryable());
    }

    #[test]
    fn test_delay_is_bounded() {
        let policy = RetryPolicy::for_call(
            Operation::DiskInfo,
            &ClientConfig::default(),
            &CallContext::default(),
        );
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(60), Duration::from_millis(2000));
    }

    #[test]
    fn test_context_override() {
        let config = ClientConfig::default();
        let ctx = CallContext::default().with_retry_attempts(0);
        assert_eq!(RetryPolicy::for_call(Operation::DiskInfo, &config, &ctx).max_attempts, 1);

        let ctx = CallContext::default().with_retry_attempts(7);
        assert_eq!(RetryPolicy::for_call(Operation::DiskInfo, &config, &ctx).max_attempts, 7);
        assert_eq!(RetryPolicy::for_call(Operation::RepoDelete, &config, &ctx).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_unavailable_until_success() {
        let ctx = CallContext::default();
        let policy = RetryPolicy::for_call(Operation::DiskInfo, &fast_config(), &ctx);
        let calls = AtomicU32::new(0);

        let result = with_retry(&ctx, Operation::DiskInfo, policy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(unavailable())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_ceiling() {
        let ctx = CallContext::default();
        let policy = RetryPolicy::for_call(Operation::DiskInfo, &fast_config(), &ctx);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&ctx, Operation::DiskInfo, policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        })
        .await;

        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_operation_runs_once() {
        let ctx = CallContext::default();
        let policy = RetryPolicy::for_call(Operation::RepoDelete, &fast_config(), &ctx);
        let calls = AtomicU32::new(0);

        let _: Result<(), _> = with_retry(&ctx, Operation::RepoDelete, policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let ctx = CallContext::default();
        let policy = RetryPolicy::for_call(Operation::GetObject, &fast_config(), &ctx);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&ctx, Operation::GetObject, policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::DeadlineExceeded)
        })
        .await;

        assert_eq!(result, Err(DomainError::DeadlineExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let config = ClientConfig {
            retry_delay_ms: 10_000,
            max_retry_delay_ms: 10_000,
            ..ClientConfig::default()
        };
        let ctx = CallContext::default();
        let policy = RetryPolicy::for_call(Operation::DiskInfo, &config, &ctx);

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = with_retry(&ctx, Operation::DiskInfo, policy, || async {
            Err(unavailable())
        })
        .await;
        assert_eq!(result, Err(DomainError::Canceled));
    }
}
