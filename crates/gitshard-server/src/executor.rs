//! Backend seam between the shard endpoint and the repositories it hosts.

use crate::error::BackendError;
use async_trait::async_trait;
use gitshard_core::{
    ArchiveRequest, CommitMatch, DiskInfoResponse, ExecRequest, GitObject, GitoliteRepo,
    IsRepoCloneableResponse, PatchMetadata, PerforceConnection, RepoCloneProgress, RepoCommit,
    RepoInfo, RepoName, RepoUpdateRequest, RepoUpdateResponse, ReposStats, SearchRequest,
};

pub type BackendResult<T> = Result<T, BackendError>;

/// Result of a commit search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutput {
    pub matches: Vec<CommitMatch>,
    pub limit_hit: bool,
}

/// Operations a shard performs against its repositories.
///
/// Both protocol front ends call the same executor, so a failure renders
/// identically on either one.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Standard output of a git command.
    async fn exec(&self, req: &ExecRequest) -> BackendResult<Vec<u8>>;

    async fn archive(&self, req: &ArchiveRequest) -> BackendResult<Vec<u8>>;

    async fn search(&self, req: &SearchRequest) -> BackendResult<SearchOutput>;

    async fn get_object(&self, repo: &RepoName, object_name: &str) -> BackendResult<GitObject>;

    async fn disk_info(&self) -> BackendResult<DiskInfoResponse>;

    async fn is_repo_cloneable(&self, repo: &RepoName) -> BackendResult<IsRepoCloneableResponse>;

    /// Start cloning `repo`; `Ok(Some(reason))` reports a clone that could
    /// not be started.
    async fn repo_clone(&self, repo: &RepoName) -> BackendResult<Option<String>>;

    async fn repo_clone_progress(&self, repo: &RepoName) -> BackendResult<RepoCloneProgress>;

    /// State of `repo` on this shard; a repository it never saw is reported
    /// as not cloned rather than as an error.
    async fn repo_info(&self, repo: &RepoName) -> BackendResult<RepoInfo>;

    async fn list_cloned(&self) -> BackendResult<Vec<RepoName>>;

    async fn repo_update(&self, req: &RepoUpdateRequest) -> BackendResult<RepoUpdateResponse>;

    async fn repo_delete(&self, repo: &RepoName) -> BackendResult<()>;

    /// `git log` output of one commit in `format`.
    async fn log(&self, repo_commit: &RepoCommit, format: &str) -> BackendResult<String>;

    /// Apply `patch` and return the created ref and commit id.
    async fn create_commit_from_patch(
        &self,
        metadata: &PatchMetadata,
        patch: &[u8],
    ) -> BackendResult<(String, String)>;

    async fn list_gitolite(&self, host: &str) -> BackendResult<Vec<GitoliteRepo>>;

    async fn repos_stats(&self) -> BackendResult<ReposStats>;

    async fn is_perforce_path_cloneable(
        &self,
        connection: &PerforceConnection,
        depot_path: &str,
    ) -> BackendResult<()>;

    async fn check_perforce_credentials(&self, connection: &PerforceConnection)
        -> BackendResult<()>;
}
