//! Request and response messages shared by both wire protocols.
//!
//! The binary RPC surface encodes these with bincode, the legacy HTTP
//! surface with JSON.

use crate::repo::RepoName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Handle of a server-side response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

/// Handle of a client-side upload in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub u64);

/// One item pulled from a response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamChunk {
    Data(Vec<u8>),
    Search(SearchEvent),
    End,
}

/// Run a git command inside a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub repo: RepoName,
    pub args: Vec<String>,
    /// Revision the shard should fetch before running the command.
    #[serde(default)]
    pub ensure_revision: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Tar,
    Zip,
}

/// Produce an archive of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub repo: RepoName,
    pub treeish: String,
    pub format: ArchiveFormat,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Commit search over one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub repo: RepoName,
    #[serde(default)]
    pub revisions: Vec<String>,
    /// Substring matched against commit messages.
    pub query: String,
    #[serde(default)]
    pub include_diff: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMatch {
    pub oid: String,
    pub author: String,
    pub message: String,
    #[serde(default)]
    pub diff: Option<String>,
}

/// Incremental search output. A stream ends with `Done`.
///
/// Externally tagged: bincode cannot decode internally tagged enums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEvent {
    Matches { matches: Vec<CommitMatch> },
    Done { limit_hit: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectRequest {
    pub repo: RepoName,
    pub object_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitObject {
    pub id: String,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectResponse {
    pub object: GitObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfoResponse {
    pub free_space: u64,
    pub total_space: u64,
    pub percent_used: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsRepoCloneableRequest {
    pub repo: RepoName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsRepoCloneableResponse {
    pub cloneable: bool,
    #[serde(default)]
    pub cloned: bool,
    /// Why the repository is not cloneable, empty otherwise.
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCloneRequest {
    pub repo: RepoName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCloneResponse {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCloneProgressRequest {
    pub repos: Vec<RepoName>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCloneProgress {
    pub clone_in_progress: bool,
    pub clone_progress: String,
    pub cloned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCloneProgressResponse {
    pub results: HashMap<RepoName, RepoCloneProgress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsRepoClonedRequest {
    pub repo: RepoName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsRepoClonedResponse {
    pub cloned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfoRequest {
    pub repos: Vec<RepoName>,
}

/// What a shard knows about one repository, cloned or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub cloned: bool,
    pub clone_in_progress: bool,
    #[serde(default)]
    pub clone_progress: String,
    /// Unix seconds of the last fetch.
    #[serde(default)]
    pub last_fetched: Option<u64>,
    #[serde(default)]
    pub last_changed: Option<u64>,
    /// Size of the repository on disk.
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfoResponse {
    pub results: HashMap<RepoName, RepoInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListClonedResponse {
    pub repos: Vec<RepoName>,
}

/// One revision argument for [`rev-parse`]-style resolution.
///
/// At most one field is meant to be set. An all-empty specifier stands
/// for `HEAD`.
///
/// [`rev-parse`]: https://git-scm.com/docs/git-rev-parse
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSpecifier {
    /// A revision, range or other expression git understands.
    #[serde(default)]
    pub rev_spec: String,
    /// Include every ref matching this glob.
    #[serde(default)]
    pub ref_glob: String,
    /// Exclude refs matching this glob from the following glob.
    #[serde(default)]
    pub exclude_ref_glob: String,
}

impl RevisionSpecifier {
    pub fn rev(spec: impl Into<String>) -> Self {
        Self {
            rev_spec: spec.into(),
            ..Self::default()
        }
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        Self {
            ref_glob: pattern.into(),
            ..Self::default()
        }
    }

    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            exclude_ref_glob: pattern.into(),
            ..Self::default()
        }
    }

    /// The `git rev-parse` argument this specifier stands for.
    pub fn to_git_arg(&self) -> String {
        if !self.rev_spec.is_empty() {
            self.rev_spec.clone()
        } else if !self.ref_glob.is_empty() {
            format!("--glob={}", self.ref_glob)
        } else if !self.exclude_ref_glob.is_empty() {
            format!("--exclude={}", self.exclude_ref_glob)
        } else {
            "HEAD".to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUpdateRequest {
    pub repo: RepoName,
    /// Skip the fetch if the repository was updated within this many seconds.
    #[serde(default)]
    pub since_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUpdateResponse {
    /// Unix seconds of the last fetch.
    #[serde(default)]
    pub last_fetched: Option<u64>,
    #[serde(default)]
    pub last_changed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDeleteRequest {
    pub repo: RepoName,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoCommit {
    pub repo: RepoName,
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLogRequest {
    pub repo_commits: Vec<RepoCommit>,
    /// `--format` argument passed to `git log`.
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLogResult {
    pub repo_commit: RepoCommit,
    pub command_output: String,
    #[serde(default)]
    pub command_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLogResponse {
    pub results: Vec<BatchLogResult>,
}

/// Commit description accompanying an uploaded patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMetadata {
    pub repo: RepoName,
    pub base_commit: String,
    pub target_ref: String,
    #[serde(default)]
    pub unique_ref: bool,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCommitFromPatchRequest {
    pub metadata: PatchMetadata,
    pub patch: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCommitFromPatchResponse {
    /// Ref the commit was written to.
    pub rev: String,
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListGitoliteRequest {
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitoliteRepo {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListGitoliteResponse {
    pub repos: Vec<GitoliteRepo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReposStats {
    pub repo_count: u64,
    pub git_dir_bytes: u64,
    /// Unix seconds of the last statistics refresh.
    pub updated_at: u64,
}

/// Perforce server credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerforceConnection {
    pub port: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsPerforcePathCloneableRequest {
    pub connection: PerforceConnection,
    pub depot_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPerforceCredentialsRequest {
    pub connection: PerforceConnection,
}
