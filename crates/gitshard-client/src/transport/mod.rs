//! Protocol-neutral access to one shard.
//!
//! Every logical operation is defined once on [`Transport`]. The binary
//! RPC and legacy HTTP implementations differ only in how they put the
//! request on the wire and how they read failures back; both hand their
//! failures to the translator, so callers cannot tell them apart.

pub mod http;
pub mod rpc;
pub mod stream;

pub use http::{HttpShared, HttpTransport};
pub use rpc::RpcTransport;
pub use stream::{ResponseStream, SearchOutcome};

use crate::context::{CallContext, Protocol};
use async_trait::async_trait;
use bytes::Bytes;
use gitshard_core::*;

/// Size of the pieces a patch is uploaded in.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// One shard, reached over one protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn addr(&self) -> &str;

    /// Run a command; errors raised before the first output byte are
    /// returned here rather than from the stream.
    async fn exec(&self, ctx: &CallContext, req: ExecRequest)
        -> Result<ResponseStream<Bytes>, DomainError>;

    async fn archive(
        &self,
        ctx: &CallContext,
        req: ArchiveRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError>;

    async fn search(
        &self,
        ctx: &CallContext,
        req: SearchRequest,
    ) -> Result<ResponseStream<SearchEvent>, DomainError>;

    async fn get_object(
        &self,
        ctx: &CallContext,
        req: GetObjectRequest,
    ) -> Result<GetObjectResponse, DomainError>;

    async fn disk_info(&self, ctx: &CallContext) -> Result<DiskInfoResponse, DomainError>;

    async fn is_repo_cloneable(
        &self,
        ctx: &CallContext,
        req: IsRepoCloneableRequest,
    ) -> Result<IsRepoCloneableResponse, DomainError>;

    async fn repo_clone(
        &self,
        ctx: &CallContext,
        req: RepoCloneRequest,
    ) -> Result<RepoCloneResponse, DomainError>;

    async fn repo_clone_progress(
        &self,
        ctx: &CallContext,
        req: RepoCloneProgressRequest,
    ) -> Result<RepoCloneProgressResponse, DomainError>;

    async fn repo_info(
        &self,
        ctx: &CallContext,
        req: RepoInfoRequest,
    ) -> Result<RepoInfoResponse, DomainError>;

    async fn list_cloned(&self, ctx: &CallContext) -> Result<ListClonedResponse, DomainError>;

    async fn is_repo_cloned(
        &self,
        ctx: &CallContext,
        req: IsRepoClonedRequest,
    ) -> Result<IsRepoClonedResponse, DomainError>;

    async fn repo_update(
        &self,
        ctx: &CallContext,
        req: RepoUpdateRequest,
    ) -> Result<RepoUpdateResponse, DomainError>;

    async fn repo_delete(&self, ctx: &CallContext, req: RepoDeleteRequest)
        -> Result<(), DomainError>;

    async fn batch_log(
        &self,
        ctx: &CallContext,
        req: BatchLogRequest,
    ) -> Result<BatchLogResponse, DomainError>;

    async fn create_commit_from_patch(
        &self,
        ctx: &CallContext,
        req: CreateCommitFromPatchRequest,
    ) -> Result<CreateCommitFromPatchResponse, DomainError>;

    async fn list_gitolite(
        &self,
        ctx: &CallContext,
        req: ListGitoliteRequest,
    ) -> Result<ListGitoliteResponse, DomainError>;

    async fn repos_stats(&self, ctx: &CallContext) -> Result<ReposStats, DomainError>;

    async fn is_perforce_path_cloneable(
        &self,
        ctx: &CallContext,
        req: IsPerforcePathCloneableRequest,
    ) -> Result<(), DomainError>;

    async fn check_perforce_credentials(
        &self,
        ctx: &CallContext,
        req: CheckPerforceCredentialsRequest,
    ) -> Result<(), DomainError>;
}
