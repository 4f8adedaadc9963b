//! Binary RPC service exposed by every shard.
//!
//! tarpc has no native streaming, so server streams are opened with a
//! `*_start` call and drained with [`GitserverService::next_chunk`] until
//! [`StreamChunk::End`] or an error. A reader that stops early calls
//! [`GitserverService::close_stream`]. Patch upload is the client-streaming
//! counterpart: begin, any number of chunks, finish. A writer that gives up
//! calls [`GitserverService::abort_commit_from_patch`].

use crate::protocol::*;
use crate::status::RpcStatus;

/// Result type for shard RPCs.
pub type RpcResult<T> = Result<T, RpcStatus>;

#[tarpc::service]
pub trait GitserverService {
    /// Open a stream over a command's standard output.
    async fn exec_start(req: ExecRequest) -> RpcResult<StreamId>;

    /// Open a stream over an archive of a tree.
    async fn archive_start(req: ArchiveRequest) -> RpcResult<StreamId>;

    /// Open a stream of commit search events.
    async fn search_start(req: SearchRequest) -> RpcResult<StreamId>;

    /// Pull the next item of an open stream.
    async fn next_chunk(id: StreamId) -> RpcResult<StreamChunk>;

    /// Release a stream the reader no longer wants.
    async fn close_stream(id: StreamId);

    async fn get_object(req: GetObjectRequest) -> RpcResult<GetObjectResponse>;

    async fn disk_info() -> RpcResult<DiskInfoResponse>;

    async fn is_repo_cloneable(req: IsRepoCloneableRequest) -> RpcResult<IsRepoCloneableResponse>;

    async fn repo_clone(req: RepoCloneRequest) -> RpcResult<RepoCloneResponse>;

    async fn repo_clone_progress(
        req: RepoCloneProgressRequest,
    ) -> RpcResult<RepoCloneProgressResponse>;

    async fn repo_info(req: RepoInfoRequest) -> RpcResult<RepoInfoResponse>;

    /// Every repository cloned on this shard.
    async fn list_cloned() -> RpcResult<ListClonedResponse>;

    async fn is_repo_cloned(req: IsRepoClonedRequest) -> RpcResult<IsRepoClonedResponse>;

    async fn repo_update(req: RepoUpdateRequest) -> RpcResult<RepoUpdateResponse>;

    async fn repo_delete(req: RepoDeleteRequest) -> RpcResult<()>;

    async fn batch_log(req: BatchLogRequest) -> RpcResult<BatchLogResponse>;

    /// Start a patch upload.
    async fn begin_commit_from_patch(metadata: PatchMetadata) -> RpcResult<UploadId>;

    /// Append a chunk of patch bytes to an upload.
    async fn upload_patch_chunk(id: UploadId, data: Vec<u8>) -> RpcResult<()>;

    /// Apply the uploaded patch and create the commit.
    async fn finish_commit_from_patch(id: UploadId) -> RpcResult<CreateCommitFromPatchResponse>;

    /// Drop an upload that will never be finished.
    async fn abort_commit_from_patch(id: UploadId);

    async fn list_gitolite(req: ListGitoliteRequest) -> RpcResult<ListGitoliteResponse>;

    async fn repos_stats() -> RpcResult<ReposStats>;

    async fn is_perforce_path_cloneable(req: IsPerforcePathCloneableRequest) -> RpcResult<()>;

    async fn check_perforce_credentials(req: CheckPerforceCredentialsRequest) -> RpcResult<()>;
}
