//! tarpc implementation of [`GitserverService`].
//!
//! Streaming operations run their command when the stream is opened, so
//! failures are reported by the `*_start` call. The output is then queued
//! in chunks and drained by `next_chunk`.

use crate::error::BackendError;
use crate::executor::{BackendResult, CommandExecutor, SearchOutput};
use gitshard_core::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tarpc::context::Context;
use tracing::{debug, instrument};

/// Bytes per data chunk of a byte stream.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;
/// Commit matches per search event.
pub const SEARCH_BATCH_SIZE: usize = 50;
/// Largest patch accepted by an upload.
pub const MAX_PATCH_BYTES: usize = 64 * 1024 * 1024;

struct Upload {
    metadata: PatchMetadata,
    patch: Vec<u8>,
}

/// Open streams and uploads, shared by every connection of a shard.
#[derive(Default)]
struct Sessions {
    next_id: AtomicU64,
    streams: Mutex<HashMap<StreamId, VecDeque<StreamChunk>>>,
    uploads: Mutex<HashMap<UploadId, Upload>>,
}

impl Sessions {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn open(&self, chunks: VecDeque<StreamChunk>) -> StreamId {
        let id = StreamId(self.next_id());
        self.streams.lock().insert(id, chunks);
        id
    }

    /// Pop the next chunk; an exhausted stream yields `End` and is dropped.
    fn next(&self, id: StreamId) -> Option<StreamChunk> {
        let mut streams = self.streams.lock();
        let queue = streams.get_mut(&id)?;
        match queue.pop_front() {
            Some(chunk) => Some(chunk),
            None => {
                streams.remove(&id);
                Some(StreamChunk::End)
            }
        }
    }

    fn close(&self, id: StreamId) -> bool {
        self.streams.lock().remove(&id).is_some()
    }
}

/// Shard endpoint over a [`CommandExecutor`]. Cheap to clone; clones share
/// their sessions.
#[derive(Clone)]
pub struct ShardServer {
    executor: Arc<dyn CommandExecutor>,
    sessions: Arc<Sessions>,
}

impl ShardServer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            sessions: Arc::new(Sessions::default()),
        }
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Number of server streams not yet drained or closed.
    pub fn open_streams(&self) -> usize {
        self.sessions.streams.lock().len()
    }

    /// Number of patch uploads begun but neither finished nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.sessions.uploads.lock().len()
    }

    /// Log lines of every requested commit. Failures of a single commit
    /// are reported inline; failures of the shard fail the request.
    pub async fn collect_batch_log(&self, req: &BatchLogRequest) -> BackendResult<BatchLogResponse> {
        let mut results = Vec::with_capacity(req.repo_commits.len());
        for repo_commit in &req.repo_commits {
            let (command_output, command_error) =
                match self.executor.log(repo_commit, &req.format).await {
                    Ok(output) => (output, None),
                    Err(err) if err.is_item_error() => (String::new(), Some(err.to_string())),
                    Err(err) => return Err(err),
                };
            results.push(BatchLogResult {
                repo_commit: repo_commit.clone(),
                command_output,
                command_error,
            });
        }
        Ok(BatchLogResponse { results })
    }

    pub async fn collect_clone_progress(
        &self,
        req: &RepoCloneProgressRequest,
    ) -> BackendResult<RepoCloneProgressResponse> {
        let mut results = HashMap::with_capacity(req.repos.len());
        for repo in &req.repos {
            let progress = self.executor.repo_clone_progress(repo).await?;
            results.insert(repo.clone(), progress);
        }
        Ok(RepoCloneProgressResponse { results })
    }

    pub async fn collect_repo_info(&self, req: &RepoInfoRequest) -> BackendResult<RepoInfoResponse> {
        let mut results = HashMap::with_capacity(req.repos.len());
        for repo in &req.repos {
            let info = self.executor.repo_info(repo).await?;
            results.insert(repo.clone(), info);
        }
        Ok(RepoInfoResponse { results })
    }

    pub async fn cloned_repos(&self) -> BackendResult<ListClonedResponse> {
        let repos = self.executor.list_cloned().await?;
        Ok(ListClonedResponse { repos })
    }

    pub async fn repo_cloned(&self, req: &IsRepoClonedRequest) -> BackendResult<IsRepoClonedResponse> {
        let info = self.executor.repo_info(&req.repo).await?;
        Ok(IsRepoClonedResponse {
            cloned: info.cloned,
        })
    }

    pub async fn apply_patch(
        &self,
        metadata: &PatchMetadata,
        patch: &[u8],
    ) -> BackendResult<CreateCommitFromPatchResponse> {
        let (rev, commit_id) = self.executor.create_commit_from_patch(metadata, patch).await?;
        Ok(CreateCommitFromPatchResponse { rev, commit_id })
    }

    pub async fn clone_repo(&self, req: &RepoCloneRequest) -> BackendResult<RepoCloneResponse> {
        let error = self.executor.repo_clone(&req.repo).await?;
        Ok(RepoCloneResponse { error })
    }
}

/// Split `data` into stream chunks.
pub fn byte_chunks(data: &[u8]) -> VecDeque<StreamChunk> {
    data.chunks(DATA_CHUNK_SIZE)
        .map(|chunk| StreamChunk::Data(chunk.to_vec()))
        .collect()
}

/// Search output as events: batches of matches, then `Done`.
pub fn search_events(output: SearchOutput) -> Vec<SearchEvent> {
    let mut events: Vec<SearchEvent> = output
        .matches
        .chunks(SEARCH_BATCH_SIZE)
        .map(|batch| SearchEvent::Matches {
            matches: batch.to_vec(),
        })
        .collect();
    events.push(SearchEvent::Done {
        limit_hit: output.limit_hit,
    });
    events
}

fn unknown_stream(id: StreamId) -> RpcStatus {
    RpcStatus::invalid_argument(format!("unknown stream {}", id.0))
}

fn unknown_upload(id: UploadId) -> RpcStatus {
    RpcStatus::invalid_argument(format!("unknown upload {}", id.0))
}

impl GitserverService for ShardServer {
    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn exec_start(self, _ctx: Context, req: ExecRequest) -> RpcResult<StreamId> {
        let output = self.executor.exec(&req).await?;
        debug!("Command produced {} bytes", output.len());
        Ok(self.sessions.open(byte_chunks(&output)))
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo, treeish = %req.treeish))]
    async fn archive_start(self, _ctx: Context, req: ArchiveRequest) -> RpcResult<StreamId> {
        let output = self.executor.archive(&req).await?;
        Ok(self.sessions.open(byte_chunks(&output)))
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn search_start(self, _ctx: Context, req: SearchRequest) -> RpcResult<StreamId> {
        let output = self.executor.search(&req).await?;
        let chunks = search_events(output)
            .into_iter()
            .map(StreamChunk::Search)
            .collect();
        Ok(self.sessions.open(chunks))
    }

    async fn next_chunk(self, _ctx: Context, id: StreamId) -> RpcResult<StreamChunk> {
        self.sessions.next(id).ok_or_else(|| unknown_stream(id))
    }

    async fn close_stream(self, _ctx: Context, id: StreamId) {
        if self.sessions.close(id) {
            debug!("Stream {} closed by reader", id.0);
        }
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn get_object(self, _ctx: Context, req: GetObjectRequest) -> RpcResult<GetObjectResponse> {
        let object = self.executor.get_object(&req.repo, &req.object_name).await?;
        Ok(GetObjectResponse { object })
    }

    async fn disk_info(self, _ctx: Context) -> RpcResult<DiskInfoResponse> {
        Ok(self.executor.disk_info().await?)
    }

    async fn is_repo_cloneable(
        self,
        _ctx: Context,
        req: IsRepoCloneableRequest,
    ) -> RpcResult<IsRepoCloneableResponse> {
        Ok(self.executor.is_repo_cloneable(&req.repo).await?)
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn repo_clone(self, _ctx: Context, req: RepoCloneRequest) -> RpcResult<RepoCloneResponse> {
        Ok(self.clone_repo(&req).await?)
    }

    #[instrument(skip(self, _ctx, req), fields(repos = req.repos.len()))]
    async fn repo_clone_progress(
        self,
        _ctx: Context,
        req: RepoCloneProgressRequest,
    ) -> RpcResult<RepoCloneProgressResponse> {
        Ok(self.collect_clone_progress(&req).await?)
    }

    #[instrument(skip(self, _ctx, req), fields(repos = req.repos.len()))]
    async fn repo_info(self, _ctx: Context, req: RepoInfoRequest) -> RpcResult<RepoInfoResponse> {
        Ok(self.collect_repo_info(&req).await?)
    }

    async fn list_cloned(self, _ctx: Context) -> RpcResult<ListClonedResponse> {
        Ok(self.cloned_repos().await?)
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn is_repo_cloned(
        self,
        _ctx: Context,
        req: IsRepoClonedRequest,
    ) -> RpcResult<IsRepoClonedResponse> {
        Ok(self.repo_cloned(&req).await?)
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn repo_update(
        self,
        _ctx: Context,
        req: RepoUpdateRequest,
    ) -> RpcResult<RepoUpdateResponse> {
        Ok(self.executor.repo_update(&req).await?)
    }

    #[instrument(skip(self, _ctx, req), fields(repo = %req.repo))]
    async fn repo_delete(self, _ctx: Context, req: RepoDeleteRequest) -> RpcResult<()> {
        Ok(self.executor.repo_delete(&req.repo).await?)
    }

    #[instrument(skip(self, _ctx, req), fields(commits = req.repo_commits.len()))]
    async fn batch_log(self, _ctx: Context, req: BatchLogRequest) -> RpcResult<BatchLogResponse> {
        Ok(self.collect_batch_log(&req).await?)
    }

    #[instrument(skip(self, _ctx, metadata), fields(repo = %metadata.repo))]
    async fn begin_commit_from_patch(
        self,
        _ctx: Context,
        metadata: PatchMetadata,
    ) -> RpcResult<UploadId> {
        let id = UploadId(self.sessions.next_id());
        self.sessions.uploads.lock().insert(
            id,
            Upload {
                metadata,
                patch: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn upload_patch_chunk(self, _ctx: Context, id: UploadId, data: Vec<u8>) -> RpcResult<()> {
        let mut uploads = self.sessions.uploads.lock();
        let upload = uploads.get_mut(&id).ok_or_else(|| unknown_upload(id))?;
        if upload.patch.len() + data.len() > MAX_PATCH_BYTES {
            uploads.remove(&id);
            return Err(BackendError::InvalidArgument(format!(
                "patch exceeds {} bytes",
                MAX_PATCH_BYTES
            ))
            .into());
        }
        upload.patch.extend_from_slice(&data);
        Ok(())
    }

    #[instrument(skip(self, _ctx))]
    async fn finish_commit_from_patch(
        self,
        _ctx: Context,
        id: UploadId,
    ) -> RpcResult<CreateCommitFromPatchResponse> {
        let upload = self
            .sessions
            .uploads
            .lock()
            .remove(&id)
            .ok_or_else(|| unknown_upload(id))?;
        debug!("Applying {} byte patch", upload.patch.len());
        Ok(self.apply_patch(&upload.metadata, &upload.patch).await?)
    }

    async fn abort_commit_from_patch(self, _ctx: Context, id: UploadId) {
        if self.sessions.uploads.lock().remove(&id).is_some() {
            debug!("Upload {} abandoned by writer", id.0);
        }
    }

    async fn list_gitolite(
        self,
        _ctx: Context,
        req: ListGitoliteRequest,
    ) -> RpcResult<ListGitoliteResponse> {
        let repos = self.executor.list_gitolite(&req.host).await?;
        Ok(ListGitoliteResponse { repos })
    }

    async fn repos_stats(self, _ctx: Context) -> RpcResult<ReposStats> {
        Ok(self.executor.repos_stats().await?)
    }

    async fn is_perforce_path_cloneable(
        self,
        _ctx: Context,
        req: IsPerforcePathCloneableRequest,
    ) -> RpcResult<()> {
        Ok(self
            .executor
            .is_perforce_path_cloneable(&req.connection, &req.depot_path)
            .await?)
    }

    async fn check_perforce_credentials(
        self,
        _ctx: Context,
        req: CheckPerforceCredentialsRequest,
    ) -> RpcResult<()> {
        Ok(self.executor.check_perforce_credentials(&req.connection).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryExecutor, MemoryRepo};

    fn server() -> ShardServer {
        let executor = MemoryExecutor::new().with_repo(
            "github.com/org/repo",
            MemoryRepo::new()
                .with_commit("aaa111", "alice", "Initial commit")
                .with_output(["cat-file", "-p", "big"], vec![7u8; DATA_CHUNK_SIZE * 2 + 10]),
        );
        ShardServer::new(Arc::new(executor))
    }

    async fn drain(server: &ShardServer, id: StreamId) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        loop {
            let chunk = server
                .clone()
                .next_chunk(tarpc::context::current(), id)
                .await
                .unwrap();
            if chunk == StreamChunk::End {
                return chunks;
            }
            chunks.push(chunk);
        }
    }

    #[tokio::test]
    async fn test_exec_stream_is_chunked() {
        let server = server();
        let id = server
            .clone()
            .exec_start(
                tarpc::context::current(),
                ExecRequest {
                    repo: "github.com/org/repo".into(),
                    args: vec!["cat-file".into(), "-p".into(), "big".into()],
                    ensure_revision: None,
                },
            )
            .await
            .unwrap();

        let chunks = drain(&server, id).await;
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks
            .iter()
            .map(|c| match c {
                StreamChunk::Data(d) => d.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, DATA_CHUNK_SIZE * 2 + 10);
        assert_eq!(server.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_start_reports_failure() {
        let status = server()
            .exec_start(
                tarpc::context::current(),
                ExecRequest {
                    repo: "github.com/org/missing".into(),
                    args: vec!["log".into()],
                    ensure_revision: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_close_stream_releases_it() {
        let server = server();
        let id = server
            .clone()
            .search_start(
                tarpc::context::current(),
                SearchRequest {
                    repo: "github.com/org/repo".into(),
                    revisions: vec![],
                    query: "initial".into(),
                    include_diff: false,
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(server.open_streams(), 1);
        server.clone().close_stream(tarpc::context::current(), id).await;
        assert_eq!(server.open_streams(), 0);
        assert!(server
            .clone()
            .next_chunk(tarpc::context::current(), id)
            .await
            .is_err());
    }

    #[test]
    fn test_search_events_end_with_done() {
        let output = SearchOutput {
            matches: (0..SEARCH_BATCH_SIZE + 1)
                .map(|i| CommitMatch {
                    oid: i.to_string(),
                    author: "a".into(),
                    message: "m".into(),
                    diff: None,
                })
                .collect(),
            limit_hit: true,
        };
        let events = search_events(output);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], SearchEvent::Done { limit_hit: true });
    }

    #[tokio::test]
    async fn test_patch_upload_in_chunks() {
        let server = server();
        let id = server
            .clone()
            .begin_commit_from_patch(
                tarpc::context::current(),
                PatchMetadata {
                    repo: "github.com/org/repo".into(),
                    base_commit: "HEAD".into(),
                    target_ref: "refs/heads/change".into(),
                    unique_ref: false,
                    message: "Change".into(),
                    author_name: "A".into(),
                    author_email: "a@example.com".into(),
                },
            )
            .await
            .unwrap();
        for part in [b"diff --git ".to_vec(), b"a/x b/x\n".to_vec()] {
            server
                .clone()
                .upload_patch_chunk(tarpc::context::current(), id, part)
                .await
                .unwrap();
        }
        let resp = server
            .clone()
            .finish_commit_from_patch(tarpc::context::current(), id)
            .await
            .unwrap();
        assert_eq!(resp.rev, "refs/heads/change");

        assert!(server
            .clone()
            .finish_commit_from_patch(tarpc::context::current(), id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_aborted_upload_is_released() {
        let server = server();
        let id = server
            .clone()
            .begin_commit_from_patch(
                tarpc::context::current(),
                PatchMetadata {
                    repo: "github.com/org/repo".into(),
                    base_commit: "HEAD".into(),
                    target_ref: "refs/heads/change".into(),
                    unique_ref: false,
                    message: "Change".into(),
                    author_name: "A".into(),
                    author_email: "a@example.com".into(),
                },
            )
            .await
            .unwrap();
        server
            .clone()
            .upload_patch_chunk(tarpc::context::current(), id, b"diff".to_vec())
            .await
            .unwrap();
        assert_eq!(server.open_uploads(), 1);

        server.clone().abort_commit_from_patch(tarpc::context::current(), id).await;
        assert_eq!(server.open_uploads(), 0);
        assert!(server
            .clone()
            .upload_patch_chunk(tarpc::context::current(), id, b"more".to_vec())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_repo_info_covers_unknown_repos() {
        let resp = server()
            .collect_repo_info(&RepoInfoRequest {
                repos: vec!["github.com/org/repo".into(), "github.com/org/other".into()],
            })
            .await
            .unwrap();
        assert!(resp.results[&RepoName::from("github.com/org/repo")].cloned);
        assert!(!resp.results[&RepoName::from("github.com/org/other")].cloned);

        let cloned = server()
            .is_repo_cloned(
                tarpc::context::current(),
                IsRepoClonedRequest {
                    repo: "github.com/org/other".into(),
                },
            )
            .await
            .unwrap();
        assert!(!cloned.cloned);
    }

    #[tokio::test]
    async fn test_batch_log_reports_item_errors_inline() {
        let resp = server()
            .collect_batch_log(&BatchLogRequest {
                repo_commits: vec![
                    RepoCommit {
                        repo: "github.com/org/repo".into(),
                        commit_id: "aaa111".into(),
                    },
                    RepoCommit {
                        repo: "github.com/org/repo".into(),
                        commit_id: "fff999".into(),
                    },
                ],
                format: "%H %s".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.results[0].command_output, "aaa111 Initial commit");
        assert!(resp.results[0].command_error.is_none());
        assert!(resp.results[1].command_error.is_some());
    }
}
