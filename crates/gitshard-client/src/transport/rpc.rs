//! Binary RPC transport over a tarpc connection.

use super::{ResponseStream, Transport, UPLOAD_CHUNK_SIZE};
use crate::context::{CallContext, Protocol};
use crate::translate::{translate, RawError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use gitshard_core::*;
use std::future::Future;
use tarpc::client::RpcError;
use tarpc::context;
use tokio::sync::oneshot;
use tracing::debug;

/// Shard reached through its published binary connection.
pub struct RpcTransport {
    addr: String,
    conn: Result<GitserverServiceClient, DomainError>,
}

impl RpcTransport {
    /// `conn` is the registry entry for `addr`: the connection, or the
    /// error its dial failed with.
    pub fn new(addr: impl Into<String>, conn: Result<GitserverServiceClient, DomainError>) -> Self {
        Self {
            addr: addr.into(),
            conn,
        }
    }

    fn client(&self) -> Result<&GitserverServiceClient, DomainError> {
        self.conn.as_ref().map_err(Clone::clone)
    }

    /// Open a server stream and pull its items lazily.
    async fn open_stream<F>(
        &self,
        ctx: &CallContext,
        start: F,
    ) -> Result<impl Stream<Item = Result<StreamChunk, DomainError>> + Send + 'static, DomainError>
    where
        F: Future<Output = Result<RpcResult<StreamId>, RpcError>> + Send + 'static,
    {
        let client = self.client()?.clone();
        let closer = client.clone();
        let id = open_session(ctx, start, move |id| close_remote(closer, id)).await?;
        Ok(pull(RemoteStream {
            client,
            id,
            finished: false,
        }))
    }
}

/// Await a unary RPC under the call context and translate its failure.
async fn unary<T, F>(ctx: &CallContext, call: F) -> Result<T, DomainError>
where
    F: Future<Output = Result<RpcResult<T>, RpcError>>,
{
    ctx.run(async move {
        match call.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(translate(RawError::Status(status))),
            Err(err) => Err(translate(RawError::Rpc(err))),
        }
    })
    .await
}

/// Await a call that creates a server-side session.
///
/// The call runs on its own task so its reply is seen even when `ctx`
/// ends first; a session created for a caller that already left is handed
/// to `release`.
async fn open_session<T, F, R, RFut>(ctx: &CallContext, call: F, release: R) -> Result<T, DomainError>
where
    T: Send + 'static,
    F: Future<Output = Result<RpcResult<T>, RpcError>> + Send + 'static,
    R: FnOnce(T) -> RFut + Send + 'static,
    RFut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(Ok(Ok(orphan))) = tx.send(call.await) {
            release(orphan).await;
        }
    });
    let reply = ctx
        .run(async move {
            rx.await.map_err(|_| {
                DomainError::transport(TransportErrorKind::Other, "session call was dropped")
            })
        })
        .await?;
    match reply {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(status)) => Err(translate(RawError::Status(status))),
        Err(err) => Err(translate(RawError::Rpc(err))),
    }
}

async fn close_remote(client: GitserverServiceClient, id: StreamId) {
    if let Err(e) = client.close_stream(context::current(), id).await {
        debug!("Failed to close remote stream {:?}: {}", id, e);
    }
}

async fn abort_upload(client: GitserverServiceClient, id: UploadId) {
    if let Err(e) = client.abort_commit_from_patch(context::current(), id).await {
        debug!("Failed to abort upload {:?}: {}", id, e);
    }
}

/// Server-side stream owned by this client. Dropping it before the server
/// reported the end closes the remote stream.
struct RemoteStream {
    client: GitserverServiceClient,
    id: StreamId,
    finished: bool,
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(close_remote(self.client.clone(), self.id));
    }
}

/// Patch upload begun on the server. Dropping it before the server saw
/// the finish call aborts the upload.
struct PendingUpload {
    client: GitserverServiceClient,
    id: UploadId,
    finished: bool,
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(abort_upload(self.client.clone(), self.id));
    }
}

fn pull(remote: RemoteStream) -> impl Stream<Item = Result<StreamChunk, DomainError>> + Send + 'static {
    stream::unfold(Some(remote), |state| async move {
        let mut remote = state?;
        match remote.client.next_chunk(context::current(), remote.id).await {
            Ok(Ok(StreamChunk::End)) => {
                remote.finished = true;
                None
            }
            Ok(Ok(chunk)) => Some((Ok(chunk), Some(remote))),
            Ok(Err(status)) => {
                // The server drops a stream once it has reported an error.
                remote.finished = true;
                Some((Err(translate(RawError::Status(status))), None))
            }
            Err(err) => Some((Err(translate(RawError::Rpc(err))), None)),
        }
    })
}

fn expect_data(chunk: Result<StreamChunk, DomainError>) -> Result<Bytes, DomainError> {
    match chunk? {
        StreamChunk::Data(data) => Ok(Bytes::from(data)),
        other => Err(unexpected_chunk(&other)),
    }
}

fn expect_search(chunk: Result<StreamChunk, DomainError>) -> Result<SearchEvent, DomainError> {
    match chunk? {
        StreamChunk::Search(event) => Ok(event),
        other => Err(unexpected_chunk(&other)),
    }
}

fn unexpected_chunk(chunk: &StreamChunk) -> DomainError {
    DomainError::transport(
        TransportErrorKind::Decode,
        format!("unexpected stream item {:?}", chunk),
    )
}

#[async_trait]
impl Transport for RpcTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Rpc
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn exec(
        &self,
        ctx: &CallContext,
        req: ExecRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError> {
        let client = self.client()?.clone();
        let start = async move { client.exec_start(context::current(), req).await };
        let chunks = self.open_stream(ctx, start).await?;
        ResponseStream::eager(ctx, chunks.map(expect_data)).await
    }

    async fn archive(
        &self,
        ctx: &CallContext,
        req: ArchiveRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError> {
        let client = self.client()?.clone();
        let start = async move { client.archive_start(context::current(), req).await };
        let chunks = self.open_stream(ctx, start).await?;
        ResponseStream::eager(ctx, chunks.map(expect_data)).await
    }

    async fn search(
        &self,
        ctx: &CallContext,
        req: SearchRequest,
    ) -> Result<ResponseStream<SearchEvent>, DomainError> {
        let client = self.client()?.clone();
        let start = async move { client.search_start(context::current(), req).await };
        let chunks = self.open_stream(ctx, start).await?;
        Ok(ResponseStream::new(ctx, chunks.map(expect_search)))
    }

    async fn get_object(
        &self,
        ctx: &CallContext,
        req: GetObjectRequest,
    ) -> Result<GetObjectResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.get_object(context::current(), req)).await
    }

    async fn disk_info(&self, ctx: &CallContext) -> Result<DiskInfoResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.disk_info(context::current())).await
    }

    async fn is_repo_cloneable(
        &self,
        ctx: &CallContext,
        req: IsRepoCloneableRequest,
    ) -> Result<IsRepoCloneableResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.is_repo_cloneable(context::current(), req)).await
    }

    async fn repo_clone(
        &self,
        ctx: &CallContext,
        req: RepoCloneRequest,
    ) -> Result<RepoCloneResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.repo_clone(context::current(), req)).await
    }

    async fn repo_clone_progress(
        &self,
        ctx: &CallContext,
        req: RepoCloneProgressRequest,
    ) -> Result<RepoCloneProgressResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.repo_clone_progress(context::current(), req)).await
    }

    async fn repo_info(
        &self,
        ctx: &CallContext,
        req: RepoInfoRequest,
    ) -> Result<RepoInfoResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.repo_info(context::current(), req)).await
    }

    async fn list_cloned(&self, ctx: &CallContext) -> Result<ListClonedResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.list_cloned(context::current())).await
    }

    async fn is_repo_cloned(
        &self,
        ctx: &CallContext,
        req: IsRepoClonedRequest,
    ) -> Result<IsRepoClonedResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.is_repo_cloned(context::current(), req)).await
    }

    async fn repo_update(
        &self,
        ctx: &CallContext,
        req: RepoUpdateRequest,
    ) -> Result<RepoUpdateResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.repo_update(context::current(), req)).await
    }

    async fn repo_delete(&self, ctx: &CallContext, req: RepoDeleteRequest) -> Result<(), DomainError> {
        let client = self.client()?;
        unary(ctx, client.repo_delete(context::current(), req)).await
    }

    async fn batch_log(
        &self,
        ctx: &CallContext,
        req: BatchLogRequest,
    ) -> Result<BatchLogResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.batch_log(context::current(), req)).await
    }

    async fn create_commit_from_patch(
        &self,
        ctx: &CallContext,
        req: CreateCommitFromPatchRequest,
    ) -> Result<CreateCommitFromPatchResponse, DomainError> {
        let CreateCommitFromPatchRequest { metadata, patch } = req;
        let client = self.client()?.clone();
        let begin = {
            let client = client.clone();
            async move { client.begin_commit_from_patch(context::current(), metadata).await }
        };
        let aborter = client.clone();
        let id = open_session(ctx, begin, move |id| abort_upload(aborter, id)).await?;
        let mut upload = PendingUpload {
            client: client.clone(),
            id,
            finished: false,
        };
        for chunk in patch.chunks(UPLOAD_CHUNK_SIZE) {
            unary(ctx, client.upload_patch_chunk(context::current(), id, chunk.to_vec())).await?;
        }
        let result = unary(ctx, client.finish_commit_from_patch(context::current(), id)).await;
        // The server drops an upload once the finish call reaches it.
        upload.finished = !matches!(
            result,
            Err(DomainError::Canceled | DomainError::DeadlineExceeded)
        );
        result
    }

    async fn list_gitolite(
        &self,
        ctx: &CallContext,
        req: ListGitoliteRequest,
    ) -> Result<ListGitoliteResponse, DomainError> {
        let client = self.client()?;
        unary(ctx, client.list_gitolite(context::current(), req)).await
    }

    async fn repos_stats(&self, ctx: &CallContext) -> Result<ReposStats, DomainError> {
        let client = self.client()?;
        unary(ctx, client.repos_stats(context::current())).await
    }

    async fn is_perforce_path_cloneable(
        &self,
        ctx: &CallContext,
        req: IsPerforcePathCloneableRequest,
    ) -> Result<(), DomainError> {
        let client = self.client()?;
        unary(ctx, client.is_perforce_path_cloneable(context::current(), req)).await
    }

    async fn check_perforce_credentials(
        &self,
        ctx: &CallContext,
        req: CheckPerforceCredentialsRequest,
    ) -> Result<(), DomainError> {
        let client = self.client()?;
        unary(ctx, client.check_perforce_credentials(context::current(), req)).await
    }
}
