//! Legacy HTTP/JSON transport.
//!
//! Each operation is a POST with a JSON body. Requests share one
//! `reqwest::Client` and a fleet-wide permit pool; a permit is held until
//! the response, or the stream reading it, is dropped.

use super::{ResponseStream, Transport};
use crate::config::ClientConfig;
use crate::context::{CallContext, Protocol};
use crate::translate::{translate, RawError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use gitshard_core::{
    ArchiveRequest, BatchLogRequest, BatchLogResponse, CheckPerforceCredentialsRequest,
    CommandStatusPayload, CreateCommitFromPatchRequest, CreateCommitFromPatchResponse,
    DiskInfoResponse, DomainError, ExecRequest, GetObjectRequest, GetObjectResponse,
    IsPerforcePathCloneableRequest, IsRepoCloneableRequest, IsRepoCloneableResponse,
    IsRepoClonedRequest, IsRepoClonedResponse, ListClonedResponse, ListGitoliteRequest,
    ListGitoliteResponse, NotFoundPayload, RepoCloneProgressRequest, RepoCloneProgressResponse,
    RepoCloneRequest, RepoCloneResponse, RepoDeleteRequest, RepoInfoRequest, RepoInfoResponse,
    RepoUpdateRequest, RepoUpdateResponse, ReposStats, SearchEvent, SearchRequest,
    TransportErrorKind, EXEC_ERROR_HEADER, EXEC_EXIT_STATUS_HEADER, EXEC_STDERR_HEADER,
};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Header marking requests as internal fleet traffic.
pub const INTERNAL_ACTOR_HEADER: &str = "X-Requested-With";
pub const INTERNAL_ACTOR_VALUE: &str = "gitshard-internal";

/// Bytes of an unexpected error body kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 200;
/// Bytes of an error body read while looking for a structured payload.
const PAYLOAD_BODY_LIMIT: usize = 64 * 1024;

/// State shared by every HTTP transport of one client.
#[derive(Debug)]
pub struct HttpShared {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl HttpShared {
    pub fn new(config: &ClientConfig) -> Result<Self, DomainError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| translate(RawError::Http(e)))?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.http_permits)),
        })
    }

    /// Permits not currently held by a request.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Shard reached over the legacy HTTP surface.
pub struct HttpTransport {
    shared: Arc<HttpShared>,
    addr: String,
}

impl HttpTransport {
    pub fn new(shared: Arc<HttpShared>, addr: impl Into<String>) -> Self {
        Self {
            shared,
            addr: addr.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST `body` to `path` and return the successful response together
    /// with the permit that must outlive it.
    async fn post<B>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<(Response, OwnedSemaphorePermit), DomainError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let permit = ctx
            .run(async {
                Arc::clone(&self.shared.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| DomainError::transport(TransportErrorKind::Other, "permit pool closed"))
            })
            .await?;

        let mut request = self
            .shared
            .client
            .post(self.url(path))
            .header(INTERNAL_ACTOR_HEADER, INTERNAL_ACTOR_VALUE)
            .json(body);
        if let Some(deadline) = ctx.deadline() {
            request = request.timeout(deadline.saturating_duration_since(Instant::now()));
        }

        let response = ctx
            .run(async { request.send().await.map_err(|e| translate(RawError::Http(e))) })
            .await?;
        let response = ctx.run(check_status(response)).await?;
        Ok((response, permit))
    }

    async fn call_json<B, T>(&self, ctx: &CallContext, path: &str, body: &B) -> Result<T, DomainError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let (response, _permit) = self.post(ctx, path, body).await?;
        ctx.run(async {
            response
                .json::<T>()
                .await
                .map_err(|e| translate(RawError::Http(e)))
        })
        .await
    }

    async fn byte_stream<B>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<ResponseStream<Bytes>, DomainError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let (response, permit) = self.post(ctx, path, body).await?;
        let chunks = response.bytes_stream().map(move |chunk| {
            let _held = &permit;
            chunk.map_err(|e| translate(RawError::Http(e)))
        });
        ResponseStream::eager(ctx, chunks).await
    }
}

/// Map a non-200 response onto the raw error it carries.
///
/// Structured bodies are parsed whole; only the generic diagnostic is cut
/// to [`ERROR_BODY_LIMIT`].
async fn check_status(response: Response) -> Result<Response, DomainError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }

    let from_headers = header(&response, EXEC_EXIT_STATUS_HEADER)
        .and_then(|value| value.parse::<i32>().ok())
        .map(|exit_status| CommandStatusPayload {
            message: header(&response, EXEC_ERROR_HEADER)
                .unwrap_or_else(|| "command failed".to_string()),
            exit_status,
            stderr: header(&response, EXEC_STDERR_HEADER).unwrap_or_default(),
        });
    let body = read_limited(response, PAYLOAD_BODY_LIMIT).await;

    if let Some(from_headers) = from_headers {
        // Header values are flattened to visible ASCII; the body is verbatim.
        let payload = serde_json::from_slice::<CommandStatusPayload>(&body).unwrap_or(from_headers);
        return Err(translate(RawError::CommandStatus(payload)));
    }

    if status == StatusCode::NOT_FOUND {
        if let Ok(payload) = serde_json::from_slice::<NotFoundPayload>(&body) {
            return Err(translate(RawError::NotFound(payload)));
        }
    }

    let shown = &body[..body.len().min(ERROR_BODY_LIMIT)];
    Err(translate(RawError::HttpStatus {
        status: status.as_u16(),
        body: String::from_utf8_lossy(shown).into_owned(),
    }))
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Read at most `limit` bytes of the body; read errors end the read.
async fn read_limited(mut response: Response, limit: usize) -> Bytes {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(limit);
    buf.freeze()
}

/// Split a newline-delimited JSON body into search events.
fn ndjson_events<S>(
    body: S,
    permit: OwnedSemaphorePermit,
) -> impl Stream<Item = Result<SearchEvent, DomainError>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    type State = (BoxStream<'static, reqwest::Result<Bytes>>, BytesMut, OwnedSemaphorePermit);

    let initial: State = (body.boxed(), BytesMut::new(), permit);
    stream::unfold(Some(initial), |state| async move {
        let (mut body, mut buf, permit) = state?;
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let event = decode_event(&line[..pos]);
                return Some((event, Some((body, buf, permit))));
            }
            match body.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Some((Err(translate(RawError::Http(e))), None)),
                None if buf.iter().all(u8::is_ascii_whitespace) => return None,
                None => return Some((decode_event(&buf), None)),
            }
        }
    })
}

fn decode_event(line: &[u8]) -> Result<SearchEvent, DomainError> {
    serde_json::from_slice(line)
        .map_err(|e| translate(RawError::Decode(format!("invalid search event: {}", e))))
}

#[async_trait]
impl Transport for HttpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn exec(
        &self,
        ctx: &CallContext,
        req: ExecRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError> {
        self.byte_stream(ctx, "/exec", &req).await
    }

    async fn archive(
        &self,
        ctx: &CallContext,
        req: ArchiveRequest,
    ) -> Result<ResponseStream<Bytes>, DomainError> {
        self.byte_stream(ctx, "/archive", &req).await
    }

    async fn search(
        &self,
        ctx: &CallContext,
        req: SearchRequest,
    ) -> Result<ResponseStream<SearchEvent>, DomainError> {
        let (response, permit) = self.post(ctx, "/search", &req).await?;
        Ok(ResponseStream::new(
            ctx,
            ndjson_events(response.bytes_stream(), permit),
        ))
    }

    async fn get_object(
        &self,
        ctx: &CallContext,
        req: GetObjectRequest,
    ) -> Result<GetObjectResponse, DomainError> {
        self.call_json(ctx, "/commands/get-object", &req).await
    }

    async fn disk_info(&self, ctx: &CallContext) -> Result<DiskInfoResponse, DomainError> {
        self.call_json(ctx, "/disk-info", &()).await
    }

    async fn is_repo_cloneable(
        &self,
        ctx: &CallContext,
        req: IsRepoCloneableRequest,
    ) -> Result<IsRepoCloneableResponse, DomainError> {
        self.call_json(ctx, "/is-repo-cloneable", &req).await
    }

    async fn repo_clone(
        &self,
        ctx: &CallContext,
        req: RepoCloneRequest,
    ) -> Result<RepoCloneResponse, DomainError> {
        self.call_json(ctx, "/repo-clone", &req).await
    }

    async fn repo_clone_progress(
        &self,
        ctx: &CallContext,
        req: RepoCloneProgressRequest,
    ) -> Result<RepoCloneProgressResponse, DomainError> {
        self.call_json(ctx, "/repo-clone-progress", &req).await
    }

    async fn repo_info(
        &self,
        ctx: &CallContext,
        req: RepoInfoRequest,
    ) -> Result<RepoInfoResponse, DomainError> {
        self.call_json(ctx, "/repos", &req).await
    }

    async fn list_cloned(&self, ctx: &CallContext) -> Result<ListClonedResponse, DomainError> {
        self.call_json(ctx, "/list-cloned", &()).await
    }

    async fn is_repo_cloned(
        &self,
        ctx: &CallContext,
        req: IsRepoClonedRequest,
    ) -> Result<IsRepoClonedResponse, DomainError> {
        self.call_json(ctx, "/is-repo-cloned", &req).await
    }

    async fn repo_update(
        &self,
        ctx: &CallContext,
        req: RepoUpdateRequest,
    ) -> Result<RepoUpdateResponse, DomainError> {
        self.call_json(ctx, "/repo-update", &req).await
    }

    async fn repo_delete(&self, ctx: &CallContext, req: RepoDeleteRequest) -> Result<(), DomainError> {
        self.call_json(ctx, "/delete", &req).await
    }

    async fn batch_log(
        &self,
        ctx: &CallContext,
        req: BatchLogRequest,
    ) -> Result<BatchLogResponse, DomainError> {
        self.call_json(ctx, "/batch-log", &req).await
    }

    async fn create_commit_from_patch(
        &self,
        ctx: &CallContext,
        req: CreateCommitFromPatchRequest,
    ) -> Result<CreateCommitFromPatchResponse, DomainError> {
        self.call_json(ctx, "/create-commit-from-patch", &req).await
    }

    async fn list_gitolite(
        &self,
        ctx: &CallContext,
        req: ListGitoliteRequest,
    ) -> Result<ListGitoliteResponse, DomainError> {
        self.call_json(ctx, "/list-gitolite", &req).await
    }

    async fn repos_stats(&self, ctx: &CallContext) -> Result<ReposStats, DomainError> {
        self.call_json(ctx, "/repos-stats", &()).await
    }

    async fn is_perforce_path_cloneable(
        &self,
        ctx: &CallContext,
        req: IsPerforcePathCloneableRequest,
    ) -> Result<(), DomainError> {
        self.call_json(ctx, "/is-perforce-path-cloneable", &req).await
    }

    async fn check_perforce_credentials(
        &self,
        ctx: &CallContext,
        req: CheckPerforceCredentialsRequest,
    ) -> Result<(), DomainError> {
        self.call_json(ctx, "/check-perforce-credentials", &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&'static str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        let items: Vec<reqwest::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        stream::iter(items)
    }

    async fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap()
    }

    #[tokio::test]
    async fn test_ndjson_split_across_chunks() {
        let events: Vec<_> = ndjson_events(
            body(&[
                "{\"matches\":{\"matc",
                "hes\":[]}}\n\n{\"done\":{\"limit_hit\":false}}",
            ]),
            permit().await,
        )
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(SearchEvent::Matches { matches: vec![] }));
        assert_eq!(events[1], Ok(SearchEvent::Done { limit_hit: false }));
    }

    #[tokio::test]
    async fn test_ndjson_invalid_line() {
        let events: Vec<_> = ndjson_events(body(&["not json\n"]), permit().await)
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Err(DomainError::Transport(t)) if t.kind == TransportErrorKind::Decode
        ));
    }

    #[tokio::test]
    async fn test_permit_released_with_stream() {
        let pool = Arc::new(Semaphore::new(1));
        let held = Arc::clone(&pool).acquire_owned().await.unwrap();
        let events = ndjson_events(body(&[]), held);
        assert_eq!(pool.available_permits(), 0);
        drop(events);
        assert_eq!(pool.available_permits(), 1);
    }
}
