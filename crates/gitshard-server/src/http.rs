//! Legacy HTTP/JSON surface.
//!
//! One POST route per operation. Repository misses answer 404 with a JSON
//! [`NotFoundPayload`]; command failures answer 500 with the `X-Exec-*`
//! headers set and the unflattened [`CommandStatusPayload`] as JSON body.

use crate::error::BackendError;
use crate::rpc::{search_events, ShardServer, DATA_CHUNK_SIZE};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use gitshard_core::*;
use std::convert::Infallible;
use tracing::debug;

/// Content type of the search event stream.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Create the router serving every legacy endpoint.
pub fn create_router(server: ShardServer) -> Router {
    Router::new()
        .route("/exec", post(exec))
        .route("/archive", post(archive))
        .route("/search", post(search))
        .route("/commands/get-object", post(get_object))
        .route("/disk-info", post(disk_info))
        .route("/is-repo-cloneable", post(is_repo_cloneable))
        .route("/repo-clone", post(repo_clone))
        .route("/repo-clone-progress", post(repo_clone_progress))
        .route("/repos", post(repo_info))
        .route("/list-cloned", post(list_cloned))
        .route("/is-repo-cloned", post(is_repo_cloned))
        .route("/repo-update", post(repo_update))
        .route("/delete", post(repo_delete))
        .route("/batch-log", post(batch_log))
        .route("/create-commit-from-patch", post(create_commit_from_patch))
        .route("/list-gitolite", post(list_gitolite))
        .route("/repos-stats", post(repos_stats))
        .route("/is-perforce-path-cloneable", post(is_perforce_path_cloneable))
        .route("/check-perforce-credentials", post(check_perforce_credentials))
        .with_state(server)
}

/// Backend failure rendered as a legacy response.
#[derive(Debug)]
pub struct HttpError(pub BackendError);

impl From<BackendError> for HttpError {
    fn from(err: BackendError) -> Self {
        HttpError(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let err = self.0;
        if let BackendError::RepoNotFound {
            repo,
            clone_in_progress,
            clone_progress,
        } = &err
        {
            let payload = NotFoundPayload {
                repo: repo.clone(),
                clone_in_progress: *clone_in_progress,
                clone_progress: clone_progress.clone(),
            };
            return (StatusCode::NOT_FOUND, Json(payload)).into_response();
        }

        if let Some(payload) = err.command_status() {
            let mut headers = HeaderMap::new();
            set_header(&mut headers, EXEC_ERROR_HEADER, &payload.message);
            set_header(
                &mut headers,
                EXEC_EXIT_STATUS_HEADER,
                &payload.exit_status.to_string(),
            );
            set_header(&mut headers, EXEC_STDERR_HEADER, &payload.stderr);
            return (StatusCode::INTERNAL_SERVER_ERROR, headers, Json(payload)).into_response();
        }

        let status = match &err {
            BackendError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            BackendError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, err.to_string()).into_response()
    }
}

/// Header values must be visible ASCII; anything else becomes a space.
fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { ' ' })
        .collect();
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(cleaned.trim_end()),
    ) {
        headers.insert(name, value);
    }
}

type HttpResult<T> = Result<T, HttpError>;

fn byte_body(data: Vec<u8>) -> Response {
    let chunks: Vec<Result<Bytes, Infallible>> = data
        .chunks(DATA_CHUNK_SIZE)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    Body::from_stream(stream::iter(chunks)).into_response()
}

async fn exec(State(server): State<ShardServer>, Json(req): Json<ExecRequest>) -> HttpResult<Response> {
    debug!(repo = %req.repo, "exec");
    let output = server.executor().exec(&req).await?;
    Ok(byte_body(output))
}

async fn archive(
    State(server): State<ShardServer>,
    Json(req): Json<ArchiveRequest>,
) -> HttpResult<Response> {
    let output = server.executor().archive(&req).await?;
    Ok(byte_body(output))
}

async fn search(
    State(server): State<ShardServer>,
    Json(req): Json<SearchRequest>,
) -> HttpResult<Response> {
    let output = server.executor().search(&req).await?;

    let mut lines: Vec<Result<Bytes, Infallible>> = Vec::new();
    for event in search_events(output) {
        let mut line = serde_json::to_vec(&event)
            .map_err(|e| BackendError::Internal(format!("encode search event: {}", e)))?;
        line.push(b'\n');
        lines.push(Ok(Bytes::from(line)));
    }

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(stream::iter(lines)),
    )
        .into_response())
}

async fn get_object(
    State(server): State<ShardServer>,
    Json(req): Json<GetObjectRequest>,
) -> HttpResult<Json<GetObjectResponse>> {
    let object = server.executor().get_object(&req.repo, &req.object_name).await?;
    Ok(Json(GetObjectResponse { object }))
}

async fn disk_info(State(server): State<ShardServer>) -> HttpResult<Json<DiskInfoResponse>> {
    Ok(Json(server.executor().disk_info().await?))
}

async fn is_repo_cloneable(
    State(server): State<ShardServer>,
    Json(req): Json<IsRepoCloneableRequest>,
) -> HttpResult<Json<IsRepoCloneableResponse>> {
    Ok(Json(server.executor().is_repo_cloneable(&req.repo).await?))
}

async fn repo_clone(
    State(server): State<ShardServer>,
    Json(req): Json<RepoCloneRequest>,
) -> HttpResult<Json<RepoCloneResponse>> {
    Ok(Json(server.clone_repo(&req).await?))
}

async fn repo_clone_progress(
    State(server): State<ShardServer>,
    Json(req): Json<RepoCloneProgressRequest>,
) -> HttpResult<Json<RepoCloneProgressResponse>> {
    Ok(Json(server.collect_clone_progress(&req).await?))
}

async fn repo_info(
    State(server): State<ShardServer>,
    Json(req): Json<RepoInfoRequest>,
) -> HttpResult<Json<RepoInfoResponse>> {
    Ok(Json(server.collect_repo_info(&req).await?))
}

async fn list_cloned(State(server): State<ShardServer>) -> HttpResult<Json<ListClonedResponse>> {
    Ok(Json(server.cloned_repos().await?))
}

async fn is_repo_cloned(
    State(server): State<ShardServer>,
    Json(req): Json<IsRepoClonedRequest>,
) -> HttpResult<Json<IsRepoClonedResponse>> {
    Ok(Json(server.repo_cloned(&req).await?))
}

async fn repo_update(
    State(server): State<ShardServer>,
    Json(req): Json<RepoUpdateRequest>,
) -> HttpResult<Json<RepoUpdateResponse>> {
    Ok(Json(server.executor().repo_update(&req).await?))
}

async fn repo_delete(
    State(server): State<ShardServer>,
    Json(req): Json<RepoDeleteRequest>,
) -> HttpResult<Json<()>> {
    server.executor().repo_delete(&req.repo).await?;
    Ok(Json(()))
}

async fn batch_log(
    State(server): State<ShardServer>,
    Json(req): Json<BatchLogRequest>,
) -> HttpResult<Json<BatchLogResponse>> {
    Ok(Json(server.collect_batch_log(&req).await?))
}

async fn create_commit_from_patch(
    State(server): State<ShardServer>,
    Json(req): Json<CreateCommitFromPatchRequest>,
) -> HttpResult<Json<CreateCommitFromPatchResponse>> {
    Ok(Json(server.apply_patch(&req.metadata, &req.patch).await?))
}

async fn list_gitolite(
    State(server): State<ShardServer>,
    Json(req): Json<ListGitoliteRequest>,
) -> HttpResult<Json<ListGitoliteResponse>> {
    let repos = server.executor().list_gitolite(&req.host).await?;
    Ok(Json(ListGitoliteResponse { repos }))
}

async fn repos_stats(State(server): State<ShardServer>) -> HttpResult<Json<ReposStats>> {
    Ok(Json(server.executor().repos_stats().await?))
}

async fn is_perforce_path_cloneable(
    State(server): State<ShardServer>,
    Json(req): Json<IsPerforcePathCloneableRequest>,
) -> HttpResult<Json<()>> {
    server
        .executor()
        .is_perforce_path_cloneable(&req.connection, &req.depot_path)
        .await?;
    Ok(Json(()))
}

async fn check_perforce_credentials(
    State(server): State<ShardServer>,
    Json(req): Json<CheckPerforceCredentialsRequest>,
) -> HttpResult<Json<()>> {
    server
        .executor()
        .check_perforce_credentials(&req.connection)
        .await?;
    Ok(Json(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_not_found_is_404() {
        let response = HttpError(BackendError::repo_not_found("repo".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(header(&response, EXEC_EXIT_STATUS_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_command_failure_sets_exec_headers() {
        let response =
            HttpError(BackendError::command("git log", 2, "fatal: bad\nsecond line")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(header(&response, EXEC_ERROR_HEADER), Some("git log"));
        assert_eq!(header(&response, EXEC_EXIT_STATUS_HEADER), Some("2"));
        assert_eq!(
            header(&response, EXEC_STDERR_HEADER),
            Some("fatal: bad second line")
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: CommandStatusPayload = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.stderr, "fatal: bad\nsecond line");
        assert_eq!(payload.exit_status, 2);
    }

    #[test]
    fn test_revision_miss_sets_exec_headers() {
        let response = HttpError(BackendError::RevisionNotFound {
            repo: "repo".into(),
            spec: "v9".into(),
        })
        .into_response();
        assert_eq!(header(&response, EXEC_EXIT_STATUS_HEADER), Some("128"));
        assert!(header(&response, EXEC_STDERR_HEADER)
            .unwrap()
            .contains("not a valid object name v9"));
    }

    #[test]
    fn test_generic_statuses() {
        let unavailable = HttpError(BackendError::Unavailable("down".into())).into_response();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        let invalid = HttpError(BackendError::InvalidArgument("bad".into())).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
