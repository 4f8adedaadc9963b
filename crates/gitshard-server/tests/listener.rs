//! Both protocols served from one port.

use gitshard_core::*;
use gitshard_server::{spawn_shard, MemoryExecutor, MemoryRepo};
use std::sync::Arc;
use tarpc::client::Config;
use tokio_serde::formats::Bincode;
use tokio_test::assert_ok;

fn executor() -> MemoryExecutor {
    MemoryExecutor::new()
        .with_repo(
            "github.com/org/repo",
            MemoryRepo::new().with_commit("aaa111", "alice", "Initial commit"),
        )
        .with_repo("github.com/org/cloning", MemoryRepo::cloning("Receiving objects: 12%"))
}

#[tokio::test]
async fn test_rpc_and_http_share_a_port() {
    let shard = assert_ok!(spawn_shard("127.0.0.1:0", Arc::new(executor())).await);

    let transport = tarpc::serde_transport::tcp::connect(shard.addr(), Bincode::default)
        .await
        .unwrap();
    let client = GitserverServiceClient::new(Config::default(), transport).spawn();
    let object = client
        .get_object(
            tarpc::context::current(),
            GetObjectRequest {
                repo: "github.com/org/repo".into(),
                object_name: "HEAD".into(),
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(object.object.id, "aaa111");

    let response = reqwest::Client::new()
        .post(format!("http://{}/commands/get-object", shard.addr()))
        .json(&GetObjectRequest {
            repo: "github.com/org/repo".into(),
            object_name: "HEAD".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: GetObjectResponse = response.json().await.unwrap();
    assert_eq!(body.object, object.object);

    shard.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_not_found_payload() {
    let shard = assert_ok!(spawn_shard("127.0.0.1:0", Arc::new(executor())).await);

    let response = reqwest::Client::new()
        .post(format!("http://{}/commands/get-object", shard.addr()))
        .json(&GetObjectRequest {
            repo: "github.com/org/cloning".into(),
            object_name: "HEAD".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let payload: NotFoundPayload = response.json().await.unwrap();
    assert!(payload.clone_in_progress);
    assert_eq!(payload.clone_progress, "Receiving objects: 12%");
}

#[tokio::test]
async fn test_rpc_status_details() {
    let shard = assert_ok!(spawn_shard("127.0.0.1:0", Arc::new(executor())).await);
    let transport = tarpc::serde_transport::tcp::connect(shard.addr(), Bincode::default)
        .await
        .unwrap();
    let client = GitserverServiceClient::new(Config::default(), transport).spawn();

    let status = client
        .get_object(
            tarpc::context::current(),
            GetObjectRequest {
                repo: "github.com/org/repo".into(),
                object_name: "v2.0".into(),
            },
        )
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code, StatusCode::NotFound);
    assert_eq!(
        status.details,
        vec![StatusDetail::RevisionNotFound {
            repo: "github.com/org/repo".into(),
            spec: "v2.0".into(),
        }]
    );
}

#[tokio::test]
async fn test_search_over_http_is_ndjson() {
    let shard = assert_ok!(spawn_shard("127.0.0.1:0", Arc::new(executor())).await);

    let body = reqwest::Client::new()
        .post(format!("http://{}/search", shard.addr()))
        .json(&SearchRequest {
            repo: "github.com/org/repo".into(),
            revisions: vec![],
            query: "initial".into(),
            include_diff: false,
            limit: None,
        })
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events: Vec<SearchEvent> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], SearchEvent::Done { limit_hit: false });
}
