mod common;

use base64::Engine;
use common::{Fixture, OWNER, STRANGER};
use futures_util::{SinkExt, StreamExt};
use repo_sandbox::http_server::router;
use repo_sandbox::session::StaticTokens;
use repo_sandbox::state::AppState;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

const ALICE_TOKEN: &str = "alice-token";
const BOB_TOKEN: &str = "bob-token";

struct TestServer {
    fx: Fixture,
    addr: SocketAddr,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let fx = Fixture::new().await;
        let tokens = StaticTokens::new()
            .with_token(ALICE_TOKEN, OWNER)
            .with_token(BOB_TOKEN, STRANGER);
        let state = AppState::new(fx.config(), fx.registry.clone(), Arc::new(tokens));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Self {
            fx,
            addr,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn repo_url(&self, path: &str) -> String {
        self.url(&format!("/repos/{}{}", self.fx.repo_id, path))
    }

    async fn clone_repo(&self) -> Value {
        let resp = self
            .client
            .post(self.repo_url("/clone"))
            .bearer_auth(ALICE_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        resp.json().await.unwrap()
    }
}

#[tokio::test]
async fn health_needs_no_token() {
    let server = TestServer::start().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let server = TestServer::start().await;

    let resp = server.client.get(server.repo_url("/git/status")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unauthenticated");

    let resp = server
        .client
        .get(server.repo_url("/git/status"))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn other_users_get_forbidden() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .post(server.repo_url("/clone"))
        .bearer_auth(BOB_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "access_denied");
    assert!(!server.fx.clone_path().exists());
}

#[tokio::test]
async fn not_cloned_is_not_found() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .get(server.repo_url("/files"))
        .query(&[("path", "README.md")])
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "repository_not_cloned");
}

#[tokio::test]
async fn clone_is_created_then_reused() {
    let server = TestServer::start().await;
    let body = server.clone_repo().await;
    assert_eq!(body["cloned"], true);
    assert!(body["branchCreated"].as_str().unwrap().starts_with("ai-edits-"));

    let resp = server
        .client
        .post(server.repo_url("/clone"))
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cloned"], false);
}

#[tokio::test]
async fn file_round_trip_over_http() {
    let server = TestServer::start().await;
    server.clone_repo().await;

    let resp = server
        .client
        .put(server.repo_url("/files"))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "path": "docs/intro.md", "content": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .client
        .get(server.repo_url("/files"))
        .query(&[("path", "docs/intro.md"), ("encoding", "base64")])
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(body["content"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, b"hello");

    let resp = server
        .client
        .get(server.repo_url("/tree"))
        .query(&[("path", "docs")])
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["entries"][0]["path"], "docs/intro.md");
    assert_eq!(body["entries"][0]["type"], "file");

    let resp = server
        .client
        .delete(server.repo_url("/files"))
        .query(&[("path", "docs/intro.md")])
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!server.fx.clone_path().join("docs/intro.md").exists());
}

#[tokio::test]
async fn traversal_is_forbidden() {
    let server = TestServer::start().await;
    server.clone_repo().await;

    let resp = server
        .client
        .get(server.repo_url("/files"))
        .query(&[("path", "../../etc/passwd")])
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "path_rejected");
}

#[tokio::test]
async fn malformed_requests_get_json_errors() {
    let server = TestServer::start().await;
    server.clone_repo().await;

    let not_a_uuid = server
        .client
        .get(server.url("/repos/not-a-uuid/git/status"))
        .bearer_auth(ALICE_TOKEN)
        .send();
    let missing_path = server
        .client
        .get(server.repo_url("/files"))
        .bearer_auth(ALICE_TOKEN)
        .send();
    let broken_body = server
        .client
        .put(server.repo_url("/files"))
        .bearer_auth(ALICE_TOKEN)
        .header("content-type", "application/json")
        .body("{\"path\": ")
        .send();

    for resp in [not_a_uuid.await, missing_path.await, broken_body.await] {
        let resp = resp.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/json"));
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_request");
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    }
}

#[tokio::test]
async fn terminal_and_commit_over_http() {
    let server = TestServer::start().await;
    server.clone_repo().await;

    let resp = server
        .client
        .post(server.repo_url("/terminal"))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "command": "cat README.md" }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["stdout"], "# widgets\n");
    assert_eq!(body["exitCode"], 0);
    assert_eq!(body["timedOut"], false);

    let resp = server
        .client
        .post(server.repo_url("/git/commit"))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "message": "empty" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "nothing_to_commit");

    let resp = server
        .client
        .post(server.repo_url("/git/branch"))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "name": "-x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn websocket_streams_output_then_exit() {
    let server = TestServer::start().await;
    server.clone_repo().await;

    let url = format!(
        "ws://{}/repos/{}/terminal/ws?access_token={}",
        server.addr, server.fx.repo_id, ALICE_TOKEN
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
        .send(Message::Text(json!({ "command": "echo streamed" }).to_string()))
        .await
        .unwrap();

    let mut stdout = String::new();
    loop {
        let Some(Ok(Message::Text(text))) = socket.next().await else {
            panic!("socket closed before exit frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        match frame["type"].as_str().unwrap() {
            "stdout" => stdout.push_str(frame["data"].as_str().unwrap()),
            "exit" => {
                assert_eq!(frame["exitCode"], 0);
                assert_eq!(frame["timedOut"], false);
                break;
            }
            other => panic!("unexpected frame {}", other),
        }
    }
    assert_eq!(stdout, "streamed\n");
}

#[tokio::test]
async fn websocket_rejects_other_users() {
    let server = TestServer::start().await;
    let url = format!(
        "ws://{}/repos/{}/terminal/ws?access_token={}",
        server.addr, server.fx.repo_id, BOB_TOKEN
    );
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
}
