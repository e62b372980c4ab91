//! HTTP server implementation using Axum.

use crate::error::{GitError, SandboxError};
use crate::git::{BranchOutcome, CommitOutcome, LogEntry, PushOutcome, StatusSummary};
use crate::materializer::Materialized;
use crate::registry::UserId;
use crate::runner::CommandOutput;
use crate::state::AppState;
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequest, FromRequestParts, Query, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

/// JSON error response built from a [`SandboxError`].
#[derive(Debug)]
pub struct ApiError(pub SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::Unauthenticated => StatusCode::UNAUTHORIZED,
        SandboxError::AccessDenied(_) | SandboxError::PathRejected(_) => StatusCode::FORBIDDEN,
        SandboxError::RepositoryNotCloned | SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::InvalidRequest(_) | SandboxError::Git(GitError::InvalidArgument(_)) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "Request failed");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(SandboxError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(SandboxError::InvalidRequest(rejection.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(SandboxError::InvalidRequest(rejection.body_text()))
    }
}

// axum's extractors, with rejections rendered as `ApiError` JSON.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
struct ApiPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
struct ApiQuery<T>(T);

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

/// Caller identity resolved from `Authorization: Bearer <token>`
/// (or `?access_token=` on WebSocket upgrades).
pub struct AuthUser(pub UserId);

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
            return Some(token.trim().to_string());
        }
        return None;
    }
    let upgrading = parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrading {
        return None;
    }
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.access_token)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError(SandboxError::Unauthenticated))?;
        match state.sessions.resolve(&token).await? {
            Some(user) => Ok(AuthUser(user)),
            None => Err(ApiError(SandboxError::Unauthenticated)),
        }
    }
}

// Request/Response types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum Encoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
    #[serde(default)]
    encoding: Encoding,
}

#[derive(Serialize)]
struct FileResponse {
    path: String,
    content: String,
    encoding: Encoding,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    path: String,
    content: String,
    #[serde(default)]
    encoding: Encoding,
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Deserialize)]
struct TreeQuery {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct TerminalRequest {
    command: String,
}

#[derive(Deserialize)]
struct BranchRequest {
    name: String,
    #[serde(default)]
    checkout: bool,
}

#[derive(Deserialize)]
struct CheckoutRequest {
    name: String,
}

#[derive(Deserialize)]
struct CommitRequest {
    message: String,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
    remote: Option<String>,
    branch: Option<String>,
    #[serde(default)]
    set_upstream: bool,
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize { 20 }

#[derive(Deserialize)]
struct DiffQuery {
    path: Option<String>,
    #[serde(default)]
    staged: bool,
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router; split from [`run_server`] so tests can bind their own listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Clone lifecycle
        .route("/repos/:id/clone", post(clone_repository))
        // Files
        .route(
            "/repos/:id/files",
            get(read_file).put(write_file).delete(delete_file),
        )
        .route("/repos/:id/tree", get(list_directory))
        // Terminal
        .route("/repos/:id/terminal", post(run_terminal))
        .route("/repos/:id/terminal/ws", get(terminal_ws))
        // Git
        .route("/repos/:id/git/status", get(git_status))
        .route("/repos/:id/git/branch", post(create_branch))
        .route("/repos/:id/git/checkout", post(switch_branch))
        .route("/repos/:id/git/commit", post(commit))
        .route("/repos/:id/git/push", post(push))
        .route("/repos/:id/git/log", get(log))
        .route("/repos/:id/git/diff", get(diff))
        .route("/repos/:id/git/rollback", post(rollback))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let sweeper = state
        .session_cache
        .spawn_sweeper(state.config().session_sweep_interval);

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app).await;
    sweeper.abort();
    result
}

async fn health() -> &'static str {
    "OK"
}

async fn clone_repository(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<(StatusCode, Json<Materialized>)> {
    let result = state.service.ensure_cloned(&id, &user).await?;
    let status = if result.cloned { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(result)))
}

async fn read_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(q): ApiQuery<FileQuery>,
) -> ApiResult<Json<FileResponse>> {
    let content = match q.encoding {
        Encoding::Utf8 => state.service.read_file(&id, &user, &q.path).await?,
        Encoding::Base64 => {
            let bytes = state.service.read_file_bytes(&id, &user, &q.path).await?;
            base64::engine::general_purpose::STANDARD.encode(bytes)
        }
    };
    Ok(Json(FileResponse {
        path: q.path,
        content,
        encoding: q.encoding,
    }))
}

async fn write_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<WriteFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let bytes = match req.encoding {
        Encoding::Utf8 => req.content.into_bytes(),
        Encoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(req.content.as_bytes())
            .map_err(|e| SandboxError::InvalidRequest(format!("invalid base64 content: {}", e)))?,
    };
    state.service.write_file(&id, &user, &req.path, &bytes).await?;
    info!(repository = %id, path = %req.path, bytes = bytes.len(), "File written");
    Ok(Json(json!({ "path": req.path, "bytes": bytes.len() })))
}

async fn delete_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(q): ApiQuery<PathQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.delete_file(&id, &user, &q.path).await?;
    info!(repository = %id, path = %q.path, "File deleted");
    Ok(Json(json!({ "path": q.path, "deleted": true })))
}

async fn list_directory(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(q): ApiQuery<TreeQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let entries = state.service.list_directory(&id, &user, &q.path).await?;
    Ok(Json(json!({ "path": q.path, "entries": entries })))
}

async fn run_terminal(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TerminalRequest>,
) -> ApiResult<Json<CommandOutput>> {
    info!("POST /repos/{}/terminal - command: {:?}", id, req.command);
    let result = state.service.run_command(&id, &user, &req.command).await?;
    info!("POST /repos/{}/terminal - result: exit={} timed_out={}", id, result.exit_code, result.timed_out);
    Ok(Json(result))
}

async fn terminal_ws(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    state.service.authorize(&id, &user).await?;
    Ok(ws.on_upgrade(move |socket| terminal_session(socket, state, id, user)))
}

/// One WebSocket connection: each text frame `{"command": ..}` runs a
/// command, streaming its output back and ending with an `exit` frame.
async fn terminal_session(socket: WebSocket, state: AppState, id: Uuid, user: UserId) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let req: TerminalRequest = match serde_json::from_str(&text) {
            Ok(req) => req,
            Err(e) => {
                let frame = json!({ "type": "error", "code": "invalid_request", "error": e.to_string() });
                if sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = state.service.clone();
        let run_user = user.clone();
        let run = tokio::spawn(async move {
            service
                .run_command_streaming(&id, &run_user, &req.command, Some(&tx))
                .await
        });

        let mut connected = true;
        while let Some(chunk) = rx.recv().await {
            let frame = match serde_json::to_string(&chunk) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if sender.send(Message::Text(frame)).await.is_err() {
                connected = false;
                break;
            }
        }
        if !connected {
            run.abort();
            break;
        }

        let frame = match run.await {
            Ok(Ok(output)) => json!({
                "type": "exit",
                "exitCode": output.exit_code,
                "timedOut": output.timed_out,
            }),
            Ok(Err(e)) => json!({ "type": "error", "code": e.code(), "error": e.to_string() }),
            Err(e) => {
                warn!(repository = %id, error = %e, "Terminal task failed");
                json!({ "type": "error", "code": "internal", "error": "command task failed" })
            }
        };
        if sender.send(Message::Text(frame.to_string())).await.is_err() {
            break;
        }
    }
    info!(repository = %id, "Terminal socket closed");
}

async fn git_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<StatusSummary>> {
    Ok(Json(state.service.git_status(&id, &user).await?))
}

async fn create_branch(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<BranchRequest>,
) -> ApiResult<(StatusCode, Json<BranchOutcome>)> {
    let outcome = state
        .service
        .create_branch(&id, &user, &req.name, req.checkout)
        .await?;
    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

async fn switch_branch(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CheckoutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.switch_branch(&id, &user, &req.name).await?;
    Ok(Json(json!({ "branch": req.name })))
}

async fn commit(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CommitRequest>,
) -> ApiResult<(StatusCode, Json<CommitOutcome>)> {
    let outcome = state
        .service
        .commit(&id, &user, &req.message, &req.files)
        .await?;
    let status = match outcome {
        CommitOutcome::Committed { .. } => StatusCode::CREATED,
        CommitOutcome::NothingToCommit => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn push(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<PushRequest>,
) -> ApiResult<Json<PushOutcome>> {
    let outcome = state
        .service
        .push(
            &id,
            &user,
            req.remote.as_deref(),
            req.branch.as_deref(),
            req.set_upstream,
        )
        .await?;
    Ok(Json(outcome))
}

async fn log(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(q): ApiQuery<LogQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    Ok(Json(state.service.log(&id, &user, q.limit).await?))
}

async fn diff(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(q): ApiQuery<DiffQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let diff = state
        .service
        .diff(&id, &user, q.path.as_deref(), q.staged)
        .await?;
    Ok(Json(json!({ "diff": diff })))
}

async fn rollback(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let head = state.service.rollback(&id, &user).await?;
    warn!(repository = %id, user = %user, head = %head, "Repository rolled back");
    Ok(Json(json!({ "head": head })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::OwnershipRejection;
    use crate::path_guard::PathRejection;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(status_for(&SandboxError::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&SandboxError::AccessDenied(OwnershipRejection::NotOwned)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&SandboxError::AccessDenied(OwnershipRejection::NotFound)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&SandboxError::PathRejected(PathRejection::Traversal)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(&SandboxError::RepositoryNotCloned), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&SandboxError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&SandboxError::Git(GitError::InvalidArgument("-x".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SandboxError::Io(std::io::Error::other("disk"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bearer_header_is_parsed() {
        let p = parts(Request::builder().header("Authorization", "Bearer abc123"));
        assert_eq!(bearer_token(&p).as_deref(), Some("abc123"));

        let p = parts(Request::builder().header("Authorization", "bearer  abc123 "));
        assert_eq!(bearer_token(&p).as_deref(), Some("abc123"));
    }

    #[test]
    fn non_bearer_schemes_are_ignored() {
        let p = parts(Request::builder().header("Authorization", "Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&p), None);
    }

    #[test]
    fn access_token_query_only_for_websocket_upgrades() {
        let p = parts(
            Request::builder()
                .uri("/repos/x/terminal/ws?access_token=tok")
                .header("Upgrade", "websocket"),
        );
        assert_eq!(bearer_token(&p).as_deref(), Some("tok"));

        let p = parts(Request::builder().uri("/repos/x/files?access_token=tok"));
        assert_eq!(bearer_token(&p), None);

        let p = parts(Request::builder().uri("/repos/x/terminal/ws").header("Upgrade", "websocket"));
        assert_eq!(bearer_token(&p), None);
    }
}
