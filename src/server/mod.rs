use crate::domain::{LogMessage, RemoveMessageError};
use crate::infra::{
    DeleteMessageError, DeleteSessionLogError, ListSessionsError, LoadSessionError, ProjectStats,
    ProjectSummary, SessionPathError, SessionSummary, delete_session_log, delete_session_message,
    list_project_sessions, list_projects, load_session_messages, project_stats,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub projects_dir: PathBuf,
    pub frontend_origin: Option<String>,
    write_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(projects_dir: PathBuf, frontend_origin: Option<String>) -> Self {
        Self {
            projects_dir,
            frontend_origin,
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<SessionPathError> for ApiError {
    fn from(error: SessionPathError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<RemoveMessageError> for ApiError {
    fn from(error: RemoveMessageError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<DeleteMessageError> for ApiError {
    fn from(error: DeleteMessageError) -> Self {
        match error {
            DeleteMessageError::InvalidPath(error) => error.into(),
            DeleteMessageError::InvalidIndex(error) => error.into(),
            DeleteMessageError::NotFound(_) => ApiError::NotFound("Session file not found".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DeleteSessionLogError> for ApiError {
    fn from(error: DeleteSessionLogError) -> Self {
        match error {
            DeleteSessionLogError::InvalidPath(error) => error.into(),
            DeleteSessionLogError::NotFound(_) => {
                ApiError::NotFound("Session file not found".into())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LoadSessionError> for ApiError {
    fn from(error: LoadSessionError) -> Self {
        match error {
            LoadSessionError::InvalidPath(error) => error.into(),
            LoadSessionError::NotFound(_) => ApiError::NotFound("Session file not found".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ListSessionsError> for ApiError {
    fn from(error: ListSessionsError) -> Self {
        match error {
            ListSessionsError::InvalidPath(error) => error.into(),
            ListSessionsError::ProjectNotFound(project) => {
                ApiError::NotFound(format!("Project not found: {project}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| ApiError::Internal(error.to_string()))
}

pub fn build_router(state: AppState) -> Router {
    let cors = state.frontend_origin.as_deref().and_then(cors_for_origin);

    let router = Router::new()
        .route("/health", get(health))
        .route("/api/session/delete-message", post(delete_message))
        .route("/api/projects", get(projects))
        .route("/api/projects/{project}/sessions", get(project_sessions))
        .route("/api/projects/{project}/stats", get(project_stats_handler))
        .route(
            "/api/projects/{project}/sessions/{session_id}",
            delete(delete_session),
        )
        .route(
            "/api/projects/{project}/sessions/{session_id}/messages",
            get(session_messages),
        )
        .with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_for_origin(origin: &str) -> Option<CorsLayer> {
    let origin = match HeaderValue::from_str(origin.trim_end_matches('/')) {
        Ok(origin) => origin,
        Err(error) => {
            tracing::warn!(event = "server.cors.invalid_origin", origin, %error);
            return None;
        }
    };
    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]),
    )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "projectsDir": state.projects_dir.display().to_string(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMessageRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message_index: Option<i64>,
    #[serde(default)]
    project_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMessageResponse {
    success: bool,
    deleted_index: usize,
    remaining_messages: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

async fn delete_message(
    State(state): State<AppState>,
    payload: Result<Json<DeleteMessageRequest>, JsonRejection>,
) -> Result<Json<DeleteMessageResponse>, ApiError> {
    let Json(request) = payload.inspect_err(|rejection| {
        tracing::warn!(event = "message.delete.bad_body", error = %rejection.body_text());
    })?;

    let session_id = non_empty(request.session_id);
    let project_path = non_empty(request.project_path);
    let (Some(session_id), Some(message_index), Some(project_path)) =
        (session_id.clone(), request.message_index, project_path.clone())
    else {
        let missing: Vec<&str> = [
            ("sessionId", session_id.is_none()),
            ("messageIndex", request.message_index.is_none()),
            ("projectPath", project_path.is_none()),
        ]
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| name)
        .collect();
        tracing::warn!(event = "message.delete.missing_params", missing = ?missing);
        return Err(ApiError::BadRequest(format!(
            "Missing required parameters: {}",
            missing.join(", ")
        )));
    };

    let _guard = state.write_lock.lock().await;
    let projects_dir = state.projects_dir.clone();
    let session_for_blocking = session_id.clone();
    let project_for_blocking = project_path.clone();
    let result = run_blocking(move || {
        delete_session_message(
            &projects_dir,
            &session_for_blocking,
            message_index,
            &project_for_blocking,
        )
    })
    .await?;

    match result {
        Ok(outcome) => {
            tracing::info!(
                event = "message.delete.ok",
                session_id = %session_id,
                project = %project_path,
                deleted_index = outcome.deleted_index,
                remaining = outcome.remaining_messages,
            );
            Ok(Json(DeleteMessageResponse {
                success: true,
                deleted_index: outcome.deleted_index,
                remaining_messages: outcome.remaining_messages,
            }))
        }
        Err(error) => {
            tracing::warn!(
                event = "message.delete.err",
                session_id = %session_id,
                project = %project_path,
                message_index,
                %error,
            );
            Err(error.into())
        }
    }
}

#[derive(Debug, Serialize)]
struct ProjectsResponse {
    projects: Vec<ProjectSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<String>,
}

async fn projects(State(state): State<AppState>) -> Result<Json<ProjectsResponse>, ApiError> {
    let projects_dir = state.projects_dir.clone();
    let listing = run_blocking(move || list_projects(&projects_dir)).await?;
    if listing.warnings > 0 {
        tracing::warn!(event = "projects.list.warnings", warnings = listing.warnings);
    }
    Ok(Json(ProjectsResponse {
        projects: listing.projects,
        notice: listing.notice,
    }))
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionSummary>,
}

async fn project_sessions(
    State(state): State<AppState>,
    UrlPath(project): UrlPath<String>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let projects_dir = state.projects_dir.clone();
    let listing = run_blocking(move || list_project_sessions(&projects_dir, &project)).await??;
    if listing.warnings > 0 {
        tracing::warn!(event = "sessions.list.warnings", warnings = listing.warnings);
    }
    Ok(Json(SessionsResponse {
        sessions: listing.sessions,
    }))
}

async fn project_stats_handler(
    State(state): State<AppState>,
    UrlPath(project): UrlPath<String>,
) -> Result<Json<ProjectStats>, ApiError> {
    let projects_dir = state.projects_dir.clone();
    let stats = run_blocking(move || project_stats(&projects_dir, &project)).await??;
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteSessionResponse {
    success: bool,
    session_id: String,
}

async fn delete_session(
    State(state): State<AppState>,
    UrlPath((project, session_id)): UrlPath<(String, String)>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    let _guard = state.write_lock.lock().await;
    let projects_dir = state.projects_dir.clone();
    let session_for_blocking = session_id.clone();
    let project_for_blocking = project.clone();
    let result = run_blocking(move || {
        delete_session_log(&projects_dir, &project_for_blocking, &session_for_blocking)
    })
    .await?;

    match result {
        Ok(path) => {
            tracing::info!(
                event = "session.delete.ok",
                session_id = %session_id,
                project = %project,
                path = %path.display(),
            );
            Ok(Json(DeleteSessionResponse {
                success: true,
                session_id,
            }))
        }
        Err(error) => {
            tracing::warn!(
                event = "session.delete.err",
                session_id = %session_id,
                project = %project,
                %error,
            );
            Err(error.into())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionMessagesResponse {
    session_id: String,
    total: usize,
    messages: Vec<LogMessage>,
}

async fn session_messages(
    State(state): State<AppState>,
    UrlPath((project, session_id)): UrlPath<(String, String)>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<SessionMessagesResponse>, ApiError> {
    let Query(page) = query?;
    let projects_dir = state.projects_dir.clone();
    let session_for_blocking = session_id.clone();
    let loaded = run_blocking(move || {
        load_session_messages(
            &projects_dir,
            &project,
            &session_for_blocking,
            page.offset.unwrap_or(0),
            page.limit,
        )
    })
    .await??;

    Ok(Json(SessionMessagesResponse {
        session_id,
        total: loaded.total,
        messages: loaded.messages,
    }))
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

pub async fn run_http_server_on(addr: SocketAddr, state: AppState) -> Result<(), ServeError> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    tracing::info!(event = "server.listen", %addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(event = "server.shutdown");
        })
        .await
        .map_err(ServeError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use tower::ServiceExt as _;

    const PROJECT: &str = "-home-dev-app";
    const SESSION: &str = "0b9c3c1e-3f7a-4e43-9d4b-1c2d3e4f5a6b";
    const META: &str = r#"{"type":"summary","summary":"App work","leafUuid":"m2"}"#;
    const M0: &str = r#"{"type":"user","uuid":"m0","timestamp":"2026-02-19T10:00:00Z","message":{"role":"user","content":"first"}}"#;
    const M1: &str = r#"{"type":"assistant","uuid":"m1","timestamp":"2026-02-19T10:00:05Z","message":{"role":"assistant","content":[{"type":"text","text":"second"}]}}"#;
    const M2: &str = r#"{"type":"user","uuid":"m2","timestamp":"2026-02-19T10:01:00Z","message":{"role":"user","content":"third"}}"#;

    fn seed(projects_dir: &Path) -> PathBuf {
        let dir = projects_dir.join(PROJECT);
        fs::create_dir_all(&dir).expect("create project dir");
        let path = dir.join(format!("{SESSION}.jsonl"));
        fs::write(&path, format!("{M0}\n{META}\n{M1}\n{M2}\n")).expect("write log");
        path
    }

    fn router_for(projects_dir: &Path) -> Router {
        build_router(AppState::new(
            projects_dir.to_path_buf(),
            Some("http://localhost:3082".to_string()),
        ))
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn delete_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/session/delete-message")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn deletes_message_and_rewrites_log() {
        let dir = tempdir().expect("tempdir");
        let path = seed(dir.path());

        let body = format!(
            r#"{{"sessionId":"{SESSION}","messageIndex":1,"projectPath":"{PROJECT}"}}"#
        );
        let (status, value) = send(router_for(dir.path()), delete_request(&body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["success"], true);
        assert_eq!(value["deletedIndex"], 1);
        assert_eq!(value["remainingMessages"], 2);

        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text, format!("{META}\n{M0}\n{M2}\n"));
    }

    #[tokio::test]
    async fn missing_parameters_are_bad_request() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());

        let body = format!(r#"{{"sessionId":"{SESSION}","projectPath":""}}"#);
        let (status, value) = send(router_for(dir.path()), delete_request(&body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["success"], false);
        let error = value["error"].as_str().expect("error message");
        assert!(error.contains("messageIndex"));
        assert!(error.contains("projectPath"));
        assert!(!error.contains("sessionId"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let dir = tempdir().expect("tempdir");
        let (status, value) = send(router_for(dir.path()), delete_request("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn out_of_range_index_is_bad_request_and_file_is_unchanged() {
        let dir = tempdir().expect("tempdir");
        let path = seed(dir.path());
        let before = fs::read_to_string(&path).expect("read");

        for index in [-1, 3] {
            let body = format!(
                r#"{{"sessionId":"{SESSION}","messageIndex":{index},"projectPath":"{PROJECT}"}}"#
            );
            let (status, value) = send(router_for(dir.path()), delete_request(&body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "index {index}");
            assert_eq!(value["success"], false);
        }
        assert_eq!(fs::read_to_string(&path).expect("read"), before);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let body =
            format!(r#"{{"sessionId":"nope","messageIndex":0,"projectPath":"{PROJECT}"}}"#);
        let (status, value) = send(router_for(dir.path()), delete_request(&body)).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["success"], false);
        assert!(!dir.path().join(PROJECT).join("nope.jsonl").exists());
    }

    #[tokio::test]
    async fn traversal_in_project_path_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let body = format!(r#"{{"sessionId":"{SESSION}","messageIndex":0,"projectPath":".."}}"#);
        let (status, _) = send(router_for(dir.path()), delete_request(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_projects_dir() {
        let dir = tempdir().expect("tempdir");
        let (status, value) = send(router_for(dir.path()), get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["status"], "ok");
        assert_eq!(value["projectsDir"], dir.path().display().to_string());
    }

    #[tokio::test]
    async fn browses_projects_sessions_and_messages() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());

        let (status, value) = send(router_for(dir.path()), get_request("/api/projects")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["projects"][0]["name"], PROJECT);
        assert_eq!(value["projects"][0]["sessionsCount"], 1);
        assert_eq!(value["projects"][0]["totalMessages"], 3);

        let uri = format!("/api/projects/{PROJECT}/sessions");
        let (status, value) = send(router_for(dir.path()), get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["sessions"][0]["sessionId"], SESSION);
        assert_eq!(value["sessions"][0]["title"], "first");

        let uri = format!("/api/projects/{PROJECT}/sessions/{SESSION}/messages?offset=1&limit=1");
        let (status, value) = send(router_for(dir.path()), get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["sessionId"], SESSION);
        assert_eq!(value["total"], 3);
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["messages"][0]["index"], 1);
        assert_eq!(value["messages"][0]["content"], "second");
    }

    #[tokio::test]
    async fn unknown_project_and_bad_query_map_to_error_payloads() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());

        let (status, value) =
            send(router_for(dir.path()), get_request("/api/projects/missing/sessions")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["success"], false);

        let uri = format!("/api/projects/{PROJECT}/sessions/{SESSION}/messages?limit=lots");
        let (status, value) = send(router_for(dir.path()), get_request(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn deletes_whole_session_then_reports_not_found() {
        let dir = tempdir().expect("tempdir");
        let path = seed(dir.path());
        let uri = format!("/api/projects/{PROJECT}/sessions/{SESSION}");
        let request = || {
            Request::builder()
                .method("DELETE")
                .uri(&uri)
                .body(Body::empty())
                .expect("request")
        };

        let (status, value) = send(router_for(dir.path()), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["success"], true);
        assert_eq!(value["sessionId"], SESSION);
        assert!(!path.exists());

        let (status, value) = send(router_for(dir.path()), request()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn project_stats_include_averages_and_cost() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());

        let uri = format!("/api/projects/{PROJECT}/stats");
        let (status, value) = send(router_for(dir.path()), get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["name"], PROJECT);
        assert_eq!(value["sessionsCount"], 1);
        assert_eq!(value["totalMessages"], 3);
        assert_eq!(value["avgMessagesPerSession"], 3.0);
        assert_eq!(value["estimatedCostUsd"], 0.0);
        assert_eq!(value["sessions"][0]["sessionId"], SESSION);

        let (status, value) =
            send(router_for(dir.path()), get_request("/api/projects/missing/stats")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn cors_allows_frontend_origin() {
        let dir = tempdir().expect("tempdir");
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/session/delete-message")
            .header(header::ORIGIN, "http://localhost:3082")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .expect("request");
        let response = router_for(dir.path())
            .oneshot(request)
            .await
            .expect("response");
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|value| value.to_str().ok()),
            Some("http://localhost:3082")
        );
    }
}
