use std::net::SocketAddr;
use std::path::{Component, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::policy::{self, PathPolicy};
use crate::project::{Project, ProjectManager};
use crate::remote::{RemoteError, SandboxClient};
use crate::runner::{InstallReport, ScriptRunRecord, ScriptRunner};
use crate::scanner;
use crate::sync::{self, RemoteHandle, SyncVector};
use crate::tabular;
use crate::terminal::{self, TerminalRegistry};

/// Keepalive cadence on `/ws/watch`.
const WATCH_KEEPALIVE: Duration = Duration::from_secs(30);

const GITHUB_DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

const IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];

/// Everything the REST surface can answer with when it is not 2xx, mapped to
/// the `{detail}` envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    PolicyViolation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PolicyViolation(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Remote(err) => match err {
                RemoteError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                RemoteError::NotFound(_) => StatusCode::NOT_FOUND,
                RemoteError::Conflict(_) => StatusCode::CONFLICT,
                RemoteError::PolicyRejected(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_GATEWAY,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            crate::logging::error(format!("internal error: {self}"));
        }
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub struct AppState {
    pub manager: Arc<ProjectManager>,
    pub runner: Arc<ScriptRunner>,
    pub terminals: Arc<TerminalRegistry>,
    pub remote: Arc<RemoteHandle>,
    vector: std::sync::Mutex<SyncVector>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(
        manager: Arc<ProjectManager>,
        runner: Arc<ScriptRunner>,
        terminals: Arc<TerminalRegistry>,
        remote: Arc<RemoteHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            runner,
            terminals,
            remote,
            vector: std::sync::Mutex::new(SyncVector::new()),
            http: reqwest::Client::new(),
        })
    }

    fn policy(&self) -> Arc<PathPolicy> {
        self.manager.policy()
    }

    /// Snapshot of the stored vector merged with an optional caller-supplied
    /// one; per-key maximum keeps it monotone.
    fn seed_vector(&self, from_request: Option<SyncVector>) -> SyncVector {
        let mut seed = self
            .vector
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default();
        if let Some(extra) = from_request {
            for (key, value) in extra {
                let slot = seed.entry(key).or_insert(i64::MIN);
                *slot = (*slot).max(value);
            }
        }
        seed
    }

    fn store_vector(&self, next: SyncVector) {
        if let Ok(mut slot) = self.vector.lock() {
            *slot = next;
        }
    }

    async fn require_project(&self) -> ApiResult<Arc<Project>> {
        self.manager
            .active()
            .await
            .ok_or_else(|| ApiError::Conflict("no project selected".to_string()))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/folder/select", post(folder_select))
        .route("/api/fs/home", get(fs_home))
        .route("/api/fs/list", get(fs_list))
        .route("/api/files/tree", get(files_tree))
        .route("/api/files/read", get(files_read))
        .route("/api/files/write", post(files_write))
        .route("/api/files/delete", post(files_delete))
        .route("/api/scripts", get(scripts_list))
        .route("/api/scripts/run", post(scripts_run))
        .route("/api/pip/install", post(pip_install))
        .route("/api/metadata/generate", post(metadata_generate))
        .route("/api/dataframe/rows", get(dataframe_rows))
        .route("/api/dataframe/query", post(dataframe_query))
        .route("/api/sync/pull", post(sync_pull))
        .route("/api/sync/push", post(sync_push))
        .route("/api/sync/full", post(sync_full))
        .route("/api/github/device-code", post(github_device_code))
        .route("/api/github/token", post(github_token))
        .route("/api/terminal/sessions", get(terminal_sessions))
        .route("/api/terminal/close", post(terminal_close))
        .route("/ws/watch", get(ws_watch))
        .route("/ws/terminal", get(ws_terminal))
        .route("/ws/remote-terminal", get(ws_remote_terminal))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves. A failed bind is the caller's
/// exit-code-1 path.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;
    let bound = listener.local_addr()?;
    let app = router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        if let Err(err) = result {
            crate::logging::error(format!("http server error: {err}"));
        }
    });
    crate::logging::info_kv("http server listening", &[("addr", &bound.to_string())]);
    Ok(bound)
}

/// Reject absolute paths and parent traversal; returns a normalized
/// project-relative path.
fn sanitize_rel(raw: &str) -> ApiResult<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidRequest("path is required".to_string()));
    }
    let rel = policy::rel_path(trimmed);
    if rel.is_absolute() {
        return Err(ApiError::InvalidRequest(format!(
            "path must be project-relative: {trimmed}"
        )));
    }
    for comp in rel.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ApiError::InvalidRequest(format!(
                    "path escapes the project root: {trimmed}"
                )))
            }
        }
    }
    Ok(rel)
}

// ---------------------------------------------------------------------------
// Status + project lifecycle
// ---------------------------------------------------------------------------

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let project = state.manager.active().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "project": project.map(|p| json!({ "name": p.name, "path": p.root.display().to_string() })),
    }))
}

#[derive(Deserialize)]
struct FolderSelectRequest {
    path: String,
}

async fn folder_select(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FolderSelectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let path = PathBuf::from(req.path.trim());
    if req.path.trim().is_empty() {
        return Err(ApiError::InvalidRequest("path is required".to_string()));
    }
    if !path.is_absolute() {
        return Err(ApiError::InvalidRequest(format!(
            "project path must be absolute: {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(ApiError::NotFound(format!(
            "not a directory: {}",
            path.display()
        )));
    }
    let project = state
        .manager
        .select(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(json!({
        "name": project.name,
        "path": project.root.display().to_string(),
    })))
}

async fn fs_home() -> Json<serde_json::Value> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    Json(json!({ "path": home.display().to_string() }))
}

#[derive(Deserialize)]
struct FsListQuery {
    path: Option<String>,
}

async fn fs_list(Query(q): Query<FsListQuery>) -> ApiResult<Json<serde_json::Value>> {
    let current = match q.path {
        Some(p) if !p.trim().is_empty() => PathBuf::from(p.trim()),
        _ => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
    };
    if !current.is_dir() {
        return Err(ApiError::NotFound(format!(
            "not a directory: {}",
            current.display()
        )));
    }

    let mut folders = Vec::new();
    let entries = std::fs::read_dir(&current)
        .map_err(|e| ApiError::Internal(format!("read dir {}: {e}", current.display())))?;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        folders.push(json!({
            "name": name,
            "path": entry.path().display().to_string(),
        }));
    }
    folders.sort_by(|a, b| {
        let an = a["name"].as_str().unwrap_or_default().to_lowercase();
        let bn = b["name"].as_str().unwrap_or_default().to_lowercase();
        an.cmp(&bn)
    });

    Ok(Json(json!({
        "current": current.display().to_string(),
        "parent": current.parent().map(|p| p.display().to_string()),
        "folders": folders,
    })))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

async fn files_tree(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let policy = state.policy();
    let bus = state.manager.bus().clone();
    let root = project.root.clone();
    let tree = tokio::task::spawn_blocking(move || scanner::scan_tree(&root, &policy, Some(&bus)))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(json!({ "tree": tree })))
}

#[derive(Deserialize)]
struct FilesReadQuery {
    path: String,
}

async fn files_read(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FilesReadQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let rel = sanitize_rel(&q.path)?;
    let abs = project.root.join(&rel);
    if !abs.is_file() {
        return Err(ApiError::NotFound(format!("no such file: {}", q.path)));
    }

    let ext = policy::extension_of(&rel).unwrap_or_default();
    if tabular::is_tabular_extension(&ext) {
        let page = tokio::task::spawn_blocking(move || {
            tabular::preview(&abs, 0, tabular::DEFAULT_PREVIEW_LIMIT)
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::InvalidRequest(format!("{e:#}")))?;
        return Ok(Json(serde_json::to_value(page).map_err(|e| {
            ApiError::Internal(e.to_string())
        })?));
    }

    if IMAGE_EXTS.contains(&ext.as_str()) {
        let bytes = tokio::fs::read(&abs)
            .await
            .map_err(|e| ApiError::Internal(format!("read {}: {e}", q.path)))?;
        return Ok(Json(json!({
            "type": "image",
            "extension": ext,
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
        })));
    }

    let bytes = tokio::fs::read(&abs)
        .await
        .map_err(|e| ApiError::Internal(format!("read {}: {e}", q.path)))?;
    Ok(Json(json!({
        "type": "text",
        "content": String::from_utf8_lossy(&bytes),
    })))
}

#[derive(Deserialize)]
struct FilesWriteRequest {
    path: String,
    content: String,
}

async fn files_write(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FilesWriteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let rel = sanitize_rel(&req.path)?;
    if state
        .policy()
        .is_forbidden_in_app(&rel, Some(req.content.len() as u64))
    {
        return Err(ApiError::PolicyViolation(format!(
            "this file class is not allowed under app/: {}",
            req.path
        )));
    }
    let abs = project.root.join(&rel);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Internal(format!("create {}: {e}", parent.display())))?;
    }
    tokio::fs::write(&abs, req.content.as_bytes())
        .await
        .map_err(|e| ApiError::Internal(format!("write {}: {e}", req.path)))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct FilesDeleteRequest {
    path: String,
    #[serde(rename = "isDirectory", default)]
    is_directory: bool,
}

async fn files_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FilesDeleteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let rel = sanitize_rel(&req.path)?;
    let abs = project.root.join(&rel);
    if !abs.exists() {
        return Err(ApiError::NotFound(format!("no such path: {}", req.path)));
    }
    let result = if req.is_directory {
        tokio::fs::remove_dir_all(&abs).await
    } else {
        tokio::fs::remove_file(&abs).await
    };
    result.map_err(|e| ApiError::Internal(format!("delete {}: {e}", req.path)))?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

async fn scripts_list(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let scripts = crate::runner::list_scripts(&project.root);
    Ok(Json(json!({ "scripts": scripts })))
}

#[derive(Deserialize)]
struct ScriptsRunRequest {
    scripts: Vec<String>,
}

#[derive(Serialize)]
struct ScriptsRunResponse {
    results: Vec<ScriptRunRecord>,
}

async fn scripts_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScriptsRunRequest>,
) -> ApiResult<Json<ScriptsRunResponse>> {
    let project = state.require_project().await?;
    if req.scripts.is_empty() {
        return Err(ApiError::InvalidRequest("scripts is empty".to_string()));
    }
    for raw in &req.scripts {
        let rel = sanitize_rel(raw)?;
        if !rel.starts_with("app/scripts") {
            return Err(ApiError::PolicyViolation(format!(
                "only scripts under app/scripts can run: {raw}"
            )));
        }
        if !project.root.join(&rel).is_file() {
            return Err(ApiError::NotFound(format!("no such script: {raw}")));
        }
    }

    let receivers = state.runner.submit(&project.root, &req.scripts).await;
    let mut results = Vec::with_capacity(receivers.len());
    for (rel, rx) in receivers {
        match rx.await {
            Ok(record) => results.push(record),
            Err(_) => {
                return Err(ApiError::Internal(format!(
                    "script worker dropped result for {rel}"
                )))
            }
        }
    }
    Ok(Json(ScriptsRunResponse { results }))
}

#[derive(Deserialize)]
struct PipInstallRequest {
    package: String,
}

async fn pip_install(
    State(_state): State<Arc<AppState>>,
    Json(req): Json<PipInstallRequest>,
) -> ApiResult<Json<InstallReport>> {
    let package = req.package.trim();
    if package.is_empty()
        || !package
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '[' | ']' | '='))
    {
        return Err(ApiError::InvalidRequest(format!(
            "not a valid package name: {package}"
        )));
    }
    let report = crate::runner::install_package(package)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(report))
}

async fn metadata_generate(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let policy = state.policy();
    let root = project.root.clone();
    tokio::task::spawn_blocking(move || crate::project::build_metadata(&root, &policy))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Dataframe preview
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DataframeRowsQuery {
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

async fn dataframe_rows(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DataframeRowsQuery>,
) -> ApiResult<Json<tabular::DataframePage>> {
    let project = state.require_project().await?;
    let rel = sanitize_rel(&q.file_path)?;
    let abs = project.root.join(&rel);
    if !abs.is_file() {
        return Err(ApiError::NotFound(format!("no such file: {}", q.file_path)));
    }
    let page = tokio::task::spawn_blocking(move || tabular::preview(&abs, q.offset, q.limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::InvalidRequest(format!("{e:#}")))?;
    Ok(Json(page))
}

#[derive(Deserialize)]
struct DataframeQueryRequest {
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(default)]
    filters: Vec<tabular::Filter>,
    #[serde(default)]
    sort: Option<tabular::Sort>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

async fn dataframe_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DataframeQueryRequest>,
) -> ApiResult<Json<tabular::DataframePage>> {
    let project = state.require_project().await?;
    let rel = sanitize_rel(&req.file_path)?;
    let abs = project.root.join(&rel);
    if !abs.is_file() {
        return Err(ApiError::NotFound(format!(
            "no such file: {}",
            req.file_path
        )));
    }
    let page = tokio::task::spawn_blocking(move || {
        tabular::query(&abs, &req.filters, req.sort.as_ref(), req.offset, req.limit)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(|e| ApiError::InvalidRequest(format!("{e:#}")))?;
    Ok(Json(page))
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SyncPullRequest {
    codespace_url: String,
    #[serde(default)]
    last_sync: Option<SyncVector>,
}

#[derive(Deserialize)]
struct SyncPushRequest {
    codespace_url: String,
}

async fn connect_remote(state: &AppState, codespace_url: &str) -> ApiResult<SandboxClient> {
    let url = codespace_url.trim();
    if url.is_empty() {
        return Err(ApiError::InvalidRequest(
            "codespace_url is required".to_string(),
        ));
    }
    let client = SandboxClient::new(url, state.policy())?;
    // Probe before committing to a long operation.
    client.health().await?;
    state.remote.set(client.clone());
    Ok(client)
}

async fn sync_pull(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncPullRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let client = connect_remote(&state, &req.codespace_url).await?;
    let seed = state.seed_vector(req.last_sync);

    let report = sync::pull(&client, &state.manager, &project, seed).await;
    state.store_vector(report.vector.clone());
    if let Some(err) = report.error {
        return Err(err.into());
    }
    Ok(Json(json!({
        "synced_files": report.synced_paths,
        "last_sync": report.vector,
    })))
}

async fn sync_push(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncPushRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let client = connect_remote(&state, &req.codespace_url).await?;

    let report = sync::push(&client, &project, &state.policy()).await;
    if let Some(err) = report.error {
        return Err(err.into());
    }
    Ok(Json(json!({ "pushed_files": report.pushed_paths })))
}

async fn sync_full(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncPullRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.require_project().await?;
    let client = connect_remote(&state, &req.codespace_url).await?;
    let seed = state.seed_vector(req.last_sync);

    let (metadata, pull_report) = sync::full_sync(&client, &state.manager, &project, seed).await;
    state.store_vector(pull_report.vector.clone());
    if let Some(err) = pull_report.error {
        return Err(err.into());
    }
    Ok(Json(json!({
        "scripts_sync": {
            "synced_files": pull_report.synced_paths,
            "last_sync": pull_report.vector,
        },
        "metadata_sync": {
            "pushed": metadata.pushed,
            "error": metadata.error.map(|e| e.to_string()),
        },
    })))
}

// ---------------------------------------------------------------------------
// GitHub device-flow pass-through (CORS bypass only)
// ---------------------------------------------------------------------------

async fn github_device_code(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward_github(&state, GITHUB_DEVICE_CODE_URL, body).await
}

async fn github_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward_github(&state, GITHUB_TOKEN_URL, body).await
}

async fn forward_github(
    state: &AppState,
    url: &str,
    body: serde_json::Value,
) -> ApiResult<Response> {
    let upstream = state
        .http
        .post(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .json(&body)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ApiError::Remote(RemoteError::Timeout(e.to_string()))
            } else {
                ApiError::Remote(RemoteError::Unreachable(e.to_string()))
            }
        })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| ApiError::Remote(RemoteError::Unreachable(e.to_string())))?;
    Ok((
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Terminals
// ---------------------------------------------------------------------------

async fn terminal_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.terminals.list() }))
}

#[derive(Deserialize)]
struct TerminalCloseRequest {
    id: String,
}

async fn terminal_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TerminalCloseRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.terminals.close(&req.id) {
        return Err(ApiError::NotFound(format!("no such session: {}", req.id)));
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct TerminalQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

async fn ws_terminal(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TerminalQuery>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let project = state.require_project().await?;
    let terminals = state.terminals.clone();
    let cwd = project.root.clone();
    Ok(upgrade.on_upgrade(move |socket| {
        terminal::run_local_session(socket, cwd, terminals, q.cols, q.rows)
    }))
}

#[derive(Deserialize)]
struct RemoteTerminalQuery {
    codespace_url: String,
    cols: Option<u16>,
    rows: Option<u16>,
}

async fn ws_remote_terminal(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RemoteTerminalQuery>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    if q.codespace_url.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "codespace_url is required".to_string(),
        ));
    }
    let terminals = state.terminals.clone();
    Ok(upgrade.on_upgrade(move |socket| {
        terminal::run_remote_proxy(socket, q.codespace_url, terminals, q.cols, q.rows)
    }))
}

// ---------------------------------------------------------------------------
// Watch channel
// ---------------------------------------------------------------------------

async fn ws_watch(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let bus = state.manager.bus().clone();
    upgrade.on_upgrade(move |socket| watch_session(socket, bus))
}

async fn watch_session(socket: WebSocket, bus: crate::watcher::EventBus) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = bus.subscribe();
    let mut keepalive = tokio::time::interval(WATCH_KEEPALIVE);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(change) => {
                        let frame = match serde_json::to_string(&change) {
                            Ok(f) => f,
                            Err(_) => continue,
                        };
                        if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Buffer overflow drops the oldest events; keep reading.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        crate::logging::warn(format!("watch subscriber lagged, dropped {n} events"));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = keepalive.tick() => {
                if ws_tx.send(WsMessage::Text(String::new())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
