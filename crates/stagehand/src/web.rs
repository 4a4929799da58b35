//! HTTP surface: thin routing glue over the store, the orchestrators and
//! the session. Error kinds map to status codes here; filesystem paths and
//! internal detail never reach a response body.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use stageconf::StageConfig;
use x32osc::{SessionConfig, SessionError, X32Session};

use crate::bus::EventBus;
use crate::discover::{self, DiscoverError};
use crate::export::{self, ExportError, ExportMeta};
use crate::import::{self, ImportError, ImportOptions};
use crate::store::{self, SceneStore, StoreError, BACKUP_EXT, SCENE_EXT};
use crate::SharedSession;

#[derive(Clone)]
pub struct AppState {
    pub session: SharedSession,
    pub store: Arc<SceneStore>,
    pub bus: EventBus,
    pub backup_dir: PathBuf,
    pub config: StageConfig,
}

impl AppState {
    async fn session(&self) -> Arc<X32Session> {
        self.session.read().await.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/scenes", get(list_scenes).post(create_scene))
        .route("/scenes/{id}", get(get_scene).delete(delete_scene))
        .route("/scenes/{id}/load", post(load_scene))
        .route("/scenes/{id}/backup", post(backup_scene))
        .route("/backup", get(list_backups))
        .route("/backup/full", post(full_backup))
        .route("/backup/{filename}/load", post(load_backup))
        .route("/backup/{filename}", delete(delete_backup))
        .route("/x32/discover", get(discover_consoles))
        .route("/x32/connect", post(connect_console))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error envelope: `{"success": false, "error": "..."}` with a mapped
/// status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, what)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidFilename | StoreError::PathEscape => {
                Self::new(StatusCode::BAD_REQUEST, "Invalid filename")
            }
            StoreError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            StoreError::Unsupported(message) => Self::new(StatusCode::BAD_REQUEST, message),
            StoreError::Io(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage error"),
            StoreError::Session(e) => e.into(),
            StoreError::Export(e) => e.into(),
            StoreError::Import(e) => e.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Address(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            SessionError::Bind(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "could not bind socket")
            }
            SessionError::Timeout(_) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "console not responding")
            }
            SessionError::Busy(_) => Self::new(StatusCode::CONFLICT, err.to_string()),
            SessionError::Transport(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "console unreachable")
            }
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::Canceled { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            ExportError::SessionLost { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            ExportError::Session(e) => e.into(),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Parse(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            ImportError::Canceled { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
        }
    }
}

impl From<DiscoverError> for ApiError {
    fn from(err: DiscoverError) -> Self {
        match err {
            DiscoverError::InvalidSubnet(_) => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            DiscoverError::Io(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "discovery failed")
            }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(_: std::io::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
    }
}

async fn index() -> Html<&'static str> {
    Html("<!doctype html><title>stagehand</title><p>stagehand is running; the UI talks to /scenes, /backup and /ws.</p>")
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let session = state.session().await;
    let mode = if state.config.mock_mode { "mock" } else { "live" };
    Json(json!({
        "success": true,
        "state": session.connection_state().as_str(),
        "mode": mode,
        "identity": session.identity().await,
    }))
}

async fn list_scenes(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let scenes = state.store.list().await?;
    Ok(Json(json!({ "success": true, "scenes": scenes })))
}

async fn get_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let scene = state.store.get(&id).await?;
    Ok(Json(json!({ "success": true, "scene": scene })))
}

#[derive(Debug, Deserialize)]
struct SaveSceneBody {
    name: String,
    #[serde(default)]
    notes: String,
}

async fn create_scene(
    State(state): State<AppState>,
    Json(body): Json<SaveSceneBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let scene = state.store.save(&body.name, &body.notes).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "scene": scene })),
    ))
}

async fn delete_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete(&id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn load_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state.store.load(&id).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

async fn backup_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let scene = state.store.backup(&id).await?;
    Ok(Json(json!({ "success": true, "scene": scene })))
}

async fn list_backups(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut files = Vec::new();
    let mut dir = tokio::fs::read_dir(&state.backup_dir).await?;
    while let Some(dirent) = dir.next_entry().await? {
        let path = dirent.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if ext != Some(BACKUP_EXT) && ext != Some(SCENE_EXT) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let metadata = dirent.metadata().await?;
        let modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .map(|t| t.to_rfc3339());
        files.push(json!({
            "name": name,
            "size": metadata.len(),
            "modified": modified,
        }));
    }
    files.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(Json(json!({ "success": true, "files": files })))
}

#[derive(Debug, Default, Deserialize)]
struct FullBackupBody {
    filename: Option<String>,
    name: Option<String>,
    #[serde(default)]
    notes: String,
}

async fn full_backup(
    State(state): State<AppState>,
    raw_body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    // The body is optional; an empty POST takes every default.
    let body: FullBackupBody = if raw_body.is_empty() {
        FullBackupBody::default()
    } else {
        serde_json::from_slice(&raw_body)
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid JSON body"))?
    };
    let session = state.session().await;

    let name = body.name.unwrap_or_else(|| "Full Backup".to_string());
    let outcome = export::export_console_backup(
        &session,
        &state.bus,
        ExportMeta::new(&name, &body.notes),
        export::export_policy(),
        &CancellationToken::new(),
    )
    .await?;

    let filename = body
        .filename
        .unwrap_or_else(|| format!("console-{}", Utc::now().format("%Y%m%d-%H%M%S")));
    let filename = store::ensure_ext(store::sanitize_filename(&filename)?, BACKUP_EXT);
    let path = store::resolve_under(&state.backup_dir, &filename)?;
    tokio::fs::write(&path, outcome.text).await?;
    info!("wrote full backup {}", filename);

    Ok(Json(json!({
        "success": true,
        "filename": filename,
        "summary": outcome.summary,
    })))
}

async fn load_backup(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = store::resolve_under(&state.backup_dir, &filename)?;
    if !path.exists() {
        return Err(ApiError::not_found(format!("no backup named {}", filename)));
    }
    let text = tokio::fs::read_to_string(&path).await?;

    let session = state.session().await;
    let report = import::import_scene(
        &session,
        &state.bus,
        &text,
        &ImportOptions::default(),
        &CancellationToken::new(),
    )
    .await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

async fn delete_backup(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = store::resolve_under(&state.backup_dir, &filename)?;
    if !path.exists() {
        return Err(ApiError::not_found(format!("no backup named {}", filename)));
    }
    tokio::fs::remove_file(&path).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    subnet: String,
}

async fn discover_consoles(
    State(state): State<AppState>,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Value>, ApiError> {
    let consoles = discover::probe_subnet(
        &query.subnet,
        state.config.console_port,
        Duration::from_secs(1),
    )
    .await?;
    Ok(Json(json!({ "success": true, "consoles": consoles })))
}

#[derive(Debug, Deserialize)]
struct ConnectBody {
    ip: String,
    port: Option<u16>,
}

async fn connect_console(
    State(state): State<AppState>,
    Json(body): Json<ConnectBody>,
) -> Result<Json<Value>, ApiError> {
    let mut config = SessionConfig::new("x32", &body.ip)
        .with_port(body.port.unwrap_or(state.config.console_port))
        .with_idle_window(Duration::from_secs(state.config.idle_window_secs))
        .with_mock(state.config.mock_mode);
    config.max_probe_failures = state.config.max_probe_failures;

    let new_session = X32Session::connect(config, state.bus.sender()).await?;
    info!("switched console target to {}", body.ip);

    let old = {
        let mut guard = state.session.write().await;
        std::mem::replace(&mut *guard, new_session.clone())
    };
    old.close().await;

    Ok(Json(json!({
        "success": true,
        "state": new_session.connection_state().as_str(),
    })))
}
