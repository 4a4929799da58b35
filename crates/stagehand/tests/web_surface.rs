//! HTTP surface tests driven in-process through the router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use stagehand::bus::EventBus;
use stagehand::store::SceneStore;
use stagehand::web::{router, AppState};
use x32osc::mock::{self, MockConsole, MockHandle};
use x32osc::{SessionConfig, X32Session};

async fn app(console: MockConsole) -> (MockHandle, TempDir, TempDir, axum::Router) {
    let mock = mock::spawn(console).await.unwrap();
    let bus = EventBus::new();
    let config = SessionConfig::new("web-test", "127.0.0.1").with_port(mock.addr.port());
    let session = X32Session::connect(config, bus.sender()).await.unwrap();
    session
        .identity_query(Duration::from_secs(1))
        .await
        .unwrap();
    let session = stagehand::shared_session(session);

    let scene_dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let store = SceneStore::open(scene_dir.path(), session.clone(), bus.clone()).unwrap();

    let mut stage_config = stageconf::StageConfig::default();
    stage_config.scene_dir = scene_dir.path().to_path_buf();
    stage_config.backup_dir = backup_dir.path().to_path_buf();

    let state = AppState {
        session,
        store: Arc::new(store),
        bus,
        backup_dir: backup_dir.path().canonicalize().unwrap(),
        config: stage_config,
    };
    (mock, scene_dir, backup_dir, router(state))
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_state_and_identity() {
    let console = MockConsole::new().with_identity("10.0.0.2", "FOH-Main", "X32", "4.08");
    let (_mock, _scenes, _backups, app) = app(console).await;

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], "connected");
    assert_eq!(body["mode"], "live");
    assert_eq!(body["identity"]["name"], "FOH-Main");
}

#[tokio::test]
async fn scene_lifecycle_over_http() {
    let (_mock, _scenes, _backups, app) = app(MockConsole::new()).await;

    let response = app
        .clone()
        .oneshot(
            Request::post("/scenes")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"name":"Matinee","notes":"2pm show"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["scene"]["id"], "local-Matinee");

    let response = app
        .clone()
        .oneshot(Request::get("/scenes").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["scenes"].as_array().unwrap().len(), 1);
    assert_eq!(body["scenes"][0]["name"], "Matinee");

    let response = app
        .clone()
        .oneshot(
            Request::delete("/scenes/local-Matinee")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/scenes/local-Matinee")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_filename_is_a_400_with_the_exact_envelope() {
    let (_mock, _scenes, _backups, app) = app(MockConsole::new()).await;

    let response = app
        .clone()
        .oneshot(
            Request::post("/scenes")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"name":"../etc/passwd"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Invalid filename");

    // Traversal through the backup routes is rejected the same way.
    let response = app
        .oneshot(
            Request::delete("/backup/a..b.bak")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_device_slots_is_rejected() {
    let mut console = MockConsole::new();
    console.seed_scene_slot(4, "Keeper", "");
    let (_mock, _scenes, _backups, app) = app(console).await;

    let response = app
        .oneshot(
            Request::delete("/scenes/device-4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn missing_backup_is_a_404() {
    let (_mock, _scenes, _backups, app) = app(MockConsole::new()).await;

    let response = app
        .oneshot(
            Request::delete("/backup/nothing-here.bak")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn discover_requires_a_subnet() {
    let (_mock, _scenes, _backups, app) = app(MockConsole::new()).await;

    let response = app
        .clone()
        .oneshot(Request::get("/x32/discover").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::get("/x32/discover?subnet=not-a-subnet")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn backup_listing_shows_written_files() {
    let (_mock, _scenes, backups, app) = app(MockConsole::new()).await;
    std::fs::write(backups.path().join("console-20250101.bak"), "#4.08# \"B\" \"\" 0 0\n")
        .unwrap();
    std::fs::write(backups.path().join("notes.txt"), "ignored").unwrap();

    let response = app
        .oneshot(Request::get("/backup").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "console-20250101.bak");
}
