//! End-to-end tests over the HTTP surface: a real router on a random port,
//! a fake sandbox on another, and reqwest in between.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use axum::routing::{get, post};
use axum::{Json, Router};

use vibefoundry::policy::PathPolicy;
use vibefoundry::project::ProjectManager;
use vibefoundry::runner::ScriptRunner;
use vibefoundry::server::{self, AppState};
use vibefoundry::sync::RemoteHandle;
use vibefoundry::terminal::TerminalRegistry;
use vibefoundry::watcher::EventBus;

fn make_temp_dir(prefix: &str) -> PathBuf {
    let mut root = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    root.push(format!("{prefix}-{nanos}"));
    fs::create_dir_all(&root).unwrap();
    root
}

async fn start_bridge() -> (String, Arc<ProjectManager>) {
    let policy = Arc::new(PathPolicy::new().unwrap());
    let manager = Arc::new(ProjectManager::new(policy, EventBus::new()));
    let state = AppState::new(
        manager.clone(),
        ScriptRunner::new(),
        TerminalRegistry::new(),
        Arc::new(RemoteHandle::default()),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), manager)
}

/// Minimal stand-in for the sandbox REST surface: one script at a fixed
/// modtime, uploads recorded.
async fn start_fake_sandbox(uploads: Arc<Mutex<Vec<String>>>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
        .route(
            "/scripts",
            get(|| async {
                Json(serde_json::json!({
                    "scripts": [{"path": "a/b.py", "modified": 1700000000}]
                }))
            }),
        )
        .route(
            "/scripts/:path",
            get(|axum::extract::Path(p): axum::extract::Path<String>| async move {
                Json(serde_json::json!({"content": format!("# from sandbox: {p}\n")}))
            })
            .post({
                let uploads = uploads.clone();
                move |axum::extract::Path(p): axum::extract::Path<String>,
                      Json(_body): Json<serde_json::Value>| {
                    let uploads = uploads.clone();
                    async move {
                        uploads.lock().unwrap().push(p);
                        Json(serde_json::json!({"ok": true}))
                    }
                }
            }),
        )
        .route(
            "/metadata",
            post(|Json(_): Json<serde_json::Value>| async {
                Json(serde_json::json!({"ok": true}))
            }),
        );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn select_project(base: &str, root: &PathBuf) {
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/folder/select"))
        .json(&serde_json::json!({"path": root.display().to_string()}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "{}", resp.text().await.unwrap());
}

fn tree_contains(node: &serde_json::Value, path: &str) -> bool {
    if node["path"] == path {
        return true;
    }
    node["children"]
        .as_array()
        .into_iter()
        .flatten()
        .any(|child| tree_contains(child, path))
}

#[tokio::test]
async fn forbidden_file_is_deleted_on_tree_scan() {
    let root = make_temp_dir("vibefoundry-it-forbidden");
    let (base, _mgr) = start_bridge().await;
    select_project(&base, &root).await;
    fs::write(root.join("app/scripts/secret.csv"), "a,b\n1,2\n").unwrap();
    fs::write(root.join("app/scripts/keep.py"), "pass\n").unwrap();

    let body: serde_json::Value = reqwest::get(format!("{base}/api/files/tree"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(!tree_contains(&body["tree"], "app/scripts/secret.csv"));
    assert!(tree_contains(&body["tree"], "app/scripts/keep.py"));
    assert!(!root.join("app/scripts/secret.csv").exists());

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test]
async fn pull_fetches_new_file_and_is_idempotent() {
    let root = make_temp_dir("vibefoundry-it-pull");
    let (base, _mgr) = start_bridge().await;
    select_project(&base, &root).await;
    let sandbox = start_fake_sandbox(Arc::new(Mutex::new(Vec::new()))).await;

    let client = reqwest::Client::new();
    let first: serde_json::Value = client
        .post(format!("{base}/api/sync/pull"))
        .json(&serde_json::json!({"codespace_url": sandbox}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(first["synced_files"], serde_json::json!(["a/b.py"]));
    assert_eq!(first["last_sync"]["a/b.py"], 1700000000);
    assert_eq!(
        fs::read_to_string(root.join("app/a/b.py")).unwrap(),
        "# from sandbox: a/b.py\n"
    );

    let second: serde_json::Value = client
        .post(format!("{base}/api/sync/pull"))
        .json(&serde_json::json!({"codespace_url": sandbox}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["synced_files"], serde_json::json!([]));
    assert_eq!(second["last_sync"]["a/b.py"], 1700000000);

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test]
async fn push_sends_only_eligible_files() {
    let root = make_temp_dir("vibefoundry-it-push");
    let (base, _mgr) = start_bridge().await;
    select_project(&base, &root).await;
    fs::write(root.join("app/scripts/x.py"), "print('x')\n").unwrap();
    fs::write(root.join("app/sync_server.py"), "remote-owned\n").unwrap();
    fs::write(root.join("app/scripts/deck.pptx"), "slides").unwrap();

    let uploads = Arc::new(Mutex::new(Vec::new()));
    let sandbox = start_fake_sandbox(uploads.clone()).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/api/sync/push"))
        .json(&serde_json::json!({"codespace_url": sandbox}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["pushed_files"], serde_json::json!(["scripts/x.py"]));
    assert_eq!(uploads.lock().unwrap().as_slice(), ["scripts/x.py"]);

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test]
async fn error_envelope_carries_detail_and_status() {
    let (base, _mgr) = start_bridge().await;

    // No project selected yet: conflict.
    let resp = reqwest::get(format!("{base}/api/files/tree")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("no project"));
}

#[tokio::test]
async fn write_of_forbidden_file_is_rejected_with_403() {
    let root = make_temp_dir("vibefoundry-it-write");
    let (base, _mgr) = start_bridge().await;
    select_project(&base, &root).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/files/write"))
        .json(&serde_json::json!({"path": "app/scripts/data.csv", "content": "a,b\n"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(!root.join("app/scripts/data.csv").exists());

    // The same write outside app/ is allowed.
    let resp = client
        .post(format!("{base}/api/files/write"))
        .json(&serde_json::json!({"path": "input/data.csv", "content": "a,b\n"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(root.join("input/data.csv").exists());

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test]
async fn folder_select_rejects_missing_path_with_404() {
    let (base, _mgr) = start_bridge().await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/folder/select"))
        .json(&serde_json::json!({"path": "/definitely/not/here"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scripts_listing_reflects_scaffolded_project() {
    let root = make_temp_dir("vibefoundry-it-scripts");
    let (base, _mgr) = start_bridge().await;
    select_project(&base, &root).await;
    fs::write(root.join("app/scripts/analysis.py"), "pass\n").unwrap();

    let body: serde_json::Value = reqwest::get(format!("{base}/api/scripts"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let scripts = body["scripts"].as_array().unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0]["path"], "app/scripts/analysis.py");
    assert_eq!(scripts[0]["relative_path"], "analysis.py");

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test]
async fn dataframe_rows_pages_through_csv() {
    let root = make_temp_dir("vibefoundry-it-df");
    let (base, _mgr) = start_bridge().await;
    select_project(&base, &root).await;
    fs::write(
        root.join("input/sales.csv"),
        "region,units\nwest,3\neast,7\nnorth,2\n",
    )
    .unwrap();

    let body: serde_json::Value = reqwest::get(format!(
        "{base}/api/dataframe/rows?filePath=input/sales.csv&offset=1&limit=1"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(body["type"], "dataframe");
    assert_eq!(body["totalRows"], 3);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0][0], "east");
    assert_eq!(body["data"][0][1], 7);

    let _ = fs::remove_dir_all(&root);
}
