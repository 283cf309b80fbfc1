use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use walkdir::WalkDir;

use crate::policy::{self, PathPolicy};
use crate::project::{Project, ProjectManager};
use crate::remote::{RemoteError, SandboxClient};

/// Remote activity signal cadence (the sandbox idles out without it).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const TIME_KEEPER_PATH: &str = "scripts/time_keeper.txt";

/// Last-seen remote modtime per app-relative path. Pull is the only writer;
/// entries only ever move forward.
pub type SyncVector = HashMap<String, i64>;

#[derive(Debug, Default)]
pub struct PullReport {
    pub synced_paths: Vec<String>,
    pub vector: SyncVector,
    pub error: Option<RemoteError>,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub pushed_paths: Vec<String>,
    pub error: Option<RemoteError>,
}

#[derive(Debug)]
pub struct MetadataReport {
    pub pushed: bool,
    pub error: Option<RemoteError>,
}

/// Pull `remote → local app subtree`. Compares floored remote modtimes
/// against `vector`, writes new/updated files under `app/`, and advances the
/// vector per file only after its write lands. A mid-flight error aborts and
/// leaves the partial vector in the report.
pub async fn pull(
    client: &SandboxClient,
    manager: &ProjectManager,
    project: &Project,
    mut vector: SyncVector,
) -> PullReport {
    let policy = manager.policy();
    let listing = match client.list_scripts().await {
        Ok(scripts) => scripts,
        Err(err) => {
            return PullReport {
                synced_paths: Vec::new(),
                vector,
                error: Some(err),
            }
        }
    };

    let mut synced = Vec::new();
    for entry in listing {
        let remote_mtime = entry.modified_unix();
        let known = vector.get(&entry.path).copied();
        if known.is_some_and(|seen| remote_mtime <= seen) {
            continue;
        }

        let file = match client.get_script(&entry.path).await {
            Ok(f) => f,
            Err(err) => {
                return PullReport {
                    synced_paths: synced,
                    vector,
                    error: Some(err),
                }
            }
        };

        let remote_rel = policy::rel_path(&entry.path);
        if remote_rel.is_absolute()
            || remote_rel
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            crate::logging::warn_kv(
                "pull skipped unsafe remote path",
                &[("path", entry.path.as_str())],
            );
            continue;
        }
        let rel = Path::new("app").join(remote_rel);
        let bytes = match decode_content(&file.content, file.encoding.as_deref()) {
            Ok(b) => b,
            Err(err) => {
                crate::logging::error(format!("pull decode failed path={}: {err}", entry.path));
                continue;
            }
        };

        // The remote must never taint the local app subtree.
        if policy.is_forbidden_in_app(&rel, Some(bytes.len() as u64)) {
            crate::logging::warn_kv(
                "pull skipped forbidden path",
                &[("path", entry.path.as_str())],
            );
            continue;
        }

        // A concurrent re-selection makes this pull a no-op from here on.
        if !manager.is_current(project) {
            crate::logging::warn("pull aborted: project changed mid-flight");
            break;
        }

        if let Err(err) = write_file(&project.root.join(&rel), &bytes) {
            crate::logging::error(format!("pull write failed path={}: {err:#}", entry.path));
            continue;
        }

        let slot = vector.entry(entry.path.clone()).or_insert(i64::MIN);
        *slot = (*slot).max(remote_mtime);
        synced.push(entry.path);
    }

    PullReport {
        synced_paths: synced,
        vector,
        error: None,
    }
}

/// Push `local app subtree → remote`, unconditionally (no vector). Protected
/// paths are dropped silently; forbidden-for-sync paths are logged and
/// dropped.
pub async fn push(client: &SandboxClient, project: &Project, policy: &PathPolicy) -> PushReport {
    let app_dir = project.app_dir();
    let mut pushed = Vec::new();

    let mut candidates: Vec<(String, std::path::PathBuf)> = Vec::new();
    for entry in WalkDir::new(&app_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel_in_app) = entry.path().strip_prefix(&app_dir) else {
            continue;
        };
        let rel_in_project = Path::new("app").join(rel_in_app);
        if policy.is_ignored_rel(&rel_in_project, false) {
            continue;
        }
        if policy.is_protected_from_push(&rel_in_project) {
            continue;
        }
        if policy.is_forbidden_for_sync(&rel_in_project) {
            crate::logging::warn_kv(
                "push dropped forbidden file",
                &[("path", &policy::rel_string(rel_in_app))],
            );
            continue;
        }
        candidates.push((policy::rel_string(rel_in_app), entry.path().to_path_buf()));
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel, abs) in candidates {
        let content = match fs::read(&abs) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                crate::logging::error(format!("push read failed path={rel}: {err}"));
                continue;
            }
        };
        if let Err(err) = client.put_file(&rel, &content).await {
            return PushReport {
                pushed_paths: pushed,
                error: Some(err),
            };
        }
        pushed.push(rel);
    }

    PushReport {
        pushed_paths: pushed,
        error: None,
    }
}

/// Upload the metadata summaries. They travel through the dedicated metadata
/// endpoint, not as files.
pub async fn push_metadata(client: &SandboxClient, project: &Project) -> MetadataReport {
    let meta_dir = project.meta_data_dir();
    let input_text = fs::read_to_string(meta_dir.join("input_metadata.txt")).unwrap_or_default();
    let output_text = fs::read_to_string(meta_dir.join("output_metadata.txt")).unwrap_or_default();
    match client.put_metadata(&input_text, &output_text).await {
        Ok(()) => MetadataReport {
            pushed: true,
            error: None,
        },
        Err(err) => MetadataReport {
            pushed: false,
            error: Some(err),
        },
    }
}

/// Full sync = metadata push then pull; the end state equals running the two
/// sequentially.
pub async fn full_sync(
    client: &SandboxClient,
    manager: &ProjectManager,
    project: &Project,
    vector: SyncVector,
) -> (MetadataReport, PullReport) {
    let metadata = push_metadata(client, project).await;
    let pull_report = pull(client, manager, project, vector).await;
    (metadata, pull_report)
}

/// Shared slot for the most recent sandbox the bridge talked to; the
/// keepalive tick follows it.
#[derive(Default)]
pub struct RemoteHandle {
    client: std::sync::Mutex<Option<SandboxClient>>,
}

impl RemoteHandle {
    pub fn set(&self, client: SandboxClient) {
        if let Ok(mut slot) = self.client.lock() {
            *slot = Some(client);
        }
    }

    pub fn get(&self) -> Option<SandboxClient> {
        self.client.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Periodic read-modify-write of `scripts/time_keeper.txt` on the remote —
/// pure activity signaling for its idle-shutdown heuristic. Failures are
/// logged and ignored.
pub fn spawn_keepalive_task(handle: Arc<RemoteHandle>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(client) = handle.get() else {
                continue;
            };
            if let Err(err) = keepalive_tick(&client).await {
                crate::logging::warn(format!("keepalive tick failed: {err}"));
            }
        }
    })
}

async fn keepalive_tick(client: &SandboxClient) -> Result<(), RemoteError> {
    let existing = match client.get_script(TIME_KEEPER_PATH).await {
        Ok(file) => file.content,
        Err(RemoteError::NotFound(_)) => String::new(),
        Err(err) => return Err(err),
    };
    let mut next = existing;
    if !next.is_empty() && !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(&format!("{} keepalive\n", chrono::Utc::now().to_rfc3339()));
    client.put_file(TIME_KEEPER_PATH, &next).await
}

fn decode_content(content: &str, encoding: Option<&str>) -> anyhow::Result<Vec<u8>> {
    match encoding {
        Some("base64") => Ok(base64::engine::general_purpose::STANDARD.decode(content)?),
        _ => Ok(content.as_bytes().to_vec()),
    }
}

fn write_file(abs: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(abs, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::EventBus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Mutex;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> std::path::PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn manager() -> Arc<ProjectManager> {
        Arc::new(ProjectManager::new(
            Arc::new(PathPolicy::new().unwrap()),
            EventBus::new(),
        ))
    }

    async fn fake_remote(uploads: Arc<Mutex<Vec<String>>>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/scripts",
                get(|| async {
                    Json(serde_json::json!({
                        "scripts": [
                            {"path": "a/b.py", "modified": 1700000000.4},
                            {"path": "notes.csv", "modified": 1700000001.0}
                        ]
                    }))
                }),
            )
            .route(
                "/scripts/:path",
                get(|axum::extract::Path(p): axum::extract::Path<String>| async move {
                    Json(serde_json::json!({"content": format!("# remote {p}\n")}))
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

    #[tokio::test]
    async fn pull_writes_new_files_and_advances_vector() {
        let root = make_temp_dir("vibefoundry-sync-pull");
        let mgr = manager();
        let project = mgr.select(&root).await.unwrap();

        let base = fake_remote(Arc::new(Mutex::new(Vec::new()))).await;
        let client = SandboxClient::new(&base, mgr.policy()).unwrap();

        let report = pull(&client, &mgr, &project, SyncVector::new()).await;
        assert!(report.error.is_none());
        // notes.csv is forbidden under app/ and must be skipped silently.
        assert_eq!(report.synced_paths, ["a/b.py"]);
        assert_eq!(report.vector.get("a/b.py"), Some(&1700000000));
        assert!(report.vector.get("notes.csv").is_none());
        assert_eq!(
            fs::read_to_string(root.join("app/a/b.py")).unwrap(),
            "# remote a/b.py\n"
        );
        assert!(!root.join("app/notes.csv").exists());

        // Second identical pull is a no-op.
        let again = pull(&client, &mgr, &project, report.vector.clone()).await;
        assert!(again.synced_paths.is_empty());
        assert_eq!(again.vector, report.vector);

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn pull_against_stale_project_writes_nothing() {
        let root1 = make_temp_dir("vibefoundry-sync-stale-a");
        let root2 = make_temp_dir("vibefoundry-sync-stale-b");
        let mgr = manager();
        let first = mgr.select(&root1).await.unwrap();
        // Re-selection happens before the pull starts writing.
        mgr.select(&root2).await.unwrap();

        let base = fake_remote(Arc::new(Mutex::new(Vec::new()))).await;
        let client = SandboxClient::new(&base, mgr.policy()).unwrap();

        let report = pull(&client, &mgr, &first, SyncVector::new()).await;
        assert!(report.error.is_none());
        assert!(report.synced_paths.is_empty());
        assert!(!root1.join("app/a/b.py").exists());
        assert!(!root2.join("app/a/b.py").exists());

        let _ = fs::remove_dir_all(&root1);
        let _ = fs::remove_dir_all(&root2);
    }

    #[tokio::test]
    async fn push_excludes_protected_and_forbidden_files() {
        let root = make_temp_dir("vibefoundry-sync-push");
        let mgr = manager();
        let project = mgr.select(&root).await.unwrap();

        fs::write(root.join("app/scripts/x.py"), "print()\n").unwrap();
        fs::write(root.join("app/sync_server.py"), "owned by remote").unwrap();
        fs::write(root.join("app/scripts/deck.pptx"), "binary").unwrap();
        fs::write(
            root.join("app/meta_data/input_metadata.txt"),
            "# input files\n",
        )
        .unwrap();

        let uploads = Arc::new(Mutex::new(Vec::new()));
        let base = fake_remote(uploads.clone()).await;
        let client = SandboxClient::new(&base, mgr.policy()).unwrap();

        let report = push(&client, &project, &mgr.policy()).await;
        assert!(report.error.is_none());
        assert_eq!(report.pushed_paths, ["scripts/x.py"]);
        assert_eq!(uploads.lock().unwrap().as_slice(), ["scripts/x.py"]);

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn push_surfaces_partial_result_on_remote_failure() {
        let root = make_temp_dir("vibefoundry-sync-push-fail");
        let mgr = manager();
        let project = mgr.select(&root).await.unwrap();
        fs::write(root.join("app/scripts/x.py"), "print()\n").unwrap();

        // Nothing is listening here; the first upload fails after retries.
        let client = SandboxClient::new("http://127.0.0.1:9", mgr.policy()).unwrap();
        let report = push(&client, &project, &mgr.policy()).await;
        assert!(report.pushed_paths.is_empty());
        assert!(matches!(report.error, Some(RemoteError::Unreachable(_))));

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn full_sync_pushes_metadata_then_pulls() {
        let root = make_temp_dir("vibefoundry-sync-full");
        let mgr = manager();
        let project = mgr.select(&root).await.unwrap();
        fs::write(
            root.join("app/meta_data/input_metadata.txt"),
            "# input files\n(none)\n",
        )
        .unwrap();

        let base = fake_remote(Arc::new(Mutex::new(Vec::new()))).await;
        let client = SandboxClient::new(&base, mgr.policy()).unwrap();

        let (metadata, pull_report) =
            full_sync(&client, &mgr, &project, SyncVector::new()).await;
        assert!(metadata.pushed);
        assert!(metadata.error.is_none());
        assert_eq!(pull_report.synced_paths, ["a/b.py"]);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn decode_content_handles_base64() {
        assert_eq!(decode_content("aGk=", Some("base64")).unwrap(), b"hi");
        assert_eq!(decode_content("hi", None).unwrap(), b"hi");
    }
}
