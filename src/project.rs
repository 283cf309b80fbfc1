use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::policy::{self, PathPolicy};
use crate::watcher::{self, ChangeEvent, EventBus, ProjectWatcher};

/// Rebuild metadata this long after the last `data_change`.
const METADATA_DEBOUNCE: Duration = Duration::from_millis(2000);

const DEFAULT_CLAUDE_MD: &str = "\
# Project conventions

This folder is bridged to a local analysis project.

- `scripts/` holds the analysis scripts. Edit these freely.
- `meta_data/` holds generated summaries of the user's local data. Read them
  to learn what the data looks like; never write here yourself.
- The raw data stays on the user's machine. Work from the metadata summaries
  and the script outputs only.
";

const DEFAULT_METADATAFARMER: &str = "\
#!/usr/bin/env python3
\"\"\"Refresh the metadata summaries in meta_data/ from the bridge.\"\"\"

import json
import urllib.request

BRIDGE = \"http://127.0.0.1:8765\"

if __name__ == \"__main__\":
    req = urllib.request.Request(f\"{BRIDGE}/api/metadata/generate\", method=\"POST\")
    with urllib.request.urlopen(req) as resp:
        print(json.loads(resp.read()))
";

/// The selected project. Replaced wholesale on re-selection; the epoch lets
/// long-running work detect that it is stale.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub name: String,
    pub epoch: u64,
}

impl Project {
    pub fn app_dir(&self) -> PathBuf {
        self.root.join("app")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("app").join("scripts")
    }

    pub fn meta_data_dir(&self) -> PathBuf {
        self.root.join("app").join("meta_data")
    }
}

/// Process-wide project coordinator: active handle, watcher lifetime, and
/// the metadata rebuild loop all hang off this.
pub struct ProjectManager {
    active: RwLock<Option<Arc<Project>>>,
    // Serializes concurrent selects; the last one wins.
    select_gate: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    watcher: std::sync::Mutex<Option<ProjectWatcher>>,
    bus: EventBus,
    policy: Arc<PathPolicy>,
}

impl ProjectManager {
    pub fn new(policy: Arc<PathPolicy>, bus: EventBus) -> Self {
        Self {
            active: RwLock::new(None),
            select_gate: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            watcher: std::sync::Mutex::new(None),
            bus,
            policy,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn policy(&self) -> Arc<PathPolicy> {
        self.policy.clone()
    }

    pub async fn active(&self) -> Option<Arc<Project>> {
        self.active.read().await.clone()
    }

    /// True when `project` is still the selected one.
    pub fn is_current(&self, project: &Project) -> bool {
        self.epoch.load(Ordering::SeqCst) == project.epoch
    }

    /// Select `path` as the active project: validate, scaffold the
    /// conventional layout, swap the watcher. Idempotent for existing files.
    pub async fn select(&self, path: &Path) -> Result<Arc<Project>> {
        let _gate = self.select_gate.lock().await;

        if !path.is_absolute() {
            bail!("project path must be absolute: {}", path.display());
        }
        if !path.is_dir() {
            bail!("project path does not exist or is not a directory: {}", path.display());
        }

        scaffold(path)?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let project = Arc::new(Project {
            root: path.to_path_buf(),
            name,
            epoch,
        });

        {
            let mut active = self.active.write().await;
            *active = Some(project.clone());
        }

        // Subscribers stay attached to the bus; only the watcher is swapped.
        let new_watcher = watcher::start(
            project.root.clone(),
            self.policy.clone(),
            self.bus.clone(),
        );
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(new_watcher);
        }

        crate::logging::info_kv(
            "project selected",
            &[
                ("path", &project.root.display().to_string()),
                ("name", &project.name),
            ],
        );
        Ok(project)
    }
}

/// Create the conventional subtrees and helper files if missing. Existing
/// files are left untouched.
pub fn scaffold(root: &Path) -> Result<()> {
    for sub in ["input", "output", "app", "app/scripts", "app/meta_data"] {
        let dir = root.join(sub);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let claude = root.join("app").join("CLAUDE.md");
    if !claude.exists() {
        fs::write(&claude, DEFAULT_CLAUDE_MD)
            .with_context(|| format!("write {}", claude.display()))?;
    }
    let farmer = root.join("app").join("metadatafarmer.py");
    if !farmer.exists() {
        fs::write(&farmer, DEFAULT_METADATAFARMER)
            .with_context(|| format!("write {}", farmer.display()))?;
    }
    Ok(())
}

/// Walk `input/` and `output/` and write textual per-file summaries into
/// `app/meta_data/`. Returns the two summary texts.
pub fn build_metadata(root: &Path, policy: &PathPolicy) -> Result<(String, String)> {
    let input_text = summarize_subtree(root, "input", policy)?;
    let output_text = summarize_subtree(root, "output", policy)?;

    let meta_dir = root.join("app").join("meta_data");
    fs::create_dir_all(&meta_dir).with_context(|| format!("create {}", meta_dir.display()))?;
    fs::write(meta_dir.join("input_metadata.txt"), &input_text)
        .context("write input metadata")?;
    fs::write(meta_dir.join("output_metadata.txt"), &output_text)
        .context("write output metadata")?;
    Ok((input_text, output_text))
}

fn summarize_subtree(root: &Path, subtree: &str, policy: &PathPolicy) -> Result<String> {
    let base = root.join(subtree);
    let mut lines = vec![format!("# {subtree} files")];
    if !base.is_dir() {
        lines.push("(none)".to_string());
        return Ok(lines.join("\n") + "\n");
    }

    let mut entries: Vec<(String, PathBuf, u64)> = Vec::new();
    for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if policy.is_ignored_rel(rel, false) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push((policy::rel_string(rel), entry.path().to_path_buf(), size));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    if entries.is_empty() {
        lines.push("(none)".to_string());
    }
    for (rel, abs, size) in entries {
        lines.push(summarize_file(&rel, &abs, size));
    }
    Ok(lines.join("\n") + "\n")
}

fn summarize_file(rel: &str, abs: &Path, size: u64) -> String {
    let ext = policy::extension_of(abs).unwrap_or_default();
    if ext == "csv" {
        if let Ok((rows, cols)) = crate::tabular::summarize(abs) {
            let columns = cols
                .iter()
                .map(|c| format!("{} ({})", c.name, c.dtype.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            return format!("- {rel} ({}): {rows} rows; columns: {columns}", human_size(size));
        }
    }
    format!("- {rel} ({})", human_size(size))
}

fn human_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Background loop: rebuild metadata ~2 s after the last data change. Runs
/// for the life of the daemon; project swaps are picked up per rebuild.
pub fn spawn_metadata_task(manager: Arc<ProjectManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = manager.bus().subscribe();
        let mut deadline: Option<tokio::time::Instant> = None;
        loop {
            let sleep = match deadline {
                Some(at) => tokio::time::sleep_until(at),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Ok(ChangeEvent::DataChange { action: None, .. }) => {
                            deadline = Some(tokio::time::Instant::now() + METADATA_DEBOUNCE);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            deadline = Some(tokio::time::Instant::now() + METADATA_DEBOUNCE);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = sleep, if deadline.is_some() => {
                    deadline = None;
                    if let Some(project) = manager.active().await {
                        let policy = manager.policy();
                        let root = project.root.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            build_metadata(&root, &policy)
                        })
                        .await;
                        match result {
                            Ok(Ok(_)) => crate::logging::info("metadata rebuilt after data change"),
                            Ok(Err(err)) => {
                                crate::logging::error(format!("metadata rebuild failed: {err:#}"))
                            }
                            Err(err) => {
                                crate::logging::error(format!("metadata task panicked: {err}"))
                            }
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

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

    fn manager() -> ProjectManager {
        ProjectManager::new(Arc::new(PathPolicy::new().unwrap()), EventBus::new())
    }

    #[tokio::test]
    async fn select_scaffolds_and_is_idempotent() {
        let root = make_temp_dir("vibefoundry-project-select");
        let mgr = manager();

        let project = mgr.select(&root).await.unwrap();
        assert_eq!(project.root, root);
        assert!(root.join("input").is_dir());
        assert!(root.join("output").is_dir());
        assert!(root.join("app/scripts").is_dir());
        assert!(root.join("app/meta_data").is_dir());
        assert!(root.join("app/CLAUDE.md").is_file());
        assert!(root.join("app/metadatafarmer.py").is_file());

        // Re-selecting must not clobber user edits.
        fs::write(root.join("app/CLAUDE.md"), "edited").unwrap();
        mgr.select(&root).await.unwrap();
        assert_eq!(fs::read_to_string(root.join("app/CLAUDE.md")).unwrap(), "edited");

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn reselect_bumps_epoch_and_stales_old_handle() {
        let root1 = make_temp_dir("vibefoundry-project-epoch-a");
        let root2 = make_temp_dir("vibefoundry-project-epoch-b");
        let mgr = manager();

        let first = mgr.select(&root1).await.unwrap();
        assert!(mgr.is_current(&first));

        let second = mgr.select(&root2).await.unwrap();
        assert!(!mgr.is_current(&first));
        assert!(mgr.is_current(&second));
        assert_eq!(mgr.active().await.unwrap().root, root2);

        let _ = fs::remove_dir_all(&root1);
        let _ = fs::remove_dir_all(&root2);
    }

    #[tokio::test]
    async fn select_rejects_missing_directory() {
        let mgr = manager();
        let err = mgr
            .select(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn metadata_summarizes_csv_and_plain_files() {
        let root = make_temp_dir("vibefoundry-project-meta");
        scaffold(&root).unwrap();
        fs::write(
            root.join("input/sales.csv"),
            "region,units\nwest,3\neast,7\n",
        )
        .unwrap();
        fs::write(root.join("output/report.txt"), "done").unwrap();

        let policy = PathPolicy::new().unwrap();
        let (input_text, output_text) = build_metadata(&root, &policy).unwrap();

        assert!(input_text.contains("input/sales.csv"));
        assert!(input_text.contains("2 rows"));
        assert!(input_text.contains("region (str)"));
        assert!(input_text.contains("units (int)"));
        assert!(output_text.contains("output/report.txt"));

        assert_eq!(
            fs::read_to_string(root.join("app/meta_data/input_metadata.txt")).unwrap(),
            input_text
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_subtrees_report_none() {
        let root = make_temp_dir("vibefoundry-project-meta-empty");
        scaffold(&root).unwrap();
        let policy = PathPolicy::new().unwrap();
        let (input_text, _) = build_metadata(&root, &policy).unwrap();
        assert!(input_text.contains("(none)"));
        let _ = fs::remove_dir_all(&root);
    }
}
