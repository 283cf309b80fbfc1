use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Mutex, Notify};
use walkdir::WalkDir;

use crate::policy;

/// Wall-clock ceiling for one script run.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(300);
/// pip gets the same ceiling; resolver stalls are its common failure mode.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-stream capture cap.
const OUTPUT_CAP: usize = 256 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Import-name → distribution-name aliases for the repair path.
const MODULE_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
];

static MISSING_MODULE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:ModuleNotFoundError|ImportError): No module named '?([A-Za-z0-9_\.]+)'?")
        .expect("missing-module regex")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunClassification {
    Ok,
    TimedOut,
    MissingModule { module: String },
    Failed { code: i32 },
}

/// Structured result of one script execution.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRunRecord {
    #[serde(rename = "scriptPath")]
    pub script_path: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "returnCode")]
    pub return_code: Option<i32>,
    #[serde(rename = "timedOut")]
    pub timed_out: bool,
    pub success: bool,
    pub classification: RunClassification,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptEntry {
    pub path: String,
    #[serde(rename = "relative_path")]
    pub relative_path: String,
}

#[derive(Debug, Serialize)]
pub struct InstallReport {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

struct Job {
    rel: String,
    abs: PathBuf,
    project_root: PathBuf,
    waiters: Vec<oneshot::Sender<ScriptRunRecord>>,
}

/// FIFO queue with a single worker: at most one script runs at any instant,
/// and duplicate submissions for a queued path attach to the pending job
/// instead of enqueueing again.
pub struct ScriptRunner {
    queue: Mutex<VecDeque<Job>>,
    wakeup: Notify,
}

impl ScriptRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        })
    }

    /// Start the worker loop. Call once at daemon startup.
    pub fn spawn_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                let job = loop {
                    let popped = runner.queue.lock().await.pop_front();
                    match popped {
                        Some(job) => break job,
                        None => runner.wakeup.notified().await,
                    }
                };
                let record = run_script(&job.rel, &job.abs, &job.project_root).await;
                for waiter in job.waiters {
                    let _ = waiter.send(record.clone());
                }
            }
        })
    }

    /// Enqueue `paths` (project-relative), deduplicating against pending
    /// entries, and return one receiver per distinct path.
    pub async fn submit(
        &self,
        project_root: &Path,
        paths: &[String],
    ) -> Vec<(String, oneshot::Receiver<ScriptRunRecord>)> {
        let mut receivers = Vec::new();
        let mut queue = self.queue.lock().await;
        for raw in paths {
            let rel = policy::rel_string(&policy::rel_path(raw));
            if receivers.iter().any(|(seen, _)| *seen == rel) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            match queue.iter().position(|j| j.rel == rel) {
                Some(idx) => queue[idx].waiters.push(tx),
                None => queue.push_back(Job {
                    abs: project_root.join(policy::rel_path(&rel)),
                    project_root: project_root.to_path_buf(),
                    rel: rel.clone(),
                    waiters: vec![tx],
                }),
            }
            receivers.push((rel, rx));
        }
        drop(queue);
        self.wakeup.notify_one();
        receivers
    }
}

/// Enumerate runnable scripts under `app/scripts/`, subdirectories included.
pub fn list_scripts(project_root: &Path) -> Vec<ScriptEntry> {
    let scripts_dir = project_root.join("app").join("scripts");
    let mut entries = Vec::new();
    for entry in WalkDir::new(&scripts_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if policy::extension_of(entry.path()).as_deref() != Some("py") {
            continue;
        }
        let Ok(rel_to_scripts) = entry.path().strip_prefix(&scripts_dir) else {
            continue;
        };
        let Ok(rel_to_root) = entry.path().strip_prefix(project_root) else {
            continue;
        };
        entries.push(ScriptEntry {
            path: policy::rel_string(rel_to_root),
            relative_path: policy::rel_string(rel_to_scripts),
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Run one script to completion: cwd at the script's parent, project root in
/// the environment, output capped, hard timeout enforced on the whole
/// process group.
async fn run_script(rel: &str, abs: &Path, project_root: &Path) -> ScriptRunRecord {
    let started_at = chrono::Utc::now().to_rfc3339();
    let cwd = abs.parent().unwrap_or(project_root).to_path_buf();

    let mut command = tokio::process::Command::new(python_binary());
    command
        .arg(abs)
        .current_dir(&cwd)
        .env("VIBEFOUNDRY_PROJECT_ROOT", project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return ScriptRunRecord {
                script_path: rel.to_string(),
                started_at,
                stdout: String::new(),
                stderr: format!("failed to start interpreter: {err}"),
                return_code: None,
                timed_out: false,
                success: false,
                classification: RunClassification::Failed { code: -1 },
            }
        }
    };

    let stdout_task = child.stdout.take().map(|r| tokio::spawn(read_capped(r)));
    let stderr_task = child.stderr.take().map(|r| tokio::spawn(read_capped(r)));
    let child_id = child.id();

    let (timed_out, status) = match tokio::time::timeout(RUN_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => (false, Some(status)),
        Ok(Err(err)) => {
            crate::logging::error(format!("script wait failed path={rel}: {err}"));
            (false, None)
        }
        Err(_) => {
            terminate_group(child_id, &mut child).await;
            (true, None)
        }
    };

    let stdout = join_capture(stdout_task).await;
    let stderr = join_capture(stderr_task).await;
    let return_code = status.and_then(|s| s.code());

    let classification = if timed_out {
        RunClassification::TimedOut
    } else {
        classify_run(return_code, &stderr)
    };
    let success = classification == RunClassification::Ok;

    ScriptRunRecord {
        script_path: rel.to_string(),
        started_at,
        stdout,
        stderr,
        return_code,
        timed_out,
        success,
        classification,
    }
}

/// `install(package)`: invoke pip with its own timeout and capture. The
/// caller decides whether to re-enqueue the originating script.
pub async fn install_package(package: &str) -> Result<InstallReport> {
    let mut command = tokio::process::Command::new(python_binary());
    command
        .args(["-m", "pip", "install", package])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().context("spawn pip")?;
    let stdout_task = child.stdout.take().map(|r| tokio::spawn(read_capped(r)));
    let stderr_task = child.stderr.take().map(|r| tokio::spawn(read_capped(r)));
    let child_id = child.id();

    let status = match tokio::time::timeout(INSTALL_TIMEOUT, child.wait()).await {
        Ok(result) => Some(result.context("wait for pip")?),
        Err(_) => {
            terminate_group(child_id, &mut child).await;
            None
        }
    };

    let mut stderr = join_capture(stderr_task).await;
    if status.is_none() {
        stderr.push_str("\npip install timed out");
    }
    Ok(InstallReport {
        success: status.is_some_and(|s| s.success()),
        stdout: join_capture(stdout_task).await,
        stderr,
    })
}

fn python_binary() -> String {
    std::env::var("VIBEFOUNDRY_PYTHON").unwrap_or_else(|_| "python3".to_string())
}

/// Classify a finished (non-timeout) run from its exit code and stderr.
fn classify_run(return_code: Option<i32>, stderr: &str) -> RunClassification {
    if return_code == Some(0) {
        return RunClassification::Ok;
    }
    if let Some(module) = extract_missing_module(stderr) {
        return RunClassification::MissingModule {
            module: resolve_package_name(&module),
        };
    }
    RunClassification::Failed {
        code: return_code.unwrap_or(-1),
    }
}

fn extract_missing_module(stderr: &str) -> Option<String> {
    MISSING_MODULE_RE
        .captures(stderr)
        .map(|caps| caps[1].to_string())
}

/// Map an import name to the pip distribution: submodules reduce to their
/// top-level package, then the alias table applies.
pub fn resolve_package_name(module: &str) -> String {
    let top = module.split('.').next().unwrap_or(module);
    for (import_name, dist_name) in MODULE_ALIASES {
        if top == *import_name {
            return dist_name.to_string();
        }
    }
    top.to_string()
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < OUTPUT_CAP {
                    let take = n.min(OUTPUT_CAP - kept.len());
                    kept.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    // Keep draining so the child never blocks on the pipe.
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

async fn join_capture(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(unix)]
async fn terminate_group(child_id: Option<u32>, child: &mut tokio::process::Child) {
    if let Some(pid) = child_id {
        // Negative pid: the whole process group the script spawned.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn terminate_group(_child_id: Option<u32>, child: &mut tokio::process::Child) {
    let _ = child.kill().await;
}
