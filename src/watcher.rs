use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::policy::{self, PathPolicy};

/// Per-subscriber buffer; lagging subscribers lose the oldest events rather
/// than back-pressuring the watcher.
const BUS_CAPACITY: usize = 64;

/// Events for the same path within this window collapse into one.
const COALESCE_WINDOW: Duration = Duration::from_millis(1000);

/// Watch re-attach backoff steps (capped at the last entry).
const REATTACH_BACKOFF_SECS: &[u64] = &[3, 6, 12];

/// Extensions that count as renderable outputs when they appear under
/// `output/`.
const OUTPUT_EXTS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "csv", "xlsx", "xls"];

/// Typed change notification, serialized verbatim onto `/ws/watch`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ChangeEvent {
    #[serde(rename = "script_change")]
    ScriptChange {
        path: String,
        #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
        last_modified: Option<i64>,
    },
    #[serde(rename = "data_change")]
    DataChange {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    #[serde(rename = "output_file_change")]
    OutputChange { path: String },
    #[serde(rename = "watch_error")]
    WatchError { message: String },
}

impl ChangeEvent {
    pub fn deleted_for_safety(path: String) -> Self {
        ChangeEvent::DataChange {
            path,
            action: Some("deleted-for-safety".to_string()),
        }
    }

    /// Coalescing key; `watch_error` frames are never coalesced.
    fn path_key(&self) -> Option<&str> {
        match self {
            ChangeEvent::ScriptChange { path, .. } => Some(path),
            ChangeEvent::DataChange { path, .. } => Some(path),
            ChangeEvent::OutputChange { path } => Some(path),
            ChangeEvent::WatchError { .. } => None,
        }
    }
}

/// Fan-out point for all change notifications. Components other than the
/// watcher and the scanner never publish here.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running filesystem watcher. Dropping it stops the watch task
/// (and with it the underlying notify watcher).
pub struct ProjectWatcher {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching `root`, classifying raw filesystem events into
/// [`ChangeEvent`]s and publishing them on `bus` after per-path coalescing.
/// Watch failures are logged, surfaced as `watch_error` frames, and retried
/// with backoff.
pub fn start(root: PathBuf, policy: Arc<PathPolicy>, bus: EventBus) -> ProjectWatcher {
    let task = tokio::spawn(async move {
        let mut attempt = 0usize;
        loop {
            match watch_until_error(&root, &policy, &bus).await {
                Ok(()) => return, // channel closed, watcher handle dropped
                Err(err) => {
                    crate::logging::error(format!(
                        "watcher failed root={} err={err:#}",
                        root.display()
                    ));
                    bus.publish(ChangeEvent::WatchError {
                        message: err.to_string(),
                    });
                    let idx = attempt.min(REATTACH_BACKOFF_SECS.len() - 1);
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(REATTACH_BACKOFF_SECS[idx])).await;
                }
            }
        }
    });
    ProjectWatcher { task }
}

async fn watch_until_error(root: &Path, policy: &PathPolicy, bus: &EventBus) -> Result<()> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    })
    .context("create watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;

    // Pending events keyed by path; each entry fires when its window closes.
    let mut pending: HashMap<String, (ChangeEvent, Instant)> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(_, d)| *d).min();
        tokio::select! {
            received = raw_rx.recv() => {
                match received {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err).context("watch event"),
                    Some(Ok(event)) => {
                        for change in classify(root, policy, &event) {
                            enqueue(&mut pending, change);
                        }
                    }
                }
            }
            _ = sleep_until_opt(next_deadline) => {
                flush_due(&mut pending, bus);
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn enqueue(pending: &mut HashMap<String, (ChangeEvent, Instant)>, event: ChangeEvent) {
    let Some(key) = event.path_key().map(|k| k.to_string()) else {
        return;
    };
    match pending.get_mut(&key) {
        // Window already open: keep the deadline, remember the latest event.
        Some(slot) => slot.0 = event,
        None => {
            pending.insert(key, (event, Instant::now() + COALESCE_WINDOW));
        }
    }
}

fn flush_due(pending: &mut HashMap<String, (ChangeEvent, Instant)>, bus: &EventBus) {
    let now = Instant::now();
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, (_, deadline))| *deadline <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in due {
        if let Some((event, _)) = pending.remove(&key) {
            bus.publish(event);
        }
    }
}

/// Map one raw notify event onto zero or more typed changes.
fn classify(root: &Path, policy: &PathPolicy, event: &Event) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    for abs in &event.paths {
        let Ok(rel) = abs.strip_prefix(root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let is_dir = abs.is_dir();
        if policy.is_ignored_rel(rel, is_dir) || is_dir {
            continue;
        }
        let rel_str = policy::rel_string(rel);

        if is_script_path(rel) && is_create_or_modify(&event.kind) {
            out.push(ChangeEvent::ScriptChange {
                path: rel_str,
                last_modified: file_mtime_unix(abs),
            });
        } else if policy::under_subtree(rel, "input") {
            out.push(ChangeEvent::DataChange {
                path: rel_str,
                action: None,
            });
        } else if policy::under_subtree(rel, "output")
            // create only, unlike scripts
            && matches!(event.kind, EventKind::Create(_))
            && matches!(policy::extension_of(rel).as_deref(), Some(ext) if OUTPUT_EXTS.contains(&ext))
        {
            out.push(ChangeEvent::OutputChange { path: rel_str });
        }
    }
    out
}

/// Scripts live under `app/scripts/`; any other `*.py` under `app/` counts
/// too (helper modules next to the scripts).
fn is_script_path(rel: &Path) -> bool {
    if !policy::under_subtree(rel, "app") {
        return false;
    }
    let under_scripts = rel.starts_with("app/scripts");
    under_scripts || policy::extension_of(rel).as_deref() == Some("py")
}

fn is_create_or_modify(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

pub fn file_mtime_unix(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    Some(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn policy() -> PathPolicy {
        PathPolicy::new().unwrap()
    }

    fn event_for(root: &Path, rel: &str, kind: EventKind) -> Event {
        Event::new(kind).add_path(root.join(rel))
    }

    #[test]
    fn classifies_script_data_and_output_changes() {
        let root = Path::new("/proj");
        let p = policy();

        let script = classify(
            root,
            &p,
            &event_for(root, "app/scripts/run.py", EventKind::Modify(ModifyKind::Any)),
        );
        assert!(matches!(
            script.as_slice(),
            [ChangeEvent::ScriptChange { path, .. }] if path == "app/scripts/run.py"
        ));

        let data = classify(
            root,
            &p,
            &event_for(root, "input/sales.csv", EventKind::Create(CreateKind::File)),
        );
        assert!(matches!(
            data.as_slice(),
            [ChangeEvent::DataChange { path, action: None }] if path == "input/sales.csv"
        ));

        let output = classify(
            root,
            &p,
            &event_for(root, "output/plot.png", EventKind::Create(CreateKind::File)),
        );
        assert!(matches!(
            output.as_slice(),
            [ChangeEvent::OutputChange { path }] if path == "output/plot.png"
        ));
    }

    #[test]
    fn rewriting_an_existing_output_emits_nothing() {
        let root = Path::new("/proj");
        let changes = classify(
            root,
            &policy(),
            &event_for(root, "output/plot.png", EventKind::Modify(ModifyKind::Any)),
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn helper_py_under_app_counts_as_script() {
        let root = Path::new("/proj");
        let changes = classify(
            root,
            &policy(),
            &event_for(root, "app/helpers.py", EventKind::Create(CreateKind::File)),
        );
        assert!(matches!(
            changes.as_slice(),
            [ChangeEvent::ScriptChange { .. }]
        ));
    }

    #[test]
    fn non_renderable_output_and_ignored_paths_are_dropped() {
        let root = Path::new("/proj");
        let p = policy();
        assert!(classify(
            root,
            &p,
            &event_for(root, "output/notes.log", EventKind::Create(CreateKind::File)),
        )
        .is_empty());
        assert!(classify(
            root,
            &p,
            &event_for(
                root,
                "app/scripts/__pycache__/run.pyc",
                EventKind::Create(CreateKind::File),
            ),
        )
        .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_keeps_latest_event_per_path() {
        let mut pending = HashMap::new();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        enqueue(
            &mut pending,
            ChangeEvent::ScriptChange {
                path: "app/scripts/s.py".into(),
                last_modified: Some(1),
            },
        );
        enqueue(
            &mut pending,
            ChangeEvent::ScriptChange {
                path: "app/scripts/s.py".into(),
                last_modified: Some(5),
            },
        );
        assert_eq!(pending.len(), 1);

        tokio::time::advance(COALESCE_WINDOW + Duration::from_millis(10)).await;
        flush_due(&mut pending, &bus);
        assert!(pending.is_empty());

        let got = rx.try_recv().unwrap();
        assert!(matches!(
            got,
            ChangeEvent::ScriptChange { last_modified: Some(5), .. }
        ));
        assert!(rx.try_recv().is_err(), "exactly one frame per window");
    }

    #[test]
    fn watch_error_has_no_coalescing_key() {
        let ev = ChangeEvent::WatchError {
            message: "gone".into(),
        };
        assert!(ev.path_key().is_none());
    }
}
