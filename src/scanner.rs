use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy::{self, PathPolicy};
use crate::watcher::{ChangeEvent, EventBus};

/// One entry in a tree snapshot. Identity is the relative `path`; snapshots
/// are rebuilt per scan and never mutated after return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub path: String,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Node>>,
}

/// Build a filtered snapshot rooted at `root`. Forbidden files discovered
/// under `app/` are deleted on sight and reported on the bus; they never
/// appear in the returned tree.
pub fn scan_tree(root: &Path, policy: &PathPolicy, bus: Option<&EventBus>) -> Result<Node> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());
    let children = scan_dir(root, root, policy, bus)
        .with_context(|| format!("scan {}", root.display()))?;
    Ok(Node {
        name,
        path: String::new(),
        is_directory: true,
        extension: None,
        last_modified: None,
        children: Some(children),
    })
}

fn scan_dir(root: &Path, dir: &Path, policy: &PathPolicy, bus: Option<&EventBus>) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    let entries = fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let abs = entry.path();
        let Ok(rel) = abs.strip_prefix(root) else {
            continue;
        };
        let file_type = entry.file_type()?;
        let is_dir = file_type.is_dir();
        if policy.is_ignored_rel(rel, is_dir) {
            continue;
        }

        if is_dir {
            let children = scan_dir(root, &abs, policy, bus)?;
            nodes.push(Node {
                name: entry.file_name().to_string_lossy().to_string(),
                path: policy::rel_string(rel),
                is_directory: true,
                extension: None,
                last_modified: None,
                children: Some(children),
            });
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let meta = entry.metadata().ok();
        let size = meta.as_ref().map(|m| m.len());
        if policy.is_forbidden_in_app(rel, size) {
            // Exclude from the snapshot whether or not the unlink worked.
            let rel_str = policy::rel_string(rel);
            match fs::remove_file(&abs) {
                Ok(()) => crate::logging::warn_kv(
                    "deleted forbidden file under app/",
                    &[("path", rel_str.as_str())],
                ),
                Err(err) => crate::logging::error(format!(
                    "failed to delete forbidden file {}: {err}",
                    rel_str
                )),
            }
            if let Some(bus) = bus {
                bus.publish(ChangeEvent::deleted_for_safety(rel_str));
            }
            continue;
        }

        let last_modified = meta
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        nodes.push(Node {
            name: entry.file_name().to_string_lossy().to_string(),
            path: policy::rel_string(rel),
            is_directory: false,
            extension: policy::extension_of(rel),
            last_modified,
            children: None,
        });
    }

    sort_nodes(&mut nodes);
    Ok(nodes)
}

/// Directories first, then case-insensitive name.
fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// Cheap change detector: the sorted concatenation of `path:modtime` for
/// every file in the snapshot. Equal signatures mean an identical tree.
pub fn snapshot_signature(tree: &Node) -> String {
    let mut entries = Vec::new();
    collect_signature(tree, &mut entries);
    entries.sort();
    entries.join("\n")
}

fn collect_signature(node: &Node, out: &mut Vec<String>) {
    if !node.is_directory {
        out.push(format!("{}:{}", node.path, node.last_modified.unwrap_or(0)));
    }
    if let Some(children) = &node.children {
        for child in children {
            collect_signature(child, out);
        }
    }
}
