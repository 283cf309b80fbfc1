use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Extensions that must never exist under `app/` (risk of data leaving the
/// local-only subtrees). Discovered instances are deleted by the scanner.
const FORBIDDEN_IN_APP_EXTS: &[&str] = &["csv", "xlsx", "xls", "json"];

/// Plain-text files under `app/` above this size are treated like data dumps.
const APP_TXT_MAX_BYTES: u64 = 50 * 1024;

/// Extensions that never cross the outbound sync boundary.
const FORBIDDEN_FOR_SYNC_EXTS: &[&str] =
    &["pdf", "csv", "xlsx", "xls", "xlsm", "xlsb", "ppt", "pptx"];

/// File stems the remote owns; local copies are never pushed.
const PROTECTED_PUSH_STEMS: &[&str] = &["sync_server", "metadatafarmer"];

/// Exact names the remote owns.
const PROTECTED_PUSH_NAMES: &[&str] = &["CLAUDE.md"];

/// Directories the remote owns (pull-only).
const PROTECTED_PUSH_DIRS: &[&str] = &["meta_data"];

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // dotfiles and editor droppings
    ".*",
    // dependency/build trees
    "node_modules/",
    "__pycache__/",
    ".git/",
    "target/",
    "build/",
    "dist/",
    "venv/",
    ".venv/",
    ".ipynb_checkpoints/",
];

/// Stateless classifier for every path decision the bridge makes. The
/// scanner, synchronizer, watcher, and HTTP writers all consult this one
/// matcher so they cannot disagree on what is permissible.
#[derive(Clone)]
pub struct PathPolicy {
    ignore: Gitignore,
}

impl PathPolicy {
    pub fn new() -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }
        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self { ignore })
    }

    /// Dotfiles, dependency trees, build dirs. `rel` is project-relative.
    pub fn is_ignored_rel(&self, rel: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }

    /// True when `rel` must not exist under `app/`. Extension matches are
    /// decided from the path alone; the `.txt` size rule needs a stat, which
    /// the caller supplies via `size`.
    pub fn is_forbidden_in_app(&self, rel: &Path, size: Option<u64>) -> bool {
        if !under_subtree(rel, "app") {
            return false;
        }
        match extension_of(rel).as_deref() {
            Some(ext) if FORBIDDEN_IN_APP_EXTS.contains(&ext) => true,
            Some("txt") => size.is_some_and(|s| s > APP_TXT_MAX_BYTES),
            _ => false,
        }
    }

    /// True when `rel` must never be uploaded, anywhere.
    pub fn is_forbidden_for_sync(&self, rel: &Path) -> bool {
        matches!(extension_of(rel).as_deref(), Some(ext) if FORBIDDEN_FOR_SYNC_EXTS.contains(&ext))
    }

    /// True when the remote owns `rel` and push must skip it silently.
    pub fn is_protected_from_push(&self, rel: &Path) -> bool {
        for comp in rel.components() {
            if let Component::Normal(os) = comp {
                let name = os.to_string_lossy();
                if PROTECTED_PUSH_DIRS.contains(&name.as_ref()) {
                    return true;
                }
            }
        }
        let Some(name) = rel.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return false;
        };
        if PROTECTED_PUSH_NAMES.contains(&name.as_str()) {
            return true;
        }
        let stem = name.split('.').next().unwrap_or("");
        PROTECTED_PUSH_STEMS.contains(&stem)
    }
}

/// Lowercased extension of the final path component.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// True when `rel` has `subtree` as its first component (but is not the
/// subtree root itself).
pub fn under_subtree(rel: &Path, subtree: &str) -> bool {
    let mut comps = rel.components();
    match comps.next() {
        Some(Component::Normal(first)) if first.to_string_lossy() == subtree => {
            comps.next().is_some()
        }
        _ => false,
    }
}

/// Project-relative path with `/` separators, for wire payloads and vector
/// keys.
pub fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

pub fn rel_path(raw: &str) -> PathBuf {
    PathBuf::from(raw.replace('\\', "/"))
}
