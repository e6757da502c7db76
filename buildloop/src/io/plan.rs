//! Plan and task documents on disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::plan::{TaskRef, current_task};
use crate::io::init::ProjectPaths;

/// Read the plan document. A missing plan is `None`, not an error.
pub fn read_plan(paths: &ProjectPaths) -> Result<Option<String>> {
    read_optional(&paths.plan_path)
}

/// The task currently in progress, or `None` if there is none (or no plan).
pub fn read_current_task(paths: &ProjectPaths) -> Result<Option<TaskRef>> {
    let Some(plan) = read_plan(paths)? else {
        debug!(path = %paths.plan_path.display(), "no plan document");
        return Ok(None);
    };
    Ok(current_task(&plan))
}

/// Where a task path from the plan points.
///
/// Paths are relative to the plan's directory; a path that does not exist there
/// is tried against the project root.
pub fn resolve_task_path(paths: &ProjectPaths, task: &TaskRef) -> PathBuf {
    let relative = task.path.trim_end_matches('/');
    let candidates = [paths.state_dir.join(relative), paths.root.join(relative)];
    for candidate in &candidates {
        if candidate.exists() {
            return candidate.clone();
        }
    }
    let [first, _] = candidates;
    first
}

/// Read the task document, if the task path names an existing file.
///
/// Directory-style paths (`tasks/001-x/`) read `README.md` inside them.
pub fn read_task_document(paths: &ProjectPaths, task: &TaskRef) -> Result<Option<String>> {
    let path = resolve_task_path(paths, task);
    if path.is_dir() {
        return read_optional(&path.join("README.md"));
    }
    read_optional(&path)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}
