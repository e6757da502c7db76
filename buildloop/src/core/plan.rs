//! Plan document parsing: find the task currently "In Progress".
//!
//! The plan is free-form markdown. Only the section under an `In Progress`
//! heading is inspected, and within it only list items that reference a task
//! path (bare, as a link target, or behind a checkbox).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A task reference extracted from the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Stable identifier, e.g. `011-telegram-notifications`.
    pub id: String,
    /// Path exactly as written in the plan, e.g. `tasks/011-telegram-notifications.md`.
    pub path: String,
}

impl TaskRef {
    pub fn title(&self) -> String {
        task_title(&self.id)
    }
}

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.*?)\s*#*\s*$").unwrap());
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+]\s+(?:\[[ xX]\]\s+)?(.+?)\s*$").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[^\]]*\]\(\s*<?([^)\s>]+)>?\s*\)").unwrap());
static TASK_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\./)?(?:[A-Za-z0-9._-]+/)*(\d+-[A-Za-z0-9][A-Za-z0-9_-]*)(?:\.md)?/?$").unwrap()
});

/// Return the first task reference under the "In Progress" heading, if any.
pub fn current_task(plan: &str) -> Option<TaskRef> {
    let mut in_section = false;
    let mut in_comment = false;

    for line in plan.lines() {
        let trimmed = line.trim();

        if in_comment {
            if trimmed.contains("-->") {
                in_comment = false;
            }
            continue;
        }
        if trimmed.starts_with("<!--") {
            in_comment = !trimmed.contains("-->");
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(line) {
            if in_section {
                break;
            }
            in_section = is_in_progress_heading(&caps[1]);
            continue;
        }
        if !in_section {
            continue;
        }

        if let Some(task) = parse_list_item(line) {
            return Some(task);
        }
    }
    None
}

/// Derive a display title from a task id.
///
/// `"007-extract-task-manager-hook"` becomes `"Extract Task Manager Hook"`.
pub fn task_title(id: &str) -> String {
    let without_prefix = match id.split_once('-') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) => {
            rest
        }
        _ => id,
    };
    without_prefix
        .split('-')
        .filter(|segment| !segment.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn is_in_progress_heading(text: &str) -> bool {
    text.trim_end_matches(':').trim().eq_ignore_ascii_case("in progress")
}

fn parse_list_item(line: &str) -> Option<TaskRef> {
    let caps = LIST_ITEM_RE.captures(line)?;
    let content = caps.get(1)?.as_str();

    let candidate = match LINK_RE.captures(content) {
        Some(link) => link.get(1)?.as_str(),
        None => content,
    };
    parse_task_path(candidate)
}

/// Task paths stay inside the project: `..` segments are rejected.
fn parse_task_path(candidate: &str) -> Option<TaskRef> {
    if candidate.split('/').any(|segment| segment == "..") {
        return None;
    }
    let caps = TASK_PATH_RE.captures(candidate)?;
    Some(TaskRef {
        id: caps.get(1)?.as_str().to_string(),
        path: candidate.to_string(),
    })
}
