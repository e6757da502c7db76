//! Per-iteration prompt composition.
//!
//! Templates are rendered with minijinja, then split on
//! `<!-- section:KEY required|droppable -->` markers so an oversized prompt can
//! shed its least important sections before anything required is cut.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::classifier::tail;
use crate::core::plan::TaskRef;
use crate::core::types::{FailureContext, Mode};

const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

/// Default prompt ceiling in bytes.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 200_000;

/// Dropped in this order when over budget.
const DROP_ORDER: [&str; 4] = ["plan", "document", "task", "failure"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// Everything a prompt is rendered from.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub mode: Mode,
    pub project_id: String,
    /// Required in build mode.
    pub task: Option<TaskRef>,
    pub task_document: Option<String>,
    pub plan: Option<String>,
    /// Plan location as shown to the agent.
    pub plan_path: String,
    pub tasks_dir: String,
    pub failure: Option<FailureContext>,
    /// 1-based attempt number on the current task.
    pub attempt: u32,
    pub gates: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: String,
    path: &'a str,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a TaskRef) -> Self {
        Self {
            id: &task.id,
            title: task.title(),
            path: &task.path,
        }
    }
}

#[derive(Debug, Serialize)]
struct FailureView<'a> {
    summary: &'a str,
    detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn engine() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("build", BUILD_TEMPLATE)
        .context("load build prompt template")?;
    env.add_template("plan", PLAN_TEMPLATE)
        .context("load plan prompt template")?;
    Ok(env)
}

/// Renders prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    failure_limit_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, failure_limit_bytes: usize) -> Self {
        Self {
            budget_bytes,
            failure_limit_bytes,
        }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<String> {
        let rendered = self.render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }

    fn render(&self, input: &PromptInputs) -> Result<String> {
        let env = engine()?;
        let name = input.mode.as_str();
        if input.mode == Mode::Build && input.task.is_none() {
            return Err(anyhow!("build prompt requires a task"));
        }
        let failure = input.failure.as_ref().map(|failure| FailureView {
            summary: failure.summary.trim(),
            detail: tail(failure.detail.trim(), self.failure_limit_bytes),
        });
        let template = env.get_template(name)?;
        let rendered = template
            .render(context! {
                project_id => input.project_id.as_str(),
                task => input.task.as_ref().map(TaskContext::from_task),
                document => input.task_document.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                plan => input.plan.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                plan_path => input.plan_path.as_str(),
                tasks_dir => input.tasks_dir.as_str(),
                failure => failure,
                attempt => input.attempt,
                gates => input.gates.as_slice(),
            })
            .with_context(|| format!("render {name} prompt"))?;
        Ok(rendered)
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES, 8_000)
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped prompt section for budget"
            );
        }
    }

    // Still over: cut the tail of the last section.
    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let other = total - last.content.len();
    let allowed = budget.saturating_sub(other);
    let mut keep = allowed.saturating_sub(12);
    while keep > 0 && !last.content.is_char_boundary(keep) {
        keep -= 1;
    }
    let before = last.content.len();
    last.content.truncate(keep);
    last.content.push_str("\n[truncated]");
    debug!(
        section = %last.key,
        before,
        after = last.content.len(),
        "truncated prompt section for budget"
    );
}

fn join_sections(sections: &[Section]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}
