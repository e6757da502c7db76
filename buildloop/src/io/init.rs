//! Project layout and `.buildloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ProjectConfig, write_config};

/// All canonical paths within `.buildloop/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".buildloop");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: state_dir.join("config.toml"),
            plan_path: state_dir.join("PLAN.md"),
            tasks_dir: state_dir.join("tasks"),
            sessions_dir: state_dir.join("sessions"),
            logs_dir: state_dir.join("logs"),
            gitignore_path: state_dir.join(".gitignore"),
        }
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{session_id}.log"))
    }

    pub fn control_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.control"))
    }

    /// Project id used when the config does not name one: the root directory name.
    pub fn default_project_id(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "project".to_string())
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing buildloop-owned files.
    pub force: bool,
}

/// Create `.buildloop/` scaffolding in `root`.
///
/// Fails if `.buildloop/config.toml` already exists unless `options.force` is set.
/// An existing plan document is never overwritten.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "buildloop init: .buildloop exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "buildloop init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.tasks_dir)?;
    create_dir(&paths.sessions_dir)?;
    create_dir(&paths.logs_dir)?;

    write_file(&paths.gitignore_path, GITIGNORE)?;
    write_config(&paths.config_path, &ProjectConfig::default())?;
    if !paths.plan_path.exists() {
        write_file(&paths.plan_path, PLAN_PLACEHOLDER)?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const GITIGNORE: &str = "sessions/\nlogs/\n";
const PLAN_PLACEHOLDER: &str = "# Plan\n\n\
<!-- List one task path under In Progress, e.g. `- [ ] tasks/001-first-task.md` -->\n\n\
## In Progress\n\n\
## Backlog\n\n\
## Done\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::current_task;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.tasks_dir.is_dir());
        assert!(paths.sessions_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.plan_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            ProjectConfig::default()
        );
    }

    /// The placeholder plan has an empty In Progress section, so nothing is selected.
    #[test]
    fn placeholder_plan_has_no_current_task() {
        assert_eq!(current_task(PLAN_PLACEHOLDER), None);
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_project(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_keeps_existing_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.plan_path, "## In Progress\n- tasks/001-a.md\n").expect("write plan");

        init_project(temp.path(), &InitOptions { force: true }).expect("re-init");

        let plan = fs::read_to_string(&paths.plan_path).expect("read plan");
        assert!(plan.contains("001-a"));
    }

    #[test]
    fn session_paths_are_stable() {
        let paths = ProjectPaths::new("/work/app");
        assert!(
            paths
                .log_path("s-1")
                .ends_with(Path::new(".buildloop/logs/s-1.log"))
        );
        assert!(
            paths
                .control_path("s-1")
                .ends_with(Path::new(".buildloop/sessions/s-1.control"))
        );
        assert_eq!(paths.default_project_id(), "app");
    }
}
