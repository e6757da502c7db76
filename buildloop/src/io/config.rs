//! Project configuration stored under `.buildloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Per-project configuration (TOML).
///
/// Read once at session start and never mutated by the loop. Missing fields
/// default to the values in [`ProjectConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Stable project identifier. Defaults to the project directory name.
    pub project_id: Option<String>,

    /// Agent identity resolved through the agent registry (e.g. `claude`).
    pub agent: String,

    /// Model passed to the agent, if it accepts one.
    pub model: Option<String>,

    /// Hard ceiling on iterations per session.
    pub max_iterations: u32,

    /// Consecutive failed iterations (agent or gate) tolerated before stopping.
    pub max_retries: u32,

    /// Wall-clock budget for one agent run, in seconds.
    pub iteration_timeout_secs: u64,

    /// Wall-clock budget for each gate, in seconds.
    pub gate_timeout_secs: u64,

    /// Bytes of agent/gate output kept in memory per process.
    pub output_limit_bytes: usize,

    /// Bytes of failure output folded into the next prompt.
    pub failure_context_limit_bytes: usize,

    /// Verification commands, run in order after the agent reports done.
    pub gates: Vec<GateSpec>,

    /// Extra or overriding agent definitions, keyed by agent identity.
    pub agents: BTreeMap<String, AgentOverride>,
}

/// A named verification command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateSpec {
    pub name: String,
    /// Program and arguments, e.g. `["cargo", "test"]`.
    pub command: Vec<String>,
}

/// Project-level agent definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AgentOverride {
    /// Program and arguments. The prompt is written to stdin.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Flag used to pass `model` (e.g. `--model`). Omitted when unset.
    pub model_flag: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            agent: "claude".to_string(),
            model: None,
            max_iterations: 20,
            max_retries: 3,
            iteration_timeout_secs: 30 * 60,
            gate_timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
            failure_context_limit_bytes: 8_000,
            gates: Vec::new(),
            agents: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.trim().is_empty() {
            return Err(anyhow!("agent must not be empty"));
        }
        if let Some(id) = &self.project_id {
            validate_id(id)?;
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.gate_timeout_secs == 0 {
            return Err(anyhow!("gate_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        let mut seen = Vec::new();
        for gate in &self.gates {
            if gate.name.trim().is_empty() {
                return Err(anyhow!("gate name must not be empty"));
            }
            if seen.contains(&gate.name.as_str()) {
                return Err(anyhow!("duplicate gate name '{}'", gate.name));
            }
            seen.push(gate.name.as_str());
            if gate.command.is_empty() || gate.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "gate '{}' command must be a non-empty array",
                    gate.name
                ));
            }
        }
        for (name, agent) in &self.agents {
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "agents.{name}.command must be a non-empty array"
                ));
            }
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }
}

/// Validate that an id is safe for use in file names.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ProjectConfig::default()`.
pub fn load_config(path: &Path) -> Result<ProjectConfig> {
    if !path.exists() {
        let cfg = ProjectConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ProjectConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ProjectConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("create temp config {}", tmp_path.display()))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
