//! Resolve an agent identity to a concrete invocation.
//!
//! Built-in agents cover the common CLIs; `[agents.<name>]` in the project
//! config adds new ones or overrides a built-in. The prompt is always written
//! to the agent's stdin.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

use crate::io::config::{AgentOverride, ProjectConfig};
use crate::io::process::CommandSpec;

/// Everything needed to launch one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// Agent identity as configured (e.g. `claude`).
    pub agent: String,
    pub model: Option<String>,
    pub command: CommandSpec,
}

struct BuiltinAgent {
    name: &'static str,
    program: &'static str,
    args: &'static [&'static str],
    model_flag: &'static str,
    /// Arguments that must follow the model flag (e.g. the stdin marker `-`).
    trailing: &'static [&'static str],
}

const BUILTIN_AGENTS: &[BuiltinAgent] = &[
    BuiltinAgent {
        name: "claude",
        program: "claude",
        args: &["-p", "--dangerously-skip-permissions"],
        model_flag: "--model",
        trailing: &[],
    },
    BuiltinAgent {
        name: "codex",
        program: "codex",
        args: &[
            "exec",
            "--sandbox",
            "danger-full-access",
            "--skip-git-repo-check",
        ],
        model_flag: "--model",
        trailing: &["-"],
    },
];

/// Names of agents usable without configuration.
pub fn builtin_agent_names() -> Vec<&'static str> {
    BUILTIN_AGENTS.iter().map(|agent| agent.name).collect()
}

/// Resolve the configured agent. Unknown agents are configuration errors.
pub fn resolve_agent(config: &ProjectConfig) -> Result<AgentInvocation> {
    let name = config.agent.trim();
    let model = config.model.clone().filter(|m| !m.trim().is_empty());

    let command = if let Some(custom) = config.agents.get(name) {
        custom_command(name, custom, model.as_deref())?
    } else if let Some(builtin) = BUILTIN_AGENTS.iter().find(|agent| agent.name == name) {
        builtin_command(builtin, model.as_deref())
    } else {
        let mut known: Vec<String> = builtin_agent_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        known.extend(config.agents.keys().cloned());
        return Err(anyhow!(
            "unknown agent '{name}' (known: {})",
            known.join(", ")
        ));
    };

    Ok(AgentInvocation {
        agent: name.to_string(),
        model,
        command,
    })
}

fn builtin_command(agent: &BuiltinAgent, model: Option<&str>) -> CommandSpec {
    let mut args: Vec<String> = agent.args.iter().map(|s| s.to_string()).collect();
    if let Some(model) = model {
        args.push(agent.model_flag.to_string());
        args.push(model.to_string());
    }
    args.extend(agent.trailing.iter().map(|s| s.to_string()));
    CommandSpec {
        program: agent.program.to_string(),
        args,
        env: BTreeMap::new(),
    }
}

fn custom_command(name: &str, custom: &AgentOverride, model: Option<&str>) -> Result<CommandSpec> {
    let mut command = CommandSpec::from_argv(&custom.command)
        .map_err(|_| anyhow!("agents.{name}.command must be a non-empty array"))?;
    if let (Some(flag), Some(model)) = (&custom.model_flag, model) {
        command.args.push(flag.clone());
        command.args.push(model.to_string());
    }
    command.env = custom.env.clone();
    Ok(command)
}
