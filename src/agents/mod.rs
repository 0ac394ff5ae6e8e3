//! Agent families and the command sequences that provision and invoke them.
//!
//! A family is a closed enumeration; everything that varies between
//! installations (install package, registry, credential variable names) is
//! configuration data. This module only projects family + role + config onto
//! an ordered command list, so it stays a pure function that tests can
//! inspect.

pub mod analyzer;
pub mod solver;

use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::io::config::{Config, FamilyConfig};
use crate::io::container::Container;

/// Fixed container paths shared with the prompt contracts.
pub const REPO_DIR: &str = "/app/repo";
pub const ANALYZER_PROMPT_PATH: &str = "/app/codeAnalyzerPrompt.txt";
pub const SOLVER_PROMPT_PATH: &str = "/app/taskSolverPrompt.txt";
pub const TASKS_PATH: &str = "/app/tasks.json";
pub const REPORT_PATH: &str = "/app/finalReport.json";
pub const DIFF_PATH: &str = "/app/git_diff.txt";
pub const DIFF_HARNESS_PATH: &str = "/app/make_diff.sh";

/// Supported agent families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentFamily {
    Claude,
    Gemini,
    Codex,
    Qwen,
}

impl AgentFamily {
    pub const ALL: [AgentFamily; 4] = [
        AgentFamily::Claude,
        AgentFamily::Gemini,
        AgentFamily::Codex,
        AgentFamily::Qwen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentFamily::Claude => "claude",
            AgentFamily::Gemini => "gemini",
            AgentFamily::Codex => "codex",
            AgentFamily::Qwen => "qwen",
        }
    }
}

impl fmt::Display for AgentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(AgentFamily::Claude),
            "gemini" => Ok(AgentFamily::Gemini),
            "codex" => Ok(AgentFamily::Codex),
            "qwen" => Ok(AgentFamily::Qwen),
            other => Err(format!("unknown agent family '{other}'")),
        }
    }
}

/// Role an agent plays in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Analyzer,
    Solver,
}

impl Role {
    pub fn prompt_path(self) -> &'static str {
        match self {
            Role::Analyzer => ANALYZER_PROMPT_PATH,
            Role::Solver => SOLVER_PROMPT_PATH,
        }
    }
}

/// Ordered commands that turn a blank base image into a working agent
/// environment, plus the final invocation.
#[derive(Debug, Clone)]
pub struct InvocationPlan {
    pub provisioning: Vec<String>,
    pub invocation: String,
}

/// Build the full command plan for the configured family and role.
pub fn build_plan(cfg: &Config, role: Role, git_url: &str) -> InvocationPlan {
    let family = cfg.agent;
    let family_cfg = cfg.active_family();

    let mut provisioning = vec![
        "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq \
         curl git ca-certificates"
            .to_string(),
        "curl -fsSL https://deb.nodesource.com/setup_22.x | bash - && \
         DEBIAN_FRONTEND=noninteractive apt-get install -y -qq nodejs"
            .to_string(),
        format!("git clone {} {}", sh_quote(git_url), REPO_DIR),
        install_command(family_cfg),
    ];
    if role == Role::Solver {
        provisioning.push(format!("chmod +x {DIFF_HARNESS_PATH}"));
    }

    InvocationPlan {
        provisioning,
        invocation: invocation_command(family, family_cfg, role),
    }
}

/// The agent-binary install step. Clears inherited proxy variables when the
/// install source is not reachable through the proxy.
fn install_command(family_cfg: &FamilyConfig) -> String {
    let mut install = format!("npm install -g {}", sh_quote(&family_cfg.install_package));
    if let Some(registry) = &family_cfg.registry {
        install.push_str(&format!(" --registry {}", sh_quote(registry)));
    }
    if family_cfg.clear_proxy_for_install {
        format!("env -u http_proxy -u https_proxy -u HTTP_PROXY -u HTTPS_PROXY {install}")
    } else {
        install
    }
}

/// The final command that runs the agent against its prompt file.
fn invocation_command(family: AgentFamily, family_cfg: &FamilyConfig, role: Role) -> String {
    let prompt = role.prompt_path();
    let exports = credential_exports(family, family_cfg);
    let extra = extra_args(family_cfg);

    let agent = match family {
        AgentFamily::Claude => format!(
            "claude --dangerously-skip-permissions{extra} -p \"$(cat {prompt})\""
        ),
        AgentFamily::Gemini => format!("gemini --yolo{extra} -p \"$(cat {prompt})\""),
        AgentFamily::Codex => format!(
            "codex exec --sandbox danger-full-access --skip-git-repo-check{extra} - < {prompt}"
        ),
        AgentFamily::Qwen => format!("qwen --yolo{extra} -p \"$(cat {prompt})\""),
    };
    format!("cd {REPO_DIR} && {exports}{agent}")
}

/// `export VAR=value; ` prefix for the invocation, per the family table.
fn credential_exports(family: AgentFamily, family_cfg: &FamilyConfig) -> String {
    let mut exports = String::new();
    if family_cfg.export_key && !family_cfg.api_key.is_empty() {
        exports.push_str(&format!(
            "export {}={}; ",
            family_cfg.api_key_env,
            sh_quote(&family_cfg.api_key)
        ));
    }
    if let (Some(env), Some(url)) = (&family_cfg.base_url_env, &family_cfg.base_url) {
        exports.push_str(&format!("export {}={}; ", env, sh_quote(url)));
    }
    if family == AgentFamily::Claude {
        exports.push_str("export IS_SANDBOX=1; ");
    }
    exports
}

fn extra_args(family_cfg: &FamilyConfig) -> String {
    family_cfg
        .extra_args
        .iter()
        .map(|arg| format!(" {}", sh_quote(arg)))
        .collect()
}

/// Single-quote a value for embedding in an `sh -c` command line.
fn sh_quote(value: &str) -> String {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// Copy the host user's version-control credentials into a container.
///
/// Best-effort: a missing host file is logged and skipped, never fatal.
/// Credential config baked into the image is removed first so the copied
/// files win.
pub(crate) fn copy_host_credentials(container: &dyn Container, use_ssh: bool) {
    let cleanup = vec!["rm -f /root/.gitconfig /root/.git-credentials".to_string()];
    if let Err(err) = container.exec_blocking(&cleanup, Duration::from_secs(120)) {
        warn!(error = %format!("{err:#}"), "credential cleanup failed");
    }

    let Some(home) = dirs::home_dir() else {
        warn!("no home directory, skipping credential copy");
        return;
    };
    for (file, dest) in [
        (".gitconfig", "/root/.gitconfig"),
        (".git-credentials", "/root/.git-credentials"),
    ] {
        let host = home.join(file);
        match fs::read_to_string(&host) {
            Ok(contents) => {
                if let Err(err) = container.copy_in_file(&contents, dest) {
                    warn!(file, error = %format!("{err:#}"), "credential copy failed");
                }
            }
            Err(_) => debug!(file, "host credential file absent, skipping"),
        }
    }
    if use_ssh {
        let ssh_dir = home.join(".ssh");
        if ssh_dir.is_dir() {
            if let Err(err) = container.copy_in_tree(&ssh_dir, "/root/.ssh") {
                warn!(error = %format!("{err:#}"), "ssh key copy failed");
            }
        } else {
            debug!("host ~/.ssh absent, skipping");
        }
    }
}

/// Shell script staged inside solver containers; the agent invokes it at
/// task completion to produce the patch artifact.
pub const DIFF_HARNESS: &str = r#"#!/bin/sh
# Capture the working tree as one unified diff, including new files.
set -eu
cd /app/repo
git add -N .
git diff > /app/git_diff.txt
"#;
