//! Layered taskfarm configuration (TOML).
//!
//! Effective configuration is the user-global file overlaid by the
//! per-project file overlaid by `TASKFARM_*` environment variables. Missing
//! fields default to sensible values; `validate` enforces the cross-field
//! invariants before any container starts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::agents::AgentFamily;

pub const ENV_PREFIX: &str = "TASKFARM_";
pub const PROJECT_FILE: &str = "taskfarm.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Agent family used for both analyzer and solver roles.
    pub agent: AgentFamily,

    /// Base container image for every container in the run.
    pub image: String,

    /// Total containers a run may create (analyzer plus solvers).
    pub max_containers: u32,

    /// Solver containers allowed to run at once.
    pub max_parallel_containers: u32,

    /// Wall-clock budget for the agent invocation inside one container.
    /// Zero disables the timeout.
    pub container_timeout_secs: u64,

    /// Memory limit per container, in megabytes. Zero leaves it unbounded.
    pub container_memory_mb: u64,

    /// CPU-core limit per container. Zero leaves it unbounded.
    pub container_cpus: f64,

    /// Analyzer task-count bounds.
    pub min_tasks: u32,
    pub max_tasks: u32,

    /// Truncate captured container output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Free-text hints passed through to prompts, opaque to the engine.
    pub work_style: String,
    pub coding_style: String,

    /// Hand agents the SSH form of the host repository remote.
    pub use_ssh_remote: bool,

    pub proxy: ProxyConfig,
    pub agents: AgentsConfig,
    pub recovery: RecoveryConfig,
}

/// Dirty-working-tree recovery strategies for the patch committer.
/// Composed with short-circuit priority: auto-stash before auto-commit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Stash tracked changes before processing; restore after.
    pub auto_stash: bool,
    /// Also stash untracked files.
    pub stash_untracked: bool,
    /// Commit dirty state onto the current branch before processing.
    pub auto_commit: bool,
    /// Treat untracked files as absent for cleanliness checks.
    pub ignore_untracked: bool,
    /// Create a backup branch at the current tip before any state change.
    pub backup_branch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentFamily::Claude,
            image: "ubuntu:24.04".to_string(),
            max_containers: 10,
            max_parallel_containers: 3,
            container_timeout_secs: 60 * 60,
            container_memory_mb: 4096,
            container_cpus: 2.0,
            min_tasks: 1,
            max_tasks: 10,
            output_limit_bytes: 1_000_000,
            work_style: String::new(),
            coding_style: String::new(),
            use_ssh_remote: false,
            proxy: ProxyConfig::default(),
            agents: AgentsConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Environment pairs passed to every container, lowercase and uppercase.
    pub fn container_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        for (lower, upper, value) in [
            ("http_proxy", "HTTP_PROXY", &self.http_proxy),
            ("https_proxy", "HTTPS_PROXY", &self.https_proxy),
            ("no_proxy", "NO_PROXY", &self.no_proxy),
        ] {
            if let Some(value) = value {
                env.push((lower.to_string(), value.clone()));
                env.push((upper.to_string(), value.clone()));
            }
        }
        env
    }
}

/// Per-family agent settings, keyed by [`AgentFamily`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    pub claude: FamilyConfig,
    pub gemini: FamilyConfig,
    pub codex: FamilyConfig,
    pub qwen: FamilyConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        let mut claude = FamilyConfig::with_install("@anthropic-ai/claude-code", "ANTHROPIC_API_KEY");
        claude.base_url_env = Some("ANTHROPIC_BASE_URL".to_string());
        Self {
            claude,
            gemini: FamilyConfig::with_install("@google/gemini-cli", "GEMINI_API_KEY"),
            codex: FamilyConfig::with_install("@openai/codex", "OPENAI_API_KEY"),
            qwen: FamilyConfig::with_install("@qwen-code/qwen-code", "DASHSCOPE_API_KEY"),
        }
    }
}

impl AgentsConfig {
    pub fn family(&self, family: AgentFamily) -> &FamilyConfig {
        match family {
            AgentFamily::Claude => &self.claude,
            AgentFamily::Gemini => &self.gemini,
            AgentFamily::Codex => &self.codex,
            AgentFamily::Qwen => &self.qwen,
        }
    }

    fn family_mut(&mut self, family: AgentFamily) -> &mut FamilyConfig {
        match family {
            AgentFamily::Claude => &mut self.claude,
            AgentFamily::Gemini => &mut self.gemini,
            AgentFamily::Codex => &mut self.codex,
            AgentFamily::Qwen => &mut self.qwen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FamilyConfig {
    /// Credential value exported into the agent invocation. Empty when the
    /// agent needs no credentials.
    pub api_key: String,

    /// Environment variable the credential is exported as.
    pub api_key_env: String,

    /// Whether the credential must be exported for this family.
    pub export_key: bool,

    /// Optional backend endpoint override.
    pub base_url: Option<String>,

    /// Environment variable the endpoint override is exported as.
    pub base_url_env: Option<String>,

    /// Package installed to provision the agent binary.
    pub install_package: String,

    /// Optional registry override for the install step.
    pub registry: Option<String>,

    /// Clear inherited proxy variables around the install step when the
    /// install source is not reachable through the proxy.
    pub clear_proxy_for_install: bool,

    /// Family-specific extra invocation flags.
    pub extra_args: Vec<String>,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_key_env: String::new(),
            export_key: false,
            base_url: None,
            base_url_env: None,
            install_package: String::new(),
            registry: None,
            clear_proxy_for_install: false,
            extra_args: Vec::new(),
        }
    }
}

impl FamilyConfig {
    fn with_install(package: &str, api_key_env: &str) -> Self {
        Self {
            install_package: package.to_string(),
            api_key_env: api_key_env.to_string(),
            ..Self::default()
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(anyhow!("image must be non-empty"));
        }
        if self.max_parallel_containers == 0 {
            return Err(anyhow!("max_parallel_containers must be > 0"));
        }
        if self.max_parallel_containers > self.max_containers {
            return Err(anyhow!(
                "max_parallel_containers ({}) must not exceed max_containers ({})",
                self.max_parallel_containers,
                self.max_containers
            ));
        }
        if self.min_tasks > self.max_tasks {
            return Err(anyhow!(
                "min_tasks ({}) must not exceed max_tasks ({})",
                self.min_tasks,
                self.max_tasks
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        let family = self.agents.family(self.agent);
        if family.install_package.trim().is_empty() {
            return Err(anyhow!("agents.{}.install_package must be set", self.agent));
        }
        // A family either needs no credentials, or has a value that is
        // actually exported. The two half-configured states are rejected.
        if family.export_key && family.api_key.is_empty() {
            return Err(anyhow!(
                "agents.{}.export_key is set but api_key is empty",
                self.agent
            ));
        }
        if family.export_key && family.api_key_env.trim().is_empty() {
            return Err(anyhow!(
                "agents.{}.api_key_env must name the credential variable",
                self.agent
            ));
        }
        if !family.export_key && !family.api_key.is_empty() {
            return Err(anyhow!(
                "agents.{}.api_key is set but export_key is false",
                self.agent
            ));
        }
        Ok(())
    }

    pub fn container_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.container_timeout_secs)
    }

    pub fn active_family(&self) -> &FamilyConfig {
        self.agents.family(self.agent)
    }
}

/// Default path of the user-global config file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("taskfarm").join("config.toml"))
}

/// Load effective configuration: global file, overlaid by the project file,
/// overlaid by environment variables. Missing files contribute nothing.
pub fn load_config(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
    let mut merged = toml::Table::new();
    for path in [global, project].into_iter().flatten() {
        if !path.exists() {
            continue;
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let layer: toml::Table =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        merge_table(&mut merged, layer);
    }
    let mut cfg: Config = toml::Value::Table(merged)
        .try_into()
        .context("deserialize merged config")?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn merge_table(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_table(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `TASKFARM_*` overrides from an environment lookup.
pub fn apply_env_overrides(
    cfg: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

    if let Some(agent) = get("AGENT") {
        cfg.agent = agent
            .parse()
            .map_err(|err: String| anyhow!("{}AGENT: {err}", ENV_PREFIX))?;
    }
    if let Some(image) = get("IMAGE") {
        cfg.image = image;
    }
    parse_into(&mut cfg.max_containers, get("MAX_CONTAINERS"), "MAX_CONTAINERS")?;
    parse_into(
        &mut cfg.max_parallel_containers,
        get("MAX_PARALLEL_CONTAINERS"),
        "MAX_PARALLEL_CONTAINERS",
    )?;
    parse_into(
        &mut cfg.container_timeout_secs,
        get("CONTAINER_TIMEOUT_SECS"),
        "CONTAINER_TIMEOUT_SECS",
    )?;
    parse_into(
        &mut cfg.container_memory_mb,
        get("CONTAINER_MEMORY_MB"),
        "CONTAINER_MEMORY_MB",
    )?;
    parse_into(&mut cfg.container_cpus, get("CONTAINER_CPUS"), "CONTAINER_CPUS")?;
    parse_into(&mut cfg.min_tasks, get("MIN_TASKS"), "MIN_TASKS")?;
    parse_into(&mut cfg.max_tasks, get("MAX_TASKS"), "MAX_TASKS")?;
    parse_into(&mut cfg.use_ssh_remote, get("USE_SSH_REMOTE"), "USE_SSH_REMOTE")?;
    if let Some(style) = get("WORK_STYLE") {
        cfg.work_style = style;
    }
    if let Some(style) = get("CODING_STYLE") {
        cfg.coding_style = style;
    }
    if let Some(proxy) = get("HTTP_PROXY") {
        cfg.proxy.http_proxy = Some(proxy);
    }
    if let Some(proxy) = get("HTTPS_PROXY") {
        cfg.proxy.https_proxy = Some(proxy);
    }
    if let Some(proxy) = get("NO_PROXY") {
        cfg.proxy.no_proxy = Some(proxy);
    }

    for family in AgentFamily::ALL {
        let upper = family.to_string().to_uppercase();
        let entry = cfg.agents.family_mut(family);
        if let Some(key) = lookup(&format!("{ENV_PREFIX}{upper}_API_KEY")) {
            entry.api_key = key;
            entry.export_key = true;
        }
        if let Some(url) = lookup(&format!("{ENV_PREFIX}{upper}_BASE_URL")) {
            entry.base_url = Some(url);
        }
    }
    Ok(())
}

fn parse_into<T: std::str::FromStr>(
    slot: &mut T,
    raw: Option<String>,
    name: &str,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = raw {
        *slot = raw
            .parse()
            .map_err(|err| anyhow!("{ENV_PREFIX}{name}={raw}: {err}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_files_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(
            Some(&temp.path().join("missing-global.toml")),
            Some(&temp.path().join("missing-project.toml")),
        )
        .expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = Config::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(Some(&path), None).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn project_layer_overrides_global() {
        let temp = tempfile::tempdir().expect("tempdir");
        let global = temp.path().join("global.toml");
        let project = temp.path().join("project.toml");
        fs::write(&global, "image = \"alpine\"\nmax_parallel_containers = 2\n").expect("write");
        fs::write(&project, "image = \"ubuntu:24.04\"\n").expect("write");

        let cfg = load_config(Some(&global), Some(&project)).expect("load");
        assert_eq!(cfg.image, "ubuntu:24.04");
        assert_eq!(cfg.max_parallel_containers, 2);
    }

    #[test]
    fn nested_tables_merge_instead_of_replacing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let global = temp.path().join("global.toml");
        let project = temp.path().join("project.toml");
        fs::write(
            &global,
            "[agents.claude]\napi_key = \"k1\"\nexport_key = true\n",
        )
        .expect("write");
        fs::write(&project, "[agents.claude]\nbase_url = \"https://llm.internal\"\n")
            .expect("write");

        let cfg = load_config(Some(&global), Some(&project)).expect("load");
        assert_eq!(cfg.agents.claude.api_key, "k1");
        assert_eq!(
            cfg.agents.claude.base_url.as_deref(),
            Some("https://llm.internal")
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg, |key| match key {
            "TASKFARM_AGENT" => Some("gemini".to_string()),
            "TASKFARM_MAX_PARALLEL_CONTAINERS" => Some("5".to_string()),
            "TASKFARM_GEMINI_API_KEY" => Some("secret".to_string()),
            _ => None,
        })
        .expect("overrides");
        assert_eq!(cfg.agent, AgentFamily::Gemini);
        assert_eq!(cfg.max_parallel_containers, 5);
        assert_eq!(cfg.agents.gemini.api_key, "secret");
        assert!(cfg.agents.gemini.export_key);
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        let mut cfg = Config::default();
        let err = apply_env_overrides(&mut cfg, |key| {
            (key == "TASKFARM_MAX_TASKS").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("TASKFARM_MAX_TASKS"));
    }

    #[test]
    fn parallel_cap_must_not_exceed_total() {
        let cfg = Config {
            max_containers: 2,
            max_parallel_containers: 3,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn task_bounds_must_be_ordered() {
        let cfg = Config {
            min_tasks: 5,
            max_tasks: 2,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn credential_states_must_be_consistent() {
        let mut cfg = Config::default();
        cfg.agents.claude.export_key = true;
        assert!(cfg.validate().is_err());

        cfg.agents.claude.export_key = false;
        cfg.agents.claude.api_key = "sk-test".to_string();
        assert!(cfg.validate().is_err());

        cfg.agents.claude.export_key = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn proxy_env_pairs_cover_both_cases() {
        let proxy = ProxyConfig {
            http_proxy: Some("http://p:3128".to_string()),
            https_proxy: None,
            no_proxy: Some("localhost".to_string()),
        };
        let env = proxy.container_env();
        assert!(env.contains(&("http_proxy".to_string(), "http://p:3128".to_string())));
        assert!(env.contains(&("HTTP_PROXY".to_string(), "http://p:3128".to_string())));
        assert!(env.contains(&("NO_PROXY".to_string(), "localhost".to_string())));
        assert_eq!(env.len(), 4);
    }
}
