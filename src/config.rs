use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::AgentProfile;
use crate::batch::DEFAULT_BATCH_CONCURRENCY;
use crate::cli::*;
use crate::graph::DEFAULT_MAX_STEPS;
use crate::model::ChatModel;
use crate::team::{
    DEFAULT_LEADER_CAPACITY, DEFAULT_WORKER_CAPACITY, TeamBlueprint, default_leader_profile,
    default_worker_profiles,
};
use crate::tools::http::{HttpTool, HttpToolConfig};
use crate::tools::{DEFAULT_TOOL_TIMEOUT_SECS, ToolRegistry};

pub const DEFAULT_CONFIG_PATH: &str = ".teamcheck/config.toml";
pub const DEFAULT_TEAM_PATH: &str = ".teamcheck/team.toml";
pub const DEFAULT_TELEMETRY_PATH: &str = ".teamcheck/telemetry/events.jsonl";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TOOL_RETRY_ATTEMPTS: u32 = 2;
const DEFAULT_TOOL_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub team_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub formatter_model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_steps: usize,
    pub tool_timeout_secs: u64,
    pub tool_retry_attempts: u32,
    pub tool_retry_delay_ms: u64,
    pub concurrency: usize,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub formatter_model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub max_steps: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub tool_retry_attempts: Option<u32>,
    pub tool_retry_delay_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
    pub team_path: Option<String>,
}

/// One agent in the team file. Omitted descriptions fall back to the
/// built-in role text.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDefinition {
    pub name: String,
    pub role_description: Option<String>,
    pub task_description: Option<String>,
    pub tools: Option<Vec<String>>,
    pub capacity: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamFile {
    pub leader: Option<AgentDefinition>,
    #[serde(default)]
    pub workers: Vec<AgentDefinition>,
    #[serde(default)]
    pub tools: Vec<HttpToolConfig>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check provider values and field names.",
            path.display()
        )
    })
}

pub fn load_team_file(team_path: &str) -> Result<TeamFile> {
    let path = Path::new(team_path);
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no team file, using the built-in team");
        return Ok(TeamFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read team file at '{}'", path.display()))?;
    toml::from_str::<TeamFile>(&content).with_context(|| {
        format!(
            "invalid team file '{}'. Check agent and tool field names.",
            path.display()
        )
    })
}

/// The named profile, or an empty one when "default" is asked for but not
/// defined.
fn select_profile(cli: &Cli, profiles: &ProfilesFile) -> Result<(String, ProfileConfig)> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        anyhow::bail!("profile name cannot be empty. Set --profile <name>.");
    }
    if let Some(profile) = profiles.profiles.get(selected) {
        return Ok((selected.to_string(), profile.clone()));
    }
    if selected == "default" {
        return Ok((selected.to_string(), ProfileConfig::default()));
    }

    let mut names = profiles.profiles.keys().map(String::as_str).collect::<Vec<_>>();
    names.sort_unstable();
    let available = if names.is_empty() {
        "No profiles are defined yet.".to_string()
    } else {
        format!("Available profiles: {}", names.join(", "))
    };
    anyhow::bail!(
        "profile '{selected}' not found in '{}'. {available}",
        cli.config_path
    )
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let (selected, profile) = select_profile(cli, profiles)?;

    let provider = if cli.provider != Provider::Auto {
        cli.provider
    } else {
        profile.provider.unwrap_or(Provider::Auto)
    };

    // An explicit --team-path wins; otherwise the profile may point elsewhere.
    let team_path = if cli.team_path != DEFAULT_TEAM_PATH {
        cli.team_path.clone()
    } else {
        profile
            .team_path
            .clone()
            .unwrap_or_else(|| cli.team_path.clone())
    };

    Ok(RuntimeConfig {
        profile: selected,
        config_path: cli.config_path.clone(),
        team_path,
        provider,
        model: cli.model.clone().or(profile.model),
        formatter_model: cli.formatter_model.clone().or(profile.formatter_model),
        base_url: cli.base_url.clone().or(profile.base_url),
        request_timeout_secs: cli
            .request_timeout_secs
            .or(profile.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
            .max(1),
        max_steps: cli
            .max_steps
            .or(profile.max_steps)
            .unwrap_or(DEFAULT_MAX_STEPS)
            .max(1),
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
            .max(1),
        tool_retry_attempts: cli
            .tool_retry_attempts
            .or(profile.tool_retry_attempts)
            .unwrap_or(DEFAULT_TOOL_RETRY_ATTEMPTS)
            .max(1),
        tool_retry_delay_ms: cli
            .tool_retry_delay_ms
            .or(profile.tool_retry_delay_ms)
            .unwrap_or(DEFAULT_TOOL_RETRY_DELAY_MS),
        concurrency: profile
            .concurrency
            .unwrap_or(DEFAULT_BATCH_CONCURRENCY)
            .max(1),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| DEFAULT_TELEMETRY_PATH.to_string()),
    })
}

fn leader_profile(def: Option<&AgentDefinition>) -> AgentProfile {
    let defaults = default_leader_profile();
    let Some(def) = def else {
        return defaults;
    };
    AgentProfile {
        name: def.name.trim().to_string(),
        role_description: def
            .role_description
            .clone()
            .unwrap_or(defaults.role_description),
        task_description: def
            .task_description
            .clone()
            .unwrap_or(defaults.task_description),
        tools: def.tools.clone(),
        capacity: def.capacity.unwrap_or(DEFAULT_LEADER_CAPACITY),
    }
}

fn worker_profile(def: &AgentDefinition) -> AgentProfile {
    let name = def.name.trim().to_string();
    let builtin = default_worker_profiles().into_iter().find(|w| w.name == name);
    let (role, task) = match builtin {
        Some(w) => (w.role_description, w.task_description),
        None => (
            format!("You are the {name} of a research group."),
            format!("Complete the sub-task the team leader assigns to {name} and report back."),
        ),
    };
    AgentProfile {
        role_description: def.role_description.clone().unwrap_or(role),
        task_description: def.task_description.clone().unwrap_or(task),
        tools: def.tools.clone(),
        capacity: def.capacity.unwrap_or(DEFAULT_WORKER_CAPACITY),
        name,
    }
}

/// Leader and worker profiles from the team file, falling back to the
/// built-in two-worker team when no workers are listed.
pub fn resolve_team_profiles(team: &TeamFile) -> (AgentProfile, Vec<AgentProfile>) {
    let leader = leader_profile(team.leader.as_ref());
    let workers = if team.workers.is_empty() {
        default_worker_profiles()
    } else {
        team.workers.iter().map(worker_profile).collect()
    };
    (leader, workers)
}

pub fn build_tool_registry(team: &TeamFile, cfg: &RuntimeConfig) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in &team.tools {
        let http = HttpTool::new(
            tool.clone(),
            cfg.tool_retry_attempts,
            cfg.tool_retry_delay_ms,
        );
        registry
            .register(Arc::new(http))
            .with_context(|| format!("invalid tool '{}' in team file", tool.name))?;
    }
    Ok(registry)
}

pub fn build_team_blueprint(
    cfg: &RuntimeConfig,
    team: &TeamFile,
    model: Arc<dyn ChatModel>,
    formatter: Option<Arc<dyn ChatModel>>,
) -> Result<TeamBlueprint> {
    let (leader, workers) = resolve_team_profiles(team);
    let registry = build_tool_registry(team, cfg)?;
    let mut blueprint = TeamBlueprint::new(model, leader, workers, registry)
        .with_context(|| format!("invalid team configuration from '{}'", cfg.team_path))?
        .with_max_steps(cfg.max_steps)
        .with_tool_timeout(Duration::from_secs(cfg.tool_timeout_secs));
    if let Some(formatter) = formatter {
        blueprint = blueprint.with_formatter(formatter);
    }
    Ok(blueprint)
}
