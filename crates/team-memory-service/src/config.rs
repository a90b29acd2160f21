use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use team_memory_api::EngineConfig;
use team_memory_core::{UnknownConditionPolicy, DEFAULT_AUDIT_CAPACITY};

const DEFAULT_DB_PATH: &str = "./team_memory.sqlite3";
const DEFAULT_BIND: &str = "127.0.0.1:4020";
const DEFAULT_TEAM_ID: &str = "default";

#[derive(Debug, Parser)]
#[command(name = "team-memory-service")]
#[command(about = "Local HTTP service for the team memory engine")]
pub struct Args {
    /// YAML file with any of `db`, `bind`, `team_id`, `audit_capacity`, `unknown_conditions`.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub db: Option<PathBuf>,
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    #[arg(long)]
    pub team_id: Option<String>,
    #[arg(long)]
    pub audit_capacity: Option<usize>,
    /// `fail_closed` (default) or `fail_open`.
    #[arg(long, value_parser = parse_unknown_conditions)]
    pub unknown_conditions: Option<UnknownConditionPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub db: Option<PathBuf>,
    #[serde(default)]
    pub bind: Option<SocketAddr>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub audit_capacity: Option<usize>,
    #[serde(default)]
    pub unknown_conditions: Option<UnknownConditionPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub engine: EngineConfig,
}

fn parse_unknown_conditions(raw: &str) -> Result<UnknownConditionPolicy, String> {
    UnknownConditionPolicy::parse(raw)
        .ok_or_else(|| format!("expected `fail_closed` or `fail_open`, got `{raw}`"))
}

/// # Errors
/// Returns an error when the file cannot be read or is not valid YAML for [`FileConfig`].
pub fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Merge command-line flags over the config file over built-in defaults.
///
/// # Errors
/// Returns an error when the config file is unreadable or a resolved value is invalid.
pub fn resolve(args: Args) -> Result<ServiceConfig> {
    let file = match args.config.as_deref() {
        Some(path) => load_file(path)?,
        None => FileConfig::default(),
    };

    let bind = match args.bind.or(file.bind) {
        Some(bind) => bind,
        None => DEFAULT_BIND.parse().context("invalid default bind address")?,
    };
    let team_id = args.team_id.or(file.team_id).unwrap_or_else(|| DEFAULT_TEAM_ID.to_string());
    if team_id.trim().is_empty() {
        return Err(anyhow!("team id MUST be non-empty"));
    }
    let audit_capacity =
        args.audit_capacity.or(file.audit_capacity).unwrap_or(DEFAULT_AUDIT_CAPACITY);
    if audit_capacity == 0 {
        return Err(anyhow!("audit capacity MUST be at least 1"));
    }

    let mut engine = EngineConfig::new(
        args.db.or(file.db).unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
        team_id,
    );
    engine.audit_capacity = audit_capacity;
    engine.unknown_condition_policy =
        args.unknown_conditions.or(file.unknown_conditions).unwrap_or_default();

    Ok(ServiceConfig { bind, engine })
}
