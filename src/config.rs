#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::fetch::aggregator::DEFAULT_AGGREGATOR_BASE_URL;
use crate::fetch::official::{DEFAULT_OFFICIAL_BASE_URL, MAX_PAGE_SIZE};
use crate::reconcile::DEFAULT_RECONCILE_MAX_RESULTS;
use crate::staging::DEFAULT_STAGING_TTL;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_COMMENTVAULT_PORT: u16 = 8080;
pub const DEFAULT_COMMENTVAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_path: PathBuf,
    pub official_base_url: String,
    pub official_api_key: Option<String>,
    pub aggregator_base_url: String,
    pub aggregator_api_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub settings: PipelineSettings,
}

/// Tuning knobs read from the optional `PIPELINE_SETTINGS` TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub staging_ttl_secs: u64,
    pub reconcile_max_results: usize,
    pub metadata_timeout_secs: u64,
    pub comments_timeout_secs: u64,
    pub page_size: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            staging_ttl_secs: DEFAULT_STAGING_TTL.as_secs(),
            reconcile_max_results: DEFAULT_RECONCILE_MAX_RESULTS,
            metadata_timeout_secs: 10,
            comments_timeout_secs: 30,
            page_size: MAX_PAGE_SIZE,
        }
    }
}

impl PipelineSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut settings: Self = toml::from_str(raw).context("Parsing pipeline settings")?;
        settings.page_size = settings.page_size.clamp(1, MAX_PAGE_SIZE);
        settings.reconcile_max_results = settings.reconcile_max_results.max(1);
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Loading {}", path.display()))
    }

    pub fn staging_ttl(&self) -> Duration {
        Duration::from_secs(self.staging_ttl_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn comments_timeout(&self) -> Duration {
        Duration::from_secs(self.comments_timeout_secs)
    }
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub settings_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let database_path = overrides
        .database_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("DATABASE_PATH"))
        .ok_or_else(|| anyhow!("DATABASE_PATH not set"))?;
    let port = overrides
        .port
        .or_else(|| lookup("COMMENTVAULT_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_COMMENTVAULT_PORT);
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup("COMMENTVAULT_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_COMMENTVAULT_HOST.to_string());
    let settings = match overrides
        .settings_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("PIPELINE_SETTINGS"))
    {
        Some(path) => PipelineSettings::load(Path::new(&path))?,
        None => PipelineSettings::default(),
    };

    Ok(RuntimeConfig {
        database_path: PathBuf::from(database_path),
        official_base_url: lookup("PROVIDER_A_BASE_URL")
            .unwrap_or_else(|| DEFAULT_OFFICIAL_BASE_URL.to_string()),
        official_api_key: lookup("PROVIDER_A_API_KEY"),
        aggregator_base_url: lookup("PROVIDER_B_BASE_URL")
            .unwrap_or_else(|| DEFAULT_AGGREGATOR_BASE_URL.to_string()),
        aggregator_api_key: lookup("PROVIDER_B_API_KEY"),
        host,
        port,
        settings,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
