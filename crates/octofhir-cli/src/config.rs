use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use octofhir_smart_client::{GrantKind, SmartClientConfig};
use serde::{Deserialize, Serialize};

/// Settings keys accepted by `octofhir config set`.
pub const SETTABLE_KEYS: &[&str] = &[
    "server",
    "format",
    "client_id",
    "client_secret",
    "scope",
    "redirect_uri",
    "grant",
    "use_pkce",
    "audience",
    "context_field",
];

/// One profile in `~/.octofhir/config.toml`.
///
/// ```toml
/// [default]
/// server = "https://launch.smarthealthit.org/v/r4/fhir"
///
/// [default.auth]
/// client_id = "growth_chart"
/// redirect_uri = "http://localhost:8765/callback"
/// use_pkce = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub auth: SmartClientConfig,
}

impl ProfileConfig {
    /// Applies a `config set` key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let auth = &mut self.auth;
        match key {
            "server" => self.server = Some(value.to_string()),
            "format" => self.format = Some(value.to_string()),
            "client_id" => auth.client_id = value.to_string(),
            "client_secret" => {
                auth.client_secret = Some(value.to_string()).filter(|s| !s.is_empty());
            }
            "scope" => auth.scope = value.to_string(),
            "redirect_uri" => auth.redirect_uri = value.to_string(),
            "grant" => auth.grant = value.parse::<GrantKind>()?.as_str().to_string(),
            "use_pkce" => {
                auth.use_pkce = value
                    .parse()
                    .with_context(|| format!("use_pkce must be true or false, got \"{value}\""))?;
            }
            "audience" => auth.audience = Some(value.to_string()).filter(|s| !s.is_empty()),
            "context_field" => auth.context_field = value.to_string(),
            other => anyhow::bail!(
                "Unknown config key: {other}. Valid keys: {}",
                SETTABLE_KEYS.join(", ")
            ),
        }
        Ok(())
    }
}

pub type ConfigFile = HashMap<String, ProfileConfig>;

pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("Cannot determine home directory")?
        .join(".octofhir");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

fn load_from(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::new());
    }
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

fn save_to(path: &Path, profile: &str, config: &ProfileConfig) -> Result<()> {
    let mut all = load_from(path)?;
    all.insert(profile.to_string(), config.clone());
    let content = toml::to_string_pretty(&all)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_profile(profile: &str) -> Result<ProfileConfig> {
    let mut all = load_from(&config_path()?)?;
    Ok(all.remove(profile).unwrap_or_default())
}

pub fn save_profile(profile: &str, config: &ProfileConfig) -> Result<()> {
    save_to(&config_path()?, profile, config)
}

pub fn resolve_server(cli_server: &Option<String>, config: &ProfileConfig) -> Result<String> {
    // 1. --server flag / OCTOFHIR_URL env
    if let Some(s) = cli_server {
        return Ok(s.clone());
    }
    // 2. config.toml profile
    if let Some(s) = &config.server {
        return Ok(s.clone());
    }
    anyhow::bail!(
        "No server URL configured. Use --server, set OCTOFHIR_URL env var, or run: octofhir config set server <url>"
    )
}
