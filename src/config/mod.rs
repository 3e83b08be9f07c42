// Configuration loader
// Loads settings from ~/.casework/config.toml, with environment variables
// taking precedence. Running without a credential is supported: the server
// falls back to deterministic fixture output.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3001";
pub const DEFAULT_DB_FILE: &str = "casework.db";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TRUNCATION_RETRIES: u32 = 1;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub db_path: PathBuf,
    /// None means fixture mode: agents run with canned deterministic output.
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub truncation_retries: u32,
}

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    bind_address: Option<String>,
    #[serde(default)]
    db_path: Option<PathBuf>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    truncation_retries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: crate::agents::prompts::DEFAULT_MODEL.to_string(),
            truncation_retries: DEFAULT_TRUNCATION_RETRIES,
        }
    }
}

impl Config {
    pub fn fixture_mode(&self) -> bool {
        self.api_key.as_deref().map_or(true, str::is_empty)
    }
}

/// Load configuration: file first, environment on top.
pub fn load_config() -> Result<Config> {
    let mut config = Config::default();

    if let Some(file) = try_load_config_file()? {
        if let Some(bind) = file.bind_address {
            config.bind_address = bind;
        }
        if let Some(db) = file.db_path {
            config.db_path = db;
        }
        if let Some(key) = file.api_key {
            config.api_key = Some(key);
        }
        if let Some(url) = file.base_url {
            config.base_url = url;
        }
        if let Some(model) = file.model {
            config.default_model = model;
        }
        if let Some(retries) = file.truncation_retries {
            config.truncation_retries = retries;
        }
    }

    if let Ok(key) = std::env::var("CASEWORK_API_KEY") {
        if !key.is_empty() {
            config.api_key = Some(key);
        }
    }
    if let Ok(url) = std::env::var("CASEWORK_BASE_URL") {
        if !url.is_empty() {
            config.base_url = url;
        }
    }

    if config.fixture_mode() {
        tracing::info!(
            "no API key configured (CASEWORK_API_KEY or ~/.casework/config.toml), \
             agents will return fixture output"
        );
    }

    Ok(config)
}

fn try_load_config_file() -> Result<Option<TomlConfig>> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let config_path = home.join(".casework/config.toml");

    if !config_path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let parsed: TomlConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixture_mode() {
        assert!(Config::default().fixture_mode());
    }

    #[test]
    fn test_empty_key_is_fixture_mode() {
        let config = Config {
            api_key: Some(String::new()),
            ..Config::default()
        };
        assert!(config.fixture_mode());
    }

    #[test]
    fn test_toml_overlay_parses_partial_file() {
        let parsed: TomlConfig = toml::from_str("api_key = \"sk-test\"\nmodel = \"gpt-5\"").unwrap();
        assert_eq!(parsed.api_key.as_deref(), Some("sk-test"));
        assert_eq!(parsed.model.as_deref(), Some("gpt-5"));
        assert!(parsed.bind_address.is_none());
    }
}
