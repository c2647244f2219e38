//! Application configuration management.
//!
//! Configuration is stored at `~/.config/stockhub/config.json`. Missing
//! files yield defaults; `STOCKHUB_*` environment variables override
//! whatever the file says.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "stockhub";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://localhost:8000/api";
const DEFAULT_AUTH_URL: &str = "http://localhost:54321/auth/v1";

/// Start-up waits this long for the identity provider before showing sign-in.
const DEFAULT_INIT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_API_URL: &str = "STOCKHUB_API_URL";
const ENV_AUTH_URL: &str = "STOCKHUB_AUTH_URL";
const ENV_AUTH_KEY: &str = "STOCKHUB_AUTH_KEY";
const ENV_INIT_TIMEOUT: &str = "STOCKHUB_INIT_TIMEOUT_SECS";
const ENV_REQUEST_TIMEOUT: &str = "STOCKHUB_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the inventory API, including its `/api` prefix
    pub api_url: String,
    /// Base URL of the identity provider's auth endpoints
    pub auth_url: String,
    /// Public (anon) key sent to the identity provider
    pub auth_key: String,
    pub init_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Pre-fills the sign-in prompt
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_key: String::new(),
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse config file contents. Zero timeouts fall back to the defaults,
    /// the same as zero values from the environment.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(contents).context("Failed to parse config file")?;
        if config.init_timeout_secs == 0 {
            warn!("Ignoring zero init_timeout_secs in config file");
            config.init_timeout_secs = DEFAULT_INIT_TIMEOUT_SECS;
        }
        if config.request_timeout_secs == 0 {
            warn!("Ignoring zero request_timeout_secs in config file");
            config.request_timeout_secs = DEFAULT_REQUEST_TIMEOUT_SECS;
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(url) = lookup(ENV_AUTH_URL) {
            self.auth_url = url;
        }
        if let Some(key) = lookup(ENV_AUTH_KEY) {
            self.auth_key = key;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_INIT_TIMEOUT) {
            self.init_timeout_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_REQUEST_TIMEOUT) {
            self.request_timeout_secs = secs;
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(secs),
        _ => {
            warn!(key, value = %raw, "Ignoring invalid timeout override");
            None
        }
    }
}
