//! Configuration management for the courier client.
//!
//! Loads configuration from ${COURIER_HOME}/config.toml with sensible defaults.
//! `COURIER_API_URL` overrides the configured endpoint.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides `api_url`.
pub const API_URL_ENV: &str = "COURIER_API_URL";

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Courier client configuration.

# Base address of the authentication / API server.
api_url = "http://localhost:3105"

# Per-request timeout. A request that hangs past this fails as a transport error.
request_timeout_secs = 15

[refresh]
# Total attempts for a refresh exchange that fails at the transport level.
max_attempts = 3
initial_backoff_ms = 200
max_backoff_ms = 2000

[realtime]
order_event = "order"
announce_event = "acceptOrder"
announce_payload = "hello"

[log]
filter = "info"
# directory = "/var/log/courier"
"#;

pub mod paths {
    //! Path resolution for courier configuration and data.
    //!
    //! COURIER_HOME resolution order:
    //! 1. COURIER_HOME environment variable (if set)
    //! 2. ~/.config/courier (default)

    use std::path::PathBuf;

    /// Returns the courier home directory.
    pub fn courier_home() -> PathBuf {
        if let Ok(home) = std::env::var("COURIER_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("courier")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        courier_home().join("config.toml")
    }

    /// Returns the path of the file-backed secure storage.
    pub fn credentials_path() -> PathBuf {
        courier_home().join("credentials.json")
    }
}

/// Retry policy for refresh exchanges that fail at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Total attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
        }
    }
}

impl RefreshConfig {
    /// Delay before retry number `attempt` (0-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Realtime channel event names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Inbound event carrying a new order.
    pub order_event: String,
    /// Outbound readiness announcement sent once connected.
    pub announce_event: String,
    pub announce_payload: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            order_event: "order".to_string(),
            announce_event: "acceptOrder".to_string(),
            announce_payload: "hello".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// When set, logs also go to a daily-rolling file in this directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            directory: None,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base address of the authentication / API server.
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub refresh: RefreshConfig,
    pub realtime: RealtimeConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: Self::DEFAULT_API_URL.to_string(),
            request_timeout_secs: Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh: RefreshConfig::default(),
            realtime: RealtimeConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub const DEFAULT_API_URL: &'static str = "http://localhost:3105";
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

    /// Loads configuration from the default path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the resolved `api_url` is not a valid URL.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resolved `api_url` is not a valid URL.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        } else {
            Config::default()
        };

        let env_url = std::env::var(API_URL_ENV).ok();
        config.api_url = resolve_api_url(&config.api_url, env_url.as_deref())?;
        Ok(config)
    }

    /// Writes a commented default config file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("Config file already exists at {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Resolves the API base URL with precedence: env > config > default.
///
/// Trailing slashes are stripped so paths can be appended verbatim.
///
/// # Errors
/// Returns an error if the chosen value is not a valid URL.
pub fn resolve_api_url(config_url: &str, env_url: Option<&str>) -> Result<String> {
    let chosen = [env_url, Some(config_url)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .unwrap_or(Config::DEFAULT_API_URL);

    url::Url::parse(chosen).with_context(|| format!("Invalid API base URL: {chosen}"))?;
    Ok(chosen.trim_end_matches('/').to_string())
}
