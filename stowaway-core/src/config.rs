//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/stowaway/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/stowaway/` (~/.config/stowaway/)
//! - Offline cache: `$XDG_CACHE_HOME/stowaway/` (~/.cache/stowaway/)
//! - State/Logs: `$XDG_STATE_HOME/stowaway/` (~/.local/state/stowaway/)

use crate::dispatch::{CacheAge, DispatchMode};
use crate::error::{Error, Result};
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_CACHE_HOME or ~/.cache
fn xdg_cache_home() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".cache"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collector endpoint and dispatch behavior
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Offline cache retention
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector endpoint and dispatch settings
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Collector endpoint, e.g. `https://analytics.example.com/matomo.php`
    pub endpoint: Option<String>,

    /// Optional `token_auth` added to bulk POST bodies
    pub auth_token: Option<String>,

    /// Pause between dispatch cycles in milliseconds (negative = manual only)
    #[serde(default = "default_dispatch_interval")]
    pub interval_ms: i64,

    /// Connect/read timeout for one packet in milliseconds
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_ms: u64,

    /// Gzip POST bodies
    #[serde(default)]
    pub gzip: bool,

    /// When dispatching is allowed
    #[serde(default)]
    pub mode: DispatchMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            interval_ms: default_dispatch_interval(),
            timeout_ms: default_dispatch_timeout(),
            gzip: false,
            mode: DispatchMode::default(),
        }
    }
}

fn default_dispatch_interval() -> i64 {
    120_000
}

fn default_dispatch_timeout() -> u64 {
    5_000
}

impl DispatchConfig {
    /// Create a config for the given endpoint with default settings
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        self.endpoint_url()?;
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "dispatch.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the endpoint, requiring a host to scope the offline cache by
    pub fn endpoint_url(&self) -> Result<Url> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("dispatch.endpoint is required".to_string()))?;

        let url = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid dispatch.endpoint '{}': {}", endpoint, e)))?;

        if url.host_str().is_none() {
            return Err(Error::Config(format!(
                "dispatch.endpoint '{}' has no host",
                endpoint
            )));
        }
        Ok(url)
    }

    /// Connect/read timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Offline cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum record age in milliseconds (negative = caching disabled, 0 = unlimited)
    #[serde(default = "default_cache_max_age")]
    pub max_age_ms: i64,

    /// Maximum total size of cache containers in bytes (0 = unlimited)
    #[serde(default = "default_cache_max_size")]
    pub max_size_bytes: u64,

    /// Override for the cache root directory
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: default_cache_max_age(),
            max_size_bytes: default_cache_max_size(),
            dir: None,
        }
    }
}

fn default_cache_max_age() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_cache_max_size() -> u64 {
    4 * 1024 * 1024
}

impl CacheConfig {
    /// Retention age policy derived from `max_age_ms`
    pub fn max_age(&self) -> CacheAge {
        CacheAge::from_millis(self.max_age_ms)
    }

    /// Cache root directory, before scoping by collector host
    pub fn root_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(Config::cache_dir)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/stowaway/config.toml` (~/.config/stowaway/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("stowaway").join("config.toml")
    }

    /// Returns the default offline cache root
    ///
    /// `$XDG_CACHE_HOME/stowaway/` (~/.cache/stowaway/)
    pub fn cache_dir() -> PathBuf {
        xdg_cache_home().join("stowaway")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/stowaway/` (~/.local/state/stowaway/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("stowaway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.dispatch.endpoint.is_none());
        assert_eq!(config.dispatch.interval_ms, 120_000);
        assert_eq!(config.dispatch.timeout_ms, 5_000);
        assert!(!config.dispatch.gzip);
        assert_eq!(config.dispatch.mode, DispatchMode::Always);
        assert_eq!(config.cache.max_age_ms, 86_400_000);
        assert_eq!(config.cache.max_size_bytes, 4 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[dispatch]
endpoint = "https://analytics.example.com/matomo.php"
auth_token = "abc123"
interval_ms = -1
gzip = true
mode = "wifi_only"

[cache]
max_age_ms = 0
max_size_bytes = 1024
dir = "/tmp/stowaway-cache"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.dispatch.endpoint.as_deref(),
            Some("https://analytics.example.com/matomo.php")
        );
        assert_eq!(config.dispatch.auth_token.as_deref(), Some("abc123"));
        assert_eq!(config.dispatch.interval_ms, -1);
        assert!(config.dispatch.gzip);
        assert_eq!(config.dispatch.mode, DispatchMode::WifiOnly);
        assert_eq!(config.cache.max_age(), CacheAge::Unlimited);
        assert_eq!(config.cache.max_size_bytes, 1024);
        assert_eq!(
            config.cache.root_dir(),
            PathBuf::from("/tmp/stowaway-cache")
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_transient_offline_is_not_configurable() {
        let toml = r#"
[dispatch]
mode = "transient_offline"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_dispatch_config_validation() {
        // Endpoint is required
        let config = DispatchConfig::default();
        assert!(config.validate().is_err());

        // Malformed endpoint fails fast
        let config = DispatchConfig::with_endpoint("not a url");
        assert!(config.validate().is_err());

        // Endpoint without a host has nothing to scope the cache by
        let config = DispatchConfig::with_endpoint("file:///tmp/collector");
        assert!(config.validate().is_err());

        let config = DispatchConfig {
            timeout_ms: 0,
            ..DispatchConfig::with_endpoint("https://analytics.example.com/matomo.php")
        };
        assert!(config.validate().is_err());

        let config = DispatchConfig::with_endpoint("https://analytics.example.com/matomo.php");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.endpoint_url().unwrap().host_str(),
            Some("analytics.example.com")
        );
    }

    #[test]
    fn test_cache_age_from_config() {
        let mut config = CacheConfig::default();
        assert_eq!(
            config.max_age(),
            CacheAge::Limit(Duration::from_millis(86_400_000))
        );
        config.max_age_ms = -1;
        assert_eq!(config.max_age(), CacheAge::Disabled);
    }
}
