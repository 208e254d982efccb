//! Configuration file handling for tollgate.
//!
//! Settings live in `~/.config/tollgate/config.toml` (or the platform
//! equivalent). Values resolve in this order (later overrides earlier):
//! 1. Hard-coded defaults (the engine's production limits)
//! 2. Config file
//! 3. Command-line arguments
//!
//! ## Example Config File
//!
//! ```toml
//! [engine]
//! window_hours = 48
//! max_downloads = 3
//! cooldown_seconds = 30
//!
//! [authority]
//! endpoint = "https://api.example.com/tollgate"
//! timeout_seconds = 10
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Entitlement limits and scheduler cadence
    #[serde(default)]
    pub engine: EngineConfig,

    /// Remote download-authority endpoint
    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Local persistence locations
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Entitlement limits and scheduler cadence.
///
/// Defaults reproduce the production limits exactly; overrides exist so a
/// staging operator can shrink the window instead of waiting 48 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of the post-purchase download window in hours
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Maximum successful downloads per purchase
    #[serde(default = "default_max_downloads")]
    pub max_downloads: u32,

    /// Mandatory wait between consecutive download requests, in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Countdown publication period in seconds
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    /// How many times a starting scheduler re-checks for presentation
    /// targets before giving up
    #[serde(default = "default_discovery_attempts")]
    pub target_discovery_attempts: u32,

    /// Delay between target-discovery attempts, in milliseconds
    #[serde(default = "default_discovery_delay_ms")]
    pub target_discovery_delay_ms: u64,
}

/// Remote download-authority endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Base URL of the authority backend. Empty means no remote side is
    /// configured and resets skip their remote leg.
    #[serde(default)]
    pub endpoint: String,

    /// Deadline for each authority call, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Local persistence locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding entitlement records, cooldown markers, the
    /// owned-products cache, and the last-reset marker. `None` uses the
    /// platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_window_hours() -> u64 {
    48
}

fn default_max_downloads() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_tick_seconds() -> u64 {
    1
}

fn default_discovery_attempts() -> u32 {
    5
}

fn default_discovery_delay_ms() -> u64 {
    200
}

fn default_timeout_seconds() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            max_downloads: default_max_downloads(),
            cooldown_seconds: default_cooldown_seconds(),
            tick_seconds: default_tick_seconds(),
            target_discovery_attempts: default_discovery_attempts(),
            target_discovery_delay_ms: default_discovery_delay_ms(),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

/// The limits the engine actually consults, in engine units (epoch ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineParams {
    pub window_ms: i64,
    pub max_downloads: u32,
    pub cooldown_ms: i64,
    pub tick_ms: u64,
    pub target_discovery_attempts: u32,
    pub target_discovery_delay_ms: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        EngineConfig::default().params()
    }
}

impl EngineConfig {
    pub fn params(&self) -> EngineParams {
        EngineParams {
            window_ms: (self.window_hours as i64) * 60 * 60 * 1000,
            max_downloads: self.max_downloads,
            cooldown_ms: (self.cooldown_seconds as i64) * 1000,
            tick_ms: self.tick_seconds.max(1) * 1000,
            target_discovery_attempts: self.target_discovery_attempts,
            target_discovery_delay_ms: self.target_discovery_delay_ms,
        }
    }
}

impl TollgateConfig {
    /// Default configuration file path:
    /// - Linux: `~/.config/tollgate/config.toml`
    /// - macOS: `~/Library/Application Support/tollgate/config.toml`
    /// - Windows: `%APPDATA%\tollgate\config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tollgate")
            .join("config.toml")
    }

    /// Directory for persisted state, honoring `storage.data_dir`.
    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tollgate"),
        }
    }

    /// Load from the default path.
    pub fn load() -> Self {
        Self::load_from(Self::default_path())
    }

    /// Load from a specific path. A missing file yields defaults silently;
    /// an unparsable one yields defaults with a warning, never a failure.
    pub fn load_from(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Self>(&content) {
                Ok(config) => {
                    tracing::debug!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config at {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!("Config file not found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Save to the default path.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(Self::default_path())
    }

    /// Save to a specific path, creating parent directories as needed.
    pub fn save_to(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&path, content)?;
        tracing::debug!("Saved config to {:?}", path);

        Ok(())
    }

    /// Get a configuration value by dot path, e.g. `engine.window_hours`.
    pub fn get(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "window_hours"] => Some(self.engine.window_hours.to_string()),
            ["engine", "max_downloads"] => Some(self.engine.max_downloads.to_string()),
            ["engine", "cooldown_seconds"] => Some(self.engine.cooldown_seconds.to_string()),
            ["engine", "tick_seconds"] => Some(self.engine.tick_seconds.to_string()),
            ["engine", "target_discovery_attempts"] => {
                Some(self.engine.target_discovery_attempts.to_string())
            }
            ["engine", "target_discovery_delay_ms"] => {
                Some(self.engine.target_discovery_delay_ms.to_string())
            }
            ["authority", "endpoint"] => Some(self.authority.endpoint.clone()),
            ["authority", "timeout_seconds"] => Some(self.authority.timeout_seconds.to_string()),
            ["storage", "data_dir"] => Some(
                self.storage
                    .data_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }

    /// Set a configuration value by dot path. Rejects unknown keys and
    /// values that fail to parse or violate engine bounds.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "window_hours"] => {
                self.engine.window_hours = parse_nonzero(key, value)?;
            }
            ["engine", "max_downloads"] => {
                let parsed: u32 = value.parse().map_err(|_| invalid(key, value, "positive integer"))?;
                if parsed == 0 {
                    return Err(invalid(key, value, "positive integer"));
                }
                self.engine.max_downloads = parsed;
            }
            ["engine", "cooldown_seconds"] => {
                self.engine.cooldown_seconds =
                    value.parse().map_err(|_| invalid(key, value, "integer"))?;
            }
            ["engine", "tick_seconds"] => {
                self.engine.tick_seconds = parse_nonzero(key, value)?;
            }
            ["engine", "target_discovery_attempts"] => {
                self.engine.target_discovery_attempts =
                    value.parse().map_err(|_| invalid(key, value, "integer"))?;
            }
            ["engine", "target_discovery_delay_ms"] => {
                self.engine.target_discovery_delay_ms =
                    value.parse().map_err(|_| invalid(key, value, "integer"))?;
            }
            ["authority", "endpoint"] => {
                let trimmed = value.trim();
                if !trimmed.is_empty()
                    && !trimmed.starts_with("http://")
                    && !trimmed.starts_with("https://")
                {
                    return Err(invalid(key, value, "http(s) URL or empty"));
                }
                self.authority.endpoint = trimmed.to_string();
            }
            ["authority", "timeout_seconds"] => {
                self.authority.timeout_seconds = parse_nonzero(key, value)?;
            }
            ["storage", "data_dir"] => {
                self.storage.data_dir = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            _ => {
                return Err(ConfigError::UnknownKey(key.to_string()));
            }
        }

        Ok(())
    }

    /// All configuration keys with their current values.
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "engine.window_hours",
            "engine.max_downloads",
            "engine.cooldown_seconds",
            "engine.tick_seconds",
            "engine.target_discovery_attempts",
            "engine.target_discovery_delay_ms",
            "authority.endpoint",
            "authority.timeout_seconds",
            "storage.data_dir",
        ]
        .iter()
        .map(|key| {
            (
                key.to_string(),
                self.get(key).unwrap_or_default(),
            )
        })
        .collect()
    }
}

fn parse_nonzero(key: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed: u64 = value
        .parse()
        .map_err(|_| invalid(key, value, "positive integer"))?;
    if parsed == 0 {
        return Err(invalid(key, value, "positive integer"));
    }
    Ok(parsed)
}

fn invalid(key: &str, value: &str, expected: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: '{value}' (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{COOLDOWN_MS, MAX_DOWNLOADS, WINDOW_MS};
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_engine_constants() {
        let params = TollgateConfig::default().engine.params();
        assert_eq!(params.window_ms, WINDOW_MS);
        assert_eq!(params.max_downloads, MAX_DOWNLOADS);
        assert_eq!(params.cooldown_ms, COOLDOWN_MS);
        assert_eq!(params.tick_ms, 1_000);
    }

    #[test]
    fn test_config_path() {
        let path = TollgateConfig::default_path();
        assert!(path.to_string_lossy().contains("tollgate"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = TollgateConfig::default();
        config.engine.window_hours = 1;
        config.authority.endpoint = "https://staging.example.com".to_string();

        config.save_to(config_path.clone()).unwrap();

        let loaded = TollgateConfig::load_from(config_path);
        assert_eq!(loaded.engine.window_hours, 1);
        assert_eq!(loaded.authority.endpoint, "https://staging.example.com");
        // Untouched values keep their defaults.
        assert_eq!(loaded.engine.max_downloads, 3);
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let config = TollgateConfig::load_from(PathBuf::from("/nonexistent/config.toml"));
        assert_eq!(config.engine.window_hours, 48);
    }

    #[test]
    fn test_load_unparsable_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("broken.toml");
        std::fs::write(&config_path, "[engine\nwindow_hours = ").unwrap();

        let config = TollgateConfig::load_from(config_path);
        assert_eq!(config.engine.window_hours, 48);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        std::fs::write(&config_path, "[engine]\ncooldown_seconds = 5\n").unwrap();

        let config = TollgateConfig::load_from(config_path);
        assert_eq!(config.engine.cooldown_seconds, 5);
        assert_eq!(config.engine.window_hours, 48);
        assert_eq!(config.authority.timeout_seconds, 10);
    }

    #[test]
    fn test_get() {
        let config = TollgateConfig::default();
        assert_eq!(config.get("engine.window_hours"), Some("48".to_string()));
        assert_eq!(config.get("engine.max_downloads"), Some("3".to_string()));
        assert_eq!(config.get("authority.endpoint"), Some(String::new()));
        assert_eq!(config.get("invalid.key"), None);
    }

    #[test]
    fn test_set() {
        let mut config = TollgateConfig::default();

        config.set("engine.window_hours", "2").unwrap();
        assert_eq!(config.engine.window_hours, 2);

        config
            .set("authority.endpoint", "http://localhost:8080")
            .unwrap();
        assert_eq!(config.authority.endpoint, "http://localhost:8080");

        config.set("storage.data_dir", "/tmp/tollgate").unwrap();
        assert_eq!(config.storage.data_dir, Some(PathBuf::from("/tmp/tollgate")));

        // Clearing the data dir falls back to the platform default.
        config.set("storage.data_dir", "").unwrap();
        assert_eq!(config.storage.data_dir, None);
    }

    #[test]
    fn test_set_invalid_value() {
        let mut config = TollgateConfig::default();

        assert!(config.set("engine.window_hours", "soon").is_err());
        assert!(config.set("engine.window_hours", "0").is_err());
        assert!(config.set("engine.max_downloads", "0").is_err());
        assert!(config.set("authority.endpoint", "ftp://nope").is_err());
        assert!(config.set("authority.timeout_seconds", "0").is_err());
    }

    #[test]
    fn test_set_unknown_key() {
        let mut config = TollgateConfig::default();
        let result = config.set("unknown.key", "value");
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_list_covers_every_gettable_key() {
        let config = TollgateConfig::default();
        let items = config.list();
        assert!(items.iter().any(|(k, _)| k == "engine.window_hours"));
        for (key, value) in items {
            assert_eq!(config.get(&key), Some(value));
        }
    }

    #[test]
    fn test_toml_serialization() {
        let config = TollgateConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[engine]"));
        assert!(toml.contains("[authority]"));
        assert!(toml.contains("[storage]"));
    }

    #[test]
    fn test_staging_override_shrinks_window() {
        let mut config = TollgateConfig::default();
        config.set("engine.window_hours", "1").unwrap();
        let params = config.engine.params();
        assert_eq!(params.window_ms, 60 * 60 * 1000);
        // Other limits stay at production values.
        assert_eq!(params.max_downloads, 3);
    }
}
