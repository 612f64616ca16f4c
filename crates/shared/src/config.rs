//! Configuration management for the anime cross-reference utility.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings. The request governor knobs can
//! additionally be overridden from the environment without touching the file.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable overriding the default policy's concurrency cap
pub const ENV_MAX_CONCURRENCY: &str = "GOVERNOR_MAX_CONCURRENCY";
/// Environment variable overriding the default policy's retry count
pub const ENV_MAX_RETRIES: &str = "GOVERNOR_MAX_RETRIES";
/// Environment variable overriding the default policy's base backoff delay
pub const ENV_BASE_DELAY_MS: &str = "GOVERNOR_BASE_DELAY_MS";
/// Environment variable overriding the default policy's backoff ceiling
pub const ENV_MAX_DELAY_MS: &str = "GOVERNOR_MAX_DELAY_MS";
/// Environment variable overriding the default policy's request timeout
pub const ENV_TIMEOUT_MS: &str = "GOVERNOR_TIMEOUT_MS";
/// Environment variable overriding the global inter-request spacing floor
pub const ENV_MIN_REQUEST_INTERVAL_MS: &str = "GOVERNOR_MIN_REQUEST_INTERVAL_MS";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Outbound request governor settings
    #[serde(default)]
    pub governor: GovernorConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Request governor configuration
///
/// Every field is optional in the file; missing ones take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Minimum spacing between two dispatches to the same domain, in milliseconds.
    ///
    /// Applies to every domain on top of its concurrency cap.
    pub min_request_interval_ms: u64,

    /// User agent sent with every governed request
    pub user_agent: String,

    /// Policy for domains without an explicit entry
    pub default: PolicyConfig,

    /// Per-domain overrides keyed by exact hostname
    pub domains: BTreeMap<String, PolicyOverride>,
}

/// Rate-limit policy for one destination domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any single backoff delay in milliseconds
    pub max_delay_ms: u64,

    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,

    /// Maximum number of simultaneous in-flight requests
    pub max_concurrency: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            timeout_ms: 30_000,
            max_concurrency: 5,
        }
    }
}

impl PolicyConfig {
    /// Check that the policy can actually be enforced
    pub fn validate(&self, domain: &str) -> Result<()> {
        if self.max_concurrency == 0 {
            bail!("Policy for '{}' must allow at least one concurrent request", domain);
        }
        if self.timeout_ms == 0 {
            bail!("Policy for '{}' must have a non-zero timeout", domain);
        }
        if self.base_delay_ms > self.max_delay_ms {
            bail!(
                "Policy for '{}' has base_delay_ms ({}) greater than max_delay_ms ({})",
                domain,
                self.base_delay_ms,
                self.max_delay_ms
            );
        }
        Ok(())
    }
}

/// Per-domain policy entry. Fields left out inherit from the base policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl PolicyOverride {
    /// Layer the fields set here on top of `base`
    pub fn apply_to(&self, base: PolicyConfig) -> PolicyConfig {
        PolicyConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_concurrency: self.max_concurrency.unwrap_or(base.max_concurrency),
        }
    }
}

impl From<PolicyConfig> for PolicyOverride {
    fn from(policy: PolicyConfig) -> Self {
        Self {
            max_retries: Some(policy.max_retries),
            base_delay_ms: Some(policy.base_delay_ms),
            max_delay_ms: Some(policy.max_delay_ms),
            timeout_ms: Some(policy.timeout_ms),
            max_concurrency: Some(policy.max_concurrency),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_request_interval_ms: 100,
            user_agent: "anime-xref/0.1.0".to_string(),
            default: PolicyConfig::default(),
            domains: BTreeMap::new(),
        }
    }
}

impl GovernorConfig {
    /// Validate the default policy and every per-domain override
    ///
    /// Overrides are checked as layered on the default policy.
    pub fn validate(&self) -> Result<()> {
        self.default.validate("default")?;
        for (domain, overrides) in &self.domains {
            overrides.apply_to(self.default).validate(domain)?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                root_dir: "data".to_string(),
            },
            logging: LoggingConfig {
                log_dir: "logs".to_string(),
                default_level: "info".to_string(),
                console: true,
                file: true,
                json_format: false,
            },
            governor: GovernorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .governor
            .validate()
            .with_context(|| format!("Invalid governor settings in {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            domains = config.governor.domains.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Apply `GOVERNOR_*` environment overrides to the governor settings
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Overrides touch the default policy and the global spacing floor only;
    /// per-domain entries keep the fields they set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let governor = &mut self.governor;

        if let Some(value) = parse_override(&lookup, ENV_MAX_CONCURRENCY)? {
            governor.default.max_concurrency = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_MAX_RETRIES)? {
            governor.default.max_retries = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_BASE_DELAY_MS)? {
            governor.default.base_delay_ms = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_MAX_DELAY_MS)? {
            governor.default.max_delay_ms = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_TIMEOUT_MS)? {
            governor.default.timeout_ms = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_MIN_REQUEST_INTERVAL_MS)? {
            governor.min_request_interval_ms = value;
        }

        governor
            .validate()
            .context("Invalid governor settings after environment overrides")
    }

    /// Get the absolute path for the data directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    /// Get the absolute path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        let log_path = Path::new(&self.logging.log_dir);
        if log_path.is_absolute() {
            log_path.to_path_buf()
        } else {
            self.data_dir().join(log_path)
        }
    }
}

/// Read and parse one override variable, if set
fn parse_override<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };

    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| anyhow!("Invalid value '{}' for {}: {}", raw, name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data.root_dir, "data");
        assert_eq!(config.governor.min_request_interval_ms, 100);
        assert_eq!(config.governor.default.max_retries, 3);
        assert_eq!(config.governor.default.max_concurrency, 5);
        assert!(config.governor.domains.is_empty());
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let mut original_config = Config::default();
        original_config.governor.domains.insert(
            "api.jikan.moe".to_string(),
            PolicyOverride {
                max_concurrency: Some(1),
                ..PolicyOverride::default()
            },
        );
        original_config.save(&config_path)?;

        assert!(config_path.exists());

        let loaded_config = Config::from_file(&config_path)?;
        assert_eq!(loaded_config.data.root_dir, original_config.data.root_dir);
        assert_eq!(
            loaded_config.governor.domains.get("api.jikan.moe"),
            original_config.governor.domains.get("api.jikan.moe")
        );

        Ok(())
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        // Should return default config without error
        assert_eq!(config.data.root_dir, "data");
    }

    #[test]
    fn test_governor_section_is_optional() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[data]
root_dir = "var"

[logging]
log_dir = "logs"
default_level = "debug"
console = true
file = false
json_format = false
"#,
        )?;

        let config = Config::from_file(&config_path)?;
        assert_eq!(config.data.root_dir, "var");
        assert_eq!(config.governor.default, PolicyConfig::default());

        Ok(())
    }

    #[test]
    fn test_partial_governor_section_uses_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
[data]
root_dir = "var"

[logging]
log_dir = "logs"
default_level = "info"
console = true
file = false
json_format = false

[governor]
min_request_interval_ms = 50

[governor.default]
max_retries = 1
"#,
        )?;

        assert_eq!(config.governor.min_request_interval_ms, 50);
        assert_eq!(config.governor.user_agent, GovernorConfig::default().user_agent);
        assert_eq!(config.governor.default.max_retries, 1);
        assert_eq!(config.governor.default.base_delay_ms, 1000);
        assert_eq!(config.governor.default.max_concurrency, 5);
        assert!(config.governor.domains.is_empty());

        Ok(())
    }

    #[test]
    fn test_single_field_domain_override() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[data]
root_dir = "var"

[logging]
log_dir = "logs"
default_level = "info"
console = true
file = false
json_format = false

[governor.default]
max_retries = 4

[governor.domains."api.jikan.moe"]
max_concurrency = 1
"#,
        )?;

        let config = Config::from_file(&config_path)?;
        let jikan = config.governor.domains["api.jikan.moe"];
        assert_eq!(jikan.max_concurrency, Some(1));
        assert_eq!(jikan.max_retries, None);

        let effective = jikan.apply_to(config.governor.default);
        assert_eq!(effective.max_concurrency, 1);
        assert_eq!(effective.max_retries, 4);
        assert_eq!(effective.timeout_ms, 30_000);

        Ok(())
    }

    #[test]
    fn test_invalid_policy_in_file_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.governor.domains.insert(
            "kitsu.io".to_string(),
            PolicyOverride {
                max_concurrency: Some(0),
                ..PolicyOverride::default()
            },
        );
        config.save(&config_path)?;

        let err = Config::from_file(&config_path).unwrap_err();
        assert!(format!("{:#}", err).contains("kitsu.io"));

        Ok(())
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            (ENV_MAX_CONCURRENCY, "2"),
            (ENV_MAX_RETRIES, " 7 "),
            (ENV_BASE_DELAY_MS, "250"),
            (ENV_MIN_REQUEST_INTERVAL_MS, "40"),
        ]))?;

        assert_eq!(config.governor.default.max_concurrency, 2);
        assert_eq!(config.governor.default.max_retries, 7);
        assert_eq!(config.governor.default.base_delay_ms, 250);
        assert_eq!(config.governor.default.max_delay_ms, 30_000);
        assert_eq!(config.governor.min_request_interval_ms, 40);

        Ok(())
    }

    #[test]
    fn test_env_override_parse_error_names_variable() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup_from(&[(ENV_MAX_RETRIES, "many")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RETRIES));
    }

    #[test]
    fn test_env_override_still_validated() {
        let mut config = Config::default();
        let result = config.apply_overrides(lookup_from(&[(ENV_MAX_DELAY_MS, "10")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_path_resolution() {
        let config = Config::default();

        let log_dir = config.log_dir();
        assert!(log_dir.ends_with("data/logs"));
    }
}
