//! Configuration loading: TOML file plus `LOXONE_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_port() -> u16 {
    80
}

fn default_listen_port() -> u16 {
    9504
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// `serde(with = "humantime_serde")` helper for plain (non-`Option`)
/// `Duration` fields, since `humantime` itself has no serde integration.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Configuration for a single Miniserver connection.
///
/// Encryption selection:
/// - `use_encryption`: opt in to `wss://` from the start.
/// - `force_encryption`: require encryption; implies `use_encryption`.
/// - Otherwise encryption is auto-enabled once a Miniserver Gen2 is
///   detected from the parsed structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniserverConfig {
    /// Friendly name used as the `miniserver` metric label. Defaults to
    /// `host` when left empty.
    #[serde(default)]
    pub name: String,
    /// Hostname or IP address of the Miniserver.
    #[serde(default)]
    pub host: String,
    /// TCP port of the Miniserver's web/WebSocket interface.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Miniserver account username.
    #[serde(default)]
    pub username: String,
    /// Miniserver account password.
    #[serde(default)]
    pub password: String,
    /// Manually enable `wss://` from the first connection attempt.
    #[serde(default)]
    pub use_encryption: bool,
    /// Require encryption; refuses to fall back to plaintext.
    #[serde(default)]
    pub force_encryption: bool,
}

impl Default for MiniserverConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            use_encryption: false,
            force_encryption: false,
        }
    }
}

/// Configuration for the optional OTLP metrics push pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// Whether the push loop is started at all.
    #[serde(default)]
    pub enabled: bool,
    /// Collector endpoint, e.g. `http://localhost:4317`.
    #[serde(default)]
    pub endpoint: String,
    /// How often to snapshot and push.
    #[serde(default = "default_otlp_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Per-export timeout; must be strictly less than `interval`.
    #[serde(default = "default_otlp_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra resource attributes attached to every exported metric, in
    /// `key=value` form.
    #[serde(default)]
    pub resource_attributes: Vec<String>,
    /// Extra HTTP headers attached verbatim to every export request, in
    /// `Header-Name: value` form (e.g. a collector's bearer token).
    #[serde(default)]
    pub auth_headers: Vec<String>,
}

fn default_otlp_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_otlp_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            interval: default_otlp_interval(),
            timeout: default_otlp_timeout(),
            resource_attributes: Vec::new(),
            auth_headers: Vec::new(),
        }
    }
}

/// Top-level exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// One or more Miniservers to poll.
    #[serde(default)]
    pub miniservers: Vec<MiniserverConfig>,
    /// HTTP bind port for the scrape endpoint.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// HTTP bind address for the scrape endpoint.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// `trace`/`debug`/`info`/`warn`/`error`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `text`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Room names excluded from projected metrics.
    #[serde(default)]
    pub exclude_rooms: Vec<String>,
    /// Control types excluded from projected metrics.
    #[serde(default)]
    pub exclude_types: Vec<String>,
    /// Shell-style globs of control names excluded from projected metrics.
    #[serde(default)]
    pub exclude_names: Vec<String>,
    /// Emit `loxone_control` info metrics for text-only controls.
    #[serde(default)]
    pub include_text_values: bool,
    /// OTLP push pipeline configuration.
    #[serde(default)]
    pub otlp: OtlpConfig,
    /// Graceful shutdown deadline for in-flight HTTP requests.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            miniservers: Vec::new(),
            listen_port: default_listen_port(),
            listen_address: default_listen_address(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            exclude_rooms: Vec::new(),
            exclude_types: Vec::new(),
            exclude_names: Vec::new(),
            include_text_values: false,
            otlp: OtlpConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file's TOML could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// Config serialization failed (used by `to_toml`).
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// Semantic validation failed after the config was assembled.
    #[error("{0}")]
    Invalid(String),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "text"];

impl ExporterConfig {
    /// Load configuration from a TOML file, apply `LOXONE_*` environment
    /// overrides, and validate the result.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text, path.display().to_string())
    }

    /// Parse configuration from a TOML string, apply environment overrides,
    /// and validate the result. `source_label` is used only in error
    /// messages.
    pub fn from_toml(text: &str, source_label: impl Into<String>) -> Result<Self, ConfigError> {
        let label = source_label.into();
        let mut config: ExporterConfig =
            toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: label,
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build configuration purely from `LOXONE_*` environment variables,
    /// used when no config file is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ExporterConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML, e.g. for `--print-config` style tooling.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn apply_env_overrides(&mut self) {
        if self.miniservers.is_empty() {
            self.miniservers.push(MiniserverConfig::default());
        }
        let ms0 = &mut self.miniservers[0];

        if let Ok(v) = std::env::var("LOXONE_HOST") {
            ms0.host = v;
        }
        if let Ok(v) = std::env::var("LOXONE_USERNAME") {
            ms0.username = v;
        }
        if let Ok(v) = std::env::var("LOXONE_PASSWORD") {
            ms0.password = v;
        }
        if let Ok(v) = std::env::var("LOXONE_PORT") {
            if let Ok(port) = v.parse() {
                ms0.port = port;
            }
        }
        if let Ok(v) = std::env::var("LOXONE_NAME") {
            ms0.name = v;
        } else if ms0.name.is_empty() {
            ms0.name = ms0.host.clone();
        }
        if let Ok(v) = std::env::var("LOXONE_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(v) = std::env::var("LOXONE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("LOXONE_OTLP_ENDPOINT") {
            self.otlp.enabled = true;
            self.otlp.endpoint = v;
        }

        // Drop placeholder entries that env overrides never populated.
        self.miniservers.retain(|ms| !ms.host.is_empty());
    }

    /// Validate the fully assembled configuration, returning every problem
    /// found rather than just the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.miniservers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one miniserver must be configured".to_string(),
            ));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid(
                "listen_port must be between 1 and 65535".to_string(),
            ));
        }
        self.listen_address.parse::<std::net::IpAddr>().map_err(|_| {
            ConfigError::Invalid(format!(
                "listen_address must be a valid IP address, got {:?}",
                self.listen_address
            ))
        })?;
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level must be one of {VALID_LOG_LEVELS:?}, got {:?}",
                self.log_level
            )));
        }
        if !VALID_LOG_FORMATS.contains(&self.log_format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_format must be one of {VALID_LOG_FORMATS:?}, got {:?}",
                self.log_format
            )));
        }

        let mut names = std::collections::HashSet::new();
        for ms in &self.miniservers {
            if ms.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "miniserver {:?}: host must not be empty",
                    ms.name
                )));
            }
            if ms.username.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "miniserver {:?}: username must not be empty",
                    ms.name
                )));
            }
            if ms.password.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "miniserver {:?}: password must not be empty",
                    ms.name
                )));
            }
            if ms.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "miniserver {:?}: port must be between 1 and 65535",
                    ms.name
                )));
            }
            if !names.insert(ms.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate miniserver name {:?}",
                    ms.name
                )));
            }
        }

        if self.otlp.enabled {
            if self.otlp.endpoint.is_empty() {
                return Err(ConfigError::Invalid(
                    "otlp.endpoint must be set when otlp.enabled is true".to_string(),
                ));
            }
            if self.otlp.timeout >= self.otlp.interval {
                return Err(ConfigError::Invalid(
                    "otlp.timeout must be strictly less than otlp.interval".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml() -> &'static str {
        r#"
        [[miniservers]]
        name = "house"
        host = "10.0.0.5"
        username = "admin"
        password = "secret"
        "#
    }

    #[test]
    fn loads_minimal_valid_config() {
        let config = ExporterConfig::from_toml(valid_toml(), "test").unwrap();
        assert_eq!(config.miniservers.len(), 1);
        assert_eq!(config.listen_port, 9504);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn rejects_empty_miniservers() {
        let err = ExporterConfig::from_toml("", "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let toml = r#"
        [[miniservers]]
        name = "house"
        host = "10.0.0.5"
        username = "admin"
        password = "secret"

        [[miniservers]]
        name = "house"
        host = "10.0.0.6"
        username = "admin"
        password = "secret"
        "#;
        let err = ExporterConfig::from_toml(toml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_invalid_listen_address() {
        let toml = format!("{}\nlisten_address = \"not-an-ip\"\n", valid_toml());
        let err = ExporterConfig::from_toml(&toml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn otlp_timeout_must_be_less_than_interval() {
        let toml = format!(
            "{}\n[otlp]\nenabled = true\nendpoint = \"http://localhost:4317\"\ninterval = \"10s\"\ntimeout = \"10s\"\n",
            valid_toml()
        );
        let err = ExporterConfig::from_toml(&toml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_fill_in_blank_miniserver() {
        std::env::set_var("LOXONE_HOST", "192.168.1.50");
        std::env::set_var("LOXONE_USERNAME", "admin");
        std::env::set_var("LOXONE_PASSWORD", "hunter2");
        let config = ExporterConfig::from_toml("", "test").unwrap();
        std::env::remove_var("LOXONE_HOST");
        std::env::remove_var("LOXONE_USERNAME");
        std::env::remove_var("LOXONE_PASSWORD");
        assert_eq!(config.miniservers[0].host, "192.168.1.50");
        assert_eq!(config.miniservers[0].name, "192.168.1.50");
    }

    #[test]
    fn round_trips_through_to_toml() {
        let config = ExporterConfig::from_toml(valid_toml(), "test").unwrap();
        let text = config.to_toml().unwrap();
        let reparsed = ExporterConfig::from_toml(&text, "roundtrip").unwrap();
        assert_eq!(reparsed.miniservers[0].host, config.miniservers[0].host);
    }
}
