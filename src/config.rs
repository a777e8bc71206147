//! Configuration loading and persistence.
//!
//! Reads `config.json` from the hubwire config directory, falling back to
//! defaults, then applies `HUBWIRE_*` environment overrides. Dispatcher and
//! client options are derived from [`Config`].

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::middleware::{CompressionMiddleware, MiddlewarePipeline};

/// How the dispatcher reacts to one class of malformed traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Fail the receive; the serving loop closes the connection.
    Raise,
    /// Log at warn and answer with an error result when an id is recoverable.
    #[default]
    Report,
}

impl std::str::FromStr for ErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raise" => Ok(Self::Raise),
            "report" => Ok(Self::Report),
            other => anyhow::bail!("unknown error policy: {other}"),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Raise => "raise",
            Self::Report => "report",
        })
    }
}

/// Client reaction to a server invocation with no registered handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownHandlerPolicy {
    /// Log at error and reply with an error result if the call has an id.
    #[default]
    Report,
    /// Log at debug and drop the call.
    Ignore,
}

impl std::str::FromStr for UnknownHandlerPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "ignore" => Ok(Self::Ignore),
            other => anyhow::bail!("unknown handler policy: {other}"),
        }
    }
}

/// Per-class dispatcher error policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandling {
    /// Malformed JSON or argument type mismatch.
    pub unparseable: ErrorPolicy,
    /// Well-formed but not an invocation envelope.
    pub invalid: ErrorPolicy,
    /// Unknown method name or wrong argument count.
    pub missing_method: ErrorPolicy,
}

impl ErrorHandling {
    /// Same policy for every class.
    pub fn uniform(policy: ErrorPolicy) -> Self {
        Self {
            unparseable: policy,
            invalid: policy,
            missing_method: policy,
        }
    }
}

/// Backplane settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackplaneConfig {
    /// Prefix for every pub/sub channel name.
    pub channel_prefix: String,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "hubwire".to_string(),
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long `start()` waits for the connection event.
    pub handshake_timeout_ms: u64,
    /// Reaction to invocations with no handler.
    pub unknown_handler: UnknownHandlerPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            unknown_handler: UnknownHandlerPolicy::Report,
        }
    }
}

impl ClientConfig {
    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Configuration for hubwire endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher error policies.
    pub errors: ErrorHandling,
    /// Payload size (bytes) at which the compression stage gzips.
    /// `None` leaves compression out of the default pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_threshold: Option<usize>,
    /// Backplane settings.
    pub backplane: BackplaneConfig,
    /// Client settings.
    pub client: ClientConfig,
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `HUBWIRE_CONFIG_DIR` overrides the platform config dir
    /// (e.g. `~/.config/hubwire`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("HUBWIRE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("hubwire"))
    }

    /// Loads configuration from `config.json`, with environment overrides.
    ///
    /// A missing file means defaults; an unreadable or invalid one is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            log::debug!("[Config] {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from an explicit file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Persists the configuration as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Apply `HUBWIRE_*` overrides read through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("HUBWIRE_ERROR_POLICY") {
            match value.parse() {
                Ok(policy) => self.errors = ErrorHandling::uniform(policy),
                Err(e) => log::warn!("[Config] ignoring HUBWIRE_ERROR_POLICY: {e}"),
            }
        }

        if let Some(value) = lookup("HUBWIRE_COMPRESSION_THRESHOLD") {
            match value.trim() {
                "" | "off" | "none" => self.compression_threshold = None,
                raw => match raw.parse::<usize>() {
                    Ok(threshold) => self.compression_threshold = Some(threshold),
                    Err(e) => log::warn!("[Config] ignoring HUBWIRE_COMPRESSION_THRESHOLD: {e}"),
                },
            }
        }

        if let Some(prefix) = lookup("HUBWIRE_CHANNEL_PREFIX") {
            self.backplane.channel_prefix = prefix;
        }

        if let Some(value) = lookup("HUBWIRE_HANDSHAKE_TIMEOUT_MS") {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.client.handshake_timeout_ms = ms,
                Err(e) => log::warn!("[Config] ignoring HUBWIRE_HANDSHAKE_TIMEOUT_MS: {e}"),
            }
        }

        if let Some(value) = lookup("HUBWIRE_UNKNOWN_HANDLER") {
            match value.parse() {
                Ok(policy) => self.client.unknown_handler = policy,
                Err(e) => log::warn!("[Config] ignoring HUBWIRE_UNKNOWN_HANDLER: {e}"),
            }
        }
    }

    /// Default middleware pipeline implied by this configuration.
    ///
    /// Contains the compression stage when a threshold is set; empty otherwise.
    pub fn middleware(&self) -> MiddlewarePipeline {
        match self.compression_threshold {
            Some(threshold) => MiddlewarePipeline::builder()
                .with(CompressionMiddleware::new(Some(threshold)))
                .build(),
            None => MiddlewarePipeline::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.errors, ErrorHandling::uniform(ErrorPolicy::Report));
        assert_eq!(config.compression_threshold, None);
        assert_eq!(config.backplane.channel_prefix, "hubwire");
        assert_eq!(config.client.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.unknown_handler, UnknownHandlerPolicy::Report);
        assert!(config.middleware().is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"errors":{"missing_method":"raise"}}"#).unwrap();
        assert_eq!(config.errors.missing_method, ErrorPolicy::Raise);
        assert_eq!(config.errors.invalid, ErrorPolicy::Report);
        assert_eq!(config.client.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.compression_threshold = Some(2048);
        config.backplane.channel_prefix = "prod".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.middleware().len(), 1);
    }

    #[test]
    fn test_load_from_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("HUBWIRE_ERROR_POLICY", "Raise"),
            ("HUBWIRE_COMPRESSION_THRESHOLD", "512"),
            ("HUBWIRE_CHANNEL_PREFIX", "edge"),
            ("HUBWIRE_HANDSHAKE_TIMEOUT_MS", "250"),
            ("HUBWIRE_UNKNOWN_HANDLER", "ignore"),
        ]));
        assert_eq!(config.errors, ErrorHandling::uniform(ErrorPolicy::Raise));
        assert_eq!(config.compression_threshold, Some(512));
        assert_eq!(config.backplane.channel_prefix, "edge");
        assert_eq!(config.client.handshake_timeout_ms, 250);
        assert_eq!(config.client.unknown_handler, UnknownHandlerPolicy::Ignore);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("HUBWIRE_ERROR_POLICY", "explode"),
            ("HUBWIRE_HANDSHAKE_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_policy_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ErrorPolicy::Raise).unwrap(), "\"raise\"");
        assert_eq!(ErrorPolicy::Report.to_string(), "report");
    }
}
