//! Configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration.
//!
//! ```toml
//! [probe]
//! connect_timeout_ms = 2000
//! read_timeout_ms = 2000
//! bootstrap_url = "http://snare.bootstrap/config"
//!
//! [storage]
//! last_proxy_path = "snare/last-proxy.json"
//! trust_store_dir = "snare/trusted"
//! ```

use serde::{Deserialize, Serialize};
use snare_discovery::{DEFAULT_BOOTSTRAP_URL, ProbeConfig, Uri};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnareConfig {
    /// Bootstrap probe settings
    #[serde(default)]
    pub probe: ProbeSettings,
    /// On-disk state
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Bootstrap probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// TCP connect timeout per candidate (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Request/response timeout per candidate (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    /// URL requested through each candidate
    #[serde(default = "default_bootstrap_url")]
    pub bootstrap_url: String,
    /// Largest accepted bootstrap response
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// User-Agent for the bootstrap request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_bootstrap_url() -> String {
    DEFAULT_BOOTSTRAP_URL.to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_user_agent() -> String {
    format!("snare/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            bootstrap_url: default_bootstrap_url(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

/// On-disk state locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Remembered proxy (JSON)
    #[serde(default = "default_last_proxy_path")]
    pub last_proxy_path: PathBuf,
    /// Directory of trusted proxy certificates (PEM)
    #[serde(default = "default_trust_store_dir")]
    pub trust_store_dir: PathBuf,
}

fn default_last_proxy_path() -> PathBuf {
    PathBuf::from("snare").join("last-proxy.json")
}

fn default_trust_store_dir() -> PathBuf {
    PathBuf::from("snare").join("trusted")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            last_proxy_path: default_last_proxy_path(),
            trust_store_dir: default_trust_store_dir(),
        }
    }
}

impl SnareConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.connect_timeout_ms == 0 || self.probe.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.probe.max_body_bytes == 0 {
            return Err(ConfigError::InvalidBodyLimit);
        }
        self.bootstrap_uri()?;
        Ok(())
    }

    /// Prober configuration derived from the `[probe]` table
    pub fn probe_config(&self) -> Result<ProbeConfig, ConfigError> {
        Ok(ProbeConfig {
            connect_timeout: Duration::from_millis(self.probe.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.probe.read_timeout_ms),
            bootstrap_url: self.bootstrap_uri()?,
            max_body_size: self.probe.max_body_bytes,
            user_agent: self.probe.user_agent.clone(),
        })
    }

    fn bootstrap_uri(&self) -> Result<Uri, ConfigError> {
        let uri: Uri = self
            .probe
            .bootstrap_url
            .parse()
            .map_err(|_| ConfigError::InvalidBootstrapUrl(self.probe.bootstrap_url.clone()))?;

        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(ConfigError::InvalidBootstrapUrl(self.probe.bootstrap_url.clone()));
        }
        Ok(uri)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Probe timeouts must be non-zero")]
    InvalidTimeout,

    #[error("Bootstrap body limit must be non-zero")]
    InvalidBodyLimit,

    #[error("Bootstrap URL must be an absolute http:// URL: {0}")]
    InvalidBootstrapUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SnareConfig::default();

        assert_eq!(config.probe.connect_timeout_ms, 2000);
        assert_eq!(config.probe.read_timeout_ms, 2000);
        assert!(config.validate().is_ok());

        let probe = config.probe_config().unwrap();
        assert_eq!(probe.connect_timeout, Duration::from_secs(2));
        assert_eq!(probe.bootstrap_url.path(), "/config");
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SnareConfig::from_toml("").unwrap(), SnareConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = SnareConfig::from_toml(
            r#"
            [probe]
            connect_timeout_ms = 500

            [storage]
            trust_store_dir = "/var/lib/snare/trusted"
            "#,
        )
        .unwrap();

        assert_eq!(config.probe.connect_timeout_ms, 500);
        assert_eq!(config.probe.read_timeout_ms, 2000);
        assert_eq!(config.storage.trust_store_dir, PathBuf::from("/var/lib/snare/trusted"));
        assert_eq!(config.storage.last_proxy_path, default_last_proxy_path());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = SnareConfig::default();
        let parsed = SnareConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_config() {
        assert_eq!(
            SnareConfig::from_toml("[probe]\nread_timeout_ms = 0"),
            Err(ConfigError::InvalidTimeout)
        );
        assert!(matches!(
            SnareConfig::from_toml("[probe]\nbootstrap_url = \"https://snare.bootstrap/config\""),
            Err(ConfigError::InvalidBootstrapUrl(_))
        ));
        assert!(matches!(
            SnareConfig::from_toml("[probe]\nbootstrap_url = \"/config\""),
            Err(ConfigError::InvalidBootstrapUrl(_))
        ));
        assert!(matches!(
            SnareConfig::from_toml("[probe]\nconnect_timeout_ms = \"fast\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snare.toml");
        std::fs::write(&path, "[probe]\nread_timeout_ms = 750\n").unwrap();

        let config = SnareConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.probe.read_timeout_ms, 750);

        assert!(matches!(
            SnareConfig::from_toml_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
