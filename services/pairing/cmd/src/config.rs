//! Configuration handling for the pairing node.
//!
//! Values come from the YAML config file when present, then `PAIRING_*`
//! environment variables, then command line flags in `main`.

use anyhow::{Context, Result};
use pairing_session::{SessionConfig, SessionParameters};
use pairing_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Pairing node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage backend settings
    pub storage: StorageConfig,
    /// Storage context holding the fabric table
    pub fabric_context: String,
    /// Handshake settings
    pub session: SessionSettings,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `file`
    pub mode: String,
    /// JSON file used by the file backend
    pub path: PathBuf,
}

/// Handshake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Whole-handshake deadline, e.g. `30s`
    pub handshake_timeout: String,
    /// Idle retransmission interval advertised to peers, e.g. `500ms`
    pub idle_interval: Option<String>,
    /// Active retransmission interval advertised to peers, e.g. `300ms`
    pub active_interval: Option<String>,
    /// Initiator randoms remembered for replay detection
    pub random_cache_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            path: PathBuf::from("./pairingdata/storage.json"),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: "30s".to_string(),
            idle_interval: None,
            active_interval: None,
            random_cache_size: 128,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            fabric_context: "fabrics".to_string(),
            session: SessionSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {}: {:?}", field, value))
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: NodeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final pairing configuration: storage={}, fabric_context={}, handshake_timeout={}",
            config.storage.mode, config.fabric_context, config.session.handshake_timeout
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(mode) = std::env::var("PAIRING_STORAGE_MODE") {
            info!("Storage mode overridden by environment: {}", mode);
            self.storage.mode = mode;
        }

        if let Ok(path) = std::env::var("PAIRING_STORAGE_PATH") {
            info!("Storage path overridden by environment: {}", path);
            self.storage.path = PathBuf::from(path);
        }

        if let Ok(context) = std::env::var("PAIRING_FABRIC_CONTEXT") {
            info!("Fabric context overridden by environment: {}", context);
            self.fabric_context = context;
        }

        if let Ok(timeout) = std::env::var("PAIRING_HANDSHAKE_TIMEOUT") {
            info!("Handshake timeout overridden by environment: {}", timeout);
            self.session.handshake_timeout = timeout;
        }

        if let Ok(level) = std::env::var("PAIRING_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Reject values that would only fail later
    pub fn validate(&self) -> Result<()> {
        self.storage_mode()?;
        self.session_config()?;
        if self.fabric_context.is_empty() {
            anyhow::bail!("fabric_context must not be empty");
        }
        Ok(())
    }

    /// Storage backend selection
    pub fn storage_mode(&self) -> Result<StorageMode> {
        match self.storage.mode.as_str() {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                path: self.storage.path.clone(),
            }),
            other => anyhow::bail!("unknown storage mode {:?} (expected memory or file)", other),
        }
    }

    /// Session manager settings
    pub fn session_config(&self) -> Result<SessionConfig> {
        let settings = &self.session;
        let millis = |field: &str, value: &Option<String>| -> Result<Option<u32>> {
            value
                .as_deref()
                .map(|v| parse_duration(field, v).map(|d| d.as_millis().min(u32::MAX as u128) as u32))
                .transpose()
        };

        Ok(SessionConfig {
            handshake_timeout: parse_duration("handshake_timeout", &settings.handshake_timeout)?,
            local_params: SessionParameters {
                idle_interval_ms: millis("idle_interval", &settings.idle_interval)?,
                active_interval_ms: millis("active_interval", &settings.active_interval)?,
                active_threshold_ms: None,
            },
            random_cache_size: settings.random_cache_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.storage.mode, "memory");
        assert_eq!(config.fabric_context, "fabrics");
        let session = config.session_config().unwrap();
        assert_eq!(session.handshake_timeout, Duration::from_secs(30));
        assert!(matches!(config.storage_mode().unwrap(), StorageMode::InMemory));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
storage:
  mode: file
  path: /tmp/pairing/storage.json
fabric_context: test-fabrics
session:
  handshake_timeout: 45s
  idle_interval: 800ms
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.fabric_context, "test-fabrics");
        assert!(matches!(
            config.storage_mode().unwrap(),
            StorageMode::File { path } if path == PathBuf::from("/tmp/pairing/storage.json")
        ));
        let session = config.session_config().unwrap();
        assert_eq!(session.handshake_timeout, Duration::from_secs(45));
        assert_eq!(
            session.local_params.idle_interval(),
            Duration::from_millis(800)
        );
        assert_eq!(session.random_cache_size, 128);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = NodeConfig::default();
        config.storage.mode = "tape".to_string();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.session.handshake_timeout = "soon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = NodeConfig::load_from_file("/nonexistent/pairing.yaml").unwrap();
        assert_eq!(config.session.random_cache_size, 128);
    }
}
