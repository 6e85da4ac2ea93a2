//! Configuration for the MIDI device manager
//!
//! Loaded from YAML. Every field is optional; an empty file yields defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::router::DEFAULT_MAX_PACKET_SIZE;

/// Smallest accepted hotplug poll interval
pub const MIN_HOTPLUG_POLL_INTERVAL_MS: u64 = 10;

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ManagerConfig {
    /// Name registered with the MIDI system; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default)]
    pub debug_logging: bool,
    /// Device watcher cadence of the hardware transport
    #[serde(default = "default_hotplug_poll_interval_ms")]
    pub hotplug_poll_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            max_packet_size: default_max_packet_size(),
            debug_logging: false,
            hotplug_poll_interval_ms: default_hotplug_poll_interval_ms(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // serde_yaml reads an empty document as unit, not as an empty map
        let config: ManagerConfig = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size == 0 {
            anyhow::bail!("max_packet_size must be greater than 0");
        }
        if self.hotplug_poll_interval_ms < MIN_HOTPLUG_POLL_INTERVAL_MS {
            anyhow::bail!(
                "hotplug_poll_interval_ms must be at least {} (got {})",
                MIN_HOTPLUG_POLL_INTERVAL_MS,
                self.hotplug_poll_interval_ms
            );
        }
        if let Some(name) = &self.client_name {
            if name.trim().is_empty() {
                anyhow::bail!("client_name cannot be blank (omit it to generate one)");
            }
        }
        Ok(())
    }

    pub fn hotplug_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_interval_ms)
    }
}

fn default_max_packet_size() -> usize { DEFAULT_MAX_PACKET_SIZE }
fn default_hotplug_poll_interval_ms() -> u64 { 500 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = ManagerConfig::from_yaml("").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.max_packet_size, 4096);
        assert_eq!(config.hotplug_poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let config = ManagerConfig::from_yaml("client_name: LaunchControl\n").unwrap();
        assert_eq!(config.client_name.as_deref(), Some("LaunchControl"));
        assert_eq!(config.max_packet_size, 4096);
        assert!(!config.debug_logging);
    }

    #[test]
    fn test_rejects_zero_packet_size() {
        let err = ManagerConfig::from_yaml("max_packet_size: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_packet_size"));
    }

    #[test]
    fn test_rejects_fast_polling() {
        assert!(ManagerConfig::from_yaml("hotplug_poll_interval_ms: 5\n").is_err());
        assert!(ManagerConfig::from_yaml("hotplug_poll_interval_ms: 10\n").is_ok());
    }

    #[test]
    fn test_rejects_blank_client_name() {
        assert!(ManagerConfig::from_yaml("client_name: \"  \"\n").is_err());
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        assert!(ManagerConfig::from_yaml("max_packet_size: [1, 2\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "client_name: Studio\nmax_packet_size: 256\ndebug_logging: true\nhotplug_poll_interval_ms: 250"
        )
        .unwrap();

        let config = ManagerConfig::load(file.path()).await.unwrap();

        assert_eq!(
            config,
            ManagerConfig {
                client_name: Some("Studio".into()),
                max_packet_size: 256,
                debug_logging: true,
                hotplug_poll_interval_ms: 250,
            }
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_fails_but_default_fallback_works() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");

        assert!(ManagerConfig::load(&missing).await.is_err());
        assert_eq!(
            ManagerConfig::load_or_default(&missing).await.unwrap(),
            ManagerConfig::default()
        );
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("midi.yaml");
        let config = ManagerConfig {
            client_name: Some("Rig".into()),
            max_packet_size: 1024,
            ..ManagerConfig::default()
        };

        config.save(&path).await.unwrap();

        assert_eq!(ManagerConfig::load(&path).await.unwrap(), config);
    }
}
