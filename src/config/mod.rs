//! Core Configuration
//!
//! Service-wide settings, as opposed to the per-connection parameters in
//! [`crate::ssh::RawConnectionConfig`]. Every field has a default, so an
//! empty JSON object is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub tunnels: TunnelSettings,
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep period; sessions idle for twice this long get probed
    #[serde(default = "default_health_period_ms")]
    pub period_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_health_period_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: default_health_period_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Tunnel listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSettings {
    /// Address tunnels listen on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    /// Read a JSON config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json_str(&contents)?;
        tracing::info!("Loaded core config from {}", path.as_ref().display());
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.health.period_ms == 0 {
            return Err(ConfigError::Invalid("health.periodMs must be greater than zero".into()));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "health.probeTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.tunnels.bind_address.trim().is_empty() {
            return Err(ConfigError::Invalid("tunnels.bindAddress is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.health.period_ms, 30_000);
        assert_eq!(config.tunnels.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{"health": {"periodMs": 1000, "enabled": false}}"#;
        let config = CoreConfig::from_json_str(json).unwrap();
        assert!(!config.health.enabled);
        assert_eq!(config.health.period_ms, 1000);
        assert_eq!(config.health.probe_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_zero_period() {
        let err = CoreConfig::from_json_str(r#"{"health": {"periodMs": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        tokio::fs::write(&path, r#"{"tunnels": {"bindAddress": "127.0.0.2"}}"#)
            .await
            .unwrap();

        let config = CoreConfig::load(&path).await.unwrap();
        assert_eq!(config.tunnels.bind_address, "127.0.0.2");
    }
}
