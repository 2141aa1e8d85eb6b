//! Configuration file handling
//!
//! The agent keeps its settings in a TOML file which also caches the device
//! access token between runs:
//! - Typed view (`AgentConfig`) consumed by the rest of the agent
//! - Dotted-key `get` / `set` over the raw table, so rewrites keep unknown keys
//! - Explicit `flush` back to disk

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::models::AttributeValue;

pub const DEFAULT_CONFIG_FILE: &str = "thingslink.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("cannot set '{0}': a parent key is not a table")]
    NotATable(String),
}

/// Typed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub platform: PlatformConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the platform, e.g. `https://thingsboard.cloud`
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// MQTT broker host; defaults to the host part of `url`
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Attach the gateway alarm rules when the profile is created
    #[serde(default = "default_true")]
    pub alarm_rules: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub attribute_scope: AttributeScope,
    #[serde(default = "default_sensors")]
    pub sensors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeScope {
    #[default]
    Server,
    Client,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            attribute_scope: AttributeScope::default(),
            sensors: default_sensors(),
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_profile_name() -> String {
    "GatewayProfile".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    10
}

fn default_sensors() -> Vec<String> {
    vec!["Sensor1".into(), "Sensor2".into(), "Sensor3".into()]
}

impl AgentConfig {
    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.platform.url.trim().is_empty() {
            return Err(ConfigError::Invalid("platform.url is empty".into()));
        }
        if self.platform.username.trim().is_empty() {
            return Err(ConfigError::Invalid("platform.username is empty".into()));
        }
        if self.device.name.trim().is_empty() {
            return Err(ConfigError::Invalid("device.name is empty".into()));
        }
        if self.device.profile_name.trim().is_empty() {
            return Err(ConfigError::Invalid("device.profile_name is empty".into()));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::Invalid("telemetry.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

impl PlatformConfig {
    /// Broker host, falling back to the host of the REST URL
    pub fn mqtt_host(&self) -> String {
        if let Some(host) = self.mqtt_host.as_deref().filter(|h| !h.is_empty()) {
            return host.to_string();
        }
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// TOML-backed key/value store
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    table: toml::Table,
}

impl ConfigStore {
    /// Load the file at `path`
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        Self::parse(path, &content)
    }

    pub fn parse(path: impl Into<PathBuf>, content: &str) -> Result<Self, ConfigError> {
        let path = path.into();
        let table = content
            .parse::<toml::Table>()
            .map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, table })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Typed view of the current table
    pub fn config(&self) -> Result<AgentConfig, ConfigError> {
        toml::Value::Table(self.table.clone())
            .try_into::<AgentConfig>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Look up a dotted key such as `device.access_token`
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        let mut parts = key.split('.');
        let mut current = self.table.get(parts.next()?)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(toml::Value::as_str)
    }

    /// Set a dotted key, creating intermediate tables as needed
    pub fn set(&mut self, key: &str, value: impl Into<toml::Value>) -> Result<(), ConfigError> {
        let parts: Vec<&str> = key.split('.').collect();
        let (last, parents) = parts
            .split_last()
            .ok_or_else(|| ConfigError::Invalid("empty key".into()))?;

        let mut table = &mut self.table;
        for part in parents {
            table = table
                .entry(part.to_string())
                .or_insert(toml::Value::Table(toml::Table::new()))
                .as_table_mut()
                .ok_or_else(|| ConfigError::NotATable(key.to_string()))?;
        }
        table.insert(last.to_string(), value.into());
        Ok(())
    }

    /// Write the table back to its file
    pub async fn flush(&self) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&self.table)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!("Configuration flushed to {}", self.path.display());
        Ok(())
    }
}
