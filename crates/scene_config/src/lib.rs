//! Configuration management for SceneSync
//!
//! This crate handles loading and validating `.scenesync/config.toml`

use scene_common::{ClientId, Result, SceneError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Project root path (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Property synchronization settings
    #[serde(default)]
    pub properties: PropertyConfig,

    /// Undo capture settings
    #[serde(default)]
    pub undo: UndoConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session configuration ([session])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity of this client, assigned by the session handshake
    #[serde(default = "default_client_id")]
    pub client_id: ClientId,

    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Maximum remote operations applied per tick (0 = unlimited)
    #[serde(default)]
    pub max_ops_per_tick: usize,
}

fn default_client_id() -> ClientId {
    ClientId(1)
}
fn default_client_name() -> String {
    "SceneSync User".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_name: default_client_name(),
            max_ops_per_tick: 0,
        }
    }
}

/// How local changes are detected each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Only objects reported dirty by the host are diffed
    #[default]
    Dirty,
    /// Every tracked object is diffed every tick
    Full,
}

/// Property configuration ([properties])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    #[serde(default)]
    pub scan_mode: ScanMode,

    /// Flush the pending-write cache at the end of every tick
    #[serde(default = "default_true")]
    pub flush_writes_each_tick: bool,

    /// Field names excluded from object checksums (bookkeeping churn)
    #[serde(default = "default_checksum_ignore")]
    pub checksum_ignore_fields: Vec<String>,
}

fn default_checksum_ignore() -> Vec<String> {
    vec!["hideFlags".to_string()]
}

impl Default for PropertyConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::default(),
            flush_writes_each_tick: true,
            checksum_ignore_fields: default_checksum_ignore(),
        }
    }
}

/// Undo configuration ([undo])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum transactions kept on the undo stack (0 = unlimited)
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    256
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: default_max_history(),
        }
    }
}

/// Logging configuration ([logging])
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from workspace root
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let config_path = workspace_root.join(".scenesync/config.toml");

        if !config_path.exists() {
            return Ok(Self {
                root: workspace_root.to_path_buf(),
                ..Self::default()
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| SceneError::ConfigError(format!("Failed to read config: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| SceneError::ConfigError(format!("Failed to parse config: {}", e)))?;

        config.root = workspace_root.to_path_buf();
        Ok(config)
    }

    /// Load config from a TOML file
    pub fn from_toml(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        let mut config: Self = toml::from_str(&content)?;
        if let Some(parent) = path.parent() {
            config.root = parent.to_path_buf();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session.client_id.0 == 0 {
            anyhow::bail!("session.client_id 0 is reserved");
        }
        if self.session.client_name.trim().is_empty() {
            anyhow::bail!("session.client_name cannot be empty");
        }
        if self
            .properties
            .checksum_ignore_fields
            .iter()
            .any(|f| f.is_empty())
        {
            anyhow::bail!("properties.checksum_ignore_fields cannot contain empty names");
        }
        Ok(())
    }
}
