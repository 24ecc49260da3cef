//! Common types and errors for SceneSync
//!
//! This crate provides the shared error type and identifiers used across all
//! SceneSync components.

pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Shared error types for SceneSync operations outside the replication core
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Identity of a client connected to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SceneError>;
