//! Temporary project roots for configuration tests

use assert_fs::prelude::*;
use assert_fs::TempDir;

/// Create a temporary directory for testing
///
/// The directory is removed when the `TempDir` is dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// A project root whose `.scenesync/config.toml` holds `toml`
///
/// # Example
///
/// ```rust
/// use scene_test_helpers::workspace::workspace_with_config;
///
/// let root = workspace_with_config("[session]\nclient_id = 3\n");
/// let config = scene_config::Config::load(root.path()).unwrap();
/// assert_eq!(config.session.client_id.0, 3);
/// ```
pub fn workspace_with_config(toml: &str) -> TempDir {
    let temp = temp_dir();
    temp.child(".scenesync/config.toml")
        .write_str(toml)
        .expect("Failed to write config.toml");
    temp
}
