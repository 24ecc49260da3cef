//! Tracing setup for the test suites
//!
//! The level applies to the SceneSync crates only; everything else stays at
//! `warn` so a `debug` run shows the engine and not its dependencies.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

const SCENE_CRATES: [&str; 4] = ["scene_sync", "scene_config", "scene_common", "scene_test_helpers"];

/// Filter directives enabling `level` for the SceneSync crates
pub fn scene_filter(level: &str) -> String {
    std::iter::once("warn".to_string())
        .chain(SCENE_CRATES.iter().map(|krate| format!("{}={}", krate, level)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the test subscriber once per process.
///
/// `RUST_LOG` overrides `level` when set. Later calls are ignored.
///
/// ```rust
/// use scene_test_helpers::logging::init_test_logging;
///
/// init_test_logging("debug");
/// ```
pub fn init_test_logging(level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(scene_filter(level)));

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Errors only
pub fn suppress_logs() {
    init_test_logging("error");
}

/// Every op crossing the session boundary, for debugging one failing test
pub fn trace_engine() {
    init_test_logging("trace");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_scopes_level_to_scene_crates() {
        let filter = scene_filter("debug");
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("scene_sync=debug"));
        assert!(filter.contains("scene_test_helpers=debug"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
