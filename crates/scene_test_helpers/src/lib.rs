//! Shared test utilities for SceneSync test suites
//!
//! This crate provides an in-memory host scene, a scripted server and common
//! assertions so every suite drives the engine the same way.
//!
//! # Modules
//!
//! - [`objects`]: Host object types with static field tables
//! - [`scene`]: In-memory [`HostStore`](scene_sync::HostStore)
//! - [`server`]: Scripted server-of-record over a channel link
//! - [`workspace`]: Temporary project roots with a config file
//! - [`logging`]: Test logging configuration
//! - [`assertions`]: Predicates over sent operations
//!
//! # Example
//!
//! ```rust
//! use scene_test_helpers::prelude::*;
//!
//! let (mut engine, mut server) = test_engine();
//! let mut scene = TestScene::new();
//! let handle = scene.add(TestObject::transform());
//!
//! engine.track(&mut scene, handle).unwrap();
//! engine.tick(&mut scene).unwrap();
//! assert!(sent_create("Transform").eval(server.pump().as_slice()));
//! ```

pub mod assertions;
pub mod logging;
pub mod objects;
pub mod scene;
pub mod server;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::logging::{init_test_logging, suppress_logs, trace_engine};
    pub use crate::objects::{TestObject, CRATE, LIGHT, TRANSFORM};
    pub use crate::scene::TestScene;
    pub use crate::server::{engine_with_config, test_config, test_engine, FakeServer};
    pub use crate::workspace::{temp_dir, workspace_with_config};
    pub use predicates::prelude::*;
}
