//! # SceneSync Replication Engine
//!
//! Property synchronization and undo-aware replication of a shared scene graph.
//!
//! ## Architecture
//!
//! - **Property tree**: [`PropertyNode`] mirrors every synchronized host field
//! - **Diff/apply**: [`PropertyManager`] converts host fields to and from trees,
//!   patching existing nodes in place so only the differing leaves are reported
//! - **Checksum**: [`ChecksumEngine`] fingerprints trees and host objects
//! - **Graph**: [`SyncGraph`] holds the replicated [`SyncNode`]s and their lock state
//! - **Session**: [`SessionLink`] is the boundary to the server-of-record
//! - **Undo**: [`UndoManager`] keeps the host's undo/redo stack coherent with
//!   distributed edits
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scene_sync::{ChannelLink, PropertyTranslator, SyncEngine};
//! use scene_config::Config;
//!
//! # fn run(scene: &mut dyn scene_sync::HostStore) -> scene_sync::Result<()> {
//! let config = Config::default();
//! scene_common::telemetry::init_tracing(config.logging.verbose, config.logging.json);
//! let (link, _server) = ChannelLink::pair(config.session.client_id);
//!
//! let mut engine = SyncEngine::new(config, Box::new(link))?;
//! engine.register(Box::new(PropertyTranslator::new("Transform")))?;
//!
//! // Once per host update tick
//! let report = engine.tick(scene)?;
//! tracing::debug!("applied {} remote ops", report.remote_ops);
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod convert;
pub mod engine;
pub mod graph;
pub mod host;
pub mod outbox;
pub mod path;
pub mod property;
pub mod property_manager;
pub mod protocol;
pub mod session;
pub mod translator;
pub mod undo;

pub use checksum::{ChecksumEngine, ChecksumFilter, Fletcher64};
pub use engine::{SyncEngine, TickReport};
pub use graph::{LockMode, LockState, NodeId, NodeKey, SyncGraph, SyncNode};
pub use host::{
    FieldDescriptor, FieldError, FieldKind, FieldValue, HostObject, HostStore, NoReferences, ObjectHandle,
    ReferenceResolver, StableIdentity,
};
pub use path::{ChangeSet, PathSegment, PropertyPath, TreeChange};
pub use property::{Dictionary, FromProperty, PropertyKind, PropertyNode, ValueNode, ValueTag};
pub use property_manager::{ChangeNotification, FieldDelta, PropertyManager};
pub use protocol::{LocalOp, RemoteOp};
pub use scene_common::ClientId;
pub use session::{ChannelLink, ServerEndpoint, SessionLink};
pub use translator::{PropertyTranslator, Translator, TranslatorContext, TranslatorRegistry};
pub use undo::{
    FieldModification, ReplayDirection, ReplayTarget, StructuralChange, Transaction, TransactionId,
    UndoManager,
};

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: String,
    },

    #[error("Unresolved reference to node {0}")]
    UnresolvedReference(NodeId),

    #[error("Node {0} is locked by {1}")]
    LockConflict(NodeKey, ClientId),

    #[error("Stale replay: {0}")]
    StaleReplay(String),

    #[error("No translator registered for type '{0}'")]
    UnknownType(String),

    #[error("Translator for type '{0}' registered twice")]
    DuplicateTranslator(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid property path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Session link closed")]
    Closed,
}

impl SyncError {
    pub(crate) fn mismatch(expected: impl ToString, found: impl ToString) -> Self {
        SyncError::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn invalid_path(path: &PropertyPath, reason: impl Into<String>) -> Self {
        SyncError::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
