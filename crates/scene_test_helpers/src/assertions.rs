//! Domain-specific assertions for SceneSync tests
//!
//! Predicates over the ops a client sent upstream, for use with
//! [`FakeServer::pump`](crate::server::FakeServer::pump) batches.

use predicates::prelude::*;
use scene_sync::{LocalOp, NodeId};

/// Some op in the batch sets `field` (or a path below it) on node `id`
///
/// # Example
///
/// ```rust
/// use predicates::prelude::*;
/// use scene_sync::{LocalOp, PropertyPath};
/// use scene_test_helpers::assertions::sent_property_change;
///
/// let ops = vec![LocalOp::PropertyChange {
///     id: 7,
///     path: PropertyPath::field("speed"),
///     value: 2.0f32.into(),
/// }];
/// assert!(sent_property_change(7, "speed").eval(ops.as_slice()));
/// assert!(!sent_property_change(7, "label").eval(ops.as_slice()));
/// ```
pub fn sent_property_change(id: NodeId, field: &str) -> impl Predicate<[LocalOp]> {
    let field = field.to_string();
    predicate::function(move |ops: &[LocalOp]| {
        ops.iter().any(|op| match op {
            LocalOp::PropertyChange { id: target, path, .. } => {
                *target == id && path.top_field() == Some(field.as_str())
            }
            _ => false,
        })
    })
}

/// No op in the batch edits a property tree
pub fn no_property_edits() -> impl Predicate<[LocalOp]> {
    predicate::function(|ops: &[LocalOp]| !ops.iter().any(LocalOp::is_property_edit))
}

/// Some op in the batch creates a node of `type_tag`
pub fn sent_create(type_tag: &str) -> impl Predicate<[LocalOp]> {
    let type_tag = type_tag.to_string();
    predicate::function(move |ops: &[LocalOp]| {
        ops.iter()
            .any(|op| matches!(op, LocalOp::Create { type_tag: tag, .. } if *tag == type_tag))
    })
}

/// Some op in the batch removes top-level `field` from node `id`
pub fn sent_field_removal(id: NodeId, field: &str) -> impl Predicate<[LocalOp]> {
    let field = field.to_string();
    predicate::function(move |ops: &[LocalOp]| {
        ops.iter().any(|op| {
            matches!(op, LocalOp::RemoveField { id: target, path, field: removed }
                if *target == id && path.is_root() && *removed == field)
        })
    })
}

/// Ops in the batch that edit a property tree
pub fn property_edits(ops: &[LocalOp]) -> Vec<&LocalOp> {
    ops.iter().filter(|op| op.is_property_edit()).collect()
}
