//! Operations exchanged with the server-of-record

use crate::graph::NodeId;
use crate::path::PropertyPath;
use crate::property::{Dictionary, PropertyNode};
use scene_common::ClientId;
use serde::{Deserialize, Serialize};

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteOp {
    /// A node created elsewhere enters the local graph
    Create {
        id: NodeId,
        type_tag: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<NodeId>,
        child_index: u32,
        properties: Dictionary,
        #[serde(skip_serializing_if = "Option::is_none")]
        lock_owner: Option<ClientId>,
    },

    /// Id assigned to a node this client created
    ConfirmCreate { local_key: u64, id: NodeId },

    Delete {
        id: NodeId,
        /// Removed because its parent subscription went away
        #[serde(default)]
        unsubscribed: bool,
    },

    ConfirmDelete { id: NodeId },

    Lock { id: NodeId, owner: ClientId, full: bool },

    Unlock { id: NodeId },

    /// Ownership display update
    LockOwnerChange { id: NodeId, owner: Option<ClientId> },

    /// Outcome of this client's own lock request
    DirectLockChange { id: NodeId, held: bool },

    ParentChange {
        id: NodeId,
        parent: Option<NodeId>,
        child_index: u32,
    },

    PropertyChange {
        id: NodeId,
        path: PropertyPath,
        value: PropertyNode,
    },

    RemoveField {
        id: NodeId,
        path: PropertyPath,
        field: String,
    },

    ListAdd {
        id: NodeId,
        path: PropertyPath,
        index: usize,
        values: Vec<PropertyNode>,
    },

    ListRemove {
        id: NodeId,
        path: PropertyPath,
        index: usize,
        count: usize,
    },
}

impl RemoteOp {
    /// Target node id; for `ConfirmCreate` the newly assigned one
    pub fn id(&self) -> NodeId {
        match self {
            RemoteOp::Create { id, .. }
            | RemoteOp::ConfirmCreate { id, .. }
            | RemoteOp::Delete { id, .. }
            | RemoteOp::ConfirmDelete { id }
            | RemoteOp::Lock { id, .. }
            | RemoteOp::Unlock { id }
            | RemoteOp::LockOwnerChange { id, .. }
            | RemoteOp::DirectLockChange { id, .. }
            | RemoteOp::ParentChange { id, .. }
            | RemoteOp::PropertyChange { id, .. }
            | RemoteOp::RemoveField { id, .. }
            | RemoteOp::ListAdd { id, .. }
            | RemoteOp::ListRemove { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteOp::Create { .. } => "Create",
            RemoteOp::ConfirmCreate { .. } => "ConfirmCreate",
            RemoteOp::Delete { .. } => "Delete",
            RemoteOp::ConfirmDelete { .. } => "ConfirmDelete",
            RemoteOp::Lock { .. } => "Lock",
            RemoteOp::Unlock { .. } => "Unlock",
            RemoteOp::LockOwnerChange { .. } => "LockOwnerChange",
            RemoteOp::DirectLockChange { .. } => "DirectLockChange",
            RemoteOp::ParentChange { .. } => "ParentChange",
            RemoteOp::PropertyChange { .. } => "PropertyChange",
            RemoteOp::RemoveField { .. } => "RemoveField",
            RemoteOp::ListAdd { .. } => "ListAdd",
            RemoteOp::ListRemove { .. } => "ListRemove",
        }
    }

    /// Serialize to JSON bytes (diagnostics only)
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LocalOp {
    Create {
        /// Echoed back in `ConfirmCreate`
        local_key: u64,
        type_tag: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<NodeId>,
        child_index: u32,
        properties: Dictionary,
    },

    Delete { id: NodeId },

    Lock { id: NodeId, full: bool },

    /// Release a held lock or cancel a pending request
    Unlock { id: NodeId },

    ParentChange {
        id: NodeId,
        parent: Option<NodeId>,
        child_index: u32,
    },

    PropertyChange {
        id: NodeId,
        path: PropertyPath,
        value: PropertyNode,
    },

    RemoveField {
        id: NodeId,
        path: PropertyPath,
        field: String,
    },

    ListAdd {
        id: NodeId,
        path: PropertyPath,
        index: usize,
        values: Vec<PropertyNode>,
    },

    ListRemove {
        id: NodeId,
        path: PropertyPath,
        index: usize,
        count: usize,
    },
}

impl LocalOp {
    /// Target node id; `None` for `Create`
    pub fn id(&self) -> Option<NodeId> {
        match self {
            LocalOp::Create { .. } => None,
            LocalOp::Delete { id }
            | LocalOp::Lock { id, .. }
            | LocalOp::Unlock { id }
            | LocalOp::ParentChange { id, .. }
            | LocalOp::PropertyChange { id, .. }
            | LocalOp::RemoveField { id, .. }
            | LocalOp::ListAdd { id, .. }
            | LocalOp::ListRemove { id, .. } => Some(*id),
        }
    }

    /// Whether this op edits a node's property tree
    pub fn is_property_edit(&self) -> bool {
        matches!(
            self,
            LocalOp::PropertyChange { .. }
                | LocalOp::RemoveField { .. }
                | LocalOp::ListAdd { .. }
                | LocalOp::ListRemove { .. }
        )
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_op_serialization() {
        let op = RemoteOp::ListRemove {
            id: 7,
            path: PropertyPath::field("items"),
            index: 1,
            count: 1,
        };

        let bytes = op.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "ListRemove");
        assert_eq!(RemoteOp::from_bytes(&bytes).unwrap(), op);
    }

    #[test]
    fn test_delete_defaults_unsubscribed() {
        let op = RemoteOp::from_bytes(br#"{"type":"Delete","id":3}"#).unwrap();
        match op {
            RemoteOp::Delete { id, unsubscribed } => {
                assert_eq!(id, 3);
                assert!(!unsubscribed);
            }
            _ => panic!("Expected Delete op"),
        }
    }

    #[test]
    fn test_local_op_targets() {
        let create = LocalOp::Create {
            local_key: 1,
            type_tag: "Transform".into(),
            parent: None,
            child_index: 0,
            properties: Dictionary::new(),
        };
        assert_eq!(create.id(), None);
        assert!(!create.is_property_edit());

        let set = LocalOp::PropertyChange {
            id: 9,
            path: PropertyPath::field("speed"),
            value: PropertyNode::from(2.0f32),
        };
        assert_eq!(set.id(), Some(9));
        assert!(set.is_property_edit());
    }
}
