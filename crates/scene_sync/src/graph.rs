//! Replicated node graph
//!
//! Nodes live in an arena keyed by a client-local [`NodeKey`]. The server id
//! is only known after `ConfirmCreate`, so every cross-node link inside the
//! graph goes through keys; ids are an index for resolving remote ops.

use crate::host::{ObjectHandle, ReferenceResolver};
use crate::property::Dictionary;
use crate::{Result, SyncError};
use indexmap::IndexMap;
use scene_common::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Server-assigned node id; `0` means unconfirmed
pub type NodeId = u32;

/// Client-local arena key, assigned when the node enters the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(pub u64);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Blocks property edits only
    #[default]
    Partial,
    /// Also blocks structural changes
    Full,
}

/// Write ownership of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    pub owner: Option<ClientId>,
    pub mode: LockMode,
    /// Outstanding request from this client
    pub requested: Option<LockMode>,
    /// This client holds the lock
    pub held: bool,
    /// Release once the pending local edit has been flushed
    pub transient: bool,
    /// A local edit went upstream while the transient lock was held
    pub edited: bool,
}

impl LockState {
    /// Another client owns the node
    pub fn is_locked(&self, local: ClientId) -> bool {
        self.owner.is_some_and(|owner| owner != local)
    }

    pub fn is_fully_locked(&self, local: ClientId) -> bool {
        self.is_locked(local) && self.mode == LockMode::Full
    }

    pub fn is_lock_pending(&self) -> bool {
        self.requested.is_some()
    }

    pub fn is_owned_by(&self, client: ClientId) -> bool {
        self.owner == Some(client)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncNode {
    pub key: NodeKey,
    pub id: NodeId,
    /// Selects the translator that owns this node
    pub type_tag: String,
    pub parent: Option<NodeKey>,
    pub child_index: u32,
    pub lock: LockState,
    /// Sparse root of the synchronized state
    pub properties: Dictionary,
    pub handle: Option<ObjectHandle>,
    /// Delete sent, waiting for `ConfirmDelete`
    pub deleting: bool,
}

impl SyncNode {
    pub fn new(type_tag: impl Into<String>, properties: Dictionary) -> Self {
        Self {
            key: NodeKey(0),
            id: 0,
            type_tag: type_tag.into(),
            parent: None,
            child_index: 0,
            lock: LockState::default(),
            properties,
            handle: None,
            deleting: false,
        }
    }

    pub fn with_handle(mut self, handle: ObjectHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.id != 0
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// All nodes this client knows about
#[derive(Debug, Default)]
pub struct SyncGraph {
    next_key: u64,
    nodes: IndexMap<NodeKey, SyncNode>,
    by_id: HashMap<NodeId, NodeKey>,
    by_handle: HashMap<ObjectHandle, NodeKey>,
}

impl SyncGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node under a fresh key, indexing its id and handle
    pub fn insert(&mut self, mut node: SyncNode) -> NodeKey {
        self.next_key += 1;
        let key = NodeKey(self.next_key);
        node.key = key;
        if node.is_confirmed() {
            self.by_id.insert(node.id, key);
        }
        if let Some(handle) = node.handle {
            self.by_handle.insert(handle, key);
        }
        self.nodes.insert(key, node);
        key
    }

    pub fn get(&self, key: NodeKey) -> Option<&SyncNode> {
        self.nodes.get(&key)
    }

    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut SyncNode> {
        self.nodes.get_mut(&key)
    }

    pub fn key_of(&self, id: NodeId) -> Option<NodeKey> {
        self.by_id.get(&id).copied()
    }

    pub fn key_for_handle(&self, handle: ObjectHandle) -> Option<NodeKey> {
        self.by_handle.get(&handle).copied()
    }

    pub fn by_id(&self, id: NodeId) -> Option<&SyncNode> {
        self.key_of(id).and_then(|key| self.get(key))
    }

    pub fn by_handle(&self, handle: ObjectHandle) -> Option<&SyncNode> {
        self.key_for_handle(handle).and_then(|key| self.get(key))
    }

    /// Server id of a node, `None` while unconfirmed
    pub fn id_of(&self, key: NodeKey) -> Option<NodeId> {
        self.get(key).map(|node| node.id).filter(|id| *id != 0)
    }

    pub fn handle_of(&self, key: NodeKey) -> Option<ObjectHandle> {
        self.get(key).and_then(|node| node.handle)
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncNode> {
        self.nodes.values()
    }

    /// Finalize a local node's id
    pub fn confirm(&mut self, key: NodeKey, id: NodeId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| SyncError::NodeNotFound(key.to_string()))?;
        if node.is_confirmed() && node.id != id {
            self.by_id.remove(&node.id);
        }
        node.id = id;
        self.by_id.insert(id, key);
        Ok(())
    }

    pub fn bind(&mut self, key: NodeKey, handle: ObjectHandle) {
        if let Some(node) = self.nodes.get_mut(&key) {
            if let Some(old) = node.handle.replace(handle) {
                self.by_handle.remove(&old);
            }
            self.by_handle.insert(handle, key);
        }
    }

    pub fn unbind(&mut self, key: NodeKey) -> Option<ObjectHandle> {
        let handle = self.nodes.get_mut(&key)?.handle.take()?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    /// Direct children ordered by child index
    pub fn children_of(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut children: Vec<&SyncNode> = self.nodes.values().filter(|n| n.parent == Some(key)).collect();
        children.sort_by_key(|n| n.child_index);
        children.into_iter().map(|n| n.key).collect()
    }

    /// `key` followed by all of its descendants, parents before children
    pub fn subtree(&self, key: NodeKey) -> Vec<NodeKey> {
        if !self.nodes.contains_key(&key) {
            return Vec::new();
        }
        // One pass over the arena; `parent` is edited in place, so there is no standing index
        let mut children: HashMap<NodeKey, Vec<&SyncNode>> = HashMap::new();
        for node in self.nodes.values() {
            if let Some(parent) = node.parent {
                children.entry(parent).or_default().push(node);
            }
        }
        let mut keys = vec![key];
        let mut i = 0;
        while i < keys.len() {
            if let Some(mut direct) = children.remove(&keys[i]) {
                direct.sort_by_key(|n| n.child_index);
                keys.extend(direct.into_iter().map(|n| n.key));
            }
            i += 1;
        }
        keys
    }

    /// Remove a node and its descendants, parents first
    pub fn remove_subtree(&mut self, key: NodeKey) -> Vec<SyncNode> {
        let keys = self.subtree(key);
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(node) = self.nodes.shift_remove(&key) {
                if node.is_confirmed() {
                    self.by_id.remove(&node.id);
                }
                if let Some(handle) = node.handle {
                    self.by_handle.remove(&handle);
                }
                removed.push(node);
            }
        }
        if removed.len() > 1 {
            tracing::debug!("Removed {} with {} descendants", key, removed.len() - 1);
        }
        removed
    }
}

impl ReferenceResolver for SyncGraph {
    fn node_id(&self, handle: ObjectHandle) -> Option<NodeId> {
        self.by_handle(handle).map(|node| node.id).filter(|id| *id != 0)
    }

    fn handle(&self, id: NodeId) -> Option<ObjectHandle> {
        self.by_id(id).and_then(|node| node.handle)
    }
}
