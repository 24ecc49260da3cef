//! Outbound operation queue
//!
//! Local ops are queued against node keys and only turned into [`LocalOp`]s
//! when flushed, because a node created this tick has no server id yet. The
//! queue is strictly ordered: an op whose node (or new parent) is still
//! unconfirmed holds back everything behind it until `ConfirmCreate` arrives.

use crate::graph::{NodeId, NodeKey, SyncGraph};
use crate::path::TreeChange;
use crate::property::Dictionary;
use crate::protocol::LocalOp;
use crate::session::SessionLink;
use crate::Result;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum PendingKind {
    Create {
        type_tag: String,
        parent: Option<NodeKey>,
        child_index: u32,
        properties: Dictionary,
    },
    Delete,
    Lock {
        full: bool,
    },
    Unlock,
    ParentChange {
        parent: Option<NodeKey>,
        child_index: u32,
    },
    Change(TreeChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub target: NodeKey,
    pub kind: PendingKind,
}

enum Resolved {
    Ready(LocalOp),
    Blocked,
    Dropped,
}

#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<PendingOp>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.queue.iter()
    }

    pub fn has_ops_for(&self, target: NodeKey) -> bool {
        self.queue.iter().any(|op| op.target == target)
    }

    /// Queue an op; a `Set` directly following a `Set` of the same path replaces it
    pub fn push(&mut self, target: NodeKey, kind: PendingKind) {
        if let PendingKind::Change(TreeChange::Set { path, value }) = &kind {
            if let Some(PendingOp {
                target: last_target,
                kind: PendingKind::Change(TreeChange::Set { path: last_path, value: last_value }),
            }) = self.queue.back_mut()
            {
                if *last_target == target && *last_path == *path {
                    tracing::trace!("Coalescing set of {} on {}", path, target);
                    *last_value = value.clone();
                    return;
                }
            }
        }
        self.queue.push_back(PendingOp { target, kind });
    }

    /// Drop every queued op for `target`.
    ///
    /// Returns true when a `Create` was among them, meaning the server never
    /// heard of the node.
    pub fn cancel(&mut self, target: NodeKey) -> bool {
        let mut had_create = false;
        self.queue.retain(|op| {
            if op.target != target {
                return true;
            }
            had_create |= matches!(op.kind, PendingKind::Create { .. });
            false
        });
        had_create
    }

    /// Send queued ops in order until the queue empties or the head is blocked
    pub fn flush(&mut self, graph: &SyncGraph, link: &mut dyn SessionLink) -> Result<usize> {
        let mut sent = 0;
        while let Some(front) = self.queue.front() {
            match resolve(front, graph) {
                Resolved::Ready(op) => {
                    link.send(op)?;
                    self.queue.pop_front();
                    sent += 1;
                }
                Resolved::Blocked => {
                    tracing::trace!(
                        "Outbox blocked on unconfirmed {} ({} queued)",
                        front.target,
                        self.queue.len()
                    );
                    break;
                }
                Resolved::Dropped => {
                    tracing::debug!("Dropping queued op for removed {}", front.target);
                    self.queue.pop_front();
                }
            }
        }
        Ok(sent)
    }
}

enum ParentRef {
    Resolved(Option<NodeId>),
    Unconfirmed,
    Missing,
}

fn parent_ref(parent: Option<NodeKey>, graph: &SyncGraph) -> ParentRef {
    match parent {
        None => ParentRef::Resolved(None),
        Some(key) => match graph.get(key) {
            None => ParentRef::Missing,
            Some(node) if node.is_confirmed() => ParentRef::Resolved(Some(node.id)),
            Some(_) => ParentRef::Unconfirmed,
        },
    }
}

fn resolve(pending: &PendingOp, graph: &SyncGraph) -> Resolved {
    if let PendingKind::Create {
        type_tag,
        parent,
        child_index,
        properties,
    } = &pending.kind
    {
        if graph.get(pending.target).is_none() {
            return Resolved::Dropped;
        }
        return match parent_ref(*parent, graph) {
            ParentRef::Resolved(parent) => Resolved::Ready(LocalOp::Create {
                local_key: pending.target.0,
                type_tag: type_tag.clone(),
                parent,
                child_index: *child_index,
                properties: properties.clone(),
            }),
            ParentRef::Unconfirmed => Resolved::Blocked,
            ParentRef::Missing => Resolved::Dropped,
        };
    }

    let Some(node) = graph.get(pending.target) else {
        return Resolved::Dropped;
    };
    if !node.is_confirmed() {
        return Resolved::Blocked;
    }
    let id = node.id;

    let op = match &pending.kind {
        PendingKind::Create { .. } => return Resolved::Dropped,
        PendingKind::Delete => LocalOp::Delete { id },
        PendingKind::Lock { full } => LocalOp::Lock { id, full: *full },
        PendingKind::Unlock => LocalOp::Unlock { id },
        PendingKind::ParentChange { parent, child_index } => match parent_ref(*parent, graph) {
            ParentRef::Resolved(parent) => LocalOp::ParentChange {
                id,
                parent,
                child_index: *child_index,
            },
            ParentRef::Unconfirmed => return Resolved::Blocked,
            ParentRef::Missing => return Resolved::Dropped,
        },
        PendingKind::Change(change) => match change.clone() {
            TreeChange::Set { path, value } => LocalOp::PropertyChange { id, path, value },
            TreeChange::RemoveField { path, field } => LocalOp::RemoveField { id, path, field },
            TreeChange::ListAdd { path, index, values } => LocalOp::ListAdd {
                id,
                path,
                index,
                values,
            },
            TreeChange::ListRemove { path, index, count } => LocalOp::ListRemove {
                id,
                path,
                index,
                count,
            },
        },
    };
    Resolved::Ready(op)
}
