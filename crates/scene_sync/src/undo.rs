//! Undo transaction capture and replay
//!
//! Mirrors the host's undo/redo stacks. Local edits accumulate in a pending
//! transaction until the host registers a checkpoint; undo and redo move the
//! top transaction between the stacks and replay it through a
//! [`ReplayTarget`] with recording suppressed.
//!
//! Transactions hold field-level before/after values and structural moves
//! only, never whole-object snapshots.

use crate::host::ObjectHandle;
use crate::property::PropertyNode;
use crate::SyncError;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// One field's change; `None` means the field was at its default
#[derive(Debug, Clone, PartialEq)]
pub struct FieldModification {
    pub handle: ObjectHandle,
    pub field: String,
    pub before: Option<PropertyNode>,
    pub after: Option<PropertyNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructuralChange {
    Reparent {
        handle: ObjectHandle,
        old_parent: Option<ObjectHandle>,
        old_index: u32,
        new_parent: Option<ObjectHandle>,
        new_index: u32,
    },
    /// Sibling order change under the same parent
    Reorder {
        handle: ObjectHandle,
        parent: Option<ObjectHandle>,
        old_index: u32,
        new_index: u32,
    },
}

impl StructuralChange {
    pub fn handle(&self) -> ObjectHandle {
        match self {
            StructuralChange::Reparent { handle, .. } | StructuralChange::Reorder { handle, .. } => *handle,
        }
    }

    /// Parent and index the object should end up at when replaying
    pub fn placement(&self, direction: ReplayDirection) -> (Option<ObjectHandle>, u32) {
        match (self, direction) {
            (
                StructuralChange::Reparent {
                    old_parent, old_index, ..
                },
                ReplayDirection::Undo,
            ) => (*old_parent, *old_index),
            (
                StructuralChange::Reparent {
                    new_parent, new_index, ..
                },
                ReplayDirection::Redo,
            ) => (*new_parent, *new_index),
            (StructuralChange::Reorder { parent, old_index, .. }, ReplayDirection::Undo) => (*parent, *old_index),
            (StructuralChange::Reorder { parent, new_index, .. }, ReplayDirection::Redo) => (*parent, *new_index),
        }
    }

    fn merge(&mut self, later: &StructuralChange) -> bool {
        match (self, later) {
            (
                StructuralChange::Reparent {
                    handle,
                    new_parent,
                    new_index,
                    ..
                },
                StructuralChange::Reparent {
                    handle: h,
                    new_parent: p,
                    new_index: i,
                    ..
                },
            ) if handle == h => {
                *new_parent = *p;
                *new_index = *i;
                true
            }
            (
                StructuralChange::Reorder {
                    handle,
                    parent,
                    new_index,
                    ..
                },
                StructuralChange::Reorder {
                    handle: h,
                    parent: p,
                    new_index: i,
                    ..
                },
            ) if handle == h && parent == p => {
                *new_index = *i;
                true
            }
            _ => false,
        }
    }
}

/// Edits recorded between two host checkpoints
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub recorded_at: DateTime<Utc>,
    pub fields: Vec<FieldModification>,
    pub structure: Vec<StructuralChange>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.structure.is_empty()
    }

    /// Objects touched by this transaction, in first-seen order
    pub fn handles(&self) -> Vec<ObjectHandle> {
        let mut handles = Vec::new();
        let all = self
            .structure
            .iter()
            .map(StructuralChange::handle)
            .chain(self.fields.iter().map(|m| m.handle));
        for handle in all {
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        handles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    Undo,
    Redo,
}

/// Applies replayed steps to the host and the replicated graph.
///
/// Returning [`SyncError::StaleReplay`] skips the rest of the transaction;
/// [`SyncError::LockConflict`] skips only that step.
pub trait ReplayTarget {
    fn apply_field(&mut self, modification: &FieldModification, value: Option<&PropertyNode>) -> crate::Result<()>;

    fn apply_structure(&mut self, change: &StructuralChange, direction: ReplayDirection) -> crate::Result<()>;

    /// Called once after a replay; re-applies lock state for the touched objects
    fn finish(&mut self, touched: &[ObjectHandle]);
}

enum Step<'a> {
    Field(&'a FieldModification),
    Structure(&'a StructuralChange),
}

impl Step<'_> {
    fn handle(&self) -> ObjectHandle {
        match self {
            Step::Field(m) => m.handle,
            Step::Structure(s) => s.handle(),
        }
    }
}

pub struct UndoManager {
    undo: Vec<Transaction>,
    redo: Vec<Transaction>,
    pending_fields: Vec<FieldModification>,
    pending_structure: Vec<StructuralChange>,
    next_id: u64,
    /// 0 = unlimited
    max_history: usize,
    replaying: bool,
    suppress_next: bool,
    active: Option<TransactionId>,
}

impl UndoManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            pending_fields: Vec::new(),
            pending_structure: Vec::new(),
            next_id: 0,
            max_history,
            replaying: false,
            suppress_next: false,
            active: None,
        }
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Transaction currently being replayed
    pub fn active(&self) -> Option<TransactionId> {
        self.active
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_fields.is_empty() || !self.pending_structure.is_empty()
    }

    pub fn peek_undo(&self) -> Option<&Transaction> {
        self.undo.last()
    }

    pub fn peek_redo(&self) -> Option<&Transaction> {
        self.redo.last()
    }

    /// Record a field edit into the pending transaction.
    ///
    /// A combinable edit of a field already pending keeps the first `before`
    /// and takes the new `after`; if that nets out to no change the record is
    /// dropped.
    pub fn record_field(&mut self, modification: FieldModification, combinable: bool) {
        if self.replaying {
            return;
        }
        if combinable {
            let existing = self
                .pending_fields
                .iter()
                .position(|m| m.handle == modification.handle && m.field == modification.field);
            if let Some(i) = existing {
                self.pending_fields[i].after = modification.after;
                if self.pending_fields[i].before == self.pending_fields[i].after {
                    self.pending_fields.remove(i);
                }
                return;
            }
        }
        self.pending_fields.push(modification);
    }

    pub fn record_structure(&mut self, change: StructuralChange, combinable: bool) {
        if self.replaying {
            return;
        }
        if combinable {
            if let Some(existing) = self.pending_structure.iter_mut().rev().find(|c| c.handle() == change.handle()) {
                if existing.merge(&change) {
                    return;
                }
            }
        }
        self.pending_structure.push(change);
    }

    /// Force-revert the next checkpointed transaction instead of keeping it
    pub fn suppress_next_transaction(&mut self) {
        self.suppress_next = true;
    }

    /// Close the pending transaction at a host checkpoint.
    ///
    /// Clears the redo stack unless `preserve_redo`. Returns `None` when
    /// nothing was pending or the transaction was suppressed.
    pub fn checkpoint(&mut self, target: &mut dyn ReplayTarget, preserve_redo: bool) -> Option<TransactionId> {
        if !self.has_pending() {
            return None;
        }
        self.next_id += 1;
        let transaction = Transaction {
            id: TransactionId(self.next_id),
            recorded_at: Utc::now(),
            fields: std::mem::take(&mut self.pending_fields),
            structure: std::mem::take(&mut self.pending_structure),
        };

        if std::mem::take(&mut self.suppress_next) {
            tracing::info!("Reverting suppressed {}", transaction.id);
            self.replay(&transaction, ReplayDirection::Undo, target);
            return None;
        }

        let id = transaction.id;
        tracing::debug!(
            "Checkpoint {}: {} field edits, {} structural",
            id,
            transaction.fields.len(),
            transaction.structure.len()
        );
        self.undo.push(transaction);
        if self.max_history > 0 && self.undo.len() > self.max_history {
            let dropped = self.undo.len() - self.max_history;
            self.undo.drain(..dropped);
        }
        if !preserve_redo {
            self.redo.clear();
        }
        Some(id)
    }

    #[tracing::instrument(skip_all, fields(depth = self.undo.len()))]
    pub fn undo(&mut self, target: &mut dyn ReplayTarget) -> Option<TransactionId> {
        let transaction = self.undo.pop()?;
        self.replay(&transaction, ReplayDirection::Undo, target);
        let id = transaction.id;
        self.redo.push(transaction);
        Some(id)
    }

    #[tracing::instrument(skip_all, fields(depth = self.redo.len()))]
    pub fn redo(&mut self, target: &mut dyn ReplayTarget) -> Option<TransactionId> {
        let transaction = self.redo.pop()?;
        self.replay(&transaction, ReplayDirection::Redo, target);
        let id = transaction.id;
        self.undo.push(transaction);
        Some(id)
    }

    fn replay(&mut self, transaction: &Transaction, direction: ReplayDirection, target: &mut dyn ReplayTarget) {
        self.replaying = true;
        self.active = Some(transaction.id);

        // Redo runs moves then fields in recorded order; undo is the exact mirror
        let mut steps: Vec<Step<'_>> = transaction
            .structure
            .iter()
            .map(Step::Structure)
            .chain(transaction.fields.iter().map(Step::Field))
            .collect();
        if direction == ReplayDirection::Undo {
            steps.reverse();
        }

        let mut touched = Vec::new();
        for step in steps {
            let handle = step.handle();
            let result = match step {
                Step::Field(m) => {
                    let value = match direction {
                        ReplayDirection::Undo => m.before.as_ref(),
                        ReplayDirection::Redo => m.after.as_ref(),
                    };
                    target.apply_field(m, value)
                }
                Step::Structure(change) => target.apply_structure(change, direction),
            };
            match result {
                Ok(()) => {
                    if !touched.contains(&handle) {
                        touched.push(handle);
                    }
                }
                Err(SyncError::StaleReplay(reason)) => {
                    tracing::warn!("Skipping rest of {}: {}", transaction.id, reason);
                    break;
                }
                Err(SyncError::LockConflict(key, owner)) => {
                    tracing::debug!("Skipping step on {} locked by {}", key, owner);
                }
                Err(e) => tracing::warn!(%handle, "Replay step of {} failed: {}", transaction.id, e),
            }
        }

        target.finish(&touched);
        self.active = None;
        self.replaying = false;
    }
}
