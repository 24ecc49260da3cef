//! Replication engine
//!
//! [`SyncEngine`] owns every service for one session and is driven by the
//! host once per update tick. Each tick:
//!
//! 1. drains remote ops from the session in delivery order and applies them
//!    (tree first, then host writes queued in the pending-write cache)
//! 2. flushes the pending-write cache
//! 3. runs local change detection: locked nodes are reverted, everything
//!    else is diffed, queued upstream and recorded for undo
//! 4. releases completed transient locks, then flushes the outbox

use crate::checksum::{ChecksumEngine, ChecksumFilter};
use crate::graph::{LockMode, NodeId, NodeKey, SyncGraph, SyncNode};
use crate::host::{HostObject, HostStore, ObjectHandle};
use crate::outbox::{Outbox, PendingKind};
use crate::path::{ChangeSet, TreeChange};
use crate::property::PropertyNode;
use crate::property_manager::{ChangeNotification, FieldDelta, PropertyManager};
use crate::protocol::RemoteOp;
use crate::session::SessionLink;
use crate::translator::{Translator, TranslatorContext, TranslatorRegistry};
use crate::undo::{
    FieldModification, ReplayDirection, ReplayTarget, StructuralChange, TransactionId, UndoManager,
};
use crate::{Result, SyncError};
use indexmap::IndexSet;
use scene_common::ClientId;
use scene_config::{Config, ScanMode};
use std::collections::HashMap;

/// What happened during one tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Remote ops drained from the session
    pub remote_ops: usize,
    /// Per-op failures; replication continued past each of them
    pub errors: Vec<SyncError>,
    /// One per host field written from the pending-write cache
    pub notifications: Vec<ChangeNotification>,
    /// Objects whose local edits were reverted because of a lock
    pub reverted: Vec<ObjectHandle>,
    /// Top-level fields diffed and queued upstream
    pub changed_fields: usize,
    pub released_locks: usize,
    /// Ops handed to the session
    pub sent_ops: usize,
}

impl TickReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn absorb(&mut self, other: TickReport) {
        self.errors.extend(other.errors);
        self.notifications.extend(other.notifications);
        self.reverted.extend(other.reverted);
        self.changed_fields += other.changed_fields;
    }
}

pub struct SyncEngine {
    config: Config,
    client: ClientId,
    link: Box<dyn SessionLink>,
    graph: SyncGraph,
    properties: PropertyManager,
    checksums: ChecksumEngine,
    undo: UndoManager,
    translators: TranslatorRegistry,
    outbox: Outbox,
    /// Reported by the host since the last scan
    dirty: IndexSet<NodeKey>,
    moved: IndexSet<NodeKey>,
    /// Host checksum at the last full-scan diff
    synced: HashMap<NodeKey, u64>,
    /// Results of scans run outside a tick, reported with the next tick
    carry: TickReport,
    connected: bool,
}

impl SyncEngine {
    pub fn new(config: Config, link: Box<dyn SessionLink>) -> Result<Self> {
        config.validate()?;

        let client = link.local_client();
        if client != config.session.client_id {
            tracing::warn!(
                "Session assigned {} but configuration names {}",
                client,
                config.session.client_id
            );
        }

        let checksums = ChecksumEngine::new(ChecksumFilter::ignoring(
            config.properties.checksum_ignore_fields.iter().cloned(),
        ));
        let undo = UndoManager::new(config.undo.max_history);

        tracing::info!(
            "Sync engine started for {} ({}), {:?} scan",
            client,
            config.session.client_name,
            config.properties.scan_mode
        );

        Ok(Self {
            config,
            client,
            link,
            graph: SyncGraph::new(),
            properties: PropertyManager::new(),
            checksums,
            undo,
            translators: TranslatorRegistry::new(),
            outbox: Outbox::new(),
            dirty: IndexSet::new(),
            moved: IndexSet::new(),
            synced: HashMap::new(),
            carry: TickReport::default(),
            connected: true,
        })
    }

    pub fn register(&mut self, translator: Box<dyn Translator>) -> Result<()> {
        self.translators.register(translator)
    }

    pub fn local_client(&self) -> ClientId {
        self.client
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &SyncGraph {
        &self.graph
    }

    pub fn node(&self, handle: ObjectHandle) -> Option<&SyncNode> {
        self.graph.by_handle(handle)
    }

    pub fn history(&self) -> &UndoManager {
        &self.undo
    }

    /// Ops queued but not yet handed to the session
    pub fn pending_outbound(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn key_for(&self, handle: ObjectHandle) -> Result<NodeKey> {
        self.graph
            .key_for_handle(handle)
            .ok_or_else(|| SyncError::NodeNotFound(handle.to_string()))
    }

    fn key_of_id(&self, id: NodeId) -> Result<NodeKey> {
        self.graph
            .key_of(id)
            .ok_or_else(|| SyncError::NodeNotFound(format!("id {}", id)))
    }

    /// Start synchronizing a host object entering scope.
    ///
    /// Returns `None` when the translator declines the object.
    pub fn track(&mut self, hosts: &mut dyn HostStore, handle: ObjectHandle) -> Result<Option<NodeKey>> {
        if let Some(key) = self.graph.key_for_handle(handle) {
            return Ok(Some(key));
        }
        let type_name = hosts
            .object(handle)
            .ok_or_else(|| SyncError::NodeNotFound(handle.to_string()))?
            .type_name()
            .to_string();
        let translator = self.translators.get(&type_name)?;
        let parent = hosts.parent_of(handle).and_then(|p| self.graph.key_for_handle(p));
        let child_index = hosts.child_index(handle);

        let mut ctx = TranslatorContext::new(self.client, &self.graph, hosts, &mut self.properties);
        let Some(mut node) = translator.try_create(&mut ctx, handle) else {
            tracing::debug!(%handle, "Translator for '{}' declined object", type_name);
            return Ok(None);
        };
        node.handle = Some(handle);
        node.parent = parent;
        node.child_index = child_index;

        let create = PendingKind::Create {
            type_tag: node.type_tag.clone(),
            parent,
            child_index,
            properties: node.properties.clone(),
        };
        let key = self.graph.insert(node);
        self.outbox.push(key, create);
        tracing::debug!(%handle, "Tracking '{}' as {}", type_name, key);
        Ok(Some(key))
    }

    /// Stop synchronizing a destroyed host object and its descendants
    pub fn untrack(&mut self, handle: ObjectHandle) -> Result<()> {
        let key = self.key_for(handle)?;
        let subtree = self.graph.subtree(key);

        let mut never_sent = false;
        for (i, k) in subtree.iter().enumerate() {
            let had_create = self.outbox.cancel(*k);
            if i == 0 {
                never_sent = had_create;
            }
            self.forget(*k);
        }

        if never_sent {
            tracing::debug!(%handle, "Dropping {} before the server heard of it", key);
            self.graph.remove_subtree(key);
            return Ok(());
        }

        for k in &subtree {
            if let Some(node) = self.graph.get_mut(*k) {
                node.deleting = true;
            }
            self.graph.unbind(*k);
        }
        self.outbox.push(key, PendingKind::Delete);
        tracing::debug!(%handle, "Deleting {}", key);
        Ok(())
    }

    fn forget(&mut self, key: NodeKey) {
        if let Some(handle) = self.graph.handle_of(key) {
            self.properties.discard(handle);
        }
        self.dirty.shift_remove(&key);
        self.moved.shift_remove(&key);
        self.synced.remove(&key);
    }

    /// Queue a host-reported field change for the next scan
    pub fn mark_dirty(&mut self, handle: ObjectHandle) -> bool {
        match self.graph.key_for_handle(handle) {
            Some(key) => self.dirty.insert(key),
            None => false,
        }
    }

    /// Queue a host-reported reparent or reorder for the next scan
    pub fn report_parent_change(&mut self, handle: ObjectHandle) -> bool {
        match self.graph.key_for_handle(handle) {
            Some(key) => self.moved.insert(key),
            None => false,
        }
    }

    /// Ask the server for write ownership
    pub fn request_lock(&mut self, handle: ObjectHandle, mode: LockMode, transient: bool) -> Result<()> {
        let key = self.key_for(handle)?;
        let client = self.client;
        let node = self
            .graph
            .get_mut(key)
            .ok_or_else(|| SyncError::NodeNotFound(key.to_string()))?;
        let lock = &mut node.lock;

        if lock.is_owned_by(client) && (lock.mode == LockMode::Full || mode == LockMode::Partial) {
            lock.transient &= transient;
            return Ok(());
        }
        if lock.requested == Some(mode) {
            return Ok(());
        }
        lock.requested = Some(mode);
        lock.transient = transient;
        lock.edited = false;
        self.outbox.push(
            key,
            PendingKind::Lock {
                full: mode == LockMode::Full,
            },
        );
        tracing::debug!(%handle, "Requested {:?} lock on {} (transient: {})", mode, key, transient);
        Ok(())
    }

    /// Release a held lock, or cancel a request that has not been granted yet
    pub fn release_lock(&mut self, handle: ObjectHandle) -> Result<()> {
        let key = self.key_for(handle)?;
        let client = self.client;
        let node = self
            .graph
            .get_mut(key)
            .ok_or_else(|| SyncError::NodeNotFound(key.to_string()))?;
        let lock = &mut node.lock;

        let cancelled = lock.requested.take().is_some();
        let owned = lock.is_owned_by(client);
        if !cancelled && !owned {
            return Ok(());
        }
        if owned {
            lock.owner = None;
            lock.mode = LockMode::Partial;
        }
        lock.held = false;
        lock.transient = false;
        lock.edited = false;
        self.outbox.push(key, PendingKind::Unlock);
        tracing::debug!(%handle, cancelled, "Released lock on {}", key);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(client = %self.client))]
    pub fn tick(&mut self, hosts: &mut dyn HostStore) -> Result<TickReport> {
        if !self.connected {
            return Err(SyncError::Closed);
        }
        let mut report = std::mem::take(&mut self.carry);

        if let Err(e) = self.drain_remote(hosts, &mut report) {
            tracing::error!("Session link failed: {}", e);
            self.connected = false;
            return Err(e);
        }
        if self.config.properties.flush_writes_each_tick {
            let notifications = self.flush_pending_writes(hosts);
            report.notifications.extend(notifications);
        }
        self.detect_local_changes(hosts, &mut report);
        report.released_locks = self.release_transient_locks();
        report.sent_ops = self.flush_outbox()?;

        if report.remote_ops > 0 || report.sent_ops > 0 {
            tracing::debug!(
                "Tick: {} remote ops, {} sent, {} writes",
                report.remote_ops,
                report.sent_ops,
                report.notifications.len()
            );
        }
        Ok(report)
    }

    /// Write every queued remote change into the host objects
    pub fn flush_pending_writes(&mut self, hosts: &mut dyn HostStore) -> Vec<ChangeNotification> {
        let notifications = self.properties.flush(hosts);
        for notification in &notifications {
            if let Some(key) = self.graph.key_for_handle(notification.handle) {
                self.synced.remove(&key);
            }
        }
        notifications
    }

    fn flush_outbox(&mut self) -> Result<usize> {
        match self.outbox.flush(&self.graph, self.link.as_mut()) {
            Ok(sent) => Ok(sent),
            Err(e) => {
                tracing::error!("Session link failed: {}", e);
                self.connected = false;
                Err(e)
            }
        }
    }

    fn drain_remote(&mut self, hosts: &mut dyn HostStore, report: &mut TickReport) -> Result<()> {
        let limit = self.config.session.max_ops_per_tick;
        while limit == 0 || report.remote_ops < limit {
            let Some(op) = self.link.poll()? else {
                break;
            };
            report.remote_ops += 1;
            let (name, id) = (op.name(), op.id());
            tracing::debug!("<- {} on node {}", name, id);

            if let Err(e) = self.apply_remote(hosts, op) {
                match &e {
                    SyncError::UnknownType(tag) => {
                        tracing::error!("No translator for '{}' ({} on node {})", tag, name, id)
                    }
                    other => tracing::warn!("{} on node {} failed: {}", name, id, other),
                }
                report.errors.push(e);
            }
        }
        Ok(())
    }

    /// Run `f` with the node's translator and a context over the engine's services
    fn with_translator<T>(
        &mut self,
        hosts: &mut dyn HostStore,
        key: NodeKey,
        f: impl FnOnce(&dyn Translator, &mut TranslatorContext<'_>, &SyncNode) -> Result<T>,
    ) -> Result<T> {
        let node = self
            .graph
            .get(key)
            .ok_or_else(|| SyncError::NodeNotFound(key.to_string()))?;
        let translator = self.translators.get(&node.type_tag)?;
        let mut ctx = TranslatorContext::new(self.client, &self.graph, hosts, &mut self.properties);
        f(translator, &mut ctx, node)
    }

    fn apply_tree_change(&mut self, key: NodeKey, change: &TreeChange) -> Result<()> {
        let node = self
            .graph
            .get_mut(key)
            .ok_or_else(|| SyncError::NodeNotFound(key.to_string()))?;
        change.apply(&mut node.properties)
    }

    fn apply_remote(&mut self, hosts: &mut dyn HostStore, op: RemoteOp) -> Result<()> {
        let client = self.client;
        match op {
            RemoteOp::Create {
                id,
                type_tag,
                parent,
                child_index,
                properties,
                lock_owner,
            } => {
                if self.graph.key_of(id).is_some() {
                    tracing::debug!("Node {} already known, ignoring Create", id);
                    return Ok(());
                }
                self.translators.get(&type_tag)?;
                let parent_key = parent.and_then(|pid| {
                    let key = self.graph.key_of(pid);
                    if key.is_none() {
                        tracing::warn!("Parent {} of node {} unknown, creating as root", pid, id);
                    }
                    key
                });

                let mut node = SyncNode::new(type_tag, properties);
                node.id = id;
                node.parent = parent_key;
                node.child_index = child_index;
                node.lock.owner = lock_owner;
                node.lock.held = lock_owner == Some(client);
                let key = self.graph.insert(node);

                let handle = self.with_translator(hosts, key, |t, ctx, node| Ok(t.get_host_object(ctx, node, None)))?;
                match handle {
                    Some(handle) => self.graph.bind(key, handle),
                    None => tracing::warn!("No host object for node {}", id),
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_create(ctx, node))
            }

            RemoteOp::ConfirmCreate { local_key, id } => {
                let key = NodeKey(local_key);
                self.graph.confirm(key, id)?;
                // References to this node can now resolve
                self.synced.clear();
                let waiting: Vec<NodeKey> = self
                    .graph
                    .iter()
                    .filter(|n| n.handle.is_some() && !n.deleting)
                    .filter(|n| n.properties.values().any(PropertyNode::holds_unresolved_reference))
                    .map(|n| n.key)
                    .collect();
                if !waiting.is_empty() {
                    tracing::debug!("{} nodes hold references awaiting ids, rescanning", waiting.len());
                    self.dirty.extend(waiting);
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_confirm_create(ctx, node))
            }

            RemoteOp::Delete { id, unsubscribed } => {
                let key = self.key_of_id(id)?;
                let subtree = self.graph.subtree(key);
                // Leaves first so host teardown never sees a destroyed parent
                for (i, k) in subtree.iter().enumerate().rev() {
                    let implicit = unsubscribed || i > 0;
                    if let Err(e) = self.with_translator(hosts, *k, |t, ctx, node| t.on_delete(ctx, node, implicit)) {
                        tracing::warn!("Delete handler for {} failed: {}", k, e);
                    }
                    self.outbox.cancel(*k);
                    self.forget(*k);
                }
                self.graph.remove_subtree(key);
                Ok(())
            }

            RemoteOp::ConfirmDelete { id } => {
                let Some(key) = self.graph.key_of(id) else {
                    tracing::debug!("ConfirmDelete for unknown node {}", id);
                    return Ok(());
                };
                let result = self.with_translator(hosts, key, |t, ctx, node| t.on_confirm_delete(ctx, node));
                self.graph.remove_subtree(key);
                result
            }

            RemoteOp::Lock { id, owner, full } => {
                let key = self.key_of_id(id)?;
                if let Some(node) = self.graph.get_mut(key) {
                    node.lock.owner = Some(owner);
                    node.lock.mode = if full { LockMode::Full } else { LockMode::Partial };
                    node.lock.held = owner == client;
                    if owner == client {
                        node.lock.requested = None;
                    }
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_lock(ctx, node))
            }

            RemoteOp::Unlock { id } => {
                let key = self.key_of_id(id)?;
                if let Some(node) = self.graph.get_mut(key) {
                    node.lock.owner = None;
                    node.lock.mode = LockMode::Partial;
                    node.lock.held = false;
                    node.lock.transient = false;
                    node.lock.edited = false;
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_unlock(ctx, node))
            }

            RemoteOp::LockOwnerChange { id, owner } => {
                let key = self.key_of_id(id)?;
                if let Some(node) = self.graph.get_mut(key) {
                    node.lock.owner = owner;
                    node.lock.held = owner == Some(client);
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_lock_owner_change(ctx, node))
            }

            RemoteOp::DirectLockChange { id, held } => {
                let key = self.key_of_id(id)?;
                if let Some(node) = self.graph.get_mut(key) {
                    let requested = node.lock.requested.take();
                    if held {
                        node.lock.owner = Some(client);
                        node.lock.mode = requested.unwrap_or(node.lock.mode);
                        node.lock.held = true;
                    } else {
                        if node.lock.is_owned_by(client) {
                            node.lock.owner = None;
                        }
                        node.lock.held = false;
                        node.lock.transient = false;
                        node.lock.edited = false;
                    }
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_direct_lock_change(ctx, node, held))
            }

            RemoteOp::ParentChange {
                id,
                parent,
                child_index,
            } => {
                let key = self.key_of_id(id)?;
                let parent_key = parent.map(|pid| self.key_of_id(pid)).transpose()?;
                if let Some(node) = self.graph.get_mut(key) {
                    node.parent = parent_key;
                    node.child_index = child_index;
                }
                self.with_translator(hosts, key, |t, ctx, node| t.on_parent_change(ctx, node))
            }

            RemoteOp::PropertyChange { id, path, value } => {
                let key = self.key_of_id(id)?;
                let change = TreeChange::Set { path, value };
                self.apply_tree_change(key, &change)?;
                self.with_translator(hosts, key, |t, ctx, node| t.on_property_change(ctx, node, change.path()))
            }

            RemoteOp::RemoveField { id, path, field } => {
                let key = self.key_of_id(id)?;
                let change = TreeChange::RemoveField {
                    path: path.clone(),
                    field: field.clone(),
                };
                self.apply_tree_change(key, &change)?;
                self.with_translator(hosts, key, |t, ctx, node| t.on_remove_field(ctx, node, &path, &field))
            }

            RemoteOp::ListAdd {
                id,
                path,
                index,
                values,
            } => {
                let key = self.key_of_id(id)?;
                let change = TreeChange::ListAdd { path, index, values };
                self.apply_tree_change(key, &change)?;
                self.with_translator(hosts, key, |t, ctx, node| t.on_list_add(ctx, node, change.path()))
            }

            RemoteOp::ListRemove { id, path, index, count } => {
                let key = self.key_of_id(id)?;
                let change = TreeChange::ListRemove { path, index, count };
                self.apply_tree_change(key, &change)?;
                self.with_translator(hosts, key, |t, ctx, node| t.on_list_remove(ctx, node, change.path()))
            }
        }
    }

    fn detect_local_changes(&mut self, hosts: &mut dyn HostStore, report: &mut TickReport) {
        let moved: Vec<NodeKey> = self.moved.drain(..).collect();
        for key in moved {
            self.process_move(hosts, key, report);
        }

        let full = self.config.properties.scan_mode == ScanMode::Full;
        let targets: Vec<NodeKey> = if full {
            self.dirty.clear();
            self.graph.keys()
        } else {
            self.dirty.drain(..).collect()
        };
        for key in targets {
            self.scan_node(hosts, key, full, report);
        }
    }

    fn scan_node(&mut self, hosts: &mut dyn HostStore, key: NodeKey, use_checksum: bool, report: &mut TickReport) {
        let Some(node) = self.graph.get(key) else {
            return;
        };
        let Some(handle) = node.handle.filter(|_| !node.deleting) else {
            return;
        };
        if self.properties.has_pending(handle) {
            // Remote writes not flushed yet; the host value is stale
            tracing::trace!(%handle, "Deferring scan of {} until writes flush", key);
            self.dirty.insert(key);
            return;
        }
        let Some(host) = hosts.object(handle) else {
            tracing::debug!(%handle, "Host object for {} is gone", key);
            return;
        };

        if let Some(owner) = node.lock.owner.filter(|owner| *owner != self.client) {
            let queued = self.properties.apply_all(handle, host, &node.properties, &self.graph);
            if queued > 0 {
                if let Some(host) = hosts.object_mut(handle) {
                    report.notifications.extend(self.properties.flush_object(handle, host));
                }
                tracing::warn!(%handle, "{} is locked by {}, reverted {} local edits", key, owner, queued);
                report.reverted.push(handle);
            }
            return;
        }
        if node.lock.transient && node.lock.is_lock_pending() {
            tracing::trace!(%handle, "Holding edits on {} until its lock is granted", key);
            self.dirty.insert(key);
            return;
        }

        let checksum = if use_checksum {
            let store: &dyn HostStore = &*hosts;
            let sum = self.checksums.object(host, &|h| store.stable_identity(h));
            if self.synced.get(&key) == Some(&sum) {
                tracing::trace!(%handle, "{} unchanged", key);
                return;
            }
            Some(sum)
        } else {
            None
        };

        let deltas = diff_node(&mut self.graph, &mut self.properties, &mut self.outbox, key, host);
        if let Some(sum) = checksum {
            self.synced.insert(key, sum);
        }
        if deltas.is_empty() {
            return;
        }
        report.changed_fields += deltas.len();
        if self.config.undo.enabled {
            for delta in deltas.into_iter().filter(|d| !d.resolves_reference()) {
                self.undo.record_field(
                    FieldModification {
                        handle,
                        field: delta.field,
                        before: delta.before,
                        after: delta.after,
                    },
                    true,
                );
            }
        }
    }

    fn process_move(&mut self, hosts: &mut dyn HostStore, key: NodeKey, report: &mut TickReport) {
        let Some(node) = self.graph.get(key) else {
            return;
        };
        let Some(handle) = node.handle.filter(|_| !node.deleting) else {
            return;
        };
        let host_parent = hosts.parent_of(handle);
        let host_index = hosts.child_index(handle);
        let old_parent = node.parent.and_then(|p| self.graph.handle_of(p));
        let old_index = node.child_index;
        if host_parent == old_parent && host_index == old_index {
            return;
        }

        let new_parent_key = host_parent.and_then(|p| self.graph.key_for_handle(p));
        let blocked = [Some(key), node.parent, new_parent_key]
            .into_iter()
            .flatten()
            .filter_map(|k| self.graph.get(k))
            .find(|n| n.lock.is_fully_locked(self.client))
            .and_then(|n| n.lock.owner.map(|owner| (n.key, owner)));
        if let Some((locked, owner)) = blocked {
            hosts.set_parent(handle, old_parent, old_index);
            tracing::warn!(%handle, "Reverted move of {}: {} is fully locked by {}", key, locked, owner);
            report.reverted.push(handle);
            return;
        }
        if node.lock.transient && node.lock.is_lock_pending() {
            tracing::trace!(%handle, "Holding move of {} until its lock is granted", key);
            self.moved.insert(key);
            return;
        }
        if host_parent.is_some() && new_parent_key.is_none() {
            tracing::debug!(%handle, "{} moved under an untracked parent, syncing as root", key);
        }

        let change = if host_parent == old_parent {
            StructuralChange::Reorder {
                handle,
                parent: old_parent,
                old_index,
                new_index: host_index,
            }
        } else {
            StructuralChange::Reparent {
                handle,
                old_parent,
                old_index,
                new_parent: host_parent,
                new_index: host_index,
            }
        };
        if let Some(node) = self.graph.get_mut(key) {
            node.parent = new_parent_key;
            node.child_index = host_index;
            node.lock.edited |= node.lock.transient && node.lock.held;
        }
        self.outbox.push(
            key,
            PendingKind::ParentChange {
                parent: new_parent_key,
                child_index: host_index,
            },
        );
        if self.config.undo.enabled {
            self.undo.record_structure(change, true);
        }
    }

    fn release_transient_locks(&mut self) -> usize {
        let client = self.client;
        let done: Vec<NodeKey> = self
            .graph
            .iter()
            .filter(|n| n.lock.transient && n.lock.edited && n.lock.is_owned_by(client))
            .filter(|n| !self.dirty.contains(&n.key) && !self.moved.contains(&n.key))
            .filter(|n| !n.handle.is_some_and(|h| self.properties.has_pending(h)))
            .map(|n| n.key)
            .collect();

        for key in &done {
            if let Some(node) = self.graph.get_mut(*key) {
                node.lock.owner = None;
                node.lock.mode = LockMode::Partial;
                node.lock.held = false;
                node.lock.transient = false;
                node.lock.edited = false;
            }
            self.outbox.push(*key, PendingKind::Unlock);
            tracing::debug!("Released transient lock on {}", key);
        }
        done.len()
    }

    /// The host registered an undo checkpoint.
    ///
    /// Edits reported since the last tick are captured first, so they land in
    /// this transaction.
    pub fn checkpoint(&mut self, hosts: &mut dyn HostStore, preserve_redo: bool) -> Option<TransactionId> {
        if !self.config.undo.enabled {
            return None;
        }
        let mut captured = TickReport::default();
        self.detect_local_changes(hosts, &mut captured);
        self.carry.absorb(captured);

        let mut target = EngineReplay::new(self.client, &mut self.graph, &mut self.properties, &mut self.outbox, hosts);
        let id = self.undo.checkpoint(&mut target, preserve_redo);
        let diffed = target.diffed;
        for key in diffed {
            self.synced.remove(&key);
        }
        id
    }

    /// Replay the top undo transaction
    pub fn undo(&mut self, hosts: &mut dyn HostStore) -> Option<TransactionId> {
        if !self.config.undo.enabled {
            return None;
        }
        self.checkpoint(hosts, false);
        let mut target = EngineReplay::new(self.client, &mut self.graph, &mut self.properties, &mut self.outbox, hosts);
        let id = self.undo.undo(&mut target);
        let diffed = target.diffed;
        for key in diffed {
            self.synced.remove(&key);
        }
        if let Some(id) = id {
            tracing::info!("Undid {}", id);
        }
        id
    }

    /// Replay the top redo transaction.
    ///
    /// Pending edits are checkpointed first; a new edit empties the redo stack.
    pub fn redo(&mut self, hosts: &mut dyn HostStore) -> Option<TransactionId> {
        if !self.config.undo.enabled {
            return None;
        }
        self.checkpoint(hosts, false);
        let mut target = EngineReplay::new(self.client, &mut self.graph, &mut self.properties, &mut self.outbox, hosts);
        let id = self.undo.redo(&mut target);
        let diffed = target.diffed;
        for key in diffed {
            self.synced.remove(&key);
        }
        if let Some(id) = id {
            tracing::info!("Redid {}", id);
        }
        id
    }

    /// Revert the next checkpointed transaction instead of keeping it
    pub fn suppress_next_transaction(&mut self) {
        self.undo.suppress_next_transaction();
    }

    /// Whether a node's tree still describes its host object
    pub fn verify(&mut self, hosts: &dyn HostStore, handle: ObjectHandle) -> Result<bool> {
        let key = self.key_for(handle)?;
        let node = self
            .graph
            .get(key)
            .ok_or_else(|| SyncError::NodeNotFound(key.to_string()))?;
        let host = hosts
            .object(handle)
            .ok_or_else(|| SyncError::NodeNotFound(handle.to_string()))?;

        if self.properties.has_same_properties(host, &node.properties, &self.graph) {
            return Ok(true);
        }
        let expected = self.checksums.dictionary(&node.properties);
        let actual = self
            .checksums
            .dictionary(&self.properties.extract_all(host, &self.graph));
        if expected != actual {
            tracing::warn!(
                %handle,
                "{} drifted from its host object ({:016x} != {:016x})",
                key,
                expected,
                actual
            );
        }
        Ok(expected == actual)
    }

    /// End the session; later ticks fail with [`SyncError::Closed`]
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        tracing::info!(
            "Disconnected {} ({} nodes, {} ops unsent)",
            self.client,
            self.graph.len(),
            self.outbox.len()
        );
    }
}

/// Diff a node's tree against its host object and queue the resulting ops
fn diff_node(
    graph: &mut SyncGraph,
    properties: &mut PropertyManager,
    outbox: &mut Outbox,
    key: NodeKey,
    host: &dyn HostObject,
) -> Vec<FieldDelta> {
    let Some(node) = graph.get_mut(key) else {
        return Vec::new();
    };
    // Moved out so the graph can resolve references meanwhile
    let mut root = std::mem::take(&mut node.properties);
    let mut changes = ChangeSet::new();
    let deltas = properties.send_changes(host, &mut root, &*graph, &mut changes);
    if let Some(node) = graph.get_mut(key) {
        node.properties = root;
        if !changes.is_empty() {
            node.lock.edited |= node.lock.transient && node.lock.held;
        }
    }
    for change in changes {
        outbox.push(key, PendingKind::Change(change));
    }
    deltas
}

/// Replays undo steps onto host objects and pushes the results upstream
struct EngineReplay<'a> {
    client: ClientId,
    graph: &'a mut SyncGraph,
    properties: &'a mut PropertyManager,
    outbox: &'a mut Outbox,
    hosts: &'a mut dyn HostStore,
    diffed: Vec<NodeKey>,
}

impl<'a> EngineReplay<'a> {
    fn new(
        client: ClientId,
        graph: &'a mut SyncGraph,
        properties: &'a mut PropertyManager,
        outbox: &'a mut Outbox,
        hosts: &'a mut dyn HostStore,
    ) -> Self {
        Self {
            client,
            graph,
            properties,
            outbox,
            hosts,
            diffed: Vec::new(),
        }
    }

    fn live_node(&self, handle: ObjectHandle) -> Result<NodeKey> {
        let key = self
            .graph
            .key_for_handle(handle)
            .ok_or_else(|| SyncError::StaleReplay(format!("{} is no longer synchronized", handle)))?;
        match self.graph.get(key) {
            Some(node) if !node.deleting => Ok(key),
            _ => Err(SyncError::StaleReplay(format!("{} is being deleted", key))),
        }
    }

    fn lock_holder(&self, key: NodeKey, full_only: bool) -> Option<ClientId> {
        let lock = &self.graph.get(key)?.lock;
        let blocked = if full_only {
            lock.is_fully_locked(self.client)
        } else {
            lock.is_locked(self.client)
        };
        lock.owner.filter(|_| blocked)
    }
}

impl ReplayTarget for EngineReplay<'_> {
    fn apply_field(&mut self, modification: &FieldModification, value: Option<&PropertyNode>) -> Result<()> {
        let key = self.live_node(modification.handle)?;
        if let Some(owner) = self.lock_holder(key, false) {
            return Err(SyncError::LockConflict(key, owner));
        }
        let host = self
            .hosts
            .object_mut(modification.handle)
            .ok_or_else(|| SyncError::StaleReplay(format!("{} no longer exists", modification.handle)))?;
        self.properties
            .restore_field(host, &modification.field, value, &*self.graph)
    }

    fn apply_structure(&mut self, change: &StructuralChange, direction: ReplayDirection) -> Result<()> {
        let handle = change.handle();
        let key = self.live_node(handle)?;
        let (parent, index) = change.placement(direction);
        let parent_key = match parent {
            Some(p) => Some(
                self.graph
                    .key_for_handle(p)
                    .ok_or_else(|| SyncError::StaleReplay(format!("parent {} is no longer synchronized", p)))?,
            ),
            None => None,
        };
        let current_parent = self.graph.get(key).and_then(|n| n.parent);
        for k in [Some(key), current_parent, parent_key].into_iter().flatten() {
            if let Some(owner) = self.lock_holder(k, true) {
                return Err(SyncError::LockConflict(k, owner));
            }
        }

        self.hosts.set_parent(handle, parent, index);
        if let Some(node) = self.graph.get_mut(key) {
            node.parent = parent_key;
            node.child_index = index;
        }
        self.outbox.push(
            key,
            PendingKind::ParentChange {
                parent: parent_key,
                child_index: index,
            },
        );
        Ok(())
    }

    fn finish(&mut self, touched: &[ObjectHandle]) {
        for handle in touched {
            let Some(key) = self.graph.key_for_handle(*handle) else {
                continue;
            };
            if let Some(host) = self.hosts.object(*handle) {
                diff_node(self.graph, self.properties, self.outbox, key, host);
                self.diffed.push(key);
            }
            let locked = self
                .graph
                .get(key)
                .is_some_and(|node| node.lock.is_locked(self.client));
            self.hosts.set_locked(*handle, locked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StableIdentity;
    use crate::session::ChannelLink;
    use crate::translator::PropertyTranslator;

    /// A scene with no objects at all
    struct EmptyScene;

    impl HostStore for EmptyScene {
        fn object(&self, _handle: ObjectHandle) -> Option<&dyn HostObject> {
            None
        }
        fn object_mut(&mut self, _handle: ObjectHandle) -> Option<&mut dyn HostObject> {
            None
        }
        fn spawn(&mut self, _type_tag: &str, _parent: Option<ObjectHandle>, _child_index: u32) -> Option<ObjectHandle> {
            None
        }
        fn destroy(&mut self, _handle: ObjectHandle) {}
        fn parent_of(&self, _handle: ObjectHandle) -> Option<ObjectHandle> {
            None
        }
        fn child_index(&self, _handle: ObjectHandle) -> u32 {
            0
        }
        fn set_parent(&mut self, _handle: ObjectHandle, _parent: Option<ObjectHandle>, _child_index: u32) {}
        fn stable_identity(&self, _handle: ObjectHandle) -> Option<StableIdentity> {
            None
        }
    }

    fn engine() -> (SyncEngine, crate::session::ServerEndpoint) {
        let config = Config::default();
        let (link, server) = ChannelLink::pair(config.session.client_id);
        (SyncEngine::new(config, Box::new(link)).unwrap(), server)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.session.client_id = ClientId(0);
        let (link, _server) = ChannelLink::pair(ClientId(0));

        let err = SyncEngine::new(config, Box::new(link)).err().unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_unknown_type_is_reported_and_tick_continues() {
        let (mut engine, server) = engine();
        engine.register(Box::new(PropertyTranslator::new("Transform"))).unwrap();

        server
            .push(RemoteOp::Create {
                id: 5,
                type_tag: "Terrain".into(),
                parent: None,
                child_index: 0,
                properties: Default::default(),
                lock_owner: None,
            })
            .unwrap();
        server.push(RemoteOp::Unlock { id: 99 }).unwrap();

        let report = engine.tick(&mut EmptyScene).unwrap();
        assert_eq!(report.remote_ops, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(&report.errors[0], SyncError::UnknownType(tag) if tag == "Terrain"));
        assert!(matches!(report.errors[1], SyncError::NodeNotFound(_)));
        assert!(engine.graph().is_empty());
    }

    #[test]
    fn test_max_ops_per_tick() {
        let mut config = Config::default();
        config.session.max_ops_per_tick = 2;
        let (link, server) = ChannelLink::pair(config.session.client_id);
        let mut engine = SyncEngine::new(config, Box::new(link)).unwrap();

        for id in 0..5 {
            server.push(RemoteOp::ConfirmDelete { id }).unwrap();
        }
        assert_eq!(engine.tick(&mut EmptyScene).unwrap().remote_ops, 2);
        assert_eq!(engine.tick(&mut EmptyScene).unwrap().remote_ops, 2);
        assert_eq!(engine.tick(&mut EmptyScene).unwrap().remote_ops, 1);
    }

    #[test]
    fn test_tick_after_disconnect_is_closed() {
        let (mut engine, _server) = engine();
        engine.disconnect();
        assert!(!engine.is_connected());
        assert!(matches!(engine.tick(&mut EmptyScene), Err(SyncError::Closed)));
    }

    #[test]
    fn test_undo_disabled_records_nothing() {
        let mut config = Config::default();
        config.undo.enabled = false;
        let (link, _server) = ChannelLink::pair(config.session.client_id);
        let mut engine = SyncEngine::new(config, Box::new(link)).unwrap();

        assert!(engine.checkpoint(&mut EmptyScene, false).is_none());
        assert!(engine.undo(&mut EmptyScene).is_none());
        assert_eq!(engine.history().undo_depth(), 0);
    }
}
