//! Per-type adapters between host objects and SyncNodes
//!
//! The engine dispatches every remote op by the node's type tag to exactly one
//! registered [`Translator`]. Handlers receive the node read-only; all tree and
//! host mutation goes through [`TranslatorContext`].

use crate::graph::{SyncGraph, SyncNode};
use crate::host::{HostStore, ObjectHandle};
use crate::path::PropertyPath;
use crate::property_manager::PropertyManager;
use crate::{Result, SyncError};
use scene_common::ClientId;
use std::collections::HashMap;

/// Core services available to a translator while it handles an op
pub struct TranslatorContext<'a> {
    pub local_client: ClientId,
    pub graph: &'a SyncGraph,
    pub hosts: &'a mut dyn HostStore,
    pub properties: &'a mut PropertyManager,
}

impl<'a> TranslatorContext<'a> {
    pub fn new(
        local_client: ClientId,
        graph: &'a SyncGraph,
        hosts: &'a mut dyn HostStore,
        properties: &'a mut PropertyManager,
    ) -> Self {
        Self {
            local_client,
            graph,
            hosts,
            properties,
        }
    }

    /// Queue writes bringing the node's host object in line with its tree
    pub fn apply_all(&mut self, node: &SyncNode) -> usize {
        let Some(handle) = node.handle else {
            return 0;
        };
        match self.hosts.object(handle) {
            Some(host) => self.properties.apply_all(handle, host, &node.properties, self.graph),
            None => {
                tracing::debug!(%handle, "No host object for {}", node.key);
                0
            }
        }
    }

    pub fn apply_field(&mut self, node: &SyncNode, field: &str) -> bool {
        let Some(handle) = node.handle else {
            return false;
        };
        match self.hosts.object(handle) {
            Some(host) => self
                .properties
                .apply_field(handle, host, &node.properties, field, self.graph),
            None => false,
        }
    }

    /// Apply the top-level field touched by a change at `path`
    pub fn apply_path(&mut self, node: &SyncNode, path: &PropertyPath) -> bool {
        match path.top_field() {
            Some(field) => self.apply_field(node, field),
            None => self.apply_all(node) > 0,
        }
    }

    /// Mirror the node's lock state onto its host object
    pub fn reflect_lock(&mut self, node: &SyncNode) {
        if let Some(handle) = node.handle {
            self.hosts.set_locked(handle, node.lock.is_locked(self.local_client));
        }
    }

    pub fn parent_handle(&self, node: &SyncNode) -> Option<ObjectHandle> {
        node.parent.and_then(|key| self.graph.handle_of(key))
    }
}

/// Adapter for one type tag.
///
/// Every handler has a default covering the standard property behaviour, so
/// an implementation only overrides what its host type needs.
pub trait Translator {
    fn type_tag(&self) -> &str;

    /// Build a node for a host object entering scope; `None` declines to sync it
    fn try_create(&self, ctx: &mut TranslatorContext<'_>, handle: ObjectHandle) -> Option<SyncNode> {
        let host = ctx.hosts.object(handle)?;
        let properties = ctx.properties.extract_all(host, ctx.graph);
        Some(SyncNode::new(self.type_tag(), properties).with_handle(handle))
    }

    /// Host object for a remotely created node, spawning one when there is no current object
    fn get_host_object(
        &self,
        ctx: &mut TranslatorContext<'_>,
        node: &SyncNode,
        current: Option<ObjectHandle>,
    ) -> Option<ObjectHandle> {
        if current.is_some() {
            return current;
        }
        let parent = ctx.parent_handle(node);
        ctx.hosts.spawn(&node.type_tag, parent, node.child_index)
    }

    fn on_create(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode) -> Result<()> {
        ctx.apply_all(node);
        ctx.reflect_lock(node);
        Ok(())
    }

    fn on_confirm_create(&self, _ctx: &mut TranslatorContext<'_>, node: &SyncNode) -> Result<()> {
        tracing::debug!("{} confirmed as id {}", node.key, node.id);
        Ok(())
    }

    fn on_delete(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode, unsubscribed: bool) -> Result<()> {
        if let Some(handle) = node.handle {
            tracing::debug!(%handle, unsubscribed, "Destroying host object for {}", node.key);
            ctx.hosts.destroy(handle);
        }
        Ok(())
    }

    fn on_confirm_delete(&self, _ctx: &mut TranslatorContext<'_>, _node: &SyncNode) -> Result<()> {
        Ok(())
    }

    fn on_lock(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode) -> Result<()> {
        ctx.reflect_lock(node);
        Ok(())
    }

    fn on_unlock(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode) -> Result<()> {
        ctx.reflect_lock(node);
        Ok(())
    }

    fn on_lock_owner_change(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode) -> Result<()> {
        ctx.reflect_lock(node);
        Ok(())
    }

    fn on_direct_lock_change(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode, _held: bool) -> Result<()> {
        ctx.reflect_lock(node);
        Ok(())
    }

    fn on_parent_change(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode) -> Result<()> {
        if let Some(handle) = node.handle {
            let parent = ctx.parent_handle(node);
            ctx.hosts.set_parent(handle, parent, node.child_index);
        }
        Ok(())
    }

    fn on_property_change(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode, path: &PropertyPath) -> Result<()> {
        ctx.apply_path(node, path);
        Ok(())
    }

    fn on_remove_field(
        &self,
        ctx: &mut TranslatorContext<'_>,
        node: &SyncNode,
        path: &PropertyPath,
        field: &str,
    ) -> Result<()> {
        if path.is_root() {
            ctx.apply_field(node, field);
        } else {
            ctx.apply_path(node, path);
        }
        Ok(())
    }

    fn on_list_add(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode, path: &PropertyPath) -> Result<()> {
        ctx.apply_path(node, path);
        Ok(())
    }

    fn on_list_remove(&self, ctx: &mut TranslatorContext<'_>, node: &SyncNode, path: &PropertyPath) -> Result<()> {
        ctx.apply_path(node, path);
        Ok(())
    }
}

/// Generic translator: the host object's fields are the whole tree
#[derive(Debug, Clone)]
pub struct PropertyTranslator {
    type_tag: String,
}

impl PropertyTranslator {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
        }
    }
}

impl Translator for PropertyTranslator {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }
}

/// Translators by type tag
#[derive(Default)]
pub struct TranslatorRegistry {
    translators: HashMap<String, Box<dyn Translator>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, translator: Box<dyn Translator>) -> Result<()> {
        let tag = translator.type_tag().to_string();
        if self.translators.contains_key(&tag) {
            return Err(SyncError::DuplicateTranslator(tag));
        }
        tracing::debug!("Registered translator for '{}'", tag);
        self.translators.insert(tag, translator);
        Ok(())
    }

    pub fn get(&self, type_tag: &str) -> Result<&dyn Translator> {
        self.translators
            .get(type_tag)
            .map(|t| t.as_ref())
            .ok_or_else(|| SyncError::UnknownType(type_tag.to_string()))
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.translators.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.translators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.translators.is_empty()
    }
}
