//! Diff/apply/copy engine between host objects and property trees
//!
//! Host → tree conversions are sparse: fields at their default value are never
//! stored. Tree → host writes are deferred into a pending-write cache that is
//! coalesced per object and flushed once per tick.

use crate::convert;
use crate::host::{FieldDescriptor, FieldError, FieldValue, HostObject, HostStore, ObjectHandle, ReferenceResolver};
use crate::path::{ChangeSet, PropertyPath, TreeChange};
use crate::property::{Dictionary, PropertyNode};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Before/after state of one top-level field changed by a local diff.
/// `None` means the field is at its default value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDelta {
    pub field: String,
    pub before: Option<PropertyNode>,
    pub after: Option<PropertyNode>,
}

impl FieldDelta {
    /// Only fills in ids for references that were unresolved before
    pub fn resolves_reference(&self) -> bool {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => before.holds_unresolved_reference() && after.resolves(before),
            _ => false,
        }
    }
}

/// Fired once per field written during a flush
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub handle: ObjectHandle,
    pub field: String,
    /// New value, or `None` when the field was reset to its default
    pub value: Option<PropertyNode>,
}

#[derive(Debug)]
struct PendingWrite {
    value: FieldValue,
    node: Option<PropertyNode>,
}

/// Converts, diffs and applies host object fields
#[derive(Default)]
pub struct PropertyManager {
    /// One instance per host type holding standard defaults
    scratch: HashMap<String, Box<dyn HostObject>>,
    pending: IndexMap<ObjectHandle, IndexMap<String, PendingWrite>>,
}

impl PropertyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default value of a field, from its descriptor override or the scratch instance
    pub fn default_value(&mut self, host: &dyn HostObject, descriptor: &FieldDescriptor) -> Option<FieldValue> {
        if let Some(default) = descriptor.default {
            return Some(default());
        }
        let scratch = self
            .scratch
            .entry(host.type_name().to_string())
            .or_insert_with(|| host.scratch());
        scratch.get_field(descriptor.name)
    }

    pub fn is_default(&mut self, host: &dyn HostObject, descriptor: &FieldDescriptor, value: &FieldValue) -> bool {
        self.default_value(host, descriptor).as_ref() == Some(value)
    }

    /// Every non-default field as a sparse dictionary
    pub fn extract_all(&mut self, host: &dyn HostObject, resolver: &dyn ReferenceResolver) -> Dictionary {
        let mut root = Dictionary::new();
        for descriptor in host.fields() {
            let Some(value) = host.get_field(descriptor.name) else {
                continue;
            };
            if self.is_default(host, descriptor, &value) {
                continue;
            }
            root.insert(descriptor.name.to_string(), convert::to_node(&value, resolver));
        }
        root
    }

    /// Queue writes making `host` match `root`; absent fields are reset to default.
    ///
    /// Only fields whose value actually differs are queued. Returns the number
    /// of fields queued.
    pub fn apply_all(
        &mut self,
        handle: ObjectHandle,
        host: &dyn HostObject,
        root: &Dictionary,
        resolver: &dyn ReferenceResolver,
    ) -> usize {
        host.fields()
            .iter()
            .filter(|descriptor| {
                self.apply_descriptor(handle, host, descriptor, root.get(descriptor.name), resolver)
            })
            .count()
    }

    /// Queue the write for a single top-level field
    pub fn apply_field(
        &mut self,
        handle: ObjectHandle,
        host: &dyn HostObject,
        root: &Dictionary,
        field: &str,
        resolver: &dyn ReferenceResolver,
    ) -> bool {
        match host.fields().iter().find(|d| d.name == field) {
            Some(descriptor) => self.apply_descriptor(handle, host, descriptor, root.get(field), resolver),
            None => {
                tracing::debug!("{} has no field '{}', ignoring", host.type_name(), field);
                false
            }
        }
    }

    fn apply_descriptor(
        &mut self,
        handle: ObjectHandle,
        host: &dyn HostObject,
        descriptor: &FieldDescriptor,
        node: Option<&PropertyNode>,
        resolver: &dyn ReferenceResolver,
    ) -> bool {
        let current = host.get_field(descriptor.name);
        match node {
            Some(node) => match convert::to_field_value(node, descriptor.kind, current.as_ref(), resolver) {
                Ok(Some(value)) => self.queue(handle, descriptor.name, current.as_ref(), value, Some(node.clone())),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(
                        %handle,
                        field = descriptor.name,
                        "Skipping field with conflicting type: {}",
                        e
                    );
                    false
                }
            },
            None => match self.default_value(host, descriptor) {
                Some(default) => self.queue(handle, descriptor.name, current.as_ref(), default, None),
                None => {
                    tracing::debug!(%handle, field = descriptor.name, "No default known, leaving field");
                    false
                }
            },
        }
    }

    fn queue(
        &mut self,
        handle: ObjectHandle,
        field: &str,
        current: Option<&FieldValue>,
        value: FieldValue,
        node: Option<PropertyNode>,
    ) -> bool {
        if current == Some(&value) {
            // A later write restoring the current value cancels an earlier one
            if let Some(writes) = self.pending.get_mut(&handle) {
                writes.shift_remove(field);
                if writes.is_empty() {
                    self.pending.shift_remove(&handle);
                }
            }
            return false;
        }
        self.pending
            .entry(handle)
            .or_default()
            .insert(field.to_string(), PendingWrite { value, node });
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(IndexMap::len).sum()
    }

    pub fn has_pending(&self, handle: ObjectHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    /// Drop queued writes for an object that no longer exists
    pub fn discard(&mut self, handle: ObjectHandle) {
        self.pending.shift_remove(&handle);
    }

    /// Write queued values into one host object
    pub fn flush_object(&mut self, handle: ObjectHandle, host: &mut dyn HostObject) -> Vec<ChangeNotification> {
        let Some(writes) = self.pending.shift_remove(&handle) else {
            return Vec::new();
        };
        let mut notifications = Vec::with_capacity(writes.len());
        for (field, write) in writes {
            match host.set_field(&field, write.value) {
                Ok(()) => notifications.push(ChangeNotification {
                    handle,
                    field,
                    value: write.node,
                }),
                Err(e) => tracing::warn!(%handle, field = %field, "Setter rejected value: {}", e),
            }
        }
        notifications
    }

    /// Write every queued value
    pub fn flush(&mut self, hosts: &mut dyn HostStore) -> Vec<ChangeNotification> {
        let handles: Vec<ObjectHandle> = self.pending.keys().copied().collect();
        let mut notifications = Vec::new();
        for handle in handles {
            match hosts.object_mut(handle) {
                Some(host) => notifications.extend(self.flush_object(handle, host)),
                None => {
                    tracing::debug!(%handle, "Host object gone, dropping pending writes");
                    self.pending.shift_remove(&handle);
                }
            }
        }
        notifications
    }

    /// Write one field immediately, bypassing the pending-write cache.
    /// `None` restores the field's default.
    pub fn restore_field(
        &mut self,
        host: &mut dyn HostObject,
        field: &str,
        value: Option<&PropertyNode>,
        resolver: &dyn ReferenceResolver,
    ) -> crate::Result<()> {
        let descriptor = host
            .fields()
            .iter()
            .find(|d| d.name == field)
            .copied()
            .ok_or_else(|| FieldError::UnknownField(field.to_string()))?;
        let current = host.get_field(field);
        let value = match value {
            Some(node) => convert::to_field_value(node, descriptor.kind, current.as_ref(), resolver)?,
            None => self.default_value(&*host, &descriptor),
        };
        match value {
            Some(value) if current.as_ref() != Some(&value) => Ok(host.set_field(field, value)?),
            _ => Ok(()),
        }
    }

    /// Local → remote diff.
    ///
    /// Existing entries are patched in place through [`PropertyManager::copy`],
    /// so a list or dictionary field reports only the leaves that differ.
    pub fn send_changes(
        &mut self,
        host: &dyn HostObject,
        root: &mut Dictionary,
        resolver: &dyn ReferenceResolver,
        changes: &mut ChangeSet,
    ) -> Vec<FieldDelta> {
        let mut deltas = Vec::new();
        for descriptor in host.fields() {
            let Some(value) = host.get_field(descriptor.name) else {
                continue;
            };
            let name = descriptor.name;

            if self.is_default(host, descriptor, &value) {
                if let Some(before) = root.shift_remove(name) {
                    changes.push(TreeChange::RemoveField {
                        path: PropertyPath::root(),
                        field: name.to_string(),
                    });
                    deltas.push(FieldDelta {
                        field: name.to_string(),
                        before: Some(before),
                        after: None,
                    });
                }
                continue;
            }

            let node = convert::to_node(&value, resolver);
            let path = PropertyPath::field(name);
            match root.get_mut(name) {
                Some(existing) if *existing == node => {}
                Some(existing) => {
                    let before = existing.clone();
                    if !Self::copy(existing, &node, &path, changes) {
                        *existing = node.clone();
                        changes.push(TreeChange::Set {
                            path,
                            value: node.clone(),
                        });
                    }
                    deltas.push(FieldDelta {
                        field: name.to_string(),
                        before: Some(before),
                        after: Some(node),
                    });
                }
                None => {
                    root.insert(name.to_string(), node.clone());
                    changes.push(TreeChange::Set {
                        path,
                        value: node.clone(),
                    });
                    deltas.push(FieldDelta {
                        field: name.to_string(),
                        before: None,
                        after: Some(node),
                    });
                }
            }
        }
        deltas
    }

    /// Merge `src` into `dest` in place, recording every edit.
    ///
    /// Returns `false` without touching `dest` when the two nodes are of
    /// different kinds; the caller must then replace `dest` wholesale.
    pub fn copy(dest: &mut PropertyNode, src: &PropertyNode, path: &PropertyPath, changes: &mut ChangeSet) -> bool {
        if dest.kind() != src.kind() {
            return false;
        }
        match (dest, src) {
            (PropertyNode::Value(d), PropertyNode::Value(s)) => {
                if d != s {
                    *d = s.clone();
                    changes.push(TreeChange::Set {
                        path: path.clone(),
                        value: src.clone(),
                    });
                }
            }
            (PropertyNode::String(d), PropertyNode::String(s)) => {
                if d != s {
                    d.clone_from(s);
                    changes.push(TreeChange::Set {
                        path: path.clone(),
                        value: src.clone(),
                    });
                }
            }
            (PropertyNode::Reference(d), PropertyNode::Reference(s)) => {
                if d != s {
                    *d = *s;
                    changes.push(TreeChange::Set {
                        path: path.clone(),
                        value: src.clone(),
                    });
                }
            }
            (PropertyNode::Null, PropertyNode::Null) => {}
            (PropertyNode::List(d), PropertyNode::List(s)) => Self::copy_list(d, s, path, changes),
            (PropertyNode::Dictionary(d), PropertyNode::Dictionary(s)) => {
                Self::copy_dictionary(d, s, path, changes)
            }
            _ => return false,
        }
        true
    }

    /// Lock-step alignment: single inserts and removals are detected by
    /// looking one element ahead; anything else becomes an in-place
    /// replacement, and a leftover length difference one trailing bulk edit.
    fn copy_list(dest: &mut Vec<PropertyNode>, src: &[PropertyNode], path: &PropertyPath, changes: &mut ChangeSet) {
        let mut i = 0;
        while i < src.len() && i < dest.len() {
            if dest[i] == src[i] {
                i += 1;
                continue;
            }
            if src.len() != dest.len() {
                if i + 1 < dest.len() && src[i] == dest[i + 1] {
                    dest.remove(i);
                    changes.push(TreeChange::ListRemove {
                        path: path.clone(),
                        index: i,
                        count: 1,
                    });
                    continue;
                }
                if i + 1 < src.len() && dest[i] == src[i + 1] {
                    dest.insert(i, src[i].clone());
                    changes.push(TreeChange::ListAdd {
                        path: path.clone(),
                        index: i,
                        values: vec![src[i].clone()],
                    });
                    i += 1;
                    continue;
                }
            }
            let child = path.index(i);
            if !Self::copy(&mut dest[i], &src[i], &child, changes) {
                dest[i] = src[i].clone();
                changes.push(TreeChange::Set {
                    path: child,
                    value: src[i].clone(),
                });
            }
            i += 1;
        }

        if dest.len() > src.len() {
            let count = dest.len() - src.len();
            dest.truncate(src.len());
            changes.push(TreeChange::ListRemove {
                path: path.clone(),
                index: src.len(),
                count,
            });
        } else if src.len() > dest.len() {
            let start = dest.len();
            dest.extend_from_slice(&src[start..]);
            changes.push(TreeChange::ListAdd {
                path: path.clone(),
                index: start,
                values: src[start..].to_vec(),
            });
        }
    }

    fn copy_dictionary(dest: &mut Dictionary, src: &Dictionary, path: &PropertyPath, changes: &mut ChangeSet) {
        let removed: Vec<String> = dest.keys().filter(|k| !src.contains_key(*k)).cloned().collect();
        for key in removed {
            dest.shift_remove(&key);
            changes.push(TreeChange::RemoveField {
                path: path.clone(),
                field: key,
            });
        }
        for (key, value) in src {
            let child = path.child(key.clone());
            match dest.get_mut(key) {
                Some(existing) if existing == value => {}
                Some(existing) => {
                    if !Self::copy(existing, value, &child, changes) {
                        *existing = value.clone();
                        changes.push(TreeChange::Set {
                            path: child,
                            value: value.clone(),
                        });
                    }
                }
                None => {
                    dest.insert(key.clone(), value.clone());
                    changes.push(TreeChange::Set {
                        path: child,
                        value: value.clone(),
                    });
                }
            }
        }
    }

    /// Whether `root` already describes `host` exactly
    pub fn has_same_properties(
        &mut self,
        host: &dyn HostObject,
        root: &Dictionary,
        resolver: &dyn ReferenceResolver,
    ) -> bool {
        host.fields().iter().all(|descriptor| match host.get_field(descriptor.name) {
            None => true,
            Some(value) if self.is_default(host, descriptor, &value) => !root.contains_key(descriptor.name),
            Some(value) => root.get(descriptor.name) == Some(&convert::to_node(&value, resolver)),
        })
    }
}
