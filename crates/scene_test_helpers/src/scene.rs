//! In-memory host scene

use crate::objects::TestObject;
use indexmap::IndexMap;
use scene_sync::{FieldValue, HostObject, HostStore, ObjectHandle, StableIdentity};

#[derive(Debug)]
struct Entry {
    object: TestObject,
    parent: Option<ObjectHandle>,
    child_index: u32,
    locked: bool,
}

/// A host scene graph of [`TestObject`]s
#[derive(Debug, Default)]
pub struct TestScene {
    next_handle: u64,
    entries: IndexMap<ObjectHandle, Entry>,
    /// Objects created through [`HostStore::spawn`]
    pub spawned: Vec<ObjectHandle>,
    /// Objects removed through [`HostStore::destroy`], descendants included
    pub destroyed: Vec<ObjectHandle>,
}

impl TestScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a root object after the existing roots
    pub fn add(&mut self, object: TestObject) -> ObjectHandle {
        self.insert(object, None)
    }

    /// Add an object as the last child of `parent`
    pub fn add_child(&mut self, parent: ObjectHandle, object: TestObject) -> ObjectHandle {
        self.insert(object, Some(parent))
    }

    fn insert(&mut self, object: TestObject, parent: Option<ObjectHandle>) -> ObjectHandle {
        self.next_handle += 1;
        let handle = ObjectHandle(self.next_handle);
        let child_index = self.children(parent).len() as u32;
        self.entries.insert(
            handle,
            Entry {
                object,
                parent,
                child_index,
                locked: false,
            },
        );
        handle
    }

    fn children(&self, parent: Option<ObjectHandle>) -> Vec<ObjectHandle> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.parent == parent)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&TestObject> {
        self.entries.get(&handle).map(|entry| &entry.object)
    }

    pub fn field(&self, handle: ObjectHandle, field: &str) -> Option<FieldValue> {
        self.get(handle).and_then(|object| object.get_field(field))
    }

    /// Simulate a user edit; panics when the field rejects the value
    pub fn set(&mut self, handle: ObjectHandle, field: &str, value: FieldValue) {
        let entry = self.entries.get_mut(&handle).expect("unknown test object");
        entry.object.set_field(field, value).expect("invalid test field value");
    }

    /// Simulate the user dragging an object in the hierarchy
    pub fn move_to(&mut self, handle: ObjectHandle, parent: Option<ObjectHandle>, child_index: u32) {
        self.set_parent(handle, parent, child_index);
    }

    /// Whether the object is shown as locked
    pub fn is_locked(&self, handle: ObjectHandle) -> bool {
        self.entries.get(&handle).is_some_and(|entry| entry.locked)
    }

    /// `handle` and every descendant, parents first
    pub fn descendants(&self, handle: ObjectHandle) -> Vec<ObjectHandle> {
        let mut found = vec![handle];
        let mut i = 0;
        while i < found.len() {
            found.extend(self.children(Some(found[i])));
            i += 1;
        }
        found
    }
}

impl HostStore for TestScene {
    fn object(&self, handle: ObjectHandle) -> Option<&dyn HostObject> {
        self.entries.get(&handle).map(|entry| &entry.object as &dyn HostObject)
    }

    fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut dyn HostObject> {
        self.entries
            .get_mut(&handle)
            .map(|entry| &mut entry.object as &mut dyn HostObject)
    }

    fn spawn(&mut self, type_tag: &str, parent: Option<ObjectHandle>, child_index: u32) -> Option<ObjectHandle> {
        let object = TestObject::named(type_tag)?;
        let handle = self.insert(object, parent);
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.child_index = child_index;
        }
        self.spawned.push(handle);
        Some(handle)
    }

    fn destroy(&mut self, handle: ObjectHandle) {
        if !self.contains(handle) {
            return;
        }
        for removed in self.descendants(handle) {
            self.entries.shift_remove(&removed);
            self.destroyed.push(removed);
        }
    }

    fn parent_of(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        self.entries.get(&handle).and_then(|entry| entry.parent)
    }

    fn child_index(&self, handle: ObjectHandle) -> u32 {
        self.entries.get(&handle).map_or(0, |entry| entry.child_index)
    }

    fn set_parent(&mut self, handle: ObjectHandle, parent: Option<ObjectHandle>, child_index: u32) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.parent = parent;
            entry.child_index = child_index;
        }
    }

    fn set_locked(&mut self, handle: ObjectHandle, locked: bool) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.locked = locked;
        }
    }

    /// Type name plus the `Type[index]` chain from the root
    fn stable_identity(&self, handle: ObjectHandle) -> Option<StableIdentity> {
        let entry = self.entries.get(&handle)?;
        let mut segments = Vec::new();
        let mut cursor = Some(handle);
        while let Some(current) = cursor {
            let e = self.entries.get(&current)?;
            segments.push(format!("{}[{}]", e.object.type_name(), e.child_index));
            cursor = e.parent;
        }
        segments.reverse();
        Some(StableIdentity {
            type_name: entry.object.type_name().to_string(),
            path: segments.join("/"),
            sub_index: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_removes_descendants() {
        let mut scene = TestScene::new();
        let root = scene.add(TestObject::transform());
        let child = scene.add_child(root, TestObject::crate_object());
        let grandchild = scene.add_child(child, TestObject::light());
        let other = scene.add(TestObject::light());

        scene.destroy(child);
        assert!(scene.contains(root));
        assert!(!scene.contains(grandchild));
        assert!(scene.contains(other));
        assert_eq!(scene.destroyed, vec![child, grandchild]);
    }

    #[test]
    fn test_identity_follows_hierarchy() {
        let mut scene = TestScene::new();
        let root = scene.add(TestObject::transform());
        let child = scene.add_child(root, TestObject::crate_object());

        let identity = scene.stable_identity(child).unwrap();
        assert_eq!(identity.path, "Transform[0]/Crate[0]");
        let light = scene.add(TestObject::light());
        assert_eq!(scene.child_index(light), 1);
    }
}
