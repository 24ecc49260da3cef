//! Conversion between host field values and property nodes

use crate::host::{FieldKind, FieldValue, ObjectHandle, ReferenceResolver};
use crate::property::{PropertyKind, PropertyNode, ValueNode, ValueTag};
use crate::{Result, SyncError};

/// Convert a host value into its property representation.
///
/// Object references that have no confirmed SyncNode become the
/// [`PropertyNode::KEEP_REFERENCE`] sentinel so that peers never null out
/// their own valid reference because of ours.
pub fn to_node(value: &FieldValue, resolver: &dyn ReferenceResolver) -> PropertyNode {
    match value {
        FieldValue::Bool(v) => PropertyNode::from(*v),
        FieldValue::Int(v) => PropertyNode::from(*v),
        FieldValue::Long(v) => PropertyNode::from(*v),
        FieldValue::Float(v) => PropertyNode::from(*v),
        FieldValue::Double(v) => PropertyNode::from(*v),
        FieldValue::Vector2(v) => PropertyNode::from(*v),
        FieldValue::Vector3(v) => PropertyNode::from(*v),
        FieldValue::Vector4(v) => PropertyNode::from(*v),
        FieldValue::Quaternion(v) => PropertyNode::quaternion(*v),
        FieldValue::Color(v) => PropertyNode::color(*v),
        FieldValue::Enum(v) => PropertyNode::enumeration(*v),
        FieldValue::FloatArray(v) => PropertyNode::from(v.clone()),
        FieldValue::Blob(tag, bytes) => PropertyNode::blob(*tag, bytes.clone()),
        FieldValue::Text(s) => PropertyNode::String(s.clone()),
        FieldValue::Object(None) => PropertyNode::Null,
        FieldValue::Object(Some(handle)) => PropertyNode::Reference(
            resolver
                .node_id(*handle)
                .unwrap_or(PropertyNode::KEEP_REFERENCE),
        ),
        FieldValue::List(items) => {
            PropertyNode::List(items.iter().map(|item| to_node(item, resolver)).collect())
        }
        FieldValue::Map(entries) => PropertyNode::Dictionary(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), to_node(item, resolver)))
                .collect(),
        ),
    }
}

/// Convert a property node back to a host value of the given kind.
///
/// Returns `Ok(None)` when the node says "keep the current value": the
/// reference sentinel, or a reference whose target has no live object.
/// `current` supplies the host's value so that nested unresolved references
/// keep their existing element.
pub fn to_field_value(
    node: &PropertyNode,
    kind: FieldKind,
    current: Option<&FieldValue>,
    resolver: &dyn ReferenceResolver,
) -> Result<Option<FieldValue>> {
    let value = match kind {
        FieldKind::Bool => FieldValue::Bool(node.as_value()?),
        FieldKind::Int => FieldValue::Int(node.as_value()?),
        FieldKind::Long => FieldValue::Long(node.as_value()?),
        FieldKind::Float => FieldValue::Float(node.as_value()?),
        FieldKind::Double => FieldValue::Double(node.as_value()?),
        FieldKind::Vector2 => FieldValue::Vector2(node.as_value()?),
        FieldKind::Vector3 => FieldValue::Vector3(node.as_value()?),
        FieldKind::Vector4 => FieldValue::Vector4(node.as_value()?),
        FieldKind::Quaternion => {
            FieldValue::Quaternion(node.expect_value(ValueTag::Quaternion)?.float_array::<4>()?)
        }
        FieldKind::Color => FieldValue::Color(node.expect_value(ValueTag::Color)?.float_array::<4>()?),
        FieldKind::Enum => FieldValue::Enum(enum_value(node.expect_value(ValueTag::Enum)?)?),
        FieldKind::FloatArray => FieldValue::FloatArray(node.as_value()?),
        FieldKind::Blob(tag) => FieldValue::Blob(tag, node.expect_value(tag)?.bytes.clone()),
        FieldKind::Text => FieldValue::Text(node.as_value()?),
        FieldKind::Object => match node {
            PropertyNode::Null => FieldValue::Object(None),
            PropertyNode::Reference(id) => match resolve_reference(*id, resolver) {
                Some(handle) => FieldValue::Object(Some(handle)),
                None => return Ok(None),
            },
            other => return Err(SyncError::mismatch("Reference", other.kind())),
        },
        FieldKind::List(element) => {
            let items = node
                .as_list()
                .ok_or_else(|| SyncError::mismatch(PropertyKind::List, node.kind()))?;
            let existing = match current {
                Some(FieldValue::List(existing)) => Some(existing),
                _ => None,
            };
            let mut values = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let current_item = existing.and_then(|e| e.get(i));
                match to_field_value(item, *element, current_item, resolver)? {
                    Some(value) => values.push(value),
                    None => values.push(current_item.cloned().unwrap_or(FieldValue::Object(None))),
                }
            }
            FieldValue::List(values)
        }
        FieldKind::Map(element) => {
            let entries = node
                .as_dictionary()
                .ok_or_else(|| SyncError::mismatch(PropertyKind::Dictionary, node.kind()))?;
            let existing = match current {
                Some(FieldValue::Map(existing)) => Some(existing),
                _ => None,
            };
            let mut values = indexmap::IndexMap::with_capacity(entries.len());
            for (key, item) in entries {
                let current_item = existing.and_then(|e| e.get(key));
                let value = match to_field_value(item, *element, current_item, resolver)? {
                    Some(value) => value,
                    None => current_item.cloned().unwrap_or(FieldValue::Object(None)),
                };
                values.insert(key.clone(), value);
            }
            FieldValue::Map(values)
        }
    };
    Ok(Some(value))
}

fn resolve_reference(id: u32, resolver: &dyn ReferenceResolver) -> Option<ObjectHandle> {
    if id == PropertyNode::KEEP_REFERENCE {
        return None;
    }
    let handle = resolver.handle(id);
    if handle.is_none() {
        tracing::debug!("Reference to node {} has no live object, keeping current value", id);
    }
    handle
}

fn enum_value(value: &ValueNode) -> Result<i32> {
    let bytes: [u8; 4] = value
        .bytes
        .as_slice()
        .try_into()
        .map_err(|_| SyncError::mismatch(ValueTag::Enum, format!("{} bytes", value.bytes.len())))?;
    Ok(i32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoReferences;
    use std::collections::HashMap;

    struct Table(HashMap<u32, ObjectHandle>);

    impl ReferenceResolver for Table {
        fn node_id(&self, handle: ObjectHandle) -> Option<u32> {
            self.0.iter().find(|(_, h)| **h == handle).map(|(id, _)| *id)
        }

        fn handle(&self, id: u32) -> Option<ObjectHandle> {
            self.0.get(&id).copied()
        }
    }

    #[test]
    fn test_scalar_conversions() {
        let cases = [
            (FieldValue::Float(1.5), FieldKind::Float),
            (FieldValue::Color([1.0, 0.0, 0.0, 1.0]), FieldKind::Color),
            (FieldValue::Enum(3), FieldKind::Enum),
            (FieldValue::Text("crate".into()), FieldKind::Text),
            (FieldValue::FloatArray(vec![0.5, 0.25]), FieldKind::FloatArray),
        ];
        for (value, kind) in cases {
            let node = to_node(&value, &NoReferences);
            assert_eq!(to_field_value(&node, kind, None, &NoReferences).unwrap(), Some(value));
        }
    }

    #[test]
    fn test_kind_mismatch_is_type_error() {
        let node = to_node(&FieldValue::Int(4), &NoReferences);
        let err = to_field_value(&node, FieldKind::Text, None, &NoReferences).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unconfirmed_reference_becomes_sentinel() {
        let node = to_node(&FieldValue::Object(Some(ObjectHandle(5))), &NoReferences);
        assert_eq!(node, PropertyNode::Reference(PropertyNode::KEEP_REFERENCE));
        assert_eq!(
            to_node(&FieldValue::Object(None), &NoReferences),
            PropertyNode::Null
        );
    }

    #[test]
    fn test_unresolved_reference_keeps_current() {
        let resolver = Table(HashMap::from([(7, ObjectHandle(70))]));

        let resolved = to_field_value(&PropertyNode::Reference(7), FieldKind::Object, None, &resolver).unwrap();
        assert_eq!(resolved, Some(FieldValue::Object(Some(ObjectHandle(70)))));

        let unresolved = to_field_value(&PropertyNode::Reference(99), FieldKind::Object, None, &resolver).unwrap();
        assert_eq!(unresolved, None);

        // Inside a list the current element survives
        static OBJECT: FieldKind = FieldKind::Object;
        let current = FieldValue::List(vec![
            FieldValue::Object(Some(ObjectHandle(1))),
            FieldValue::Object(Some(ObjectHandle(2))),
        ]);
        let node = PropertyNode::list([PropertyNode::Reference(7), PropertyNode::Reference(0)]);
        let value = to_field_value(&node, FieldKind::List(&OBJECT), Some(&current), &resolver).unwrap();
        assert_eq!(
            value,
            Some(FieldValue::List(vec![
                FieldValue::Object(Some(ObjectHandle(70))),
                FieldValue::Object(Some(ObjectHandle(2))),
            ]))
        );
    }
}
