//! Property tree data model
//!
//! Every synchronized value is a [`PropertyNode`]. Trees are owned top-down by
//! their root; a node's position in its parent is expressed as a
//! [`PropertyPath`](crate::PropertyPath) computed during traversal, never as a
//! stored back-pointer.

use crate::graph::NodeId;
use crate::{Result, SyncError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named children of a dictionary node. Equality ignores insertion order.
pub type Dictionary = IndexMap<String, PropertyNode>;

/// Type tag of a fixed-size value payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueTag {
    Bool,
    Int,
    Long,
    Float,
    Double,
    Vector2,
    Vector3,
    Vector4,
    Quaternion,
    Color,
    Enum,
    Curve,
    Gradient,
    Bytes,
}

impl ValueTag {
    /// Discriminator fed to checksums
    pub(crate) fn code(self) -> u32 {
        self as u32 + 1
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fixed-size scalar/struct payload, little-endian encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueNode {
    pub tag: ValueTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_len: Option<u32>,
    pub bytes: Vec<u8>,
}

impl ValueNode {
    pub fn new(tag: ValueTag, bytes: Vec<u8>) -> Self {
        Self {
            tag,
            array_len: None,
            bytes,
        }
    }

    pub fn array(tag: ValueTag, len: u32, bytes: Vec<u8>) -> Self {
        Self {
            tag,
            array_len: Some(len),
            bytes,
        }
    }

    pub(crate) fn from_floats(tag: ValueTag, floats: &[f32]) -> Self {
        Self::new(tag, floats.iter().flat_map(|f| f.to_le_bytes()).collect())
    }

    /// Decode the payload as a sequence of `f32`
    pub fn floats(&self) -> Result<Vec<f32>> {
        if self.bytes.len() % 4 != 0 {
            return Err(SyncError::mismatch("f32 payload", format!("{} bytes", self.bytes.len())));
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Decode the payload as exactly `N` floats
    pub fn float_array<const N: usize>(&self) -> Result<[f32; N]> {
        let floats = self.floats()?;
        floats
            .try_into()
            .map_err(|v: Vec<f32>| SyncError::mismatch(format!("{} floats", N), format!("{} floats", v.len())))
    }
}

/// Variant of a [`PropertyNode`], used to decide whether two nodes can be merged in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Value,
    String,
    List,
    Dictionary,
    Reference,
    Null,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A synchronized value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum PropertyNode {
    Value(ValueNode),
    String(String),
    List(Vec<PropertyNode>),
    Dictionary(Dictionary),
    /// Weak reference to a SyncNode; `0` means "keep the current host value"
    Reference(NodeId),
    Null,
}

impl PropertyNode {
    /// Reference sentinel: leave the host-side reference untouched
    pub const KEEP_REFERENCE: NodeId = 0;

    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyNode::Value(_) => PropertyKind::Value,
            PropertyNode::String(_) => PropertyKind::String,
            PropertyNode::List(_) => PropertyKind::List,
            PropertyNode::Dictionary(_) => PropertyKind::Dictionary,
            PropertyNode::Reference(_) => PropertyKind::Reference,
            PropertyNode::Null => PropertyKind::Null,
        }
    }

    pub fn dictionary<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, PropertyNode)>,
    {
        PropertyNode::Dictionary(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = PropertyNode>,
    {
        PropertyNode::List(items.into_iter().collect())
    }

    pub fn color(rgba: [f32; 4]) -> Self {
        PropertyNode::Value(ValueNode::from_floats(ValueTag::Color, &rgba))
    }

    pub fn quaternion(xyzw: [f32; 4]) -> Self {
        PropertyNode::Value(ValueNode::from_floats(ValueTag::Quaternion, &xyzw))
    }

    pub fn enumeration(value: i32) -> Self {
        PropertyNode::Value(ValueNode::new(ValueTag::Enum, value.to_le_bytes().to_vec()))
    }

    /// Opaque blob such as an animation curve or gradient
    pub fn blob(tag: ValueTag, bytes: Vec<u8>) -> Self {
        PropertyNode::Value(ValueNode::new(tag, bytes))
    }

    /// Convert to a native value, failing on a tag mismatch
    pub fn as_value<T: FromProperty>(&self) -> Result<T> {
        T::from_property(self)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyNode::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<PropertyNode>> {
        match self {
            PropertyNode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<PropertyNode>> {
        match self {
            PropertyNode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            PropertyNode::Dictionary(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_dictionary_mut(&mut self) -> Option<&mut Dictionary> {
        match self {
            PropertyNode::Dictionary(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<NodeId> {
        match self {
            PropertyNode::Reference(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyNode::Null)
    }

    /// Whether the tree holds a reference whose target had no id yet
    pub fn holds_unresolved_reference(&self) -> bool {
        match self {
            PropertyNode::Reference(id) => *id == Self::KEEP_REFERENCE,
            PropertyNode::List(items) => items.iter().any(Self::holds_unresolved_reference),
            PropertyNode::Dictionary(map) => map.values().any(Self::holds_unresolved_reference),
            _ => false,
        }
    }

    /// Whether `self` equals `unresolved` apart from ids filled in for its reference sentinels
    pub fn resolves(&self, unresolved: &PropertyNode) -> bool {
        match (unresolved, self) {
            (PropertyNode::Reference(Self::KEEP_REFERENCE), PropertyNode::Reference(_)) => true,
            (PropertyNode::List(before), PropertyNode::List(after)) => {
                before.len() == after.len() && before.iter().zip(after).all(|(b, a)| a.resolves(b))
            }
            (PropertyNode::Dictionary(before), PropertyNode::Dictionary(after)) => {
                before.len() == after.len()
                    && before
                        .iter()
                        .all(|(key, b)| after.get(key).is_some_and(|a| a.resolves(b)))
            }
            (before, after) => before == after,
        }
    }

    pub(crate) fn expect_value(&self, tag: ValueTag) -> Result<&ValueNode> {
        match self {
            PropertyNode::Value(v) if v.tag == tag && v.array_len.is_none() => Ok(v),
            PropertyNode::Value(v) => Err(SyncError::mismatch(tag, v.tag)),
            other => Err(SyncError::mismatch(tag, other.kind())),
        }
    }
}

/// Conversion from a [`PropertyNode`] back to a native value
pub trait FromProperty: Sized {
    fn from_property(node: &PropertyNode) -> Result<Self>;
}

macro_rules! scalar_property {
    ($($ty:ty => $tag:expr),* $(,)?) => {
        $(
            impl From<$ty> for PropertyNode {
                fn from(value: $ty) -> Self {
                    PropertyNode::Value(ValueNode::new($tag, value.to_le_bytes().to_vec()))
                }
            }

            impl FromProperty for $ty {
                fn from_property(node: &PropertyNode) -> Result<Self> {
                    let value = node.expect_value($tag)?;
                    let bytes: [u8; std::mem::size_of::<$ty>()] = value
                        .bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| SyncError::mismatch($tag, format!("{} bytes", value.bytes.len())))?;
                    Ok(<$ty>::from_le_bytes(bytes))
                }
            }
        )*
    };
}

scalar_property! {
    i32 => ValueTag::Int,
    i64 => ValueTag::Long,
    f32 => ValueTag::Float,
    f64 => ValueTag::Double,
}

impl From<bool> for PropertyNode {
    fn from(value: bool) -> Self {
        PropertyNode::Value(ValueNode::new(ValueTag::Bool, vec![value as u8]))
    }
}

impl FromProperty for bool {
    fn from_property(node: &PropertyNode) -> Result<Self> {
        let value = node.expect_value(ValueTag::Bool)?;
        match value.bytes.as_slice() {
            [b] => Ok(*b != 0),
            other => Err(SyncError::mismatch(ValueTag::Bool, format!("{} bytes", other.len()))),
        }
    }
}

macro_rules! vector_property {
    ($($n:literal => $tag:expr),* $(,)?) => {
        $(
            impl From<[f32; $n]> for PropertyNode {
                fn from(value: [f32; $n]) -> Self {
                    PropertyNode::Value(ValueNode::from_floats($tag, &value))
                }
            }

            impl FromProperty for [f32; $n] {
                fn from_property(node: &PropertyNode) -> Result<Self> {
                    node.expect_value($tag)?.float_array::<$n>()
                }
            }
        )*
    };
}

vector_property! {
    2 => ValueTag::Vector2,
    3 => ValueTag::Vector3,
    4 => ValueTag::Vector4,
}

impl From<Vec<f32>> for PropertyNode {
    fn from(value: Vec<f32>) -> Self {
        let mut node = ValueNode::from_floats(ValueTag::Float, &value);
        node.array_len = Some(value.len() as u32);
        PropertyNode::Value(node)
    }
}

impl FromProperty for Vec<f32> {
    fn from_property(node: &PropertyNode) -> Result<Self> {
        match node {
            PropertyNode::Value(v) if v.tag == ValueTag::Float && v.array_len.is_some() => {
                let floats = v.floats()?;
                if Some(floats.len() as u32) != v.array_len {
                    return Err(SyncError::mismatch(
                        format!("{} floats", v.array_len.unwrap_or_default()),
                        format!("{} floats", floats.len()),
                    ));
                }
                Ok(floats)
            }
            PropertyNode::Value(v) => Err(SyncError::mismatch("Float array", v.tag)),
            other => Err(SyncError::mismatch("Float array", other.kind())),
        }
    }
}

impl From<String> for PropertyNode {
    fn from(value: String) -> Self {
        PropertyNode::String(value)
    }
}

impl From<&str> for PropertyNode {
    fn from(value: &str) -> Self {
        PropertyNode::String(value.to_string())
    }
}

impl FromProperty for String {
    fn from_property(node: &PropertyNode) -> Result<Self> {
        node.as_str()
            .map(str::to_string)
            .ok_or_else(|| SyncError::mismatch(PropertyKind::String, node.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip_and_mismatch() {
        let node = PropertyNode::from(2.5f32);
        assert_eq!(node.as_value::<f32>().unwrap(), 2.5);

        match node.as_value::<i32>() {
            Err(SyncError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "Int");
                assert_eq!(found, "Float");
            }
            other => panic!("Expected TypeMismatch, got {:?}", other),
        }

        assert!(PropertyNode::from("text").as_value::<bool>().is_err());
    }

    #[test]
    fn test_value_equality_includes_tag_and_length() {
        // Same bytes, different tags
        let float = PropertyNode::from(1.0f32);
        let int = PropertyNode::Value(ValueNode::new(ValueTag::Int, 1.0f32.to_le_bytes().to_vec()));
        assert_ne!(float, int);

        let array = PropertyNode::from(vec![1.0f32]);
        assert_ne!(float, array);
        assert_eq!(array.as_value::<Vec<f32>>().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_dictionary_equality_ignores_order() {
        let a = PropertyNode::dictionary([("a", PropertyNode::from(1)), ("b", PropertyNode::from(2))]);
        let b = PropertyNode::dictionary([("b", PropertyNode::from(2)), ("a", PropertyNode::from(1))]);
        assert_eq!(a, b);

        let c = PropertyNode::dictionary([("a", PropertyNode::from(1))]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_list_equality_is_positional() {
        let a = PropertyNode::list([PropertyNode::from(1), PropertyNode::from(2)]);
        let b = PropertyNode::list([PropertyNode::from(2), PropertyNode::from(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_clone_is_deep() {
        let original = PropertyNode::dictionary([(
            "items",
            PropertyNode::list([PropertyNode::from(1), PropertyNode::from(2)]),
        )]);
        let mut copy = original.clone();
        copy.as_dictionary_mut()
            .and_then(|d| d.get_mut("items"))
            .and_then(PropertyNode::as_list_mut)
            .unwrap()
            .push(PropertyNode::from(3));

        assert_eq!(original.as_dictionary().unwrap()["items"].as_list().unwrap().len(), 2);
        assert_ne!(original, copy);
    }

    #[test]
    fn test_vectors_and_special_values() {
        let v = PropertyNode::from([1.0f32, 2.0, 3.0]);
        assert_eq!(v.as_value::<[f32; 3]>().unwrap(), [1.0, 2.0, 3.0]);
        assert!(v.as_value::<[f32; 4]>().is_err());

        let color = PropertyNode::color([1.0, 0.5, 0.0, 1.0]);
        assert!(color.as_value::<[f32; 4]>().is_err());
        assert_ne!(color, PropertyNode::quaternion([1.0, 0.5, 0.0, 1.0]));
        assert!(PropertyNode::from(true).as_value::<bool>().unwrap());
    }

    #[test]
    fn test_reference_resolution() {
        let pending = PropertyNode::list([PropertyNode::Reference(7), PropertyNode::Reference(0)]);
        let resolved = PropertyNode::list([PropertyNode::Reference(7), PropertyNode::Reference(12)]);
        assert!(pending.holds_unresolved_reference());
        assert!(!resolved.holds_unresolved_reference());
        assert!(resolved.resolves(&pending));

        // A changed known reference is a real edit
        let retargeted = PropertyNode::list([PropertyNode::Reference(8), PropertyNode::Reference(12)]);
        assert!(!retargeted.resolves(&pending));
        assert!(!PropertyNode::Null.resolves(&PropertyNode::Reference(0)));
    }
}
