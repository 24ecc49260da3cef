//! Host object contract
//!
//! The engine never inspects host objects by reflection. Each host object
//! adapter implements [`HostObject`] and returns a static field descriptor list;
//! the host application exposes its objects through [`HostStore`].

use crate::graph::NodeId;
use crate::property::ValueTag;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a host-owned object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Externally addressable identity of a host object (for example an asset)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StableIdentity {
    pub type_name: String,
    pub path: String,
    pub sub_index: u32,
}

/// Static description of a field's value kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
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
    FloatArray,
    /// Opaque byte span such as a curve or gradient
    Blob(ValueTag),
    Text,
    /// Reference to another host object
    Object,
    List(&'static FieldKind),
    Map(&'static FieldKind),
}

/// Native value of a host field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    Quaternion([f32; 4]),
    Color([f32; 4]),
    Enum(i32),
    FloatArray(Vec<f32>),
    Blob(ValueTag, Vec<u8>),
    Text(String),
    Object(Option<ObjectHandle>),
    List(Vec<FieldValue>),
    Map(IndexMap<String, FieldValue>),
}

/// Describes one synchronizable field
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Overrides the scratch instance's value when the standard default differs from it
    pub default: Option<fn() -> FieldValue>,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            default: None,
        }
    }

    pub const fn with_default(mut self, default: fn() -> FieldValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Error raised by a host field setter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{field}' rejected {found} value")]
    WrongType { field: String, found: String },

    #[error("field '{0}' is read-only")]
    ReadOnly(String),
}

/// A host object exposing its synchronizable fields
pub trait HostObject {
    /// Name of the host type; also the default SyncNode type tag
    fn type_name(&self) -> &str;

    fn fields(&self) -> &'static [FieldDescriptor];

    fn get_field(&self, name: &str) -> Option<FieldValue>;

    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), FieldError>;

    /// A fresh instance of the same type holding standard defaults
    fn scratch(&self) -> Box<dyn HostObject>;
}

/// Access to the host application's objects
pub trait HostStore {
    fn object(&self, handle: ObjectHandle) -> Option<&dyn HostObject>;

    fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut dyn HostObject>;

    /// Create a host object for a remotely created node
    fn spawn(&mut self, type_tag: &str, parent: Option<ObjectHandle>, child_index: u32) -> Option<ObjectHandle>;

    fn destroy(&mut self, handle: ObjectHandle);

    fn parent_of(&self, handle: ObjectHandle) -> Option<ObjectHandle>;

    fn child_index(&self, handle: ObjectHandle) -> u32;

    fn set_parent(&mut self, handle: ObjectHandle, parent: Option<ObjectHandle>, child_index: u32);

    /// Reflect lock state in the host (for example by making the object read-only)
    fn set_locked(&mut self, _handle: ObjectHandle, _locked: bool) {}

    fn stable_identity(&self, _handle: ObjectHandle) -> Option<StableIdentity> {
        None
    }
}

/// Maps host handles to SyncNode ids and back
pub trait ReferenceResolver {
    /// Server id of the node tracking `handle`, if confirmed
    fn node_id(&self, handle: ObjectHandle) -> Option<NodeId>;

    /// Live host object for a server id
    fn handle(&self, id: NodeId) -> Option<ObjectHandle>;
}

/// Resolver for objects that never reference other objects
pub struct NoReferences;

impl ReferenceResolver for NoReferences {
    fn node_id(&self, _handle: ObjectHandle) -> Option<NodeId> {
        None
    }

    fn handle(&self, _id: NodeId) -> Option<ObjectHandle> {
        None
    }
}
