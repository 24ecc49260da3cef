//! Host object types used across the test suites
//!
//! Each type is a static field table plus the values a freshly constructed
//! instance carries. `Crate.active` has a descriptor default
//! (`true`) that differs from its freshly constructed value (`false`).

use indexmap::IndexMap;
use scene_sync::{FieldDescriptor, FieldError, FieldKind, FieldValue, HostObject, ObjectHandle};

/// Field table and initial values of one host type
#[derive(Debug)]
pub struct TypeSpec {
    pub name: &'static str,
    pub fields: &'static [FieldDescriptor],
    initial: fn() -> Vec<(&'static str, FieldValue)>,
}

pub static TRANSFORM: TypeSpec = TypeSpec {
    name: "Transform",
    fields: &[
        FieldDescriptor::new("position", FieldKind::Vector3),
        FieldDescriptor::new("rotation", FieldKind::Quaternion),
        FieldDescriptor::new("scale", FieldKind::Vector3),
    ],
    initial: || {
        vec![
            ("position", FieldValue::Vector3([0.0; 3])),
            ("rotation", FieldValue::Quaternion([0.0, 0.0, 0.0, 1.0])),
            ("scale", FieldValue::Vector3([1.0; 3])),
        ]
    },
};

pub static CRATE: TypeSpec = TypeSpec {
    name: "Crate",
    fields: &[
        FieldDescriptor::new("speed", FieldKind::Float),
        FieldDescriptor::new("items", FieldKind::List(&FieldKind::Int)),
        FieldDescriptor::new("label", FieldKind::Text),
        FieldDescriptor::new("active", FieldKind::Bool).with_default(|| FieldValue::Bool(true)),
    ],
    initial: || {
        vec![
            ("speed", FieldValue::Float(1.0)),
            ("items", FieldValue::List(Vec::new())),
            ("label", FieldValue::Text(String::new())),
            ("active", FieldValue::Bool(false)),
        ]
    },
};

pub static LIGHT: TypeSpec = TypeSpec {
    name: "Light",
    fields: &[
        FieldDescriptor::new("color", FieldKind::Color),
        FieldDescriptor::new("range", FieldKind::Float),
        FieldDescriptor::new("cookie", FieldKind::Object),
        FieldDescriptor::new("tags", FieldKind::Map(&FieldKind::Text)),
    ],
    initial: || {
        vec![
            ("color", FieldValue::Color([1.0; 4])),
            ("range", FieldValue::Float(10.0)),
            ("cookie", FieldValue::Object(None)),
            ("tags", FieldValue::Map(IndexMap::new())),
        ]
    },
};

static TYPES: [&TypeSpec; 3] = [&TRANSFORM, &CRATE, &LIGHT];

/// In-memory host object backed by a field table
#[derive(Debug, Clone)]
pub struct TestObject {
    spec: &'static TypeSpec,
    values: IndexMap<&'static str, FieldValue>,
    /// Number of successful `set_field` calls
    pub writes: usize,
}

impl TestObject {
    pub fn of(spec: &'static TypeSpec) -> Self {
        Self {
            spec,
            values: (spec.initial)().into_iter().collect(),
            writes: 0,
        }
    }

    /// A fresh instance of a known type tag
    pub fn named(type_tag: &str) -> Option<Self> {
        TYPES.iter().find(|spec| spec.name == type_tag).map(|spec| Self::of(*spec))
    }

    pub fn transform() -> Self {
        Self::of(&TRANSFORM)
    }

    pub fn crate_object() -> Self {
        Self::of(&CRATE)
    }

    pub fn light() -> Self {
        Self::of(&LIGHT)
    }

    /// Builder-style field write; panics on a value the field rejects
    pub fn with(mut self, field: &str, value: FieldValue) -> Self {
        self.set_field(field, value).expect("invalid test field value");
        self.writes = 0;
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }
}

impl HostObject for TestObject {
    fn type_name(&self) -> &str {
        self.spec.name
    }

    fn fields(&self) -> &'static [FieldDescriptor] {
        self.spec.fields
    }

    fn get_field(&self, name: &str) -> Option<FieldValue> {
        self.values.get(name).cloned()
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), FieldError> {
        let descriptor = self
            .spec
            .fields
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| FieldError::UnknownField(name.to_string()))?;
        if !fits(&value, descriptor.kind) {
            return Err(FieldError::WrongType {
                field: name.to_string(),
                found: kind_name(&value).to_string(),
            });
        }
        self.values.insert(descriptor.name, value);
        self.writes += 1;
        Ok(())
    }

    fn scratch(&self) -> Box<dyn HostObject> {
        Box::new(Self::of(self.spec))
    }
}

fn fits(value: &FieldValue, kind: FieldKind) -> bool {
    match (kind, value) {
        (FieldKind::Bool, FieldValue::Bool(_))
        | (FieldKind::Int, FieldValue::Int(_))
        | (FieldKind::Long, FieldValue::Long(_))
        | (FieldKind::Float, FieldValue::Float(_))
        | (FieldKind::Double, FieldValue::Double(_))
        | (FieldKind::Vector2, FieldValue::Vector2(_))
        | (FieldKind::Vector3, FieldValue::Vector3(_))
        | (FieldKind::Vector4, FieldValue::Vector4(_))
        | (FieldKind::Quaternion, FieldValue::Quaternion(_))
        | (FieldKind::Color, FieldValue::Color(_))
        | (FieldKind::Enum, FieldValue::Enum(_))
        | (FieldKind::FloatArray, FieldValue::FloatArray(_))
        | (FieldKind::Text, FieldValue::Text(_))
        | (FieldKind::Object, FieldValue::Object(_)) => true,
        (FieldKind::Blob(tag), FieldValue::Blob(found, _)) => tag == *found,
        (FieldKind::List(inner), FieldValue::List(items)) => items.iter().all(|v| fits(v, *inner)),
        (FieldKind::Map(inner), FieldValue::Map(entries)) => entries.values().all(|v| fits(v, *inner)),
        _ => false,
    }
}

fn kind_name(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Bool(_) => "bool",
        FieldValue::Int(_) => "int",
        FieldValue::Long(_) => "long",
        FieldValue::Float(_) => "float",
        FieldValue::Double(_) => "double",
        FieldValue::Vector2(_) => "vector2",
        FieldValue::Vector3(_) => "vector3",
        FieldValue::Vector4(_) => "vector4",
        FieldValue::Quaternion(_) => "quaternion",
        FieldValue::Color(_) => "color",
        FieldValue::Enum(_) => "enum",
        FieldValue::FloatArray(_) => "float array",
        FieldValue::Blob(..) => "blob",
        FieldValue::Text(_) => "text",
        FieldValue::Object(_) => "object",
        FieldValue::List(_) => "list",
        FieldValue::Map(_) => "map",
    }
}

/// Shorthand for an object reference value
pub fn object_ref(handle: ObjectHandle) -> FieldValue {
    FieldValue::Object(Some(handle))
}
