//! Structural checksums
//!
//! Fletcher-64 over 32-bit words. Every node is prefixed with a kind
//! discriminator and dictionaries are walked in sorted key order, so equal
//! trees checksum equally regardless of insertion order. This is a
//! fingerprint for consistency checks, not a digest.

use crate::convert;
use crate::host::{FieldValue, HostObject, NoReferences, ObjectHandle, StableIdentity};
use crate::property::{Dictionary, PropertyNode};
use std::collections::HashSet;
use std::fmt;

const VALUE_WORD: u32 = 0x5641_4c31;
const STRING_WORD: u32 = 0x5354_5231;
const LIST_WORD: u32 = 0x4c53_5431;
const DICTIONARY_WORD: u32 = 0x4449_4331;
const REFERENCE_WORD: u32 = 0x5245_4631;
const NULL_WORD: u32 = 0x4e55_4c31;
const FIELD_WORD: u32 = 0x464c_4431;

/// Fletcher-64 accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fletcher64 {
    sum1: u32,
    sum2: u32,
}

impl Default for Fletcher64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Fletcher64 {
    /// `sum1` starts at 1 so that leading zero runs of different lengths differ
    pub fn new() -> Self {
        Self { sum1: 1, sum2: 0 }
    }

    pub fn add_word(&mut self, word: u32) {
        self.sum1 = self.sum1.wrapping_add(word);
        self.sum2 = self.sum2.wrapping_add(self.sum1);
    }

    /// Length word followed by little-endian words, the last one zero-padded
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.add_word(bytes.len() as u32);
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.add_word(u32::from_le_bytes(word));
        }
    }

    pub fn add_str(&mut self, s: &str) {
        self.add_bytes(s.as_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.sum1 as u64 + ((self.sum2 as u64) << 32)
    }
}

/// Excludes named top-level fields from checksums
#[derive(Default)]
pub struct ChecksumFilter {
    ignored: HashSet<String>,
    predicate: Option<Box<dyn Fn(&str) -> bool>>,
}

impl ChecksumFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn ignoring<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored: fields.into_iter().map(Into::into).collect(),
            predicate: None,
        }
    }

    /// Exclude every field for which `exclude` returns true
    pub fn with_predicate(mut self, exclude: impl Fn(&str) -> bool + 'static) -> Self {
        self.predicate = Some(Box::new(exclude));
        self
    }

    pub fn includes(&self, field: &str) -> bool {
        !self.ignored.contains(field) && !self.predicate.as_ref().is_some_and(|p| p(field))
    }
}

impl fmt::Debug for ChecksumFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumFilter")
            .field("ignored", &self.ignored)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Computes checksums of property trees and host objects
#[derive(Debug, Default)]
pub struct ChecksumEngine {
    filter: ChecksumFilter,
}

impl ChecksumEngine {
    pub fn new(filter: ChecksumFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &ChecksumFilter {
        &self.filter
    }

    pub fn tree(&self, node: &PropertyNode) -> u64 {
        let mut acc = Fletcher64::new();
        match node {
            PropertyNode::Dictionary(map) => self.feed_root(&mut acc, map),
            other => feed_node(&mut acc, other),
        }
        acc.finish()
    }

    /// Checksum of a root dictionary, honoring the field filter
    pub fn dictionary(&self, root: &Dictionary) -> u64 {
        let mut acc = Fletcher64::new();
        self.feed_root(&mut acc, root);
        acc.finish()
    }

    /// Checksum of a host object's synchronizable fields.
    ///
    /// References are fingerprinted by stable identity, so two instances of the
    /// same addressable object checksum identically; a reference without one
    /// checksums as null.
    pub fn object(
        &self,
        host: &dyn HostObject,
        identities: &dyn Fn(ObjectHandle) -> Option<StableIdentity>,
    ) -> u64 {
        let mut acc = Fletcher64::new();
        acc.add_str(host.type_name());
        for descriptor in host.fields() {
            if !self.filter.includes(descriptor.name) {
                continue;
            }
            acc.add_word(FIELD_WORD);
            acc.add_str(descriptor.name);
            match host.get_field(descriptor.name) {
                Some(value) => feed_field(&mut acc, &value, identities),
                None => acc.add_word(NULL_WORD),
            }
        }
        acc.finish()
    }

    fn feed_root(&self, acc: &mut Fletcher64, root: &Dictionary) {
        let mut keys: Vec<&String> = root.keys().filter(|k| self.filter.includes(k)).collect();
        keys.sort();
        acc.add_word(DICTIONARY_WORD);
        acc.add_word(keys.len() as u32);
        for key in keys {
            acc.add_str(key);
            feed_node(acc, &root[key]);
        }
    }
}

fn feed_node(acc: &mut Fletcher64, node: &PropertyNode) {
    match node {
        PropertyNode::Value(value) => {
            acc.add_word(VALUE_WORD);
            acc.add_word(value.tag.code());
            acc.add_word(value.array_len.map_or(0, |n| n.wrapping_add(1)));
            acc.add_bytes(&value.bytes);
        }
        PropertyNode::String(s) => {
            acc.add_word(STRING_WORD);
            acc.add_str(s);
        }
        PropertyNode::List(items) => {
            acc.add_word(LIST_WORD);
            acc.add_word(items.len() as u32);
            for item in items {
                feed_node(acc, item);
            }
        }
        PropertyNode::Dictionary(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            acc.add_word(DICTIONARY_WORD);
            acc.add_word(keys.len() as u32);
            for key in keys {
                acc.add_str(key);
                feed_node(acc, &map[key]);
            }
        }
        PropertyNode::Reference(id) => {
            acc.add_word(REFERENCE_WORD);
            acc.add_word(*id);
        }
        PropertyNode::Null => acc.add_word(NULL_WORD),
    }
}

fn feed_field(
    acc: &mut Fletcher64,
    value: &FieldValue,
    identities: &dyn Fn(ObjectHandle) -> Option<StableIdentity>,
) {
    match value {
        FieldValue::Object(Some(handle)) => match identities(*handle) {
            Some(identity) => {
                acc.add_word(REFERENCE_WORD);
                acc.add_str(&identity.type_name);
                acc.add_str(&identity.path);
                acc.add_word(identity.sub_index);
            }
            None => acc.add_word(NULL_WORD),
        },
        FieldValue::Object(None) => acc.add_word(NULL_WORD),
        FieldValue::List(items) => {
            acc.add_word(LIST_WORD);
            acc.add_word(items.len() as u32);
            for item in items {
                feed_field(acc, item, identities);
            }
        }
        FieldValue::Map(entries) => {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            acc.add_word(DICTIONARY_WORD);
            acc.add_word(keys.len() as u32);
            for key in keys {
                acc.add_str(key);
                feed_field(acc, &entries[key], identities);
            }
        }
        scalar => feed_node(acc, &convert::to_node(scalar, &NoReferences)),
    }
}
