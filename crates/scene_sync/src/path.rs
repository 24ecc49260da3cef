//! Property paths and tree edits
//!
//! A [`PropertyPath`] locates a node inside a SyncNode's root dictionary. Paths
//! are how the engine expresses a node's position in its parent, and how
//! operations exchanged with the session address the leaves they change.

use crate::property::{Dictionary, PropertyNode};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step from a container to a child
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Location of a node relative to a root dictionary. The empty path is the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyPath(Vec<PathSegment>);

impl PropertyPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![PathSegment::Field(name.into())])
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.into()));
        Self(segments)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Name of the top-level field this path lives under
    pub fn top_field(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Field(name)) => Some(name),
            _ => None,
        }
    }

    fn split_last(&self) -> Option<(&[PathSegment], &PathSegment)> {
        self.0.split_last().map(|(last, parent)| (parent, last))
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => write!(f, "{}", name)?,
                PathSegment::Field(name) => write!(f, "/{}", name)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl PropertyNode {
    /// Look up a descendant by relative path
    pub fn get_path(&self, path: &PropertyPath) -> Option<&PropertyNode> {
        path.segments().iter().try_fold(self, |node, segment| match (node, segment) {
            (PropertyNode::Dictionary(map), PathSegment::Field(name)) => map.get(name),
            (PropertyNode::List(items), PathSegment::Index(i)) => items.get(*i),
            _ => None,
        })
    }

    pub fn get_path_mut(&mut self, path: &PropertyPath) -> Option<&mut PropertyNode> {
        path.segments().iter().try_fold(self, |node, segment| match (node, segment) {
            (PropertyNode::Dictionary(map), PathSegment::Field(name)) => map.get_mut(name),
            (PropertyNode::List(items), PathSegment::Index(i)) => items.get_mut(*i),
            _ => None,
        })
    }
}

fn descend_mut<'a>(
    root: &'a mut Dictionary,
    segments: &[PathSegment],
    path: &PropertyPath,
) -> Result<&'a mut PropertyNode> {
    let (first, rest) = match segments.split_first() {
        Some((PathSegment::Field(name), rest)) => (name, rest),
        Some((PathSegment::Index(_), _)) => {
            return Err(SyncError::invalid_path(path, "root is a dictionary"))
        }
        None => return Err(SyncError::invalid_path(path, "empty path")),
    };
    let mut node = root
        .get_mut(first)
        .ok_or_else(|| SyncError::invalid_path(path, format!("missing field '{}'", first)))?;
    for segment in rest {
        node = match (node, segment) {
            (PropertyNode::Dictionary(map), PathSegment::Field(name)) => map
                .get_mut(name)
                .ok_or_else(|| SyncError::invalid_path(path, format!("missing field '{}'", name)))?,
            (PropertyNode::List(items), PathSegment::Index(i)) => {
                let len = items.len();
                items
                    .get_mut(*i)
                    .ok_or_else(|| SyncError::invalid_path(path, format!("index {} out of {}", i, len)))?
            }
            (other, _) => {
                return Err(SyncError::invalid_path(
                    path,
                    format!("cannot descend into {}", other.kind()),
                ))
            }
        };
    }
    Ok(node)
}

/// Resolve a path against a root dictionary
pub fn resolve<'a>(root: &'a Dictionary, path: &PropertyPath) -> Option<&'a PropertyNode> {
    let (first, rest) = match path.segments().split_first() {
        Some((PathSegment::Field(name), rest)) => (name, rest),
        _ => return None,
    };
    let node = root.get(first)?;
    node.get_path(&PropertyPath(rest.to_vec()))
}

/// A single edit to a property tree, relative to the SyncNode's root dictionary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum TreeChange {
    /// Leaf or subtree replaced (or inserted) at `path`
    Set { path: PropertyPath, value: PropertyNode },
    /// Sparse field removed from the dictionary at `path`
    RemoveField { path: PropertyPath, field: String },
    /// Elements inserted into the list at `path`
    ListAdd {
        path: PropertyPath,
        index: usize,
        values: Vec<PropertyNode>,
    },
    /// Elements removed from the list at `path`
    ListRemove {
        path: PropertyPath,
        index: usize,
        count: usize,
    },
}

impl TreeChange {
    pub fn path(&self) -> &PropertyPath {
        match self {
            TreeChange::Set { path, .. }
            | TreeChange::RemoveField { path, .. }
            | TreeChange::ListAdd { path, .. }
            | TreeChange::ListRemove { path, .. } => path,
        }
    }

    /// Top-level field affected by this change
    pub fn top_field(&self) -> Option<&str> {
        match self {
            TreeChange::RemoveField { path, field } if path.is_root() => Some(field),
            other => other.path().top_field(),
        }
    }

    /// Apply the change to a root dictionary
    pub fn apply(&self, root: &mut Dictionary) -> Result<()> {
        match self {
            TreeChange::Set { path, value } => {
                let (parent, last) = path
                    .split_last()
                    .ok_or_else(|| SyncError::invalid_path(path, "cannot replace the root"))?;
                if parent.is_empty() {
                    return match last {
                        PathSegment::Field(name) => {
                            root.insert(name.clone(), value.clone());
                            Ok(())
                        }
                        PathSegment::Index(_) => Err(SyncError::invalid_path(path, "root is a dictionary")),
                    };
                }
                match (descend_mut(root, parent, path)?, last) {
                    (PropertyNode::Dictionary(map), PathSegment::Field(name)) => {
                        map.insert(name.clone(), value.clone());
                    }
                    (PropertyNode::List(items), PathSegment::Index(i)) if *i < items.len() => {
                        items[*i] = value.clone();
                    }
                    (PropertyNode::List(items), PathSegment::Index(i)) if *i == items.len() => {
                        items.push(value.clone());
                    }
                    (other, _) => {
                        return Err(SyncError::invalid_path(
                            path,
                            format!("cannot set child of {}", other.kind()),
                        ))
                    }
                }
                Ok(())
            }
            TreeChange::RemoveField { path, field } => {
                let map = if path.is_root() {
                    root
                } else {
                    descend_mut(root, path.segments(), path)?
                        .as_dictionary_mut()
                        .ok_or_else(|| SyncError::invalid_path(path, "not a dictionary"))?
                };
                map.shift_remove(field);
                Ok(())
            }
            TreeChange::ListAdd { path, index, values } => {
                let items = descend_mut(root, path.segments(), path)?
                    .as_list_mut()
                    .ok_or_else(|| SyncError::invalid_path(path, "not a list"))?;
                if *index > items.len() {
                    return Err(SyncError::invalid_path(
                        path,
                        format!("insert at {} past end {}", index, items.len()),
                    ));
                }
                items.splice(*index..*index, values.iter().cloned());
                Ok(())
            }
            TreeChange::ListRemove { path, index, count } => {
                let items = descend_mut(root, path.segments(), path)?
                    .as_list_mut()
                    .ok_or_else(|| SyncError::invalid_path(path, "not a list"))?;
                if index + count > items.len() {
                    return Err(SyncError::invalid_path(
                        path,
                        format!("remove {}..{} past end {}", index, index + count, items.len()),
                    ));
                }
                items.drain(*index..*index + count);
                Ok(())
            }
        }
    }
}

/// Ordered record of the edits produced by a diff
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<TreeChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: TreeChange) {
        tracing::trace!("tree change at {}", change.path());
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TreeChange> {
        self.changes.iter()
    }

    pub fn as_slice(&self) -> &[TreeChange] {
        &self.changes
    }

    pub fn into_vec(self) -> Vec<TreeChange> {
        self.changes
    }
}

impl IntoIterator for ChangeSet {
    type Item = TreeChange;
    type IntoIter = std::vec::IntoIter<TreeChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a TreeChange;
    type IntoIter = std::slice::Iter<'a, TreeChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
