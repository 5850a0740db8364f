//! Context items and the group registry.

use indexmap::{IndexMap, IndexSet};
use std::fmt;

/// Identifier of a group of same-shaped items.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// User-defined group
    Named(String),
    /// Automatic group of every item with this shape
    Shape(Vec<usize>),
}

impl GroupKey {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            GroupKey::Named(name) => Some(name),
            GroupKey::Shape(_) => None,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Named(name) => write!(f, "{name}"),
            GroupKey::Shape(shape) => write!(f, "{shape:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    /// Array held in the root dictionary
    Stored,
    /// Value computed from an expression over the context
    Evaluated { source: String },
    /// Array living in the sub-context bound to `parent`
    SubContext { parent: String, sub_name: String },
}

/// One named array binding of a context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub name: String,
    pub kind: ItemKind,
    pub shape: Vec<usize>,
    pub groups: Vec<GroupKey>,
    /// Substitution value used when a reduction fills instead of compressing.
    /// NaN means "ask the context delegate".
    pub value: f64,
}

impl ContextItem {
    pub fn new(name: impl Into<String>, kind: ItemKind, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            kind,
            shape,
            groups: Vec::new(),
            value: f64::NAN,
        }
    }

    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
struct Group {
    shape: Vec<usize>,
    members: IndexSet<String>,
}

/// Group registry keyed by [`GroupKey`], in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Groups {
    groups: IndexMap<GroupKey, Group>,
}

impl Groups {
    /// Add `name` to its shape group. Returns the group key.
    pub fn add_to_shape_group(&mut self, name: &str, shape: &[usize]) -> GroupKey {
        let key = GroupKey::Shape(shape.to_vec());
        self.groups
            .entry(key.clone())
            .or_insert_with(|| Group {
                shape: shape.to_vec(),
                members: IndexSet::new(),
            })
            .members
            .insert(name.to_string());
        key
    }

    /// Replace the members of a named group. An empty member list removes it.
    pub fn set_named(&mut self, group: &str, shape: Vec<usize>, members: IndexSet<String>) {
        let key = GroupKey::Named(group.to_string());
        if members.is_empty() {
            self.groups.shift_remove(&key);
        } else {
            self.groups.insert(key, Group { shape, members });
        }
    }

    /// Drop `name` from every group; groups left empty disappear.
    /// Returns the keys of the groups `name` was in.
    pub fn remove_member(&mut self, name: &str) -> Vec<GroupKey> {
        let mut left = Vec::new();
        for (key, group) in self.groups.iter_mut() {
            if group.members.shift_remove(name) {
                left.push(key.clone());
            }
        }
        self.groups.retain(|_, group| !group.members.is_empty());
        left
    }

    /// Drop `name` from one group. Returns false if it was not a member.
    pub fn remove_from(&mut self, key: &GroupKey, name: &str) -> bool {
        let Some(group) = self.groups.get_mut(key) else {
            return false;
        };
        let removed = group.members.shift_remove(name);
        if group.members.is_empty() {
            self.groups.shift_remove(key);
        }
        removed
    }

    /// Record a new shape for every named group holding `name`.
    pub fn reshape_named(&mut self, name: &str, shape: &[usize]) {
        for (key, group) in self.groups.iter_mut() {
            if key.as_name().is_some() && group.members.contains(name) {
                group.shape = shape.to_vec();
            }
        }
    }

    /// Named groups with their members, in insertion order.
    pub fn named(&self) -> Vec<(String, Vec<String>)> {
        self.groups
            .iter()
            .filter_map(|(key, group)| {
                key.as_name()
                    .map(|name| (name.to_string(), group.members.iter().cloned().collect()))
            })
            .collect()
    }

    pub fn named_groups_of(&self, name: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(key, group)| key.as_name().is_some() && group.members.contains(name))
            .filter_map(|(key, _)| key.as_name().map(str::to_string))
            .collect()
    }

    pub fn groups_of(&self, name: &str) -> Vec<GroupKey> {
        self.groups
            .iter()
            .filter(|(_, group)| group.members.contains(name))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn members(&self, key: &GroupKey) -> Option<Vec<String>> {
        self.groups
            .get(key)
            .map(|g| g.members.iter().cloned().collect())
    }

    pub fn shape(&self, key: &GroupKey) -> Option<&[usize]> {
        self.groups.get(key).map(|g| g.shape.as_slice())
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.groups.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    /// Group with the largest leading dimension; the earliest wins ties.
    pub fn largest(&self) -> Option<GroupKey> {
        let mut best: Option<(&GroupKey, usize)> = None;
        for (key, group) in &self.groups {
            let len = group.shape.first().copied().unwrap_or(0);
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((key, len));
            }
        }
        best.map(|(key, _)| key.clone())
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
