//! Event records emitted by contexts, stages and filters.
//!
//! Both [`DictModified`] and [`ContextModified`] form a merge algebra: a
//! sequence of events collapsed with `merge` is observationally equivalent to
//! applying each event in turn. Deferral windows and the deferred stage rely
//! on this.

use crate::types::Value;
use indexmap::{IndexMap, IndexSet};

/// Old and new value of a rebinding.
#[derive(Debug, Clone, PartialEq)]
pub struct Changed {
    pub old: Value,
    pub new: Value,
}

/// Raw dictionary-level change of a root context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictModified {
    pub added: IndexMap<String, Value>,
    pub changed: IndexMap<String, Changed>,
    /// Removed names with their last value
    pub removed: IndexMap<String, Value>,
}

impl DictModified {
    pub fn added(name: impl Into<String>, value: Value) -> Self {
        let mut event = Self::default();
        event.added.insert(name.into(), value);
        event
    }

    pub fn changed(name: impl Into<String>, old: Value, new: Value) -> Self {
        let mut event = Self::default();
        event.changed.insert(name.into(), Changed { old, new });
        event
    }

    pub fn removed(name: impl Into<String>, old: Value) -> Self {
        let mut event = Self::default();
        event.removed.insert(name.into(), old);
        event
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Fold `next` (which happened after `self`) into `self`.
    pub fn merge(&mut self, next: DictModified) {
        for (name, value) in next.added {
            match self.removed.shift_remove(&name) {
                Some(old) if old.is_same(&value) => {}
                Some(old) => {
                    self.changed.insert(name, Changed { old, new: value });
                }
                None => {
                    self.added.insert(name, value);
                }
            }
        }

        for (name, change) in next.changed {
            if let Some(current) = self.added.get_mut(&name) {
                *current = change.new;
            } else if let Some(current) = self.changed.get_mut(&name) {
                current.new = change.new;
            } else if let Some(old) = self.removed.shift_remove(&name) {
                // Treated as a re-add of the removed value.
                if !old.is_same(&change.new) {
                    self.changed.insert(name, Changed { old, new: change.new });
                }
            } else {
                self.changed.insert(name, change);
            }
        }

        for (name, old) in next.removed {
            if self.added.shift_remove(&name).is_some() {
                continue;
            }
            match self.changed.shift_remove(&name) {
                Some(change) => {
                    self.removed.insert(name, change.old);
                }
                None => {
                    self.removed.insert(name, old);
                }
            }
        }
    }
}

/// Item-level change notification posted by every context and stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextModified {
    pub added: IndexSet<String>,
    pub modified: IndexSet<String>,
    pub removed: IndexSet<String>,
    /// Names whose values are not array data
    pub changed: IndexSet<String>,
    /// Every item must be considered modified (group or filter changed)
    pub reset: bool,
}

impl ContextModified {
    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }

    pub fn with_added(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.added.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_modified(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.modified.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_removed(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.removed.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.reset
            && self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
    }

    /// Every name the event mentions.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .chain(self.changed.iter().filter(|n| {
                !self.added.contains(*n) && !self.modified.contains(*n) && !self.removed.contains(*n)
            }))
    }

    pub fn mentions(&self, name: &str) -> bool {
        self.added.contains(name)
            || self.modified.contains(name)
            || self.removed.contains(name)
            || self.changed.contains(name)
    }

    /// Names present in both `added` and `removed` become `modified`.
    pub fn normalize(&mut self) {
        let both: Vec<String> = self
            .added
            .iter()
            .filter(|n| self.removed.contains(*n))
            .cloned()
            .collect();
        for name in both {
            self.added.shift_remove(&name);
            self.removed.shift_remove(&name);
            self.modified.insert(name);
        }
        let modified = std::mem::take(&mut self.modified);
        self.modified = modified
            .into_iter()
            .filter(|n| !self.added.contains(n) && !self.removed.contains(n))
            .collect();
    }

    /// Copy of the event with every name prefixed by `prefix.`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        let map = |set: &IndexSet<String>| set.iter().map(|n| format!("{prefix}.{n}")).collect();
        Self {
            added: map(&self.added),
            modified: map(&self.modified),
            removed: map(&self.removed),
            changed: map(&self.changed),
            reset: self.reset,
        }
    }

    /// Fold `next` (which happened after `self`) into `self`.
    pub fn merge(&mut self, next: ContextModified) {
        for name in next.added {
            if self.removed.shift_remove(&name) {
                self.modified.insert(name);
            } else {
                self.added.insert(name);
            }
        }
        for name in next.modified {
            if !self.added.contains(&name) {
                self.modified.insert(name);
            }
        }
        for name in next.removed {
            if self.added.shift_remove(&name) {
                continue;
            }
            self.modified.shift_remove(&name);
            self.removed.insert(name);
        }
        self.changed.extend(next.changed);
        self.reset |= next.reset;
    }
}
