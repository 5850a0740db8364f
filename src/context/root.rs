//! Root context: the data-owning end of every pipeline.

use super::events::{ContextModified, DictModified};
use super::hub::{EventHub, ListenerId};
use super::item::{ContextItem, GroupKey, Groups, ItemKind};
use super::{ContextConfig, NumericContext, CONTEXT_KEY};
use crate::block::ast::Expression;
use crate::error::{FlowError, Result};
use crate::numeric::Array;
use crate::types::{AttributeChanged, DynamicObject, Value};
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

struct SubBinding {
    context: Context,
    listener: ListenerId,
}

struct DynamicBinding {
    id: u64,
    object: DynamicObject,
    attr: String,
    name: String,
    listener: ListenerId,
}

#[derive(Clone)]
struct EvaluatedItem {
    expression: Expression,
    cache: Option<Value>,
}

pub(crate) struct ContextInner {
    name: RefCell<String>,
    data: RefCell<IndexMap<String, Value>>,
    items: RefCell<IndexMap<String, ContextItem>>,
    groups: RefCell<Groups>,
    current_group: RefCell<Option<GroupKey>>,
    subcontexts: RefCell<IndexMap<String, SubBinding>>,
    bindings: RefCell<Vec<DynamicBinding>>,
    next_binding: Cell<u64>,
    evaluated: RefCell<IndexMap<String, EvaluatedItem>>,
    evaluating: RefCell<HashSet<String>>,
    defer_depth: Cell<usize>,
    pending_dict: RefCell<DictModified>,
    pending_context: RefCell<ContextModified>,
    dirty: Cell<bool>,
    dict_modified: EventHub<DictModified>,
    context_modified: EventHub<ContextModified>,
    config: ContextConfig,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for (_, sub) in self.subcontexts.get_mut().drain(..) {
            sub.context.0.context_modified.unsubscribe(sub.listener);
        }
        for binding in self.bindings.get_mut().drain(..) {
            binding.object.unsubscribe(binding.listener);
        }
    }
}

/// Data-owning context.
///
/// A mapping from names to [`Value`]s that keeps per-item metadata, groups of
/// same-shaped arrays, sub-context links and dynamic bindings in sync with
/// the dictionary, and posts a [`DictModified`] and a [`ContextModified`]
/// after every mutation.
///
/// Clones share the same underlying context.
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

impl Context {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ContextConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: ContextConfig) -> Self {
        Self(Rc::new(ContextInner {
            name: RefCell::new(name.into()),
            data: RefCell::new(IndexMap::new()),
            items: RefCell::new(IndexMap::new()),
            groups: RefCell::new(Groups::default()),
            current_group: RefCell::new(None),
            subcontexts: RefCell::new(IndexMap::new()),
            bindings: RefCell::new(Vec::new()),
            next_binding: Cell::new(0),
            evaluated: RefCell::new(IndexMap::new()),
            evaluating: RefCell::new(HashSet::new()),
            defer_depth: Cell::new(0),
            pending_dict: RefCell::new(DictModified::default()),
            pending_context: RefCell::new(ContextModified::default()),
            dirty: Cell::new(false),
            dict_modified: EventHub::new("context.dict_modified"),
            context_modified: EventHub::new("context.context_modified"),
            config,
        }))
    }

    pub fn name(&self) -> String {
        self.0.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.borrow_mut() = name.into();
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn dict_modified(&self) -> &EventHub<DictModified> {
        &self.0.dict_modified
    }

    /// True once any mutation happened since creation or the last
    /// [`Context::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        self.0.dirty.get()
    }

    pub fn mark_clean(&self) {
        self.0.dirty.set(false);
    }

    fn weak(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.0)
    }

    // ==================== Mapping API ====================

    pub fn get(&self, name: &str) -> Result<Value> {
        if name == CONTEXT_KEY {
            return Ok(Value::Context(self.clone()));
        }
        let stored = self.0.data.borrow().get(name).cloned();
        if let Some(value) = stored {
            return Ok(value);
        }
        if self.0.evaluated.borrow().contains_key(name) {
            return self.evaluate_item(name);
        }
        Err(FlowError::invalid_name(
            name,
            format!("not bound in context '{}'", self.name()),
        ))
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        check_writable(name)?;
        self.check_bindable(name, &value)?;
        self.validate_group_shapes(&[(name, &value)])?;

        if self.0.evaluated.borrow().contains_key(name) {
            return self.batch(|| {
                self.drop_expression(name);
                self.store(name, value)
            });
        }
        self.store(name, value)
    }

    fn store(&self, name: &str, value: Value) -> Result<()> {
        let old = self
            .0
            .data
            .borrow_mut()
            .insert(name.to_string(), value.clone());
        let event = match old {
            Some(old) => DictModified::changed(name, old, value),
            None => DictModified::added(name, value),
        };
        self.dict_is_modified(event)
    }

    pub fn remove(&self, name: &str) -> Result<Value> {
        check_writable(name)?;
        if self.0.evaluated.borrow().contains_key(name) {
            let value = self.get(name).unwrap_or_default();
            self.drop_expression(name);
            return Ok(value);
        }
        let old = self.0.data.borrow_mut().shift_remove(name);
        match old {
            Some(old) => {
                self.dict_is_modified(DictModified::removed(name, old.clone()))?;
                Ok(old)
            }
            None => Err(FlowError::invalid_name(
                name,
                format!("not bound in context '{}'", self.name()),
            )),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        name == CONTEXT_KEY
            || self.0.data.borrow().contains_key(name)
            || self.0.evaluated.borrow().contains_key(name)
    }

    /// Bound names, stored entries first, then evaluated items.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.0.data.borrow().keys().cloned().collect();
        keys.extend(self.0.evaluated.borrow().keys().cloned());
        keys
    }

    /// Snapshot of the stored entries.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .data
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.data.borrow().len() + self.0.evaluated.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind several names at once, posting a single event.
    ///
    /// Group shapes are validated against the final state before anything
    /// is applied.
    pub fn update<I, K>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries: Vec<(String, Value)> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for (name, value) in &entries {
            check_writable(name)?;
            self.check_bindable(name, value)?;
        }
        let pairs: Vec<(&str, &Value)> = entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
        self.validate_group_shapes(&pairs)?;

        self.batch(|| {
            for (name, value) in entries {
                if self.0.evaluated.borrow().contains_key(&name) {
                    self.drop_expression(&name);
                }
                self.store(&name, value)?;
            }
            Ok(())
        })
    }

    /// Remove every binding, posting a single event.
    pub fn clear(&self) -> Result<()> {
        self.batch(|| {
            let expressions: Vec<String> = self.0.evaluated.borrow().keys().cloned().collect();
            for name in expressions {
                self.drop_expression(&name);
            }
            let drained: Vec<(String, Value)> = self.0.data.borrow_mut().drain(..).collect();
            if drained.is_empty() {
                return Ok(());
            }
            let mut event = DictModified::default();
            event.removed.extend(drained);
            self.dict_is_modified(event)
        })
    }

    /// Shallow copy: arrays and sub-contexts are shared, metadata is not.
    pub fn copy(&self) -> Result<Context> {
        let copy = Context::with_config(self.name(), self.config());
        copy.update(self.entries())?;
        for (group, names) in self.named_groups() {
            copy.context_group_for(Some(&group), Some(names))?;
        }
        for (name, source) in self.expressions() {
            copy.define_expression(&name, &source)?;
        }
        for (name, value) in self.item_values() {
            copy.set_item_value(&name, value)?;
        }
        if let Some(group) = self.explicit_group() {
            copy.set_current_group(Some(&group))?;
        }
        Ok(copy)
    }

    // ==================== Dotted access ====================

    /// Longest `prefix.rest` split whose prefix is a bound sub-context.
    fn resolve_prefix<'n>(&self, name: &'n str) -> Option<(Context, &'n str)> {
        let data = self.0.data.borrow();
        name.rmatch_indices('.').find_map(|(idx, _)| match data.get(&name[..idx]) {
            Some(Value::Context(sub)) => Some((sub.clone(), &name[idx + 1..])),
            _ => None,
        })
    }

    pub fn get_dotted(&self, name: &str) -> Result<Value> {
        match self.resolve_prefix(name) {
            Some((sub, rest)) => sub.get_dotted(rest),
            None => self.get(name),
        }
    }

    /// Write through the deepest existing sub-context prefix, or locally.
    pub fn set_dotted(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        match self.resolve_prefix(name) {
            Some((sub, rest)) => sub.set_dotted(rest, value),
            None => self.set(name, value),
        }
    }

    pub fn remove_dotted(&self, name: &str) -> Result<Value> {
        match self.resolve_prefix(name) {
            Some((sub, rest)) => sub.remove_dotted(rest),
            None => self.remove(name),
        }
    }

    // ==================== Items and groups ====================

    /// Item metadata, with its current group memberships.
    pub fn item(&self, name: &str) -> Option<ContextItem> {
        let mut item = self.0.items.borrow().get(name).cloned()?;
        item.groups = self.0.groups.borrow().groups_of(name);
        Some(item)
    }

    pub fn items(&self) -> Vec<ContextItem> {
        let names: Vec<String> = self.0.items.borrow().keys().cloned().collect();
        names.iter().filter_map(|n| self.item(n)).collect()
    }

    pub fn item_value(&self, name: &str) -> Result<f64> {
        self.0
            .items
            .borrow()
            .get(name)
            .map(|item| item.value)
            .ok_or_else(|| FlowError::invalid_name(name, "not an item of this context"))
    }

    pub fn set_item_value(&self, name: &str, value: f64) -> Result<()> {
        let mut items = self.0.items.borrow_mut();
        let item = items
            .get_mut(name)
            .ok_or_else(|| FlowError::invalid_name(name, "not an item of this context"))?;
        item.value = value;
        Ok(())
    }

    fn item_values(&self) -> Vec<(String, f64)> {
        self.0
            .items
            .borrow()
            .values()
            .filter(|item| !item.value.is_nan())
            .map(|item| (item.name.clone(), item.value))
            .collect()
    }

    /// Query or replace a named group.
    ///
    /// * `group == None` returns the members of the current group.
    /// * `names == None` returns the members of `group`.
    /// * Otherwise `group` is replaced by `names` (an empty list removes
    ///   it). Replacing the current group posts a reset event.
    pub fn context_group_for(
        &self,
        group: Option<&str>,
        names: Option<Vec<String>>,
    ) -> Result<Vec<String>> {
        let Some(group) = group else {
            return Ok(self.current_group_names());
        };
        let Some(names) = names else {
            return self
                .0
                .groups
                .borrow()
                .members(&GroupKey::Named(group.to_string()))
                .ok_or_else(|| FlowError::invalid_name(group, "no such group"));
        };

        let mut shape: Option<Vec<usize>> = None;
        {
            let items = self.0.items.borrow();
            for name in &names {
                let item = items
                    .get(name)
                    .filter(|item| !matches!(item.kind, ItemKind::Evaluated { .. }))
                    .ok_or_else(|| {
                        FlowError::numeric(group, format!("'{name}' is not an array item"))
                    })?;
                match &shape {
                    Some(expected) if *expected != item.shape => {
                        return Err(FlowError::numeric(
                            group,
                            format!(
                                "'{name}' has shape {:?}, group members have shape {:?}",
                                item.shape, expected
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => shape = Some(item.shape.clone()),
                }
            }
        }

        self.0.groups.borrow_mut().set_named(
            group,
            shape.unwrap_or_default(),
            names.iter().cloned().collect(),
        );
        let key = GroupKey::Named(group.to_string());
        if self.0.current_group.borrow().as_ref() == Some(&key) {
            tracing::debug!(context = %self.name(), group, "current group replaced");
            self.post(None, ContextModified::reset());
        }
        Ok(names)
    }

    /// Pin the current group to a named group, or return to the default
    /// (largest leading dimension). Posts a reset event.
    pub fn set_current_group(&self, group: Option<&str>) -> Result<()> {
        let key = match group {
            Some(group) => {
                let key = GroupKey::Named(group.to_string());
                if !self.0.groups.borrow().contains(&key) {
                    return Err(FlowError::invalid_name(group, "no such group"));
                }
                Some(key)
            }
            None => None,
        };
        *self.0.current_group.borrow_mut() = key;
        self.post(None, ContextModified::reset());
        Ok(())
    }

    fn explicit_group(&self) -> Option<String> {
        self.0
            .current_group
            .borrow()
            .as_ref()
            .and_then(|k| k.as_name().map(str::to_string))
    }

    pub fn current_group(&self) -> Option<GroupKey> {
        let groups = self.0.groups.borrow();
        match self.0.current_group.borrow().as_ref() {
            Some(key) if groups.contains(key) => Some(key.clone()),
            _ => groups.largest(),
        }
    }

    pub fn named_groups(&self) -> Vec<(String, Vec<String>)> {
        self.0.groups.borrow().named()
    }

    /// Create `name` as an array filled with the delegate's default value,
    /// shaped like `group` (or the current group) and joined to it.
    ///
    /// Returns `Ok(false)` and stores nothing when the delegate has no
    /// default for `name`.
    pub fn fill_default(&self, name: &str, group: Option<&str>) -> Result<bool> {
        let Some(fill) = self.0.config.delegate.default_value(name) else {
            return Ok(false);
        };
        let key = match group {
            Some(group) => GroupKey::Named(group.to_string()),
            None => self
                .current_group()
                .ok_or_else(|| FlowError::numeric(name, "context has no groups"))?,
        };
        let shape = self
            .0
            .groups
            .borrow()
            .shape(&key)
            .map(<[usize]>::to_vec)
            .ok_or_else(|| FlowError::invalid_name(key.to_string(), "no such group"))?;

        self.batch(|| {
            self.set(name, Array::full(&shape, fill))?;
            if let Some(group) = group {
                let mut members = self.context_group_for(Some(group), None)?;
                if !members.iter().any(|m| m == name) {
                    members.push(name.to_string());
                }
                self.context_group_for(Some(group), Some(members))?;
            }
            Ok(true)
        })
    }

    fn check_bindable(&self, name: &str, value: &Value) -> Result<()> {
        if let Value::Context(sub) = value {
            if sub.ptr_eq(self) {
                return Err(FlowError::numeric(name, "a context cannot contain itself"));
            }
            if sub.reaches(self) {
                return Err(FlowError::numeric(
                    name,
                    format!("'{}' already contains '{}'", sub.name(), self.name()),
                ));
            }
        }
        Ok(())
    }

    /// Whether `target` is bound anywhere in this context's sub-context tree.
    fn reaches(&self, target: &Context) -> bool {
        let mut visited: Vec<Context> = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(ctx) = stack.pop() {
            if visited.iter().any(|seen| seen.ptr_eq(&ctx)) {
                continue;
            }
            let subs: Vec<Context> = ctx.0.subcontexts.borrow().values().map(|b| b.context.clone()).collect();
            if subs.iter().any(|sub| sub.ptr_eq(target)) {
                return true;
            }
            stack.extend(subs);
            visited.push(ctx);
        }
        false
    }

    /// Every named group touched by `entries` must keep a single shape.
    fn validate_group_shapes(&self, entries: &[(&str, &Value)]) -> Result<()> {
        let groups = self.0.groups.borrow();
        let items = self.0.items.borrow();
        let incoming: IndexMap<&str, &Value> = entries.iter().copied().collect();

        for (group, members) in groups.named() {
            if !members.iter().any(|m| incoming.contains_key(m.as_str())) {
                continue;
            }
            let mut shape: Option<(&str, &[usize])> = None;
            for member in &members {
                let member_shape = match incoming.get(member.as_str()) {
                    Some(Value::Array(array)) if array.is_pipeline_data() => array.shape(),
                    Some(_) => continue,
                    None => match items.get(member) {
                        Some(item) => item.shape.as_slice(),
                        None => continue,
                    },
                };
                match shape {
                    Some((source, expected)) if expected != member_shape => {
                        // Existing members agree, so one side is being written.
                        let (offender, got, want) = if incoming.contains_key(member.as_str()) {
                            (member.as_str(), member_shape, expected)
                        } else {
                            (source, expected, member_shape)
                        };
                        return Err(FlowError::numeric(
                            offender,
                            format!("shape {got:?} does not match group '{group}' shape {want:?}"),
                        ));
                    }
                    Some(_) => {}
                    None => shape = Some((member.as_str(), member_shape)),
                }
            }
        }
        Ok(())
    }

    fn upsert_item(&self, name: &str, kind: ItemKind, shape: &[usize]) {
        let mut items = self.0.items.borrow_mut();
        let mut groups = self.0.groups.borrow_mut();
        match items.get_mut(name) {
            Some(item) => {
                let was_grouped = !matches!(item.kind, ItemKind::Evaluated { .. });
                item.kind = kind;
                if item.shape != shape || !was_grouped {
                    if was_grouped {
                        groups.remove_from(&GroupKey::Shape(item.shape.clone()), name);
                    }
                    groups.add_to_shape_group(name, shape);
                    groups.reshape_named(name, shape);
                    item.shape = shape.to_vec();
                }
            }
            None => {
                groups.add_to_shape_group(name, shape);
                items.insert(name.to_string(), ContextItem::new(name, kind, shape.to_vec()));
            }
        }
    }

    fn remove_item(&self, name: &str) -> bool {
        let removed = self.0.items.borrow_mut().shift_remove(name).is_some();
        if removed {
            self.0.groups.borrow_mut().remove_member(name);
        }
        removed
    }

    // ==================== Evaluated items ====================

    /// Bind `name` to an expression evaluated lazily over this context.
    pub fn define_expression(&self, name: &str, source: &str) -> Result<()> {
        check_writable(name)?;
        let expression = Expression::compile(source)?;
        self.batch(|| {
            if self.0.data.borrow().contains_key(name) {
                self.remove(name)?;
            }
            let existed = self
                .0
                .evaluated
                .borrow_mut()
                .insert(
                    name.to_string(),
                    EvaluatedItem {
                        expression,
                        cache: None,
                    },
                )
                .is_some();
            {
                let mut items = self.0.items.borrow_mut();
                let item = ContextItem::new(
                    name,
                    ItemKind::Evaluated {
                        source: source.to_string(),
                    },
                    Vec::new(),
                );
                items.insert(name.to_string(), item);
            }
            let mut event = if existed {
                ContextModified::default().with_modified([name])
            } else {
                ContextModified::default().with_added([name])
            };
            self.invalidate_evaluated(&mut event);
            self.0.dirty.set(true);
            self.post(None, event);
            Ok(())
        })
    }

    /// Evaluated item definitions as `(name, source)`.
    pub fn expressions(&self) -> Vec<(String, String)> {
        self.0
            .evaluated
            .borrow()
            .iter()
            .map(|(name, item)| (name.clone(), item.expression.source().to_string()))
            .collect()
    }

    fn drop_expression(&self, name: &str) {
        if self.0.evaluated.borrow_mut().shift_remove(name).is_none() {
            return;
        }
        self.remove_item(name);
        let mut event = ContextModified::default().with_removed([name]);
        self.invalidate_evaluated(&mut event);
        self.0.dirty.set(true);
        self.post(None, event);
    }

    fn evaluate_item(&self, name: &str) -> Result<Value> {
        let entry = self.0.evaluated.borrow().get(name).cloned();
        let Some(entry) = entry else {
            return Err(FlowError::invalid_name(name, "not an evaluated item"));
        };
        if let Some(cached) = entry.cache {
            return Ok(cached);
        }
        if !self.0.evaluating.borrow_mut().insert(name.to_string()) {
            return Err(FlowError::RecursiveDefinition(name.to_string()));
        }
        let result = entry.expression.evaluate(self);
        self.0.evaluating.borrow_mut().remove(name);
        let value = result?;

        if let Some(item) = self.0.evaluated.borrow_mut().get_mut(name) {
            item.cache = Some(value.clone());
        }
        if let Some(array) = value.as_array() {
            if let Some(item) = self.0.items.borrow_mut().get_mut(name) {
                item.shape = array.shape().to_vec();
            }
        }
        tracing::trace!(context = %self.name(), name, "evaluated item computed");
        Ok(value)
    }

    /// Drop cached values of evaluated items depending on names in `event`,
    /// transitively, and report them as modified.
    fn invalidate_evaluated(&self, event: &mut ContextModified) {
        loop {
            let mut grew = false;
            let mut evaluated = self.0.evaluated.borrow_mut();
            for (name, item) in evaluated.iter_mut() {
                let depends =
                    event.reset || item.expression.names().iter().any(|dep| event.mentions(dep));
                if !depends {
                    continue;
                }
                item.cache = None;
                if !event.mentions(name) {
                    event.modified.insert(name.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
    }

    // ==================== Sub-contexts ====================

    fn attach_subcontext(&self, name: &str, sub: &Context, event: &mut ContextModified) {
        let already = self
            .0
            .subcontexts
            .borrow()
            .get(name)
            .is_some_and(|binding| binding.context.ptr_eq(sub));
        if already {
            return;
        }
        let weak = self.weak();
        let prefix = name.to_string();
        let listener = sub.0.context_modified.subscribe(move |sub_event| {
            match weak.upgrade() {
                Some(inner) => Context(inner).subcontext_modified(&prefix, sub_event),
                None => Ok(()),
            }
        });
        self.0.subcontexts.borrow_mut().insert(
            name.to_string(),
            SubBinding {
                context: sub.clone(),
                listener,
            },
        );
        for item in sub.context_items() {
            let full = format!("{name}.{item}");
            self.refresh_sub_item(name, &full);
            event.added.insert(full);
        }
    }

    fn detach_subcontext(&self, name: &str, event: &mut ContextModified) {
        let Some(binding) = self.0.subcontexts.borrow_mut().shift_remove(name) else {
            return;
        };
        binding.context.0.context_modified.unsubscribe(binding.listener);
        let prefix = format!("{name}.");
        let stale: Vec<String> = self
            .0
            .items
            .borrow()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for item in stale {
            self.remove_item(&item);
            event.removed.insert(item);
        }
    }

    fn refresh_sub_item(&self, parent: &str, full: &str) {
        match self.get_dotted(full) {
            Ok(Value::Array(array)) if array.is_pipeline_data() => {
                let sub_name = full[parent.len() + 1..].to_string();
                self.upsert_item(
                    full,
                    ItemKind::SubContext {
                        parent: parent.to_string(),
                        sub_name,
                    },
                    array.shape(),
                );
            }
            _ => {
                self.remove_item(full);
            }
        }
    }

    fn subcontext_modified(&self, prefix: &str, sub_event: &ContextModified) -> Result<()> {
        let before = self.current_group();
        let mut event = sub_event.prefixed(prefix);
        let touched: Vec<String> = if event.reset {
            let sub = self
                .0
                .subcontexts
                .borrow()
                .get(prefix)
                .map(|b| b.context.clone());
            let mut names: Vec<String> = sub
                .map(|sub| {
                    sub.context_items()
                        .into_iter()
                        .map(|n| format!("{prefix}.{n}"))
                        .collect()
                })
                .unwrap_or_default();
            let dotted = format!("{prefix}.");
            names.extend(
                self.0
                    .items
                    .borrow()
                    .keys()
                    .filter(|k| k.starts_with(&dotted))
                    .cloned(),
            );
            names
        } else {
            event
                .added
                .iter()
                .chain(&event.modified)
                .chain(&event.removed)
                .cloned()
                .collect()
        };
        for full in touched {
            self.refresh_sub_item(prefix, &full);
        }
        self.invalidate_evaluated(&mut event);
        if self.current_group() != before {
            event.reset = true;
        }
        self.0.dirty.set(true);
        self.post(None, event);
        Ok(())
    }

    // ==================== Dynamic binding ====================

    /// Keep `object` bound under the name held in its `attr` attribute.
    ///
    /// Returns `Ok(false)` (and logs a warning) when that name is already
    /// bound to another value.
    pub fn bind_dynamic(&self, object: &DynamicObject, attr: &str) -> Result<bool> {
        let name = object
            .attr(attr)
            .ok_or_else(|| FlowError::invalid_name(attr, "object has no such attribute"))?;
        check_writable(&name)?;

        let as_value = Value::Object(object.clone());
        let existing = self.0.data.borrow().get(&name).cloned();
        if let Some(existing) = &existing {
            if !existing.is_same(&as_value) {
                tracing::warn!(
                    context = %self.name(),
                    name = %name,
                    "dynamic binding collides with an existing value; binding dropped"
                );
                return Ok(false);
            }
        }
        if self.binding_index(object).is_some() {
            return Ok(true);
        }

        let id = self.0.next_binding.get();
        self.0.next_binding.set(id + 1);
        let weak = self.weak();
        let listener = object.on_change(move |change| match weak.upgrade() {
            Some(inner) => Context(inner).attribute_changed(id, change),
            None => Ok(()),
        });
        self.0.bindings.borrow_mut().push(DynamicBinding {
            id,
            object: object.clone(),
            attr: attr.to_string(),
            name: name.clone(),
            listener,
        });

        if existing.is_none() {
            self.set(&name, as_value)?;
        }
        Ok(true)
    }

    /// Stop tracking `object`; its current binding stays in place.
    pub fn unbind_dynamic(&self, object: &DynamicObject) -> bool {
        let Some(index) = self.binding_index(object) else {
            return false;
        };
        let binding = self.0.bindings.borrow_mut().remove(index);
        binding.object.unsubscribe(binding.listener);
        true
    }

    /// Name `object` is currently bound under, if it is tracked.
    pub fn binding_name(&self, object: &DynamicObject) -> Option<String> {
        self.0
            .bindings
            .borrow()
            .iter()
            .find(|b| b.object.ptr_eq(object))
            .map(|b| b.name.clone())
    }

    fn binding_index(&self, object: &DynamicObject) -> Option<usize> {
        self.0
            .bindings
            .borrow()
            .iter()
            .position(|b| b.object.ptr_eq(object))
    }

    fn attribute_changed(&self, id: u64, change: &AttributeChanged) -> Result<()> {
        let (object, old_name) = {
            let bindings = self.0.bindings.borrow();
            match bindings.iter().find(|b| b.id == id && b.attr == change.attr) {
                Some(binding) if binding.name != change.new => {
                    (binding.object.clone(), binding.name.clone())
                }
                _ => return Ok(()),
            }
        };
        let new_name = change.new.clone();
        let as_value = Value::Object(object.clone());

        let occupied = self
            .0
            .data
            .borrow()
            .get(&new_name)
            .is_some_and(|v| !v.is_same(&as_value));
        if occupied || new_name == CONTEXT_KEY {
            tracing::warn!(
                context = %self.name(),
                name = %new_name,
                previous = %old_name,
                "dynamic binding collides with an existing value; binding dropped"
            );
            self.unbind_dynamic(&object);
            return Ok(());
        }

        self.set_binding_name(&object, &new_name);
        self.batch(|| {
            let holds_object = self
                .0
                .data
                .borrow()
                .get(&old_name)
                .is_some_and(|v| v.is_same(&as_value));
            if holds_object {
                self.remove(&old_name)?;
            }
            self.set(&new_name, as_value.clone())
        })
    }

    fn set_binding_name(&self, object: &DynamicObject, name: &str) -> Option<String> {
        let mut bindings = self.0.bindings.borrow_mut();
        let binding = bindings.iter_mut().find(|b| b.object.ptr_eq(object))?;
        Some(std::mem::replace(&mut binding.name, name.to_string()))
    }

    /// An object bound under `name` that is tracked under another name is
    /// renamed: the old key goes and the attribute follows.
    fn rebind(&self, object: &DynamicObject, name: &str) -> Result<()> {
        let Some(old_name) = self.set_binding_name(object, name) else {
            return Ok(());
        };
        if old_name == name {
            return Ok(());
        }
        let attr = self
            .0
            .bindings
            .borrow()
            .iter()
            .find(|b| b.object.ptr_eq(object))
            .map(|b| b.attr.clone());
        let as_value = Value::Object(object.clone());
        self.batch(|| {
            let holds_object = self
                .0
                .data
                .borrow()
                .get(&old_name)
                .is_some_and(|v| v.is_same(&as_value));
            if holds_object {
                self.remove(&old_name)?;
            }
            if let Some(attr) = &attr {
                object.set_attr(attr, name);
            }
            Ok(())
        })
    }

    // ==================== Events ====================

    /// Run `f` with events deferred, posting the merged result once.
    pub fn batch<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.set_defer_events(true);
        let result = f();
        self.set_defer_events(false);
        result
    }

    /// Enter (`true`) or leave (`false`) an event deferral window.
    ///
    /// Windows nest; the merged events fire when the outermost one closes.
    pub fn set_defer_events(&self, defer: bool) {
        if defer {
            self.0.defer_depth.set(self.0.defer_depth.get() + 1);
            return;
        }
        let depth = self.0.defer_depth.get();
        if depth == 0 {
            return;
        }
        self.0.defer_depth.set(depth - 1);
        if depth > 1 {
            return;
        }
        let dict = std::mem::take(&mut *self.0.pending_dict.borrow_mut());
        let mut context = std::mem::take(&mut *self.0.pending_context.borrow_mut());
        context.normalize();
        self.emit(dict, context);
    }

    pub fn defer_events(&self) -> bool {
        self.0.defer_depth.get() > 0
    }

    fn post(&self, dict: Option<DictModified>, context: ContextModified) {
        if self.defer_events() {
            if let Some(dict) = dict {
                self.0.pending_dict.borrow_mut().merge(dict);
            }
            self.0.pending_context.borrow_mut().merge(context);
            return;
        }
        self.emit(dict.unwrap_or_default(), context);
    }

    fn emit(&self, dict: DictModified, context: ContextModified) {
        if !dict.is_empty() {
            self.0.dict_modified.emit(&dict);
        }
        if !context.is_empty() {
            tracing::debug!(
                context = %self.name(),
                added = context.added.len(),
                modified = context.modified.len(),
                removed = context.removed.len(),
                reset = context.reset,
                "context modified"
            );
            self.0.context_modified.emit(&context);
        }
    }

    /// Bring metadata in line with a dictionary change and post events.
    fn dict_is_modified(&self, event: DictModified) -> Result<()> {
        self.0.dirty.set(true);
        let before = self.current_group();
        let mut context = ContextModified::default();
        let mut rebinds = Vec::new();

        for (name, value) in &event.added {
            self.attach(name, value, &mut context, &mut rebinds);
            context.added.insert(name.clone());
        }
        for (name, change) in &event.changed {
            self.detach(name, &change.old, Some(&change.new), &mut context);
            self.attach(name, &change.new, &mut context, &mut rebinds);
            context.modified.insert(name.clone());
        }
        for (name, old) in &event.removed {
            self.detach(name, old, None, &mut context);
            context.removed.insert(name.clone());
        }

        context.normalize();
        self.invalidate_evaluated(&mut context);
        if self.current_group() != before {
            context.reset = true;
        }
        self.post(Some(event), context);

        for (object, name) in rebinds {
            self.rebind(&object, &name)?;
        }
        Ok(())
    }

    fn attach(
        &self,
        name: &str,
        value: &Value,
        context: &mut ContextModified,
        rebinds: &mut Vec<(DynamicObject, String)>,
    ) {
        match value {
            Value::Array(array) if array.is_pipeline_data() => {
                self.upsert_item(name, ItemKind::Stored, array.shape());
            }
            Value::Context(sub) => {
                self.remove_item(name);
                self.attach_subcontext(name, sub, context);
                context.changed.insert(name.to_string());
            }
            Value::Object(object) => {
                self.remove_item(name);
                context.changed.insert(name.to_string());
                if let Some(bound) = self.binding_name(object) {
                    if bound != name {
                        rebinds.push((object.clone(), name.to_string()));
                    }
                }
            }
            _ => {
                self.remove_item(name);
                context.changed.insert(name.to_string());
            }
        }
    }

    fn detach(
        &self,
        name: &str,
        old: &Value,
        new: Option<&Value>,
        context: &mut ContextModified,
    ) {
        let replaced_by_same = |new: Option<&Value>| new.is_some_and(|n| n.is_same(old));
        match old {
            Value::Context(_) if !replaced_by_same(new) => {
                self.detach_subcontext(name, context);
            }
            Value::Object(object) if !replaced_by_same(new) => {
                if self.binding_name(object).as_deref() == Some(name) {
                    self.unbind_dynamic(object);
                }
            }
            _ => {}
        }
        if !new.is_some_and(Value::is_array_data) {
            self.remove_item(name);
        }
    }
}

fn check_writable(name: &str) -> Result<()> {
    if name == CONTEXT_KEY {
        return Err(FlowError::invalid_name(name, "reserved name cannot be written"));
    }
    if name.is_empty() {
        return Err(FlowError::invalid_name(name, "empty name"));
    }
    Ok(())
}

impl NumericContext for Context {
    fn context_name(&self) -> String {
        self.name()
    }

    fn get_context_data(&self, name: &str) -> Result<Value> {
        self.get_dotted(name)
    }

    fn set_context_data(&self, name: &str, value: Value) -> Result<()> {
        self.set_dotted(name, value)
    }

    fn remove_context_data(&self, name: &str) -> Result<()> {
        self.remove_dotted(name).map(|_| ())
    }

    fn contains_context_data(&self, name: &str) -> bool {
        match self.resolve_prefix(name) {
            Some((sub, rest)) => sub.contains_context_data(rest),
            None => self.contains(name),
        }
    }

    fn context_keys(&self) -> Vec<String> {
        self.keys()
    }

    fn context_items(&self) -> Vec<String> {
        self.0.items.borrow().keys().cloned().collect()
    }

    fn item_fill_value(&self, name: &str) -> f64 {
        let own = self
            .0
            .items
            .borrow()
            .get(name)
            .map_or(f64::NAN, |item| item.value);
        if !own.is_nan() {
            return own;
        }
        self.0
            .config
            .delegate
            .default_value(name)
            .unwrap_or(f64::NAN)
    }

    fn current_group_names(&self) -> Vec<String> {
        self.current_group()
            .and_then(|key| self.0.groups.borrow().members(&key))
            .unwrap_or_default()
    }

    fn group_length(&self) -> usize {
        self.current_group()
            .and_then(|key| {
                self.0
                    .groups
                    .borrow()
                    .shape(&key)
                    .and_then(|s| s.first().copied())
            })
            .unwrap_or(0)
    }

    fn context_modified(&self) -> &EventHub<ContextModified> {
        &self.0.context_modified
    }

    fn set_deferred(&self, defer: bool) {
        self.set_defer_events(defer);
    }

    fn config(&self) -> ContextConfig {
        self.0.config.clone()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name())
            .field("keys", &self.keys())
            .field("current_group", &self.current_group())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::delegate::MockContextDelegate;
    use std::cell::RefCell as TestCell;

    fn record_context_events(context: &Context) -> Rc<TestCell<Vec<ContextModified>>> {
        let events = Rc::new(TestCell::new(Vec::new()));
        let sink = events.clone();
        context.context_modified().subscribe(move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });
        events
    }

    fn record_dict_events(context: &Context) -> Rc<TestCell<Vec<DictModified>>> {
        let events = Rc::new(TestCell::new(Vec::new()));
        let sink = events.clone();
        context.dict_modified().subscribe(move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });
        events
    }

    #[test]
    fn test_items_track_array_values() {
        let context = Context::new("root");
        context.set("depth", vec![0.0, 10.0, 20.0]).unwrap();
        context.set("label", "well").unwrap();
        assert_eq!(context.context_items(), vec!["depth".to_string()]);

        context.set("depth", 3.5).unwrap();
        assert!(context.context_items().is_empty());
        assert!(context.named_groups().is_empty());
    }

    #[test]
    fn test_context_key_is_reserved() {
        let context = Context::new("root");
        assert!(matches!(context.get(CONTEXT_KEY).unwrap(), Value::Context(c) if c.ptr_eq(&context)));
        assert!(matches!(
            context.set(CONTEXT_KEY, 1.0),
            Err(FlowError::InvalidName { .. })
        ));
        assert!(matches!(
            context.remove(CONTEXT_KEY),
            Err(FlowError::InvalidName { .. })
        ));
        assert!(matches!(context.get("missing"), Err(FlowError::InvalidName { .. })));
    }

    #[test]
    fn test_update_emits_single_event() {
        let context = Context::new("root");
        let dict_events = record_dict_events(&context);
        context
            .update([
                ("a", Value::from(vec![1.0, 2.0])),
                ("b", Value::from(vec![3.0, 4.0])),
                ("c", Value::Int(1)),
            ])
            .unwrap();
        assert_eq!(dict_events.borrow().len(), 1);
        assert_eq!(dict_events.borrow()[0].added.len(), 3);

        context.clear().unwrap();
        assert_eq!(dict_events.borrow().len(), 2);
        assert_eq!(dict_events.borrow()[1].removed.len(), 3);
        assert!(context.is_empty());
    }

    #[test]
    fn test_deferred_window_merges_trace() {
        let context = Context::new("root");
        let dict_events = record_dict_events(&context);
        let context_events = record_context_events(&context);

        context.set_defer_events(true);
        context.set("a", 1.0).unwrap();
        context.set("a", 2.0).unwrap();
        context.remove("a").unwrap();
        context.set("a", 3.0).unwrap();
        assert!(dict_events.borrow().is_empty());
        context.set_defer_events(false);

        let dict = dict_events.borrow();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict[0].added.get("a"), Some(&Value::Float(3.0)));
        assert!(dict[0].changed.is_empty() && dict[0].removed.is_empty());
        let ctx = context_events.borrow();
        assert_eq!(ctx.len(), 1);
        assert!(ctx[0].added.contains("a"));
    }

    #[test]
    fn test_named_group_shape_mismatch_is_rejected() {
        let context = Context::new("root");
        context.set("a", vec![1.0, 2.0]).unwrap();
        context.set("b", vec![3.0, 4.0]).unwrap();
        context
            .context_group_for(Some("logs"), Some(vec!["a".into(), "b".into()]))
            .unwrap();

        let err = context.set("a", vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, FlowError::NumericContext { ref name, .. } if name == "a"));
        assert_eq!(context.get("a").unwrap().as_array().unwrap().len(), 2);

        context.set("c", vec![1.0]).unwrap();
        assert!(context
            .context_group_for(Some("logs"), Some(vec!["a".into(), "c".into()]))
            .is_err());
    }

    #[test]
    fn test_current_group_defaults_to_largest_and_resets() {
        let context = Context::new("root");
        context.set("short", vec![1.0, 2.0]).unwrap();
        context.set("long", vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(context.current_group_names(), vec!["long".to_string()]);
        assert_eq!(context.group_length(), 3);

        context
            .context_group_for(Some("pair"), Some(vec!["short".into()]))
            .unwrap();
        let events = record_context_events(&context);
        context.set_current_group(Some("pair")).unwrap();
        assert_eq!(context.group_length(), 2);
        assert!(events.borrow().last().unwrap().reset);

        context
            .context_group_for(Some("pair"), Some(vec!["short".into()]))
            .unwrap();
        assert!(events.borrow().last().unwrap().reset);
    }

    #[test]
    fn test_reshape_regroups_item() {
        let context = Context::new("root");
        context.set("a", vec![1.0, 2.0]).unwrap();
        context.set("a", vec![1.0, 2.0, 3.0]).unwrap();
        let item = context.item("a").unwrap();
        assert_eq!(item.groups, vec![GroupKey::Shape(vec![3])]);
    }

    #[test]
    fn test_subcontext_dotted_access() {
        let root = Context::new("root");
        let sub = Context::new("sub");
        sub.set("x", 7.0).unwrap();
        root.set("p", sub.clone()).unwrap();
        assert_eq!(root.get_dotted("p.x").unwrap(), Value::Float(7.0));

        let events = record_context_events(&root);
        root.set_dotted("p.x", 9.0).unwrap();
        assert_eq!(sub.get("x").unwrap(), Value::Float(9.0));
        assert!(events.borrow()[0].modified.contains("p.x"));
    }

    #[test]
    fn test_subcontext_items_are_prefixed() {
        let root = Context::new("root");
        let sub = Context::new("sub");
        sub.set("gr", vec![1.0, 2.0]).unwrap();
        root.set("well", sub.clone()).unwrap();
        assert!(root.context_items().contains(&"well.gr".to_string()));

        sub.remove("gr").unwrap();
        assert!(!root.context_items().contains(&"well.gr".to_string()));

        root.remove("well").unwrap();
        sub.set("gr", vec![1.0]).unwrap();
        assert!(root.context_items().is_empty());
    }

    #[test]
    fn test_context_cannot_contain_itself() {
        let root = Context::new("root");
        assert!(root.set("me", root.clone()).is_err());
    }

    #[test]
    fn test_nested_cycle_is_rejected() {
        let root = Context::new("root");
        let sub = Context::new("sub");
        let leaf = Context::new("leaf");
        root.set("p", sub.clone()).unwrap();

        let err = sub.set("q", root.clone()).unwrap_err();
        assert!(matches!(err, FlowError::NumericContext { ref name, .. } if name == "q"));
        assert!(!sub.contains("q"));

        sub.set("l", leaf.clone()).unwrap();
        assert!(leaf.set("back", root.clone()).is_err());
        assert!(leaf
            .update([("ok", Value::Int(1)), ("up", Value::Context(sub.clone()))])
            .is_err());
        assert!(!leaf.contains("ok"));
        assert_eq!(root.get_dotted("p.l").unwrap().as_context().map(|c| c.name()), Some("leaf".into()));
    }

    #[test]
    fn test_evaluated_item_is_lazy_and_invalidated() {
        let context = Context::new("root");
        context.set("a", vec![1.0, 2.0]).unwrap();
        context.define_expression("b", "a * 2").unwrap();
        assert_eq!(
            context.get("b").unwrap().as_array().unwrap().to_vec(),
            vec![2.0, 4.0]
        );

        let events = record_context_events(&context);
        context.set("a", vec![5.0, 6.0]).unwrap();
        assert!(events.borrow()[0].modified.contains("b"));
        assert_eq!(
            context.get("b").unwrap().as_array().unwrap().to_vec(),
            vec![10.0, 12.0]
        );
    }

    #[test]
    fn test_recursive_definition() {
        let context = Context::new("root");
        context.define_expression("a", "b + 1").unwrap();
        context.define_expression("b", "a + 1").unwrap();
        let err = context.get("a").unwrap_err();
        assert!(matches!(err, FlowError::RecursiveDefinition(ref n) if n == "a"));
    }

    #[test]
    fn test_dynamic_binding_follows_rename() {
        let context = Context::new("root");
        let well = DynamicObject::new("well").with_attr("name", "w1");
        assert!(context.bind_dynamic(&well, "name").unwrap());
        assert!(context.get("w1").unwrap().is_same(&Value::Object(well.clone())));

        well.set_attr("name", "w2");
        assert!(!context.contains("w1"));
        assert!(context.get("w2").unwrap().is_same(&Value::Object(well.clone())));
        assert_eq!(context.binding_name(&well).as_deref(), Some("w2"));
    }

    #[test]
    fn test_dynamic_binding_collision_keeps_old_key() {
        let context = Context::new("root");
        context.set("taken", 1.0).unwrap();
        let well = DynamicObject::new("well").with_attr("name", "w1");
        context.bind_dynamic(&well, "name").unwrap();

        well.set_attr("name", "taken");
        assert!(context.contains("w1"));
        assert_eq!(context.get("taken").unwrap(), Value::Float(1.0));
        assert!(context.binding_name(&well).is_none());

        let other = DynamicObject::new("well").with_attr("name", "taken");
        assert!(!context.bind_dynamic(&other, "name").unwrap());
    }

    #[test]
    fn test_assigning_bound_object_renames_it() {
        let context = Context::new("root");
        let well = DynamicObject::new("well").with_attr("name", "w1");
        context.bind_dynamic(&well, "name").unwrap();

        context.set("w9", well.clone()).unwrap();
        assert_eq!(well.attr("name").as_deref(), Some("w9"));
        assert!(!context.contains("w1"));
        assert_eq!(context.binding_name(&well).as_deref(), Some("w9"));
    }

    #[test]
    fn test_fill_default_consults_delegate() {
        let mut delegate = MockContextDelegate::new();
        delegate
            .expect_default_value()
            .withf(|name| name == "gamma")
            .returning(|_| Some(-1.0));
        delegate
            .expect_default_value()
            .withf(|name| name != "gamma")
            .returning(|_| None);
        let config = ContextConfig::default().with_delegate(delegate);
        let context = Context::with_config("root", config);
        context.set("depth", vec![1.0, 2.0, 3.0]).unwrap();

        assert!(context.fill_default("gamma", None).unwrap());
        assert_eq!(
            context.get("gamma").unwrap().as_array().unwrap().to_vec(),
            vec![-1.0; 3]
        );
        assert!(!context.fill_default("other", None).unwrap());
        assert!(!context.contains("other"));
        assert_eq!(context.item_fill_value("gamma"), -1.0);
    }

    #[test]
    fn test_copy_is_shallow() {
        let context = Context::new("root");
        context.set("a", vec![1.0, 2.0]).unwrap();
        context
            .context_group_for(Some("g"), Some(vec!["a".into()]))
            .unwrap();
        let copy = context.copy().unwrap();
        assert!(copy.get("a").unwrap().is_same(&context.get("a").unwrap()));
        assert_eq!(copy.named_groups(), context.named_groups());

        copy.set("b", 1.0).unwrap();
        assert!(!context.contains("b"));
    }
}
