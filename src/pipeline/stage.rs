//! Derivative contexts.
//!
//! A [`Stage`] wraps an upstream context, owns no data and transforms
//! reads, writes and events according to its [`StageKind`]. Stages of
//! every kind share the event plumbing: an upstream listener, a
//! `context_modified` hub, teardown and relinking.

use super::scheduler::{Scheduler, TaskId};
use crate::context::{ContextConfig, ContextModified, ContextRef, EventHub, ListenerId, NumericContext};
use crate::error::{FlowError, Result};
use crate::filter::FilterRef;
use crate::numeric::{truthy, Array};
use crate::types::Value;
use indexmap::IndexSet;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Transformation applied by a stage.
#[derive(Clone)]
pub enum StageKind {
    /// Re-publishes upstream unchanged
    PassThrough,
    /// Keeps the rows selected by the filter mask. With `use_value`,
    /// unselected rows are filled with the item's substitution value
    /// instead of being dropped.
    Reduction { use_value: bool },
    /// Reorders or subsets rows by the filter's index list
    Mapping,
    /// Passes data unchanged and publishes a combined selection mask
    Selection,
    /// Materialises upstream reads until they are invalidated
    Cached,
    /// Coalesces upstream events and re-emits them after `delay`
    Deferred {
        scheduler: Rc<dyn Scheduler>,
        delay: Duration,
    },
    /// Re-exports items as named attributes with per-attribute change
    /// signals. With a scheduler, signals wait for the next tick.
    Traits { scheduler: Option<Rc<dyn Scheduler>> },
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::PassThrough => "pass_through",
            StageKind::Reduction { .. } => "reduction",
            StageKind::Mapping => "mapping",
            StageKind::Selection => "selection",
            StageKind::Cached => "cached",
            StageKind::Deferred { .. } => "deferred",
            StageKind::Traits { .. } => "traits",
        }
    }

    fn is_filtering(&self) -> bool {
        matches!(
            self,
            StageKind::Reduction { .. } | StageKind::Mapping | StageKind::Selection
        )
    }
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Reduction { use_value } => write!(f, "Reduction {{ use_value: {use_value} }}"),
            StageKind::Deferred { delay, .. } => write!(f, "Deferred {{ delay: {delay:?} }}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Posted by a traits stage for each attribute whose value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitChanged {
    pub name: String,
}

/// Filter result cached between upstream changes.
#[derive(Debug, Clone, Default)]
enum View {
    /// Needs recomputation
    #[default]
    Dirty,
    /// No filter or the filter places no constraint
    Identity,
    Mask(Array),
    Indices {
        indices: Vec<usize>,
        /// Upstream row → position in `indices`, built on first write
        inverse: Option<Vec<Option<usize>>>,
    },
}

#[derive(Default)]
struct StageState {
    view: View,
    cache: HashMap<String, Value>,
    pending: Option<ContextModified>,
    task: Option<TaskId>,
    pending_traits: IndexSet<String>,
    traits_task: Option<TaskId>,
}

pub struct Stage {
    name: String,
    kind: StageKind,
    upstream: RefCell<ContextRef>,
    upstream_listener: Cell<Option<ListenerId>>,
    filter: RefCell<Option<FilterRef>>,
    filter_listener: Cell<Option<ListenerId>>,
    context_modified: EventHub<ContextModified>,
    trait_changed: EventHub<TraitChanged>,
    state: RefCell<StageState>,
    weak_self: Weak<Stage>,
}

impl Stage {
    /// Create a stage listening to `upstream`.
    pub fn attach(name: impl Into<String>, upstream: ContextRef, kind: StageKind) -> Rc<Stage> {
        let stage = Rc::new_cyclic(|weak| Stage {
            name: name.into(),
            kind,
            upstream: RefCell::new(upstream),
            upstream_listener: Cell::new(None),
            filter: RefCell::new(None),
            filter_listener: Cell::new(None),
            context_modified: EventHub::new("context_modified"),
            trait_changed: EventHub::new("trait_changed"),
            state: RefCell::new(StageState::default()),
            weak_self: weak.clone(),
        });
        stage.listen_upstream();
        debug!(stage = %stage.name, kind = stage.kind.label(), "Stage attached");
        stage
    }

    pub fn pass_through(upstream: ContextRef) -> Rc<Stage> {
        Self::attach("pass_through", upstream, StageKind::PassThrough)
    }

    pub fn reduction(upstream: ContextRef, filter: Option<FilterRef>, use_value: bool) -> Rc<Stage> {
        let stage = Self::attach("reduction", upstream, StageKind::Reduction { use_value });
        stage.install_filter(filter);
        stage
    }

    pub fn mapping(upstream: ContextRef, filter: Option<FilterRef>) -> Rc<Stage> {
        let stage = Self::attach("mapping", upstream, StageKind::Mapping);
        stage.install_filter(filter);
        stage
    }

    pub fn selection(upstream: ContextRef, filter: Option<FilterRef>) -> Rc<Stage> {
        let stage = Self::attach("selection", upstream, StageKind::Selection);
        stage.install_filter(filter);
        stage
    }

    pub fn cached(upstream: ContextRef) -> Rc<Stage> {
        Self::attach("cached", upstream, StageKind::Cached)
    }

    pub fn deferred(upstream: ContextRef, scheduler: Rc<dyn Scheduler>, delay: Duration) -> Rc<Stage> {
        Self::attach("deferred", upstream, StageKind::Deferred { scheduler, delay })
    }

    pub fn traits(upstream: ContextRef, scheduler: Option<Rc<dyn Scheduler>>) -> Rc<Stage> {
        Self::attach("traits", upstream, StageKind::Traits { scheduler })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn upstream(&self) -> ContextRef {
        self.upstream.borrow().clone()
    }

    pub fn filter(&self) -> Option<FilterRef> {
        self.filter.borrow().clone()
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state.borrow().view, View::Dirty)
    }

    pub fn trait_changed(&self) -> &EventHub<TraitChanged> {
        &self.trait_changed
    }

    // ==================== Wiring ====================

    fn listen_upstream(&self) {
        let weak = self.weak_self.clone();
        let id = self.upstream.borrow().context_modified().subscribe(move |event| {
            if let Some(stage) = weak.upgrade() {
                stage.on_upstream(event)?;
            }
            Ok(())
        });
        self.upstream_listener.set(Some(id));
    }

    fn install_filter(&self, filter: Option<FilterRef>) {
        if let (Some(id), Some(old)) = (self.filter_listener.take(), self.filter.borrow().as_ref()) {
            old.updated().unsubscribe(id);
        }
        if let Some(filter) = &filter {
            let weak = self.weak_self.clone();
            let id = filter.updated().subscribe(move |update| {
                if let Some(stage) = weak.upgrade() {
                    debug!(stage = %stage.name, filter = %update.filter, "Filter updated");
                    stage.invalidate_and_reset();
                }
                Ok(())
            });
            self.filter_listener.set(Some(id));
        }
        *self.filter.borrow_mut() = filter;
    }

    /// Swap the filter. Downstream receives a reset.
    pub fn set_filter(&self, filter: Option<FilterRef>) -> Result<()> {
        if !self.kind.is_filtering() {
            return Err(FlowError::numeric(
                &self.name,
                format!("a {} stage has no filter", self.kind.label()),
            ));
        }
        self.install_filter(filter);
        self.invalidate_and_reset();
        Ok(())
    }

    fn invalidate_and_reset(&self) {
        self.state.borrow_mut().view = View::Dirty;
        self.context_modified.emit(&ContextModified::reset());
    }

    /// Stop listening upstream and to the filter, and drop pending
    /// deferred work. No further events are emitted.
    pub fn unlink(&self) {
        if let Some(id) = self.upstream_listener.take() {
            self.upstream.borrow().context_modified().unsubscribe(id);
        }
        if let (Some(id), Some(filter)) = (self.filter_listener.take(), self.filter.borrow().as_ref()) {
            filter.updated().unsubscribe(id);
        }
        let mut state = self.state.borrow_mut();
        state.pending = None;
        state.pending_traits.clear();
        let tasks = [state.task.take(), state.traits_task.take()];
        drop(state);
        for id in tasks.into_iter().flatten() {
            if let Some(scheduler) = self.scheduler() {
                scheduler.cancel(id);
            }
        }
        debug!(stage = %self.name, "Stage unlinked");
    }

    /// Attach to a new upstream. Downstream receives a reset.
    pub fn relink(&self, upstream: ContextRef) {
        if let Some(id) = self.upstream_listener.take() {
            self.upstream.borrow().context_modified().unsubscribe(id);
        }
        *self.upstream.borrow_mut() = upstream;
        self.listen_upstream();
        self.state.borrow_mut().cache.clear();
        self.invalidate_and_reset();
    }

    fn scheduler(&self) -> Option<Rc<dyn Scheduler>> {
        match &self.kind {
            StageKind::Deferred { scheduler, .. } => Some(scheduler.clone()),
            StageKind::Traits { scheduler } => scheduler.clone(),
            _ => None,
        }
    }

    // ==================== Event propagation ====================

    fn on_upstream(&self, event: &ContextModified) -> Result<()> {
        trace!(stage = %self.name, ?event, "upstream modified");
        match &self.kind {
            StageKind::PassThrough => {
                self.context_modified.emit(event);
            }
            StageKind::Reduction { .. } | StageKind::Mapping | StageKind::Selection => {
                self.state.borrow_mut().view = View::Dirty;
                let names: Vec<String> = event.names().cloned().collect();
                let filter_changed = self
                    .filter()
                    .is_some_and(|f| f.depends_on(&names));
                let mut forwarded = event.clone();
                forwarded.reset |= filter_changed;
                self.context_modified.emit(&forwarded);
            }
            StageKind::Cached => {
                {
                    let mut state = self.state.borrow_mut();
                    if event.reset {
                        state.cache.clear();
                    } else {
                        for name in event.names() {
                            state.cache.remove(name);
                        }
                    }
                }
                self.context_modified.emit(event);
            }
            StageKind::Deferred { scheduler, delay } => {
                let schedule = {
                    let mut state = self.state.borrow_mut();
                    match state.pending.as_mut() {
                        Some(pending) => pending.merge(event.clone()),
                        None => state.pending = Some(event.clone()),
                    }
                    state.task.is_none()
                };
                if schedule {
                    let weak = self.weak_self.clone();
                    let id = scheduler.schedule_after(
                        *delay,
                        Box::new(move || {
                            if let Some(stage) = weak.upgrade() {
                                stage.state.borrow_mut().task = None;
                                stage.flush();
                            }
                        }),
                    );
                    self.state.borrow_mut().task = Some(id);
                }
            }
            StageKind::Traits { scheduler } => {
                self.context_modified.emit(event);
                let names: Vec<String> = if event.reset {
                    self.upstream().context_keys()
                } else {
                    event.names().cloned().collect()
                };
                match scheduler {
                    None => {
                        for name in names {
                            self.trait_changed.emit(&TraitChanged { name });
                        }
                    }
                    Some(scheduler) => {
                        let schedule = {
                            let mut state = self.state.borrow_mut();
                            state.pending_traits.extend(names);
                            state.traits_task.is_none()
                        };
                        if schedule {
                            let weak = self.weak_self.clone();
                            let id = scheduler.schedule_after(
                                Duration::ZERO,
                                Box::new(move || {
                                    if let Some(stage) = weak.upgrade() {
                                        stage.flush_traits();
                                    }
                                }),
                            );
                            self.state.borrow_mut().traits_task = Some(id);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit the merged pending event of a deferred stage now.
    pub fn flush(&self) -> bool {
        let (pending, task) = {
            let mut state = self.state.borrow_mut();
            (state.pending.take(), state.task.take())
        };
        if let (Some(id), Some(scheduler)) = (task, self.scheduler()) {
            scheduler.cancel(id);
        }
        match pending {
            Some(mut event) => {
                event.normalize();
                debug!(stage = %self.name, ?event, "Flushing deferred event");
                self.context_modified.emit(&event);
                true
            }
            None => false,
        }
    }

    fn flush_traits(&self) {
        let names = {
            let mut state = self.state.borrow_mut();
            state.traits_task = None;
            std::mem::take(&mut state.pending_traits)
        };
        for name in names {
            self.trait_changed.emit(&TraitChanged { name });
        }
    }

    // ==================== Filtered views ====================

    /// Current filter result, recomputed if an upstream change or a
    /// filter update invalidated it.
    fn view(&self) -> Result<View> {
        let current = self.state.borrow().view.clone();
        if !matches!(current, View::Dirty) {
            return Ok(current);
        }
        let upstream = self.upstream();
        let output = match self.filter() {
            Some(filter) => filter.evaluate(&*upstream)?,
            None => None,
        };
        let view = match (output, &self.kind) {
            (None, _) => View::Identity,
            (Some(output), StageKind::Mapping) => View::Indices {
                indices: output.into_indices(),
                inverse: None,
            },
            (Some(output), _) => View::Mask(output.into_mask(upstream.group_length())?),
        };
        debug!(stage = %self.name, "Recomputed filter view");
        self.state.borrow_mut().view = view.clone();
        Ok(view)
    }

    /// Transform an upstream value into this stage's view of it.
    fn read_through(&self, name: &str, value: Value) -> Result<Value> {
        let Value::Array(array) = value else {
            return Ok(value);
        };
        if array.ndim() == 0 {
            return Ok(Value::Array(array));
        }
        let view = self.view()?;
        let transformed = match (&self.kind, view) {
            (StageKind::Reduction { use_value }, View::Mask(mask)) if array.len() == mask.len() => {
                if *use_value {
                    let fill = self.upstream().item_fill_value(name);
                    array.fill_unselected(&mask, fill)?
                } else {
                    array.compress(&mask)?
                }
            }
            (StageKind::Mapping, View::Indices { indices, .. }) if array.len() == self.upstream().group_length() => {
                array.take(&indices)?
            }
            _ => array,
        };
        Ok(Value::Array(transformed))
    }

    /// Transform a value written to this stage into the upstream value.
    fn write_through(&self, name: &str, value: Value) -> Result<Value> {
        let upstream = self.upstream();
        let view = self.view()?;
        let (rows, selected) = match (&self.kind, &view) {
            (StageKind::Reduction { use_value }, View::Mask(mask)) => {
                let rows = mask.nonzero();
                if !value.is_array_data() {
                    return Ok(value);
                }
                let incoming = value.to_array()?;
                let selected = if *use_value && incoming.len() == mask.len() {
                    incoming.compress(mask)?
                } else {
                    incoming
                };
                (rows, selected)
            }
            (StageKind::Mapping, View::Indices { .. }) => {
                if !value.is_array_data() {
                    return Ok(value);
                }
                let incoming = value.to_array()?;
                let (rows, positions) = self.scatter_plan(upstream.group_length())?;
                if incoming.len() != self.mapped_len() {
                    return Err(FlowError::numeric(
                        name,
                        format!(
                            "cannot write {} rows through a mapping of {} rows",
                            incoming.len(),
                            self.mapped_len()
                        ),
                    ));
                }
                (rows, incoming.take(&positions)?)
            }
            _ => return Ok(value),
        };

        if selected.len() != rows.len() {
            return Err(FlowError::numeric(
                name,
                format!(
                    "cannot write {} rows into {} selected rows",
                    selected.len(),
                    rows.len()
                ),
            ));
        }

        let base = match upstream.get_context_data(name) {
            Ok(Value::Array(current)) if current.ndim() > 0 => current,
            Ok(_) | Err(FlowError::InvalidName { .. }) => {
                let mut shape = vec![upstream.group_length()];
                shape.extend_from_slice(&selected.shape()[1..]);
                let fill = upstream.item_fill_value(name);
                let mut blank = Array::full(&shape, fill);
                if let Some(units) = selected.units() {
                    blank = blank.with_units(units);
                }
                blank
            }
            Err(e) => return Err(e),
        };
        if let Some(&bad) = rows.iter().find(|&&r| r >= base.len()) {
            return Err(FlowError::numeric(
                name,
                format!("row {bad} is outside the upstream array of {} rows", base.len()),
            ));
        }
        Ok(Value::Array(base.put(&rows, &selected)?))
    }

    fn mapped_len(&self) -> usize {
        match &self.state.borrow().view {
            View::Indices { indices, .. } => indices.len(),
            _ => 0,
        }
    }

    /// Upstream rows to write and, for each, the position in the mapped
    /// value it takes its row from. Uses the cached inverse permutation.
    fn scatter_plan(&self, upstream_len: usize) -> Result<(Vec<usize>, Vec<usize>)> {
        let mut state = self.state.borrow_mut();
        let View::Indices { indices, inverse } = &mut state.view else {
            return Ok((Vec::new(), Vec::new()));
        };
        if inverse.is_none() {
            if let Some(&bad) = indices.iter().find(|&&i| i >= upstream_len) {
                return Err(FlowError::numeric(
                    &self.name,
                    format!("mapping index {bad} is outside the upstream group of {upstream_len} rows"),
                ));
            }
            let mut table = vec![None; upstream_len];
            for (position, &row) in indices.iter().enumerate() {
                table[row] = Some(position);
            }
            *inverse = Some(table);
        }
        let table = inverse.as_deref().unwrap_or_default();
        Ok(table
            .iter()
            .enumerate()
            .filter_map(|(row, position)| position.map(|p| (row, p)))
            .unzip())
    }

    /// Leading length of this stage's view.
    fn view_length(&self) -> usize {
        let upstream_len = self.upstream().group_length();
        match (&self.kind, self.view()) {
            (StageKind::Reduction { use_value: false }, Ok(View::Mask(mask))) => mask.count_nonzero(),
            (StageKind::Mapping, Ok(View::Indices { indices, .. })) => indices.len(),
            _ => upstream_len,
        }
    }
}

/// Combine two selections: disjoint selections add (keeping value tags),
/// overlapping ones take the elementwise maximum. NaN counts as unselected.
fn combine_selection(a: &Array, b: &Array) -> Result<Array> {
    let clean = |m: &Array| m.map(|v| if v.is_nan() { 0.0 } else { v });
    let (a, b) = (clean(a), clean(b));
    let overlap = a.iter().zip(b.iter()).any(|(x, y)| truthy(x) && truthy(y));
    let dtype = a.dtype().promote(b.dtype());
    if overlap {
        a.zip_map(&b, dtype, f64::max)
    } else {
        a.zip_map(&b, dtype, |x, y| x + y)
    }
}

impl NumericContext for Stage {
    fn context_name(&self) -> String {
        self.name.clone()
    }

    fn get_context_data(&self, name: &str) -> Result<Value> {
        if let StageKind::Cached = self.kind {
            if let Some(value) = self.state.borrow().cache.get(name) {
                return Ok(value.clone());
            }
        }
        let value = self.upstream().get_context_data(name)?;
        let value = self.read_through(name, value)?;
        if let StageKind::Cached = self.kind {
            self.state
                .borrow_mut()
                .cache
                .insert(name.to_string(), value.clone());
        }
        Ok(value)
    }

    fn set_context_data(&self, name: &str, value: Value) -> Result<()> {
        let value = self.write_through(name, value)?;
        if let StageKind::Cached = self.kind {
            self.state.borrow_mut().cache.remove(name);
        }
        self.upstream().set_context_data(name, value)
    }

    fn remove_context_data(&self, name: &str) -> Result<()> {
        self.upstream().remove_context_data(name)
    }

    fn contains_context_data(&self, name: &str) -> bool {
        self.upstream().contains_context_data(name)
    }

    fn context_keys(&self) -> Vec<String> {
        self.upstream().context_keys()
    }

    fn context_items(&self) -> Vec<String> {
        self.upstream().context_items()
    }

    fn item_fill_value(&self, name: &str) -> f64 {
        self.upstream().item_fill_value(name)
    }

    fn current_group_names(&self) -> Vec<String> {
        self.upstream().current_group_names()
    }

    fn group_length(&self) -> usize {
        self.view_length()
    }

    fn context_selection(&self) -> Result<Option<Array>> {
        let upstream = self.upstream().context_selection()?;
        match &self.kind {
            StageKind::Selection => {
                let own = match self.view()? {
                    View::Mask(mask) => Some(mask),
                    _ => None,
                };
                match (upstream, own) {
                    (Some(a), Some(b)) if a.len() == b.len() => combine_selection(&a, &b).map(Some),
                    (Some(a), Some(b)) => Err(FlowError::numeric(
                        &self.name,
                        format!("selection of {} rows cannot combine with {} rows", b.len(), a.len()),
                    )),
                    (a, b) => Ok(b.or(a).map(|m| m.map(|v| if v.is_nan() { 0.0 } else { v }))),
                }
            }
            StageKind::Reduction { use_value } => match (upstream, self.view()?) {
                (Some(selection), View::Mask(mask)) if selection.len() == mask.len() => {
                    if *use_value {
                        selection.fill_unselected(&mask, 0.0).map(Some)
                    } else {
                        selection.compress(&mask).map(Some)
                    }
                }
                (selection, _) => Ok(selection),
            },
            StageKind::Mapping => match (upstream, self.view()?) {
                (Some(selection), View::Indices { indices, .. }) => selection.take(&indices).map(Some),
                (selection, _) => Ok(selection),
            },
            _ => Ok(upstream),
        }
    }

    fn context_modified(&self) -> &EventHub<ContextModified> {
        &self.context_modified
    }

    fn set_deferred(&self, defer: bool) {
        self.upstream().set_deferred(defer);
    }

    fn config(&self) -> ContextConfig {
        self.upstream().config()
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.unlink();
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("filter", &self.filter().map(|f| f.describe()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::filter::{ExpressionFilter, IndexFilter, ValueTag};
    use crate::numeric::DType;
    use crate::pipeline::scheduler::{ManualScheduler, MockScheduler};

    fn root_with(name: &str, values: Vec<f64>) -> (Context, ContextRef) {
        let ctx = Context::new("root");
        ctx.set(name, values).unwrap();
        let handle: ContextRef = Rc::new(ctx.clone());
        (ctx, handle)
    }

    fn values(ctx: &dyn NumericContext, name: &str) -> Vec<f64> {
        ctx.get_context_data(name)
            .unwrap()
            .as_array()
            .map(Array::to_vec)
            .unwrap_or_default()
    }

    fn recorder(stage: &Stage) -> Rc<RefCell<Vec<ContextModified>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        stage.context_modified().subscribe(move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });
        events
    }

    #[test]
    fn test_reduction_read_and_write() {
        let (root, handle) = root_with("depth", vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]);
        let filter: FilterRef = Rc::new(ExpressionFilter::new("depth > 15 and depth < 55").unwrap());
        let stage = Stage::reduction(handle, Some(filter), false);

        assert_eq!(values(&*stage, "depth"), vec![20.0, 30.0, 40.0, 50.0]);
        assert_eq!(stage.group_length(), 4);

        root.set("gr", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        stage
            .set_context_data("gr", Value::from(vec![-3.0, -4.0, -5.0, -6.0]))
            .unwrap();
        assert_eq!(values(&root, "gr"), vec![1.0, 2.0, -3.0, -4.0, -5.0, -6.0]);

        assert!(stage
            .set_context_data("gr", Value::from(vec![1.0]))
            .is_err());
    }

    #[test]
    fn test_reduction_without_filter_is_identity() {
        let (_root, handle) = root_with("x", vec![1.0, 2.0]);
        let stage = Stage::reduction(handle, None, false);
        assert_eq!(values(&*stage, "x"), vec![1.0, 2.0]);
    }

    #[test]
    fn test_reduction_empty_mask() {
        let (_root, handle) = root_with("x", vec![1.0, 2.0]);
        let filter: FilterRef = Rc::new(ExpressionFilter::new("x > 5").unwrap());
        let stage = Stage::reduction(handle, Some(filter), false);
        let empty = stage.get_context_data("x").unwrap();
        let empty = empty.as_array().cloned().unwrap();
        assert_eq!(empty.len(), 0);
        assert_eq!(empty.dtype(), DType::Float);
    }

    #[test]
    fn test_reduction_use_value_fills() {
        let ctx = Context::with_config(
            "root",
            ContextConfig::default().with_delegate(crate::context::FillDelegate::new(Some(-1.0))),
        );
        ctx.set("x", vec![1.0, 2.0, 3.0]).unwrap();
        let filter: FilterRef = Rc::new(ExpressionFilter::new("x != 2").unwrap());
        let stage = Stage::reduction(Rc::new(ctx), Some(filter), true);
        assert_eq!(values(&*stage, "x"), vec![1.0, -1.0, 3.0]);
    }

    #[test]
    fn test_reduction_write_creates_new_item() {
        let (root, handle) = root_with("x", vec![1.0, 2.0, 3.0]);
        let filter: FilterRef = Rc::new(ExpressionFilter::new("x > 1").unwrap());
        let stage = Stage::reduction(handle, Some(filter), false);
        stage
            .set_context_data("y", Value::from(vec![20.0, 30.0]))
            .unwrap();
        let y = values(&root, "y");
        assert!(y[0].is_nan());
        assert_eq!(&y[1..], &[20.0, 30.0]);
    }

    #[test]
    fn test_mapping_write_back() {
        let (root, handle) = root_with("x", vec![1.0, 2.0, 3.0, 4.0]);
        let stage = Stage::mapping(handle, Some(Rc::new(IndexFilter::new(vec![3, 1, 0]))));

        assert_eq!(values(&*stage, "x"), vec![4.0, 2.0, 1.0]);
        stage
            .set_context_data("x", Value::from(vec![90.0, 80.0, 70.0]))
            .unwrap();
        assert_eq!(values(&root, "x"), vec![70.0, 80.0, 3.0, 90.0]);

        assert!(stage
            .set_context_data("x", Value::from(vec![1.0, 2.0]))
            .is_err());
    }

    #[test]
    fn test_mapping_out_of_range_raises() {
        let (_root, handle) = root_with("x", vec![1.0, 2.0]);
        let stage = Stage::mapping(handle, Some(Rc::new(IndexFilter::new(vec![0, 5]))));
        assert!(stage
            .set_context_data("x", Value::from(vec![1.0, 2.0]))
            .is_err());
    }

    #[test]
    fn test_identity_mapping_matches_upstream_write() {
        let (root, handle) = root_with("x", vec![1.0, 2.0, 3.0]);
        let stage = Stage::mapping(handle, Some(Rc::new(IndexFilter::new(vec![0, 1, 2]))));
        stage
            .set_context_data("x", Value::from(vec![7.0, 8.0, 9.0]))
            .unwrap();
        assert_eq!(values(&root, "x"), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_upstream_change_marks_dirty() {
        let (root, handle) = root_with("x", vec![1.0, 2.0, 3.0]);
        let filter: FilterRef = Rc::new(ExpressionFilter::new("x > 1").unwrap());
        let stage = Stage::reduction(handle, Some(filter), false);
        let events = recorder(&stage);

        assert_eq!(values(&*stage, "x"), vec![2.0, 3.0]);
        assert!(!stage.is_dirty());
        root.set("x", vec![5.0, 0.0, 5.0]).unwrap();
        assert!(stage.is_dirty());
        assert!(events.borrow()[0].reset);
        assert_eq!(values(&*stage, "x"), vec![5.0, 5.0]);
    }

    #[test]
    fn test_filter_swap_emits_reset() {
        let (_root, handle) = root_with("x", vec![1.0, 2.0, 3.0]);
        let stage = Stage::reduction(handle, None, false);
        let events = recorder(&stage);
        stage
            .set_filter(Some(Rc::new(ExpressionFilter::new("x < 3").unwrap())))
            .unwrap();
        assert_eq!(events.borrow().len(), 1);
        assert!(events.borrow()[0].reset);
        assert_eq!(values(&*stage, "x"), vec![1.0, 2.0]);

        let cached = Stage::cached(stage.clone());
        assert!(cached.set_filter(None).is_err());
    }

    #[test]
    fn test_selection_combines_masks() {
        let (_root, handle) = root_with("x", vec![1.0, 2.0, 3.0, 4.0]);
        let low = ExpressionFilter::new("x < 2").unwrap();
        low.base().set_tag(Some(ValueTag { value: 1.0, bit: false }));
        let first = Stage::selection(handle, Some(Rc::new(low)));
        let high = ExpressionFilter::new("x > 3").unwrap();
        high.base().set_tag(Some(ValueTag { value: 2.0, bit: false }));
        let second = Stage::selection(first.clone(), Some(Rc::new(high)));

        assert_eq!(values(&*second, "x"), vec![1.0, 2.0, 3.0, 4.0]);
        let mask = second.context_selection().unwrap().unwrap();
        assert_eq!(mask.to_vec(), vec![1.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_cached_invalidates_named_entries() {
        let (root, handle) = root_with("x", vec![1.0]);
        root.set("y", vec![2.0]).unwrap();
        let stage = Stage::cached(handle);
        assert_eq!(values(&*stage, "x"), vec![1.0]);
        assert_eq!(values(&*stage, "y"), vec![2.0]);

        root.set("x", vec![10.0]).unwrap();
        assert_eq!(values(&*stage, "x"), vec![10.0]);
        assert!(stage.state.borrow().cache.contains_key("y"));
    }

    #[test]
    fn test_deferred_coalesces() {
        let (root, handle) = root_with("x", vec![1.0]);
        let scheduler = Rc::new(ManualScheduler::new());
        let stage = Stage::deferred(handle, scheduler.clone(), Duration::from_millis(50));
        let events = recorder(&stage);

        root.set("a", vec![1.0]).unwrap();
        root.set("b", vec![2.0]).unwrap();
        root.remove("x").unwrap();
        assert!(events.borrow().is_empty());
        assert_eq!(scheduler.pending(), 1);

        scheduler.advance(Duration::from_millis(50));
        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].added.len(), 2);
        assert!(events[0].removed.contains("x"));
    }

    #[test]
    fn test_deferred_teardown_cancels() {
        let (root, handle) = root_with("x", vec![1.0]);
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_schedule_after()
            .withf(|delay, _| *delay == Duration::from_millis(10))
            .times(1)
            .returning(|_, _| TaskId(7));
        scheduler
            .expect_cancel()
            .withf(|id| *id == TaskId(7))
            .times(1)
            .returning(|_| true);
        let stage = Stage::deferred(handle, Rc::new(scheduler), Duration::from_millis(10));

        root.set("x", vec![2.0]).unwrap();
        root.set("x", vec![3.0]).unwrap();
        drop(stage);
    }

    #[test]
    fn test_traits_signals_wait_for_tick() {
        let (root, handle) = root_with("x", vec![1.0]);
        let scheduler = Rc::new(ManualScheduler::new());
        let stage = Stage::traits(handle, Some(scheduler.clone() as Rc<dyn Scheduler>));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        stage.trait_changed().subscribe(move |e| {
            sink.borrow_mut().push(e.name.clone());
            Ok(())
        });

        root.set("x", vec![2.0]).unwrap();
        root.set("x", vec![3.0]).unwrap();
        assert!(seen.borrow().is_empty());
        scheduler.run_pending();
        assert_eq!(*seen.borrow(), vec!["x".to_string()]);
    }

    #[test]
    fn test_unlinked_stage_goes_quiet() {
        let (root, handle) = root_with("x", vec![1.0]);
        let stage = Stage::pass_through(handle);
        let events = recorder(&stage);
        root.set("x", vec![2.0]).unwrap();
        stage.unlink();
        root.set("x", vec![3.0]).unwrap();
        assert_eq!(events.borrow().len(), 1);
    }
}
