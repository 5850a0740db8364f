//! Stacks stages on a root context.

use super::scheduler::Scheduler;
use super::stage::Stage;
use crate::context::{Context, ContextRef};
use crate::error::{FlowError, Result};
use crate::filter::FilterRef;
use std::rc::Rc;
use std::time::Duration;
use tracing::info;

/// A root context and the ordered stack of stages on top of it.
///
/// ```text
/// [Context] ──► [stage 0] ──► [stage 1] ──► ... ──► tail()
/// ```
pub struct ContextPipeline {
    root: Context,
    stages: Vec<Rc<Stage>>,
}

impl ContextPipeline {
    pub fn new(root: Context) -> Self {
        Self {
            root,
            stages: Vec::new(),
        }
    }

    pub fn root(&self) -> &Context {
        &self.root
    }

    pub fn stages(&self) -> &[Rc<Stage>] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&Rc<Stage>> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The context at the end of the chain.
    pub fn tail(&self) -> ContextRef {
        match self.stages.last() {
            Some(stage) => stage.clone() as ContextRef,
            None => Rc::new(self.root.clone()),
        }
    }

    /// Attach a stage built by `make` on top of the current tail.
    pub fn push(&mut self, make: impl FnOnce(ContextRef) -> Rc<Stage>) -> Rc<Stage> {
        let stage = make(self.tail());
        info!(
            stage = %stage.name(),
            kind = stage.kind().label(),
            depth = self.stages.len() + 1,
            "Stage pushed"
        );
        self.stages.push(stage.clone());
        stage
    }

    /// Detach the stage at `index`. The stage after it, if any, is relinked
    /// onto the removed stage's upstream.
    pub fn remove(&mut self, index: usize) -> Result<Rc<Stage>> {
        if index >= self.stages.len() {
            return Err(FlowError::numeric(
                self.root.name(),
                format!("no stage at {index} in a pipeline of {}", self.stages.len()),
            ));
        }
        let removed = self.stages.remove(index);
        removed.unlink();
        if let Some(next) = self.stages.get(index) {
            next.relink(removed.upstream());
        }
        info!(stage = %removed.name(), index, "Stage removed");
        Ok(removed)
    }

    pub fn reduction(mut self, filter: Option<FilterRef>, use_value: bool) -> Self {
        self.push(|up| Stage::reduction(up, filter, use_value));
        self
    }

    pub fn mapping(mut self, filter: Option<FilterRef>) -> Self {
        self.push(|up| Stage::mapping(up, filter));
        self
    }

    pub fn selection(mut self, filter: Option<FilterRef>) -> Self {
        self.push(|up| Stage::selection(up, filter));
        self
    }

    pub fn cached(mut self) -> Self {
        self.push(Stage::cached);
        self
    }

    pub fn deferred(mut self, scheduler: Rc<dyn Scheduler>, delay: Duration) -> Self {
        self.push(|up| Stage::deferred(up, scheduler, delay));
        self
    }

    pub fn traits(mut self, scheduler: Option<Rc<dyn Scheduler>>) -> Self {
        self.push(|up| Stage::traits(up, scheduler));
        self
    }
}

impl std::fmt::Debug for ContextPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPipeline")
            .field("root", &self.root.name())
            .field("stages", &self.stages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextModified, NumericContext};
    use crate::filter::{ExpressionFilter, IndexFilter};
    use crate::types::Value;
    use std::cell::RefCell;

    fn values(ctx: &dyn NumericContext, name: &str) -> Vec<f64> {
        ctx.get_context_data(name)
            .unwrap()
            .as_array()
            .map(|a| a.to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn test_chain_composes() {
        let root = Context::new("root");
        root.set("x", vec![5.0, 1.0, 4.0, 2.0, 3.0]).unwrap();
        let pipeline = ContextPipeline::new(root)
            .reduction(Some(Rc::new(ExpressionFilter::new("x > 1").unwrap())), false)
            .mapping(Some(Rc::new(IndexFilter::new(vec![3, 0]))))
            .cached();

        assert_eq!(pipeline.len(), 3);
        assert_eq!(values(&*pipeline.tail(), "x"), vec![3.0, 5.0]);
    }

    #[test]
    fn test_remove_relinks_next_stage() {
        let root = Context::new("root");
        root.set("x", vec![1.0, 2.0, 3.0]).unwrap();
        let mut pipeline = ContextPipeline::new(root.clone())
            .reduction(Some(Rc::new(ExpressionFilter::new("x > 1").unwrap())), false)
            .cached();

        let events = Rc::new(RefCell::new(Vec::<ContextModified>::new()));
        let sink = events.clone();
        pipeline.tail().context_modified().subscribe(move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });

        assert_eq!(values(&*pipeline.tail(), "x"), vec![2.0, 3.0]);
        let removed = pipeline.remove(0).unwrap();
        assert_eq!(removed.kind().label(), "reduction");
        assert!(events.borrow().last().is_some_and(|e| e.reset));
        assert_eq!(values(&*pipeline.tail(), "x"), vec![1.0, 2.0, 3.0]);

        root.set("x", Value::from(vec![7.0])).unwrap();
        assert_eq!(values(&*pipeline.tail(), "x"), vec![7.0]);
        assert!(pipeline.remove(5).is_err());
    }

    #[test]
    fn test_empty_pipeline_tail_is_root() {
        let root = Context::new("root");
        root.set("a", 1).unwrap();
        let pipeline = ContextPipeline::new(root);
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.tail().get_context_data("a").unwrap(), Value::Int(1));
    }
}
