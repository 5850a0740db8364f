//! Runs a block against a context.

use super::eval::{ContextNamespace, Evaluator, Scope};
use super::graph::DependencyGraph;
use super::Block;
use crate::context::NumericContext;
use crate::error::{FlowError, Result};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Summary of one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Labels of the executed statements, in order
    pub executed: Vec<String>,
    /// Statements skipped by the restriction
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Executes every statement of `block` in dependency order.
pub fn execute(block: &Block, context: &dyn NumericContext) -> Result<ExecutionReport> {
    execute_restricted(block, context, None, None)
}

/// Executes the statements that connect `inputs` to `outputs`.
///
/// Reads resolve through dotted lookup on `context`, writes through dotted
/// assignment. Events are deferred for the duration of the run so one
/// merged event surfaces, also when a statement fails. Values written
/// before a failure stay in the context.
pub fn execute_restricted(
    block: &Block,
    context: &dyn NumericContext,
    inputs: Option<&BTreeSet<String>>,
    outputs: Option<&BTreeSet<String>>,
) -> Result<ExecutionReport> {
    let start = Instant::now();
    let statements = block.statements();
    let graph = DependencyGraph::build(statements);
    let order = graph.restrict(inputs, outputs)?;

    let config = context.config();
    let scope = Scope::from_preamble(block.preamble(), &config.functions)?;
    let evaluator = Evaluator::new(&config.functions, &scope, &*config.units);
    let namespace = ContextNamespace::new(context);

    let mut report = ExecutionReport {
        skipped: statements.len() - order.len(),
        ..Default::default()
    };

    context.set_deferred(true);
    let result: Result<()> = order.iter().try_for_each(|&idx| {
        let statement = &statements[idx];
        let label = statement.label();
        debug!(statement = %label, "Executing statement");
        evaluator
            .execute(statement, &namespace)
            .map_err(|e| FlowError::statement_failed(label.clone(), e))?;
        report.executed.push(label);
        Ok(())
    });
    context.set_deferred(false);
    result?;

    report.elapsed = start.elapsed();
    info!(
        context = %context.context_name(),
        executed = report.executed.len(),
        skipped = report.skipped,
        elapsed_us = report.elapsed.as_micros() as u64,
        "Block executed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, DictModified};
    use crate::numeric::Array;
    use crate::types::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn as_vec(value: Value) -> Vec<f64> {
        value.as_array().map(Array::to_vec).unwrap_or_default()
    }

    #[test]
    fn test_execute_writes_outputs() {
        let ctx = Context::new("root");
        ctx.set("x", vec![1.0, 2.0, 3.0]).unwrap();
        let block = Block::parse("import numpy as np\ny = x * 2\nz = np.sum(y)").unwrap();

        let report = execute(&block, &ctx).unwrap();
        assert_eq!(report.executed.len(), 2);
        assert_eq!(as_vec(ctx.get("y").unwrap()), vec![2.0, 4.0, 6.0]);
        assert_eq!(ctx.get("z").unwrap(), Value::Float(12.0));
    }

    #[test]
    fn test_single_merged_event() {
        let ctx = Context::new("root");
        ctx.set("x", 1).unwrap();
        let events = Rc::new(RefCell::new(Vec::<DictModified>::new()));
        let sink = events.clone();
        ctx.dict_modified().subscribe(move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });

        let block = Block::parse("a = x + 1\nb = a + 1\nc = b + 1").unwrap();
        execute(&block, &ctx).unwrap();

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].added.len(), 3);
    }

    #[test]
    fn test_failure_keeps_partial_outputs() {
        let ctx = Context::new("root");
        ctx.set("x", 1).unwrap();
        let block = Block::parse("a = x + 1\nb = a / 0\nc = a + 1").unwrap();

        let err = execute(&block, &ctx).unwrap_err();
        assert!(matches!(err, FlowError::StatementFailed { ref statement, .. } if statement == "b = a / 0"));
        assert_eq!(ctx.get("a").unwrap(), Value::Int(2));
        assert!(!ctx.contains("b"));
        assert!(!ctx.contains("c"));
        assert!(!ctx.defer_events());
    }

    #[test]
    fn test_failure_still_flushes_deferred_events() {
        let ctx = Context::new("root");
        ctx.set("x", 1).unwrap();
        let events = Rc::new(RefCell::new(Vec::<DictModified>::new()));
        let sink = events.clone();
        ctx.dict_modified().subscribe(move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });

        let block = Block::parse("a = x + 1\nb = a / 0\nc = a + 1").unwrap();
        assert!(execute(&block, &ctx).is_err());

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].added.get("a"), Some(&Value::Int(2)));
        assert!(!events[0].added.contains_key("b"));
    }

    #[test]
    fn test_unbound_name_is_not_wrapped() {
        let ctx = Context::new("root");
        let block = Block::parse("a = missing + 1").unwrap();
        assert!(matches!(
            execute(&block, &ctx),
            Err(FlowError::UnboundName(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_unbound_dotted_name_keeps_full_path() {
        let ctx = Context::new("root");
        let sub = Context::new("sub");
        sub.set("present", 1).unwrap();
        ctx.set("p", sub).unwrap();

        let block = Block::parse("a = p.missing + 1").unwrap();
        assert!(matches!(
            execute(&block, &ctx),
            Err(FlowError::UnboundName(name)) if name == "p.missing"
        ));
    }

    #[test]
    fn test_restricted_run_skips_unrelated() {
        let ctx = Context::new("root");
        ctx.set("x", 2).unwrap();
        let block = Block::parse("a = x + 1\nb = a * 2\nd = x - 1").unwrap();
        let outputs: BTreeSet<String> = ["b".to_string()].into();

        let report = execute_restricted(&block, &ctx, None, Some(&outputs)).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(ctx.get("b").unwrap(), Value::Int(6));
        assert!(!ctx.contains("d"));
    }

    #[test]
    fn test_cycle_aborts_before_running() {
        let ctx = Context::new("root");
        let block = Block::parse("a = b + 1\nb = a + 1").unwrap();
        assert!(matches!(execute(&block, &ctx), Err(FlowError::Cycle { .. })));
        assert!(ctx.is_empty());
    }
}
