use super::{FilterBase, FilterOutput, FilterRef, FilterUpdated, NumericFilter};
use crate::context::{EventHub, ListenerId, NumericContext};
use crate::error::Result;
use crate::numeric::{Array, BinaryOp, DType};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    And,
    Or,
    Min,
    Max,
}

impl AggregateOp {
    /// `Or` and `Max` have no constraint as soon as one member has none.
    fn none_short_circuits(self) -> bool {
        matches!(self, AggregateOp::Or | AggregateOp::Max)
    }

    fn combine(self, acc: &Array, next: &Array) -> Result<Array> {
        match self {
            AggregateOp::And => acc.binary(next, BinaryOp::And),
            AggregateOp::Or => acc.binary(next, BinaryOp::Or),
            AggregateOp::Min => acc.zip_map(next, acc.dtype().promote(next.dtype()), f64::min),
            AggregateOp::Max => acc.zip_map(next, acc.dtype().promote(next.dtype()), f64::max),
        }
    }
}

/// Combines member filters. Member updates are re-published.
pub struct AggregateFilter {
    base: Rc<FilterBase>,
    op: AggregateOp,
    members: RefCell<Vec<(FilterRef, ListenerId)>>,
}

impl AggregateFilter {
    pub fn new(op: AggregateOp) -> Self {
        Self {
            base: Rc::new(FilterBase::new(format!("{op:?}").to_lowercase())),
            op,
            members: RefCell::new(Vec::new()),
        }
    }

    pub fn with(self, filter: FilterRef) -> Self {
        self.add(filter);
        self
    }

    pub fn base(&self) -> &FilterBase {
        &self.base
    }

    pub fn op(&self) -> AggregateOp {
        self.op
    }

    pub fn add(&self, filter: FilterRef) {
        let base = Rc::downgrade(&self.base);
        let id = filter.updated().subscribe(move |_| {
            if let Some(base) = base.upgrade() {
                base.notify();
            }
            Ok(())
        });
        self.members.borrow_mut().push((filter, id));
        self.base.notify();
    }

    /// Detach the member at `index`.
    pub fn remove(&self, index: usize) -> Option<FilterRef> {
        let mut members = self.members.borrow_mut();
        if index >= members.len() {
            return None;
        }
        let (filter, id) = members.remove(index);
        drop(members);
        filter.updated().unsubscribe(id);
        self.base.notify();
        Some(filter)
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }
}

impl Drop for AggregateFilter {
    fn drop(&mut self) {
        for (filter, id) in self.members.borrow().iter() {
            filter.updated().unsubscribe(*id);
        }
    }
}

impl std::fmt::Debug for AggregateFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members: Vec<String> = self
            .members
            .borrow()
            .iter()
            .map(|(m, _)| m.describe())
            .collect();
        f.debug_struct("AggregateFilter")
            .field("op", &self.op)
            .field("members", &members)
            .finish()
    }
}

impl NumericFilter for AggregateFilter {
    fn describe(&self) -> String {
        format!("{:?}", self)
    }

    fn evaluate(&self, context: &dyn NumericContext) -> Result<Option<FilterOutput>> {
        let members: Vec<FilterRef> = self.members.borrow().iter().map(|(f, _)| f.clone()).collect();
        let len = context.group_length();
        let mut combined: Option<Array> = None;
        for member in members {
            let Some(output) = member.evaluate(context)? else {
                if self.op.none_short_circuits() {
                    return Ok(None);
                }
                continue;
            };
            let mask = output.into_mask(len)?;
            combined = Some(match combined {
                None => mask,
                Some(acc) => self.op.combine(&acc, &mask)?,
            });
        }
        Ok(combined.map(|mask| {
            let mask = match self.op {
                AggregateOp::And | AggregateOp::Or => mask.cast(DType::Bool),
                AggregateOp::Min | AggregateOp::Max => mask,
            };
            FilterOutput::Mask(if self.base.invert() || self.base.tag().is_some() {
                self.base.finish(mask)
            } else {
                mask
            })
        }))
    }

    fn depends_on(&self, names: &[String]) -> bool {
        self.members
            .borrow()
            .iter()
            .any(|(filter, _)| filter.depends_on(names))
    }

    fn updated(&self) -> &EventHub<FilterUpdated> {
        self.base.updated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::filter::{ExpressionFilter, IndexFilter, ValueTag};
    use std::cell::Cell;

    fn context() -> Context {
        let ctx = Context::new("root");
        ctx.set("x", vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        ctx
    }

    fn expr(source: &str) -> FilterRef {
        Rc::new(ExpressionFilter::new(source).unwrap())
    }

    #[test]
    fn test_and_or() {
        let ctx = context();
        let and = AggregateFilter::new(AggregateOp::And)
            .with(expr("x > 1"))
            .with(expr("x < 4"));
        assert_eq!(and.evaluate(&ctx).unwrap().unwrap().into_indices(), vec![1, 2]);

        let or = AggregateFilter::new(AggregateOp::Or)
            .with(expr("x < 2"))
            .with(Rc::new(IndexFilter::new(vec![3])));
        assert_eq!(or.evaluate(&ctx).unwrap().unwrap().into_indices(), vec![0, 3]);
    }

    #[test]
    fn test_none_members() {
        let ctx = context();
        let empty = expr("");
        let and = AggregateFilter::new(AggregateOp::And)
            .with(empty.clone())
            .with(expr("x > 2"));
        assert_eq!(and.evaluate(&ctx).unwrap().unwrap().into_indices(), vec![2, 3]);

        let or = AggregateFilter::new(AggregateOp::Or)
            .with(expr("x > 2"))
            .with(empty);
        assert!(or.evaluate(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_max_keeps_tag_values() {
        let ctx = context();
        let low = ExpressionFilter::new("x < 3").unwrap();
        low.base().set_tag(Some(ValueTag { value: 0.0, bit: true }));
        let high = ExpressionFilter::new("x > 1").unwrap();
        high.base().set_tag(Some(ValueTag { value: 1.0, bit: true }));

        let max = AggregateFilter::new(AggregateOp::Max)
            .with(Rc::new(low))
            .with(Rc::new(high));
        let mask = max.evaluate(&ctx).unwrap().unwrap().into_mask(4).unwrap();
        assert_eq!(mask.to_vec(), vec![1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_member_updates_propagate() {
        let member = Rc::new(ExpressionFilter::new("x > 1").unwrap());
        let agg = AggregateFilter::new(AggregateOp::And).with(member.clone());
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        agg.updated().subscribe(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });

        member.set_expression("x > 2").unwrap();
        assert_eq!(count.get(), 1);

        agg.remove(0);
        member.set_expression("x > 3").unwrap();
        assert_eq!(count.get(), 2);
    }
}
