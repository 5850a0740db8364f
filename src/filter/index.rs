use super::{FilterBase, FilterOutput, FilterUpdated, NumericFilter};
use crate::context::{EventHub, NumericContext};
use crate::error::Result;
use std::cell::RefCell;

/// Explicit row indices. Without inversion or a value tag the indices are
/// passed on in their given order, so a mapping stage can permute rows.
#[derive(Debug)]
pub struct IndexFilter {
    base: FilterBase,
    indices: RefCell<Vec<usize>>,
}

impl IndexFilter {
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            base: FilterBase::new("index"),
            indices: RefCell::new(indices),
        }
    }

    pub fn inverted(self) -> Self {
        self.base.set_invert(true);
        self
    }

    pub fn base(&self) -> &FilterBase {
        &self.base
    }

    pub fn indices(&self) -> Vec<usize> {
        self.indices.borrow().clone()
    }

    pub fn set_indices(&self, indices: Vec<usize>) {
        *self.indices.borrow_mut() = indices;
        self.base.notify();
    }
}

impl NumericFilter for IndexFilter {
    fn describe(&self) -> String {
        format!("index({} rows)", self.indices.borrow().len())
    }

    fn evaluate(&self, context: &dyn NumericContext) -> Result<Option<FilterOutput>> {
        let indices = self.indices();
        if !self.base.invert() && self.base.tag().is_none() {
            return Ok(Some(FilterOutput::Indices(indices)));
        }
        let mask = FilterOutput::Indices(indices).into_mask(context.group_length())?;
        Ok(Some(FilterOutput::Mask(self.base.finish(mask))))
    }

    fn depends_on(&self, _names: &[String]) -> bool {
        false
    }

    fn updated(&self) -> &EventHub<FilterUpdated> {
        self.base.updated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_inverted_indices() {
        let ctx = Context::new("root");
        ctx.set("x", vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let filter = IndexFilter::new(vec![1, 3]).inverted();
        let out = filter.evaluate(&ctx).unwrap().unwrap();
        assert_eq!(out.into_indices(), vec![0, 2]);
    }

    #[test]
    fn test_indices_keep_order() {
        let ctx = Context::new("root");
        let filter = IndexFilter::new(vec![3, 1, 0]);
        assert_eq!(
            filter.evaluate(&ctx).unwrap(),
            Some(FilterOutput::Indices(vec![3, 1, 0]))
        );
    }
}
