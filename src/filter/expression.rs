use super::{FilterBase, FilterOutput, FilterUpdated, NumericFilter};
use crate::block::Expression;
use crate::context::{EventHub, NumericContext};
use crate::error::{FlowError, Result};
use crate::numeric::Array;
use crate::types::Value;
use std::cell::RefCell;

/// Boolean expression over context names, e.g. `depth > 15 and depth < 55`.
#[derive(Debug)]
pub struct ExpressionFilter {
    base: FilterBase,
    expression: RefCell<Option<Expression>>,
}

impl ExpressionFilter {
    pub fn new(source: &str) -> Result<Self> {
        let filter = Self {
            base: FilterBase::new(source.trim()),
            expression: RefCell::new(None),
        };
        filter.compile(source)?;
        Ok(filter)
    }

    pub fn base(&self) -> &FilterBase {
        &self.base
    }

    pub fn source(&self) -> String {
        self.expression
            .borrow()
            .as_ref()
            .map(|e| e.source().to_string())
            .unwrap_or_default()
    }

    /// Replace the condition. An empty source clears the filter.
    pub fn set_expression(&self, source: &str) -> Result<()> {
        self.compile(source)?;
        self.base.set_label(source.trim());
        self.base.notify();
        Ok(())
    }

    fn compile(&self, source: &str) -> Result<()> {
        let compiled = if source.trim().is_empty() {
            None
        } else {
            Some(Expression::compile(source)?)
        };
        *self.expression.borrow_mut() = compiled;
        Ok(())
    }
}

impl NumericFilter for ExpressionFilter {
    fn describe(&self) -> String {
        format!("expression({})", self.source())
    }

    fn evaluate(&self, context: &dyn NumericContext) -> Result<Option<FilterOutput>> {
        let expression = self.expression.borrow();
        let Some(expression) = expression.as_ref() else {
            return Ok(None);
        };
        let mask = match expression.evaluate(context)? {
            Value::Array(array) if array.ndim() == 1 => array,
            Value::Array(array) if array.ndim() == 0 => {
                Array::full(&[context.group_length()], array.as_scalar().unwrap_or(0.0))
            }
            value @ (Value::Bool(_) | Value::Int(_) | Value::Float(_)) => {
                Array::full(&[context.group_length()], if value.truthy() { 1.0 } else { 0.0 })
            }
            other => {
                return Err(FlowError::numeric(
                    expression.source(),
                    format!("filter expression produced {}, not a mask", other.type_name()),
                ))
            }
        };
        Ok(Some(FilterOutput::Mask(self.base.finish(mask))))
    }

    fn depends_on(&self, names: &[String]) -> bool {
        self.expression
            .borrow()
            .as_ref()
            .is_some_and(|e| e.depends_on(names.iter()))
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
    fn test_expression_mask() {
        let ctx = Context::new("root");
        ctx.set("depth", vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]).unwrap();
        let filter = ExpressionFilter::new("depth > 15 and depth < 55").unwrap();

        let mask = filter.evaluate(&ctx).unwrap().unwrap().into_indices();
        assert_eq!(mask, vec![2, 3, 4, 5]);
        assert!(filter.depends_on(&["depth".to_string()]));
        assert!(!filter.depends_on(&["other".to_string()]));
    }

    #[test]
    fn test_set_expression_notifies() {
        let filter = ExpressionFilter::new("x > 1").unwrap();
        let seen = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = seen.clone();
        filter.updated().subscribe(move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        filter.set_expression("x > 2").unwrap();
        assert_eq!(seen.get(), 1);
        assert!(filter.set_expression("x >").is_err());

        filter.set_expression("").unwrap();
        let ctx = Context::new("root");
        assert!(filter.evaluate(&ctx).unwrap().is_none());
    }
}
