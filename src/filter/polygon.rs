use super::{FilterBase, FilterOutput, FilterUpdated, NumericFilter};
use crate::context::{EventHub, NumericContext};
use crate::error::{FlowError, Result};
use crate::numeric::Array;
use std::cell::RefCell;

/// Selects rows whose `(x, y)` point lies inside a polygon.
#[derive(Debug)]
pub struct PolygonFilter {
    base: FilterBase,
    x: String,
    y: String,
    vertices: RefCell<Vec<(f64, f64)>>,
}

impl PolygonFilter {
    pub fn new(x: impl Into<String>, y: impl Into<String>, vertices: Vec<(f64, f64)>) -> Self {
        let (x, y) = (x.into(), y.into());
        Self {
            base: FilterBase::new(format!("polygon({x}, {y})")),
            x,
            y,
            vertices: RefCell::new(vertices),
        }
    }

    pub fn base(&self) -> &FilterBase {
        &self.base
    }

    pub fn set_vertices(&self, vertices: Vec<(f64, f64)>) {
        *self.vertices.borrow_mut() = vertices;
        self.base.notify();
    }

    fn column(&self, context: &dyn NumericContext, name: &str) -> Result<Array> {
        let array = context.get_context_data(name)?.to_array()?;
        if array.ndim() != 1 {
            return Err(FlowError::numeric(
                name,
                format!("polygon filter needs a 1-D item, got shape {:?}", array.shape()),
            ));
        }
        Ok(array)
    }
}

/// Even-odd ray casting. Points on an edge may land on either side.
fn contains(vertices: &[(f64, f64)], px: f64, py: f64) -> bool {
    let mut inside = false;
    let mut j = vertices.len().wrapping_sub(1);
    for i in 0..vertices.len() {
        let (xi, yi) = vertices[i];
        let (xj, yj) = vertices[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

impl NumericFilter for PolygonFilter {
    fn describe(&self) -> String {
        self.base.label()
    }

    fn evaluate(&self, context: &dyn NumericContext) -> Result<Option<FilterOutput>> {
        let vertices = self.vertices.borrow();
        if vertices.len() < 3 {
            return Ok(None);
        }
        let xs = self.column(context, &self.x)?;
        let ys = self.column(context, &self.y)?;
        if xs.len() != ys.len() {
            return Err(FlowError::numeric(
                &self.y,
                format!("length {} differs from '{}' ({})", ys.len(), self.x, xs.len()),
            ));
        }
        let inside: Vec<bool> = xs
            .iter()
            .zip(ys.iter())
            .map(|(x, y)| contains(&vertices, x, y))
            .collect();
        Ok(Some(FilterOutput::Mask(self.base.finish(Array::from_bools(inside)))))
    }

    fn depends_on(&self, names: &[String]) -> bool {
        names.iter().any(|n| *n == self.x || *n == self.y)
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
    fn test_points_in_square() {
        let ctx = Context::new("root");
        ctx.set("x", vec![0.5, 2.0, 0.1, -1.0]).unwrap();
        ctx.set("y", vec![0.5, 0.5, 0.9, 0.0]).unwrap();
        let square = vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        let filter = PolygonFilter::new("x", "y", square);

        let rows = filter.evaluate(&ctx).unwrap().unwrap().into_indices();
        assert_eq!(rows, vec![0, 2]);
        assert!(filter.depends_on(&["y".to_string()]));
    }

    #[test]
    fn test_degenerate_polygon_selects_everything() {
        let ctx = Context::new("root");
        let filter = PolygonFilter::new("x", "y", vec![(0.0, 0.0), (1.0, 1.0)]);
        assert!(filter.evaluate(&ctx).unwrap().is_none());
    }
}
