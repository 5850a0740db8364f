//! Numeric filters
//!
//! A filter looks at a context and produces a boolean mask over the
//! leading axis of the current group, an index list, or `None` when it
//! places no constraint. Filtering stages in [`crate::pipeline`] consume
//! them. Every filter publishes [`FilterUpdated`] when its configuration
//! changes so stages can recompute.

mod aggregate;
mod expression;
mod index;
mod nan;
mod polygon;

pub use aggregate::{AggregateFilter, AggregateOp};
pub use expression::ExpressionFilter;
pub use index::IndexFilter;
pub use nan::NanFilter;
pub use polygon::PolygonFilter;

use crate::context::{EventHub, NumericContext};
use crate::error::{FlowError, Result};
use crate::numeric::{Array, DType};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Posted when a filter's configuration changes.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterUpdated {
    pub filter: String,
}

/// Result of evaluating a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutput {
    /// One entry per row; nonzero selects
    Mask(Array),
    /// Selected rows, in output order
    Indices(Vec<usize>),
}

impl FilterOutput {
    /// Mask over `len` rows.
    pub fn into_mask(self, len: usize) -> Result<Array> {
        match self {
            FilterOutput::Mask(mask) => {
                if mask.ndim() != 1 || mask.len() != len {
                    return Err(FlowError::numeric(
                        "<filter>",
                        format!("mask of shape {:?} does not cover {len} rows", mask.shape()),
                    ));
                }
                Ok(mask)
            }
            FilterOutput::Indices(indices) => {
                let mut selected = vec![false; len];
                for i in indices {
                    let slot = selected.get_mut(i).ok_or_else(|| {
                        FlowError::numeric("<filter>", format!("index {i} out of range for {len} rows"))
                    })?;
                    *slot = true;
                }
                Ok(Array::from_bools(selected))
            }
        }
    }

    pub fn into_indices(self) -> Vec<usize> {
        match self {
            FilterOutput::Mask(mask) => mask.nonzero(),
            FilterOutput::Indices(indices) => indices,
        }
    }
}

/// Scalar written into selected mask positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueTag {
    pub value: f64,
    /// Interpret `value` as a bit index, tagging with `1 << value`
    pub bit: bool,
}

impl ValueTag {
    pub fn factor(&self) -> f64 {
        if self.bit {
            (1u64 << (self.value as u32).min(52)) as f64
        } else {
            self.value
        }
    }
}

pub trait NumericFilter {
    /// Short description used in logs and update events.
    fn describe(&self) -> String;

    fn evaluate(&self, context: &dyn NumericContext) -> Result<Option<FilterOutput>>;

    /// True if a change to any of `names` may change the result.
    fn depends_on(&self, names: &[String]) -> bool;

    fn updated(&self) -> &EventHub<FilterUpdated>;
}

pub type FilterRef = Rc<dyn NumericFilter>;

/// State every filter carries: its update hub, inversion and value tag.
pub struct FilterBase {
    updated: EventHub<FilterUpdated>,
    invert: Cell<bool>,
    tag: Cell<Option<ValueTag>>,
    label: RefCell<String>,
}

impl FilterBase {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            updated: EventHub::new("filter_updated"),
            invert: Cell::new(false),
            tag: Cell::new(None),
            label: RefCell::new(label.into()),
        }
    }

    pub fn updated(&self) -> &EventHub<FilterUpdated> {
        &self.updated
    }

    pub fn invert(&self) -> bool {
        self.invert.get()
    }

    pub fn tag(&self) -> Option<ValueTag> {
        self.tag.get()
    }

    pub fn label(&self) -> String {
        self.label.borrow().clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.borrow_mut() = label.into();
    }

    pub fn set_invert(&self, invert: bool) {
        if self.invert.replace(invert) != invert {
            self.notify();
        }
    }

    pub fn set_tag(&self, tag: Option<ValueTag>) {
        if self.tag.replace(tag) != tag {
            self.notify();
        }
    }

    pub fn notify(&self) {
        self.updated.emit(&FilterUpdated {
            filter: self.label(),
        });
    }

    /// Apply inversion, then the value tag, to a raw selection.
    pub fn finish(&self, mask: Array) -> Array {
        let selected = if self.invert() {
            mask.logical_not()
        } else {
            mask.cast(DType::Bool)
        };
        match self.tag() {
            None => selected,
            Some(tag) => {
                let factor = tag.factor();
                let dtype = if factor.fract() == 0.0 {
                    DType::Int
                } else {
                    DType::Float
                };
                selected.map(|v| v * factor).with_dtype(dtype)
            }
        }
    }
}

impl std::fmt::Debug for FilterBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterBase")
            .field("label", &self.label())
            .field("invert", &self.invert())
            .field("tag", &self.tag())
            .finish()
    }
}
