use super::{FilterBase, FilterOutput, FilterUpdated, NumericFilter};
use crate::context::{EventHub, NumericContext};
use crate::error::Result;
use crate::numeric::Array;
use tracing::debug;

/// Selects rows where every item of the current group is finite.
#[derive(Debug)]
pub struct NanFilter {
    base: FilterBase,
}

impl NanFilter {
    pub fn new() -> Self {
        Self {
            base: FilterBase::new("nan"),
        }
    }

    pub fn inverted(self) -> Self {
        self.base.set_invert(true);
        self
    }

    pub fn base(&self) -> &FilterBase {
        &self.base
    }
}

impl Default for NanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl NumericFilter for NanFilter {
    fn describe(&self) -> String {
        "nan".to_string()
    }

    fn evaluate(&self, context: &dyn NumericContext) -> Result<Option<FilterOutput>> {
        let len = context.group_length();
        let mut finite = vec![true; len];
        for name in context.current_group_names() {
            let value = context.get_context_data(&name)?;
            let Some(array) = value.as_array() else {
                continue;
            };
            if array.len() != len {
                debug!(item = %name, "skipping item outside the current group shape");
                continue;
            }
            for (slot, ok) in finite.iter_mut().zip(array.row_is_finite()) {
                *slot &= ok;
            }
        }
        Ok(Some(FilterOutput::Mask(self.base.finish(Array::from_bools(finite)))))
    }

    fn depends_on(&self, names: &[String]) -> bool {
        !names.is_empty()
    }

    fn updated(&self) -> &EventHub<FilterUpdated> {
        self.base.updated()
    }
}
