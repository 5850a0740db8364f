//! Test data builders for creating test objects

use flowbench::context::{ContextConfig, FillDelegate};
use flowbench::{Array, Context, Value};

/// Builder for root contexts with array and scalar entries
pub struct ContextBuilder {
    name: String,
    fill: Option<f64>,
    entries: Vec<(String, Value)>,
    groups: Vec<(String, Vec<String>)>,
}

impl ContextBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fill: None,
            entries: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn array(mut self, name: &str, values: &[f64]) -> Self {
        self.entries
            .push((name.to_string(), Value::Array(Array::from_vec(values.to_vec()))));
        self
    }

    pub fn value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.entries.push((name.to_string(), value.into()));
        self
    }

    pub fn fill(mut self, fill: f64) -> Self {
        self.fill = Some(fill);
        self
    }

    pub fn group(mut self, group: &str, members: &[&str]) -> Self {
        self.groups
            .push((group.to_string(), members.iter().map(|m| m.to_string()).collect()));
        self
    }

    pub fn build(self) -> Context {
        let config = ContextConfig::default().with_delegate(FillDelegate::new(self.fill));
        let ctx = Context::with_config(self.name, config);
        ctx.update(self.entries).expect("entries bind");
        for (group, members) in self.groups {
            ctx.context_group_for(Some(&group), Some(members))
                .expect("group members share a shape");
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let ctx = ContextBuilder::new("t")
            .array("x", &[1.0, 2.0])
            .value("n", 3)
            .group("g", &["x"])
            .build();

        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.named_groups().len(), 1);
    }
}
