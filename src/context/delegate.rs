//! Context delegates supply default values for items.

use std::collections::HashMap;

/// Supplies substitution values for items that have none of their own.
#[cfg_attr(test, mockall::automock)]
pub trait ContextDelegate {
    /// Default value for `name`, or `None` if the delegate has no opinion.
    fn default_value(&self, name: &str) -> Option<f64>;
}

/// Delegate backed by a global fill value plus per-name overrides.
#[derive(Debug, Clone, Default)]
pub struct FillDelegate {
    fill: Option<f64>,
    overrides: HashMap<String, f64>,
}

impl FillDelegate {
    pub fn new(fill: Option<f64>) -> Self {
        Self {
            fill,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, value: f64) -> Self {
        self.overrides.insert(name.into(), value);
        self
    }
}

impl ContextDelegate for FillDelegate {
    fn default_value(&self, name: &str) -> Option<f64> {
        self.overrides.get(name).copied().or(self.fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let delegate = FillDelegate::new(Some(-999.25)).with_override("gamma", 0.0);
        assert_eq!(delegate.default_value("gamma"), Some(0.0));
        assert_eq!(delegate.default_value("depth"), Some(-999.25));
        assert_eq!(FillDelegate::default().default_value("depth"), None);
    }
}
