//! Numeric contexts
//!
//! A context is an observable name → value store. The [`Context`] root owns
//! the data; pipeline stages (see [`crate::pipeline`]) wrap an upstream
//! context and transform reads and writes. Both implement
//! [`NumericContext`], so stages stack on either.

pub mod delegate;
pub mod events;
pub mod hub;
pub mod item;
pub mod persist;
mod root;

pub use delegate::{ContextDelegate, FillDelegate};
pub use events::{Changed, ContextModified, DictModified};
pub use hub::{EventHub, ListenerId};
pub use item::{ContextItem, GroupKey, Groups, ItemKind};
pub use persist::{ContextSerializer, JsonContextSerializer};
pub use root::Context;

use crate::block::functions::FunctionRegistry;
use crate::error::Result;
use crate::numeric::{Array, ScaleUnits, UnitAdapter};
use crate::types::Value;
use std::fmt;
use std::rc::Rc;

/// Magic key resolving to the context itself.
pub const CONTEXT_KEY: &str = "__context__";

/// Construction-time collaborators of a context.
#[derive(Clone)]
pub struct ContextConfig {
    pub delegate: Rc<dyn ContextDelegate>,
    pub functions: Rc<FunctionRegistry>,
    pub units: Rc<dyn UnitAdapter>,
}

impl ContextConfig {
    pub fn with_delegate(mut self, delegate: impl ContextDelegate + 'static) -> Self {
        self.delegate = Rc::new(delegate);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Rc::new(functions);
        self
    }

    pub fn with_units(mut self, units: impl UnitAdapter + 'static) -> Self {
        self.units = Rc::new(units);
        self
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            delegate: Rc::new(FillDelegate::default()),
            functions: Rc::new(FunctionRegistry::standard()),
            units: Rc::new(ScaleUnits::standard()),
        }
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

/// Interface shared by root contexts and pipeline stages.
pub trait NumericContext {
    fn context_name(&self) -> String;

    /// Read a value. Dotted names resolve through sub-contexts.
    fn get_context_data(&self, name: &str) -> Result<Value>;

    fn set_context_data(&self, name: &str, value: Value) -> Result<()>;

    fn remove_context_data(&self, name: &str) -> Result<()>;

    fn contains_context_data(&self, name: &str) -> bool {
        self.get_context_data(name).is_ok()
    }

    /// Every bound name.
    fn context_keys(&self) -> Vec<String>;

    /// Names bound to array data.
    fn context_items(&self) -> Vec<String>;

    /// Substitution value of an item (its own, else the delegate's, else NaN).
    fn item_fill_value(&self, name: &str) -> f64;

    /// Members of the current group.
    fn current_group_names(&self) -> Vec<String>;

    /// Leading dimension of the current group as seen through this context.
    fn group_length(&self) -> usize;

    /// Selection mask published by selection stages.
    fn context_selection(&self) -> Result<Option<Array>> {
        Ok(None)
    }

    fn context_modified(&self) -> &EventHub<ContextModified>;

    /// Open (`true`) or close (`false`) an event deferral window on the
    /// context that owns the data.
    fn set_deferred(&self, defer: bool);

    fn config(&self) -> ContextConfig;
}

/// Shared, non-owning handle to a context.
pub type ContextRef = Rc<dyn NumericContext>;
