//! Callable modules available to block statements.
//!
//! `builtins` is always in scope. Other modules (`numpy`, `math`, script
//! modules) are reached through the block's imports.

use super::library;
use crate::error::{FlowError, Result};
use crate::numeric::Array;
use crate::scripting::{ScriptEngine, ScriptFunction};
use crate::types::Value;
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::info;

/// Module searched for unqualified calls.
pub const BUILTINS: &str = "builtins";

/// Evaluated call arguments.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keywords.push((name.into(), value.into()));
        self
    }

    /// Argument by position, falling back to its keyword name.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| {
            self.keywords
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
        })
    }

    pub fn require(&self, index: usize, name: &str) -> Result<&Value> {
        self.get(index, name)
            .ok_or_else(|| FlowError::eval(format!("missing required argument '{name}'")))
    }

    pub fn array(&self, index: usize, name: &str) -> Result<Array> {
        self.require(index, name)?.to_array()
    }

    pub fn number(&self, index: usize, name: &str) -> Result<f64> {
        let value = self.require(index, name)?;
        value.as_f64().ok_or_else(|| {
            FlowError::eval(format!(
                "argument '{name}' must be a number, not {}",
                value.type_name()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }
}

pub type NativeFn = Rc<dyn Fn(&CallArgs) -> Result<Value>>;

#[derive(Clone)]
pub enum Callable {
    Native(NativeFn),
    Script(ScriptFunction),
}

impl Callable {
    pub fn native(f: impl Fn(&CallArgs) -> Result<Value> + 'static) -> Self {
        Callable::Native(Rc::new(f))
    }

    pub fn call(&self, args: &CallArgs) -> Result<Value> {
        match self {
            Callable::Native(f) => f(args),
            Callable::Script(f) => f.call(args),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Native(_) => write!(f, "Native"),
            Callable::Script(s) => write!(f, "{s:?}"),
        }
    }
}

/// Named collection of functions and constants.
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    functions: IndexMap<String, Callable>,
    constants: IndexMap<String, Value>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(mut self, name: &str, f: impl Fn(&CallArgs) -> Result<Value> + 'static) -> Self {
        self.insert(name, Callable::native(f));
        self
    }

    pub fn constant(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.constants.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, callable: Callable) {
        self.functions.insert(name.to_string(), callable);
    }

    pub fn get_function(&self, name: &str) -> Option<&Callable> {
        self.functions.get(name)
    }

    pub fn get_constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Registry of modules keyed by import name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    modules: IndexMap<String, Module>,
}

impl FunctionRegistry {
    /// Registry holding only an empty `builtins` module.
    pub fn empty() -> Self {
        let mut registry = Self::default();
        registry.add_module(Module::new(BUILTINS));
        registry
    }

    /// `builtins`, `numpy` and `math`.
    pub fn standard() -> Self {
        let mut registry = Self::default();
        registry.add_module(library::builtins());
        registry.add_module(library::numpy());
        registry.add_module(library::math());
        registry
    }

    /// Add or replace a module.
    pub fn add_module(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), module);
    }

    /// Register a native function, creating the module if needed.
    pub fn register(&mut self, module: &str, name: &str, f: impl Fn(&CallArgs) -> Result<Value> + 'static) {
        self.modules
            .entry(module.to_string())
            .or_insert_with(|| Module::new(module))
            .insert(name, Callable::native(f));
    }

    /// Compile a rhai source and expose its public functions as `name`.
    /// Returns the number of functions registered.
    pub fn load_script_module(&mut self, name: &str, source: &str, engine: &Arc<ScriptEngine>) -> Result<usize> {
        let compiled = engine.compile(name, source)?;
        let mut module = Module::new(name);
        for (function, arity) in compiled.functions() {
            module.insert(
                &function,
                Callable::Script(ScriptFunction::new(engine.clone(), compiled.clone(), function.clone(), arity)),
            );
        }
        let count = module.functions.len();
        info!(module = name, functions = count, "Loaded script module");
        self.add_module(module);
        Ok(count)
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// True if `module` defines a function or constant called `name`.
    pub fn has_symbol(&self, module: &str, name: &str) -> bool {
        self.function(module, name).is_some() || self.constant(module, name).is_some()
    }

    pub fn function(&self, module: &str, name: &str) -> Option<&Callable> {
        self.modules.get(module).and_then(|m| m.get_function(name))
    }

    pub fn constant(&self, module: &str, name: &str) -> Option<Value> {
        self.modules
            .get(module)
            .and_then(|m| m.get_constant(name))
            .cloned()
    }

    pub fn call(&self, module: &str, name: &str, args: &CallArgs) -> Result<Value> {
        let callable = self
            .function(module, name)
            .ok_or_else(|| FlowError::UnboundName(format!("{module}.{name}")))?;
        callable.call(args)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.modules.iter().map(|(name, m)| (name, m.functions.len())))
            .finish()
    }
}
