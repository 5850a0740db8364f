//! Rhai script modules
//!
//! A script module is a rhai source file whose `fn` items become callables
//! in the block [`FunctionRegistry`](crate::block::functions::FunctionRegistry)
//! under the module's name. Blocks use them like any other module:
//!
//! ```text
//! import petro
//! vsh = petro.shale_volume(gr, 20.0, 120.0)
//! ```
//!
//! ## Types
//!
//! Numbers, booleans, strings and lists convert to their rhai counterparts.
//! Arrays are passed as the registered `Array` type, which supports the
//! arithmetic and comparison operators plus elementwise math:
//!
//! - `sqrt`, `exp`, `ln`/`log`, `log10`, `abs`, `sin`, `cos`, `tan`, `floor`, `ceil`
//! - `len`, `sum`, `mean`, `min`, `max`
//! - `clip(a, lo, hi)`, `select(mask, a, b)`, `is_nan(a)`
//! - `array([..])`, `zeros(n)`, `full(n, v)`, `to_list(a)`, `a[i]`
//!
//! ## Example Module
//!
//! ```rhai
//! // Linear shale volume from a gamma-ray log
//! fn shale_volume(gr, gr_clean, gr_shale) {
//!     clip((gr - gr_clean) / (gr_shale - gr_clean), 0.0, 1.0)
//! }
//! ```

mod engine;
mod function;

pub use engine::ScriptEngine;
pub use function::{from_dynamic, to_dynamic, ScriptFunction};

use crate::error::{FlowError, Result};
use rhai::{Engine, FnAccess, AST};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A compiled script module
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled AST
    ast: Arc<AST>,
    /// The original source code
    source: String,
    /// Module name the functions are registered under
    name: String,
}

impl CompiledModule {
    /// Get the source code of this module
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get the name of this module
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }

    /// Public script functions with their parameter counts.
    pub fn functions(&self) -> Vec<(String, usize)> {
        self.ast
            .iter_functions()
            .filter(|f| !matches!(f.access, FnAccess::Private))
            .map(|f| (f.name.to_string(), f.params.len()))
            .collect()
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

/// Cache for compiled scripts to avoid recompilation
#[derive(Default)]
pub struct ScriptCache {
    /// Map from script source to compiled module
    cache: HashMap<String, CompiledModule>,
}

impl ScriptCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Get a cached module or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, name: &str, source: &str) -> Result<CompiledModule> {
        if let Some(module) = self.cache.get(source) {
            if module.name == name {
                return Ok(module.clone());
            }
            let renamed = CompiledModule {
                name: name.to_string(),
                ..module.clone()
            };
            return Ok(renamed);
        }

        let ast = engine
            .compile(source)
            .map_err(|e| FlowError::Script(format!("Compilation error in '{name}': {e}")))?;

        let module = CompiledModule {
            ast: Arc::new(ast),
            source: source.to_string(),
            name: name.to_string(),
        };

        self.cache.insert(source.to_string(), module.clone());
        Ok(module)
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Remove a specific script from the cache
    pub fn invalidate(&mut self, source: &str) {
        self.cache.remove(source);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Thread-safe script cache wrapper
pub type SharedScriptCache = Arc<RwLock<ScriptCache>>;

/// Create a new shared script cache
pub fn create_shared_cache() -> SharedScriptCache {
    Arc::new(RwLock::new(ScriptCache::new()))
}

/// Built-in script modules
pub mod builtins {
    /// Petrophysics helpers over log arrays
    pub const PETRO: &str = r#"
// Linear shale volume from a gamma-ray log
fn shale_volume(gr, gr_clean, gr_shale) {
    clip((gr - gr_clean) / (gr_shale - gr_clean), 0.0, 1.0)
}

// Archie water saturation
fn water_saturation(rw, rt, phi, a, m, n) {
    let ratio = (a * rw) / (rt * phi ** m);
    clip(ratio ** (1.0 / n), 0.0, 1.0)
}

// Density porosity
fn density_porosity(rhob, rho_matrix, rho_fluid) {
    (rho_matrix - rhob) / (rho_matrix - rho_fluid)
}
"#;

    /// Signal helpers
    pub const SIGNAL: &str = r#"
// Scale into the 0..1 range
fn normalize(x) {
    let lo = min(x);
    let hi = max(x);
    (x - lo) / (hi - lo)
}

// Remove the mean
fn detrend(x) {
    x - mean(x)
}

// Replace NaN entries with a fill value
fn fill_nan(x, fill) {
    select(is_nan(x), fill, x)
}
"#;

    /// Unit-free conversions
    pub const CONVERT: &str = r#"
fn celsius_to_kelvin(t) {
    t + 273.15
}

fn kelvin_to_celsius(t) {
    t - 273.15
}

fn percent(x) {
    x * 100.0
}
"#;

    /// List of all built-in modules with names
    pub fn all() -> Vec<(&'static str, &'static str)> {
        vec![("petro", PETRO), ("signal", SIGNAL), ("convert", CONVERT)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_cache() {
        let engine = Engine::new();
        let mut cache = ScriptCache::new();

        let script = "fn double(x) { x * 2.0 }";
        let module1 = cache.get_or_compile(&engine, "test", script).unwrap();
        let module2 = cache.get_or_compile(&engine, "test", script).unwrap();

        // Should be the same (cached)
        assert_eq!(module1.source(), module2.source());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_module_function_listing() {
        let engine = Engine::new();
        let mut cache = ScriptCache::new();
        let module = cache
            .get_or_compile(&engine, "m", "fn a(x, y) { x + y } private fn b() { 1 }")
            .unwrap();
        assert_eq!(module.functions(), vec![("a".to_string(), 2)]);
    }

    #[test]
    fn test_builtin_modules_compile() {
        let engine = ScriptEngine::new();
        for (name, source) in builtins::all() {
            let result = engine.validate(source);
            assert!(result.is_ok(), "Built-in '{}' failed to compile: {:?}", name, result.err());
        }
    }
}
