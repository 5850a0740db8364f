//! Rhai Script Engine Implementation
//!
//! Configures a rhai [`Engine`] with the `Array` type, its operators and a
//! small elementwise math library, and calls functions of compiled modules.

use crate::error::{FlowError, Result, ResultExt};
use crate::numeric::{Array, BinaryOp, DType};
use crate::scripting::{CompiledModule, ScriptCache, SharedScriptCache};
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use std::sync::{Arc, RwLock};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

fn script_error(err: FlowError) -> Box<EvalAltResult> {
    err.to_string().into()
}

const OPERATORS: [(&str, BinaryOp); 12] = [
    ("+", BinaryOp::Add),
    ("-", BinaryOp::Sub),
    ("*", BinaryOp::Mul),
    ("/", BinaryOp::Div),
    ("%", BinaryOp::Mod),
    ("**", BinaryOp::Pow),
    ("<", BinaryOp::Lt),
    ("<=", BinaryOp::Le),
    (">", BinaryOp::Gt),
    (">=", BinaryOp::Ge),
    ("==", BinaryOp::Eq),
    ("!=", BinaryOp::Ne),
];

const ELEMENTWISE: [(&str, fn(f64) -> f64); 12] = [
    ("sqrt", f64::sqrt),
    ("exp", f64::exp),
    ("ln", f64::ln),
    ("log", f64::ln),
    ("log10", f64::log10),
    ("abs", f64::abs),
    ("sin", f64::sin),
    ("cos", f64::cos),
    ("tan", f64::tan),
    ("floor", f64::floor),
    ("ceil", f64::ceil),
    ("round", f64::round),
];

/// The script engine used for script function modules
pub struct ScriptEngine {
    /// The Rhai engine instance
    engine: Engine,
    /// Cache of compiled scripts
    cache: SharedScriptCache,
}

impl ScriptEngine {
    /// Create a new script engine with default configuration
    pub fn new() -> Self {
        Self::with_cache(Arc::new(RwLock::new(ScriptCache::new())))
    }

    /// Create a new script engine with a shared cache
    pub fn with_cache(cache: SharedScriptCache) -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);
        Self { engine, cache }
    }

    /// Configure the Rhai engine with array support and safety limits
    fn configure_engine(engine: &mut Engine) {
        // Set safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(1_000);

        engine.register_type_with_name::<Array>("Array");
        engine.register_fn("to_string", |a: &mut Array| a.to_string());

        for (symbol, op) in OPERATORS {
            Self::register_operator(engine, symbol, op);
        }
        engine.register_fn("-", |a: Array| a.map(|v| -v));

        for (name, f) in ELEMENTWISE {
            engine.register_fn(name, move |x: f64| f(x));
            engine.register_fn(name, move |x: Array| x.map_float(f));
        }

        // Reductions
        engine.register_fn("len", |a: &mut Array| a.len() as i64);
        engine.register_fn("sum", |a: Array| a.sum());
        engine.register_fn("mean", |a: Array| a.mean());
        engine.register_fn("min", |a: Array| a.min());
        engine.register_fn("max", |a: Array| a.max());
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));

        // Clamping and selection
        engine.register_fn("clip", |x: f64, lo: f64, hi: f64| clip(x, lo, hi));
        engine.register_fn("clip", |a: Array, lo: f64, hi: f64| a.map(|v| clip(v, lo, hi)));
        engine.register_fn("is_nan", |x: f64| x.is_nan());
        engine.register_fn("is_nan", |a: Array| {
            let mut mask = a.map_float(|v| if v.is_nan() { 1.0 } else { 0.0 }).with_dtype(DType::Bool);
            mask.set_units(None);
            mask
        });
        engine.register_fn("select", |c: Array, a: Array, b: Array| {
            Array::select(&c, &a, &b).map_err(script_error)
        });
        engine.register_fn("select", |c: Array, a: f64, b: Array| {
            Array::select(&c, &Array::scalar(a), &b).map_err(script_error)
        });
        engine.register_fn("select", |c: Array, a: Array, b: f64| {
            Array::select(&c, &a, &Array::scalar(b)).map_err(script_error)
        });
        engine.register_fn("select", |c: Array, a: f64, b: f64| {
            Array::select(&c, &Array::scalar(a), &Array::scalar(b)).map_err(script_error)
        });

        // Construction and access
        engine.register_fn("array", |items: rhai::Array| -> ScriptResult<Array> {
            let values = items
                .iter()
                .map(|item| {
                    item.as_float()
                        .or_else(|_| item.as_int().map(|i| i as f64))
                        .map_err(|t| -> Box<EvalAltResult> { format!("array() expects numbers, got {t}").into() })
                })
                .collect::<ScriptResult<Vec<f64>>>()?;
            Ok(Array::from_vec(values))
        });
        engine.register_fn("zeros", |n: i64| Array::zeros(&[n.max(0) as usize]));
        engine.register_fn("full", |n: i64, v: f64| Array::full(&[n.max(0) as usize], v));
        engine.register_fn("to_list", |a: Array| -> rhai::Array {
            a.iter().map(Dynamic::from_float).collect()
        });
        engine.register_indexer_get(|a: &mut Array, i: i64| -> ScriptResult<f64> {
            let index = if i < 0 { a.len() as i64 + i } else { i };
            let row = a.row(index.max(0) as usize).map_err(script_error)?;
            row.as_scalar()
                .ok_or_else(|| "indexing returned a row, not a number".into())
        });

        // Constants
        engine.register_fn("pi", || std::f64::consts::PI);
        engine.register_fn("e", || std::f64::consts::E);
        engine.register_fn("nan", || f64::NAN);
    }

    fn register_operator(engine: &mut Engine, symbol: &'static str, op: BinaryOp) {
        engine.register_fn(symbol, move |a: Array, b: Array| a.binary(&b, op).map_err(script_error));
        engine.register_fn(symbol, move |a: Array, b: f64| {
            a.binary(&Array::scalar(b), op).map_err(script_error)
        });
        engine.register_fn(symbol, move |a: f64, b: Array| {
            Array::scalar(a).binary(&b, op).map_err(script_error)
        });
        engine.register_fn(symbol, move |a: Array, b: i64| {
            a.binary(&Array::scalar(b as f64).with_dtype(DType::Int), op)
                .map_err(script_error)
        });
        engine.register_fn(symbol, move |a: i64, b: Array| {
            Array::scalar(a as f64)
                .with_dtype(DType::Int)
                .binary(&b, op)
                .map_err(script_error)
        });
    }

    /// Compile a script module and cache it
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledModule> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| FlowError::Script(format!("Failed to acquire cache lock: {}", e)))?;

        cache.get_or_compile(&self.engine, name, source)
    }

    /// Call `function` of a compiled module
    pub fn call(&self, module: &CompiledModule, function: &str, args: Vec<Dynamic>) -> Result<Dynamic> {
        let mut scope = Scope::new();
        self.engine
            .call_fn::<Dynamic>(&mut scope, module.ast(), function, args)
            .with_context(|| format!("script function {}.{}", module.name(), function))
    }

    /// Validate a script without executing it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| FlowError::Script(format!("Validation error: {}", e)))
    }

    /// Clear the script cache
    pub fn clear_cache(&self) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| FlowError::Script(format!("Failed to acquire cache lock: {}", e)))?;
        cache.clear();
        Ok(())
    }

    /// Get a reference to the underlying Rhai engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get a reference to the shared cache
    pub fn cache(&self) -> &SharedScriptCache {
        &self.cache
    }
}

fn clip(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_nan() {
        v
    } else {
        v.max(lo).min(hi)
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("cache_size", &self.cache.read().map(|c| c.len()).ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(engine: &ScriptEngine, source: &str, function: &str, args: Vec<Dynamic>) -> Dynamic {
        let module = engine.compile("test", source).unwrap();
        engine.call(&module, function, args).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = ScriptEngine::new();
        assert!(engine.cache.read().unwrap().is_empty());
    }

    #[test]
    fn test_scalar_function() {
        let engine = ScriptEngine::new();
        let result = call(&engine, "fn double(x) { x * 2.0 }", "double", vec![Dynamic::from(5.0)]);
        assert_eq!(result.as_float().unwrap(), 10.0);
    }

    #[test]
    fn test_array_arithmetic() {
        let engine = ScriptEngine::new();
        let input = Array::from_vec(vec![1.0, 2.0, 3.0]);
        let result = call(
            &engine,
            "fn scale(a) { (a + 1.0) * 2.0 }",
            "scale",
            vec![Dynamic::from(input)],
        );
        let out = result.try_cast::<Array>().unwrap();
        assert_eq!(out.to_vec(), vec![4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_array_comparison_is_mask() {
        let engine = ScriptEngine::new();
        let input = Array::from_vec(vec![1.0, 5.0, 3.0]);
        let result = call(&engine, "fn big(a) { a > 2.0 }", "big", vec![Dynamic::from(input)]);
        let mask = result.try_cast::<Array>().unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        assert_eq!(mask.nonzero(), vec![1, 2]);
    }

    #[test]
    fn test_reductions_and_indexing() {
        let engine = ScriptEngine::new();
        let input = Array::from_vec(vec![2.0, 4.0, 6.0]);
        let result = call(
            &engine,
            "fn stats(a) { mean(a) + a[-1] + len(a) }",
            "stats",
            vec![Dynamic::from(input)],
        );
        assert_eq!(result.as_float().unwrap(), 4.0 + 6.0 + 3.0);
    }

    #[test]
    fn test_select_fills_nan() {
        let engine = ScriptEngine::new();
        let input = Array::from_vec(vec![1.0, f64::NAN, 3.0]);
        let result = call(
            &engine,
            super::super::builtins::SIGNAL,
            "fill_nan",
            vec![Dynamic::from(input), Dynamic::from(0.0)],
        );
        let out = result.try_cast::<Array>().unwrap();
        assert_eq!(out.to_vec(), vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_validation() {
        let engine = ScriptEngine::new();

        // Valid script
        assert!(engine.validate("fn f(x) { x * 2.0 }").is_ok());

        // Invalid script
        assert!(engine.validate("fn f(x) { x * }").is_err());
    }

    #[test]
    fn test_caching() {
        let engine = ScriptEngine::new();

        let script = "fn f(x) { x }";
        let _ = engine.compile("test", script).unwrap();
        let _ = engine.compile("test", script).unwrap();

        // Should only have one entry in cache
        assert_eq!(engine.cache.read().unwrap().len(), 1);
        engine.clear_cache().unwrap();
        assert!(engine.cache.read().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_function_is_script_error() {
        let engine = ScriptEngine::new();
        let module = engine.compile("test", "fn f(x) { x }").unwrap();
        let err = engine.call(&module, "g", vec![]).unwrap_err();
        assert!(matches!(err.root_cause(), FlowError::Script(_)));
    }
}
