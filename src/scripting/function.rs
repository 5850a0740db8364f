//! Script functions as block callables.

use super::{CompiledModule, ScriptEngine};
use crate::block::functions::CallArgs;
use crate::error::{FlowError, Result};
use crate::numeric::Array;
use crate::types::Value;
use rhai::Dynamic;
use std::fmt;
use std::sync::Arc;

/// One `fn` of a compiled script module.
#[derive(Clone)]
pub struct ScriptFunction {
    engine: Arc<ScriptEngine>,
    module: CompiledModule,
    name: String,
    arity: usize,
}

impl ScriptFunction {
    pub fn new(engine: Arc<ScriptEngine>, module: CompiledModule, name: impl Into<String>, arity: usize) -> Self {
        Self {
            engine,
            module,
            name: name.into(),
            arity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn call(&self, args: &CallArgs) -> Result<Value> {
        if !args.keywords.is_empty() {
            return Err(FlowError::eval(format!(
                "script function {}.{} does not take keyword arguments",
                self.module.name(),
                self.name
            )));
        }
        if args.positional.len() != self.arity {
            return Err(FlowError::eval(format!(
                "{}.{}() takes {} arguments but {} were given",
                self.module.name(),
                self.name,
                self.arity,
                args.positional.len()
            )));
        }
        let dynamic_args = args
            .positional
            .iter()
            .map(to_dynamic)
            .collect::<Result<Vec<_>>>()?;
        let result = self.engine.call(&self.module, &self.name, dynamic_args)?;
        from_dynamic(result)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptFunction({}.{}/{})", self.module.name(), self.name, self.arity)
    }
}

/// Convert a context value into a rhai value.
pub fn to_dynamic(value: &Value) -> Result<Dynamic> {
    Ok(match value {
        Value::None => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Int(i) => Dynamic::from_int(*i),
        Value::Float(f) => Dynamic::from_float(*f),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::Array(a) => Dynamic::from(a.clone()),
        Value::List(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect::<Result<_>>()?),
        other => {
            return Err(FlowError::InvalidConversion {
                from: other.type_name().to_string(),
                to: "script value".to_string(),
            })
        }
    })
}

/// Convert a rhai result back into a context value.
pub fn from_dynamic(value: Dynamic) -> Result<Value> {
    if value.is_unit() {
        return Ok(Value::None);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::Int(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(Value::Float(f));
    }
    if value.is::<Array>() {
        let type_name = value.type_name();
        return value.try_cast::<Array>().map(Value::Array).ok_or_else(|| FlowError::InvalidConversion {
            from: type_name.to_string(),
            to: "array".to_string(),
        });
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Value::Str)
            .map_err(|t| FlowError::InvalidConversion {
                from: t.to_string(),
                to: "str".to_string(),
            });
    }
    if value.is_array() {
        let items = value.into_array().map_err(|t| FlowError::InvalidConversion {
            from: t.to_string(),
            to: "list".to_string(),
        })?;
        return items.into_iter().map(from_dynamic).collect::<Result<Vec<_>>>().map(Value::List);
    }
    Err(FlowError::InvalidConversion {
        from: value.type_name().to_string(),
        to: "value".to_string(),
    })
}
