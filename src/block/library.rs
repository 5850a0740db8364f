//! Standard modules: `builtins`, `numpy` and `math`.

use super::functions::{CallArgs, Module, BUILTINS};
use crate::error::{FlowError, Result};
use crate::numeric::{Array, BinaryOp, DType};
use crate::types::Value;

fn type_error(function: &str, value: &Value) -> FlowError {
    FlowError::eval(format!(
        "{function}() does not support a {} argument",
        value.type_name()
    ))
}

fn is_sequence(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::List(_))
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Apply `f` to a scalar or elementwise to an array.
fn elementwise(
    name: &'static str,
    keep_units: bool,
    f: fn(f64) -> f64,
) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let value = args.require(0, "x")?;
        if is_sequence(value) {
            let mut out = value.to_array()?.map_float(f);
            if !keep_units {
                out.set_units(None);
            }
            return Ok(Value::Array(out));
        }
        let x = value.as_f64().ok_or_else(|| type_error(name, value))?;
        Ok(Value::Float(f(x)))
    }
}

fn predicate(name: &'static str, f: fn(f64) -> bool) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let value = args.require(0, "x")?;
        if is_sequence(value) {
            let mut out = value
                .to_array()?
                .map_float(|v| flag(f(v)))
                .with_dtype(DType::Bool);
            out.set_units(None);
            return Ok(Value::Array(out));
        }
        let x = value.as_f64().ok_or_else(|| type_error(name, value))?;
        Ok(Value::Bool(f(x)))
    }
}

fn reduction(name: &'static str, f: fn(&Array) -> f64) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let value = args.require(0, "a")?;
        if !is_sequence(value) && value.as_f64().is_none() {
            return Err(type_error(name, value));
        }
        Ok(Value::Float(f(&value.to_array()?)))
    }
}

fn nan_reduction(f: fn(&Array) -> f64) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let array = args.array(0, "a")?;
        let finite: Vec<f64> = array.iter().filter(|v| !v.is_nan()).collect();
        Ok(Value::Float(f(&Array::from_vec(finite))))
    }
}

fn logical(op: BinaryOp) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let a = args.array(0, "x1")?;
        let b = args.array(1, "x2")?;
        Ok(Value::Array(a.binary(&b, op)?))
    }
}

fn extremum(pick: fn(f64, f64) -> f64) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let a = args.array(0, "x1")?;
        let b = args.array(1, "x2")?;
        let dtype = a.dtype().promote(b.dtype());
        let out = a.zip_map(&b, dtype, |x, y| {
            if x.is_nan() || y.is_nan() {
                f64::NAN
            } else {
                pick(x, y)
            }
        })?;
        Ok(Value::Array(out))
    }
}

/// Shape argument: an int or a list of ints.
fn shape_arg(value: &Value) -> Result<Vec<usize>> {
    let dim = |v: &Value| {
        v.as_i64()
            .filter(|n| *n >= 0)
            .map(|n| n as usize)
            .ok_or_else(|| FlowError::eval(format!("invalid dimension {v}")))
    };
    match value {
        Value::List(items) => items.iter().map(dim).collect(),
        other => Ok(vec![dim(other)?]),
    }
}

/// Stack rows of a nested list into a 2-D array.
fn array_from(value: &Value) -> Result<Array> {
    match value {
        Value::List(items) if items.iter().any(is_sequence) => {
            let rows = items
                .iter()
                .map(|item| {
                    let row = item.to_array()?;
                    let mut shape = vec![1];
                    shape.extend_from_slice(row.shape());
                    row.reshape(&shape)
                })
                .collect::<Result<Vec<_>>>()?;
            Array::concatenate(&rows)
        }
        other => other.to_array(),
    }
}

fn scalar_only(name: &'static str, value: &Value) -> Result<f64> {
    match value {
        Value::Array(a) => a.as_scalar().ok_or_else(|| {
            FlowError::eval(format!("{name}(): only size-1 arrays can be converted to scalars"))
        }),
        other => other.as_f64().ok_or_else(|| type_error(name, other)),
    }
}

fn scalar_math(name: &'static str, f: fn(f64) -> f64) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| Ok(Value::Float(f(scalar_only(name, args.require(0, "x")?)?)))
}

fn sequence_items(name: &'static str, value: &Value) -> Result<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Array(a) => Ok(a.iter().map(Value::Float).collect()),
        other => Err(type_error(name, other)),
    }
}

/// `min`/`max` over either one iterable or several scalars.
fn builtin_extremum(name: &'static str, greater: bool) -> impl Fn(&CallArgs) -> Result<Value> {
    move |args: &CallArgs| {
        let items = match args.positional.as_slice() {
            [single] => sequence_items(name, single)?,
            many => many.to_vec(),
        };
        let mut best: Option<(f64, Value)> = None;
        for item in items {
            let v = item.as_f64().ok_or_else(|| type_error(name, &item))?;
            let better = match &best {
                None => true,
                Some((current, _)) => (greater && v > *current) || (!greater && v < *current),
            };
            if better {
                best = Some((v, item));
            }
        }
        best.map(|(_, item)| item)
            .ok_or_else(|| FlowError::eval(format!("{name}() arg is an empty sequence")))
    }
}

pub fn builtins() -> Module {
    Module::new(BUILTINS)
        .function("abs", |args| match args.require(0, "x")? {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            Value::Array(a) => Ok(Value::Array(a.map(f64::abs))),
            other => Err(type_error("abs", other)),
        })
        .function("len", |args| {
            let value = args.require(0, "obj")?;
            let len = match value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Array(a) if a.ndim() > 0 => a.len(),
                Value::Context(c) => c.len(),
                other => {
                    return Err(FlowError::eval(format!(
                        "object of type {} has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(len as i64))
        })
        .function("min", builtin_extremum("min", false))
        .function("max", builtin_extremum("max", true))
        .function("sum", |args| {
            let items = sequence_items("sum", args.require(0, "iterable")?)?;
            if items.iter().all(|v| matches!(v, Value::Int(_) | Value::Bool(_))) {
                return Ok(Value::Int(items.iter().filter_map(Value::as_i64).sum()));
            }
            let mut total = 0.0;
            for item in &items {
                total += item.as_f64().ok_or_else(|| type_error("sum", item))?;
            }
            Ok(Value::Float(total))
        })
        .function("range", |args| {
            let int = |index: usize, name: &str| -> Result<i64> {
                let value = args.require(index, name)?;
                match value {
                    Value::Int(i) => Ok(*i),
                    Value::Bool(b) => Ok(*b as i64),
                    other => Err(FlowError::eval(format!(
                        "'{}' object cannot be interpreted as an integer",
                        other.type_name()
                    ))),
                }
            };
            let (start, stop, step) = match args.len() {
                1 => (0, int(0, "stop")?, 1),
                2 => (int(0, "start")?, int(1, "stop")?, 1),
                3 => (int(0, "start")?, int(1, "stop")?, int(2, "step")?),
                n => return Err(FlowError::eval(format!("range expected 1 to 3 arguments, got {n}"))),
            };
            if step == 0 {
                return Err(FlowError::eval("range() arg 3 must not be zero"));
            }
            let mut items = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                items.push(Value::Int(i));
                i += step;
            }
            Ok(Value::List(items))
        })
        .function("float", |args| match args.get(0, "x") {
            None => Ok(Value::Float(0.0)),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| FlowError::eval(format!("could not convert string to float: '{s}'"))),
            Some(other) => Ok(Value::Float(scalar_only("float", other)?)),
        })
        .function("int", |args| match args.get(0, "x") {
            None => Ok(Value::Int(0)),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| FlowError::eval(format!("invalid literal for int(): '{s}'"))),
            Some(other) => {
                let v = scalar_only("int", other)?;
                if !v.is_finite() {
                    return Err(FlowError::eval(format!("cannot convert {v} to integer")));
                }
                Ok(Value::Int(v.trunc() as i64))
            }
        })
        .function("bool", |args| {
            Ok(Value::Bool(args.get(0, "x").is_some_and(Value::truthy)))
        })
        .function("str", |args| {
            Ok(Value::Str(args.get(0, "object").map(|v| match v {
                Value::Str(s) => s.clone(),
                other => other.to_string(),
            }).unwrap_or_default()))
        })
        .function("round", |args| {
            let x = scalar_only("round", args.require(0, "number")?)?;
            match args.get(1, "ndigits") {
                None | Some(Value::None) => Ok(Value::Int(x.round_ties_even() as i64)),
                Some(digits) => {
                    let digits = digits
                        .as_i64()
                        .ok_or_else(|| type_error("round", digits))?;
                    let scale = 10f64.powi(digits as i32);
                    Ok(Value::Float((x * scale).round_ties_even() / scale))
                }
            }
        })
}

pub fn numpy() -> Module {
    Module::new("numpy")
        .function("sqrt", elementwise("sqrt", false, f64::sqrt))
        .function("exp", elementwise("exp", false, f64::exp))
        .function("log", elementwise("log", false, f64::ln))
        .function("log10", elementwise("log10", false, f64::log10))
        .function("sin", elementwise("sin", false, f64::sin))
        .function("cos", elementwise("cos", false, f64::cos))
        .function("tan", elementwise("tan", false, f64::tan))
        .function("abs", elementwise("abs", true, f64::abs))
        .function("floor", elementwise("floor", true, f64::floor))
        .function("ceil", elementwise("ceil", true, f64::ceil))
        .function("isnan", predicate("isnan", f64::is_nan))
        .function("isfinite", predicate("isfinite", f64::is_finite))
        .function("where", |args| {
            let condition = args.array(0, "condition")?;
            let a = args.array(1, "x")?;
            let b = args.array(2, "y")?;
            Ok(Value::Array(Array::select(&condition, &a, &b)?))
        })
        .function("clip", |args| {
            let a = args.array(0, "a")?;
            let lo = args.number(1, "a_min")?;
            let hi = args.number(2, "a_max")?;
            Ok(Value::Array(a.map(|v| if v.is_nan() { v } else { v.max(lo).min(hi) })))
        })
        .function("mean", reduction("mean", Array::mean))
        .function("sum", reduction("sum", Array::sum))
        .function("min", reduction("min", Array::min))
        .function("max", reduction("max", Array::max))
        .function("nanmean", nan_reduction(Array::mean))
        .function("nanmin", nan_reduction(Array::min))
        .function("nanmax", nan_reduction(Array::max))
        .function("zeros", |args| {
            Ok(Value::Array(Array::zeros(&shape_arg(args.require(0, "shape")?)?)))
        })
        .function("ones", |args| {
            Ok(Value::Array(Array::full(&shape_arg(args.require(0, "shape")?)?, 1.0)))
        })
        .function("full", |args| {
            let shape = shape_arg(args.require(0, "shape")?)?;
            Ok(Value::Array(Array::full(&shape, args.number(1, "fill_value")?)))
        })
        .function("arange", |args| {
            let all_int = args
                .positional
                .iter()
                .all(|v| matches!(v, Value::Int(_) | Value::Bool(_)));
            let (start, stop, step) = match args.len() {
                1 => (0.0, args.number(0, "stop")?, 1.0),
                2 => (args.number(0, "start")?, args.number(1, "stop")?, 1.0),
                _ => (
                    args.number(0, "start")?,
                    args.number(1, "stop")?,
                    args.number(2, "step")?,
                ),
            };
            if step == 0.0 {
                return Err(FlowError::eval("arange(): step must not be zero"));
            }
            let count = ((stop - start) / step).ceil().max(0.0) as usize;
            let values: Vec<f64> = (0..count).map(|i| start + step * i as f64).collect();
            let array = Array::from_vec(values);
            Ok(Value::Array(if all_int { array.with_dtype(DType::Int) } else { array }))
        })
        .function("linspace", |args| {
            let start = args.number(0, "start")?;
            let stop = args.number(1, "stop")?;
            let num = match args.get(2, "num") {
                Some(v) => v
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| type_error("linspace", v))? as usize,
                None => 50,
            };
            let values = match num {
                0 => Vec::new(),
                1 => vec![start],
                n => (0..n)
                    .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
                    .collect(),
            };
            Ok(Value::Array(Array::from_vec(values)))
        })
        .function("concatenate", |args| {
            let items = match args.require(0, "arrays")? {
                Value::List(items) => items.clone(),
                other => return Err(type_error("concatenate", other)),
            };
            let arrays = items.iter().map(Value::to_array).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(Array::concatenate(&arrays)?))
        })
        .function("array", |args| Ok(Value::Array(array_from(args.require(0, "object")?)?)))
        .function("logical_and", logical(BinaryOp::And))
        .function("logical_or", logical(BinaryOp::Or))
        .function("logical_not", |args| Ok(Value::Array(args.array(0, "x")?.logical_not())))
        .function("maximum", extremum(f64::max))
        .function("minimum", extremum(f64::min))
        .function("cumsum", |args| {
            let array = args.array(0, "a")?;
            let mut total = 0.0;
            let values = array
                .iter()
                .map(|v| {
                    total += v;
                    total
                })
                .collect();
            Ok(Value::Array(Array::from_vec(values).with_dtype(array.dtype().max(DType::Int))))
        })
        .function("diff", |args| {
            let values = args.array(0, "a")?.to_vec();
            let diffs = values.windows(2).map(|w| w[1] - w[0]).collect();
            Ok(Value::Array(Array::from_vec(diffs)))
        })
        .constant("pi", std::f64::consts::PI)
        .constant("e", std::f64::consts::E)
        .constant("nan", f64::NAN)
        .constant("inf", f64::INFINITY)
}

pub fn math() -> Module {
    Module::new("math")
        .function("sqrt", scalar_math("sqrt", f64::sqrt))
        .function("exp", scalar_math("exp", f64::exp))
        .function("log", |args| {
            let x = scalar_only("log", args.require(0, "x")?)?;
            match args.get(1, "base") {
                Some(base) => Ok(Value::Float(x.ln() / scalar_only("log", base)?.ln())),
                None => Ok(Value::Float(x.ln())),
            }
        })
        .function("log10", scalar_math("log10", f64::log10))
        .function("sin", scalar_math("sin", f64::sin))
        .function("cos", scalar_math("cos", f64::cos))
        .function("tan", scalar_math("tan", f64::tan))
        .function("fabs", scalar_math("fabs", f64::abs))
        .function("floor", |args| {
            Ok(Value::Int(scalar_only("floor", args.require(0, "x")?)?.floor() as i64))
        })
        .function("ceil", |args| {
            Ok(Value::Int(scalar_only("ceil", args.require(0, "x")?)?.ceil() as i64))
        })
        .function("isnan", |args| Ok(Value::Bool(scalar_only("isnan", args.require(0, "x")?)?.is_nan())))
        .function("isfinite", |args| {
            Ok(Value::Bool(scalar_only("isfinite", args.require(0, "x")?)?.is_finite()))
        })
        .function("pow", |args| Ok(Value::Float(args.number(0, "x")?.powf(args.number(1, "y")?))))
        .constant("pi", std::f64::consts::PI)
        .constant("e", std::f64::consts::E)
        .constant("nan", f64::NAN)
        .constant("inf", f64::INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(module: &Module, name: &str, args: Vec<Value>) -> Result<Value> {
        module
            .get_function(name)
            .unwrap_or_else(|| panic!("{name} not registered"))
            .call(&CallArgs::new(args))
    }

    fn floats(values: &[f64]) -> Value {
        Value::Array(Array::from_vec(values.to_vec()))
    }

    #[test]
    fn test_elementwise_on_scalars_and_arrays() {
        let np = numpy();
        assert_eq!(call(&np, "sqrt", vec![Value::Int(9)]).unwrap(), Value::Float(3.0));
        let out = call(&np, "sqrt", vec![floats(&[4.0, 16.0])]).unwrap();
        assert_eq!(out.as_array().map(Array::to_vec), Some(vec![2.0, 4.0]));
    }

    #[test]
    fn test_where_and_isnan() {
        let np = numpy();
        let data = floats(&[1.0, f64::NAN, 3.0]);
        let mask = call(&np, "isnan", vec![data.clone()]).unwrap();
        let out = call(&np, "where", vec![mask, Value::Float(0.0), data]).unwrap();
        assert_eq!(out.as_array().map(Array::to_vec), Some(vec![1.0, 0.0, 3.0]));
    }

    #[test]
    fn test_arange_and_linspace() {
        let np = numpy();
        let a = call(&np, "arange", vec![Value::Int(1), Value::Int(7), Value::Int(2)]).unwrap();
        assert_eq!(a.as_array().map(Array::to_vec), Some(vec![1.0, 3.0, 5.0]));
        assert_eq!(a.as_array().map(Array::dtype), Some(DType::Int));
        let l = call(&np, "linspace", vec![Value::Int(0), Value::Int(1), Value::Int(5)]).unwrap();
        assert_eq!(l.as_array().map(Array::to_vec), Some(vec![0.0, 0.25, 0.5, 0.75, 1.0]));
    }

    #[test]
    fn test_nested_list_array() {
        let np = numpy();
        let nested = Value::List(vec![
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            Value::List(vec![Value::Int(3), Value::Int(4)]),
        ]);
        let out = call(&np, "array", vec![nested]).unwrap();
        assert_eq!(out.as_array().map(|a| a.shape().to_vec()), Some(vec![2, 2]));
    }

    #[test]
    fn test_builtin_range_and_sum() {
        let b = builtins();
        let r = call(&b, "range", vec![Value::Int(4)]).unwrap();
        assert_eq!(call(&b, "sum", vec![r.clone()]).unwrap(), Value::Int(6));
        assert_eq!(call(&b, "len", vec![r]).unwrap(), Value::Int(4));
        assert_eq!(call(&b, "max", vec![Value::Int(2), Value::Float(2.5)]).unwrap(), Value::Float(2.5));
        assert!(call(&b, "range", vec![Value::Int(0), Value::Int(3), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_round_is_bankers() {
        let b = builtins();
        assert_eq!(call(&b, "round", vec![Value::Float(2.5)]).unwrap(), Value::Int(2));
        assert_eq!(call(&b, "round", vec![Value::Float(1.25), Value::Int(1)]).unwrap(), Value::Float(1.2));
    }

    #[test]
    fn test_math_rejects_arrays() {
        let m = math();
        assert!(call(&m, "sqrt", vec![floats(&[1.0, 4.0])]).is_err());
        assert_eq!(call(&m, "floor", vec![Value::Float(2.7)]).unwrap(), Value::Int(2));
    }
}
