//! Expression evaluation and statement execution over a namespace.

use super::ast::{Expr, UnaryOp};
use super::functions::{CallArgs, FunctionRegistry, BUILTINS};
use super::statement::{Binding, GeneralKind, Import, LocalFunction, PreambleItem, Statement};
use crate::context::NumericContext;
use crate::error::{FlowError, Result};
use crate::numeric::{Array, BinaryOp, DType, UnitAdapter};
use crate::types::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

const MAX_CALL_DEPTH: usize = 64;

/// Name resolution for reads and writes during execution.
pub trait Namespace {
    fn lookup(&self, name: &str) -> Result<Value>;
    fn assign(&self, name: &str, value: Value) -> Result<()>;
}

/// Reads go through dotted lookup, writes through dotted assignment.
pub struct ContextNamespace<'a> {
    context: &'a dyn NumericContext,
}

impl<'a> ContextNamespace<'a> {
    pub fn new(context: &'a dyn NumericContext) -> Self {
        Self { context }
    }
}

impl Namespace for ContextNamespace<'_> {
    fn lookup(&self, name: &str) -> Result<Value> {
        self.context.get_context_data(name).map_err(|e| match e {
            FlowError::InvalidName { .. } => FlowError::UnboundName(name.to_string()),
            other => other,
        })
    }

    fn assign(&self, name: &str, value: Value) -> Result<()> {
        self.context.set_context_data(name, value)
    }
}

/// Local variables layered over a parent namespace.
pub struct LocalNamespace<'a> {
    parent: &'a dyn Namespace,
    locals: RefCell<HashMap<String, Value>>,
    /// Function frames keep every write local; loop frames only the
    /// loop variable.
    capture_writes: bool,
}

impl<'a> LocalNamespace<'a> {
    pub fn loop_frame(parent: &'a dyn Namespace, variable: &str, value: Value) -> Self {
        let frame = Self {
            parent,
            locals: RefCell::new(HashMap::new()),
            capture_writes: false,
        };
        frame.bind(variable, value);
        frame
    }

    pub fn function_frame(parent: &'a dyn Namespace) -> Self {
        Self {
            parent,
            locals: RefCell::new(HashMap::new()),
            capture_writes: true,
        }
    }

    pub fn bind(&self, name: &str, value: Value) {
        self.locals.borrow_mut().insert(name.to_string(), value);
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.locals.borrow().contains_key(name)
    }
}

impl Namespace for LocalNamespace<'_> {
    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.locals.borrow().get(name) {
            return Ok(value.clone());
        }
        self.parent.lookup(name)
    }

    fn assign(&self, name: &str, value: Value) -> Result<()> {
        if self.capture_writes || self.is_bound(name) {
            self.bind(name, value);
            Ok(())
        } else {
            self.parent.assign(name, value)
        }
    }
}

/// Names brought in by a block preamble.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// alias -> module
    modules: HashMap<String, String>,
    /// alias -> (module, name)
    symbols: HashMap<String, (String, String)>,
    functions: HashMap<String, Rc<LocalFunction>>,
    /// `def`s whose bodies could not be compiled
    opaque: HashSet<String>,
}

impl Scope {
    /// Resolve preamble imports against `registry` and collect local
    /// function definitions.
    pub fn from_preamble(preamble: &[PreambleItem], registry: &FunctionRegistry) -> Result<Self> {
        let mut scope = Scope::default();
        for item in preamble {
            match item {
                PreambleItem::Import { imports, .. } => {
                    for import in imports {
                        scope.import(import, registry)?;
                    }
                }
                PreambleItem::Def { name, function, .. } => match function {
                    Some(function) => scope.define(function.clone()),
                    None => {
                        scope.opaque.insert(name.clone());
                    }
                },
            }
        }
        Ok(scope)
    }

    pub fn import(&mut self, import: &Import, registry: &FunctionRegistry) -> Result<()> {
        match import {
            Import::Module { module, alias } => {
                if !registry.has_module(module) {
                    return Err(FlowError::Import {
                        module: module.clone(),
                        name: alias.clone(),
                    });
                }
                self.modules.insert(alias.clone(), module.clone());
            }
            Import::Symbol {
                module,
                name,
                alias,
            } => {
                if !registry.has_symbol(module, name) {
                    return Err(FlowError::Import {
                        module: module.clone(),
                        name: name.clone(),
                    });
                }
                self.symbols
                    .insert(alias.clone(), (module.clone(), name.clone()));
            }
        }
        Ok(())
    }

    pub fn define(&mut self, function: LocalFunction) {
        self.opaque.remove(&function.name);
        self.functions
            .insert(function.name.clone(), Rc::new(function));
    }

    /// True if `name` (or its first dotted segment) refers to an import.
    pub fn is_imported(&self, name: &str) -> bool {
        let head = name.split('.').next().unwrap_or(name);
        self.symbols.contains_key(name) || self.modules.contains_key(head)
    }
}

/// Evaluates expressions and executes statements.
pub struct Evaluator<'a> {
    functions: &'a FunctionRegistry,
    scope: &'a Scope,
    units: &'a dyn UnitAdapter,
    depth: Cell<usize>,
}

impl<'a> Evaluator<'a> {
    pub fn new(functions: &'a FunctionRegistry, scope: &'a Scope, units: &'a dyn UnitAdapter) -> Self {
        Self {
            functions,
            scope,
            units,
            depth: Cell::new(0),
        }
    }

    pub fn eval(&self, expr: &Expr, ns: &dyn Namespace) -> Result<Value> {
        match expr {
            Expr::Literal(lit) => Ok(lit.to_value()),
            Expr::Name(name) => self.lookup(name, ns),
            Expr::List(items) | Expr::Tuple(items) => items
                .iter()
                .map(|item| self.eval(item, ns))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Expr::Unary { op, operand } => unary(*op, self.eval(operand, ns)?),
            Expr::Binary { op, lhs, rhs } if op.is_logical() => {
                let left = self.eval(lhs, ns)?;
                if matches!(left, Value::Array(_)) {
                    let right = self.eval(rhs, ns)?;
                    return self.binary(*op, left, right);
                }
                // Scalar `and`/`or` short-circuit and return an operand.
                let decided = match op {
                    BinaryOp::And => !left.truthy(),
                    _ => left.truthy(),
                };
                if decided {
                    Ok(left)
                } else {
                    self.eval(rhs, ns)
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = self.eval(lhs, ns)?;
                let right = self.eval(rhs, ns)?;
                self.binary(*op, left, right)
            }
            Expr::Call {
                function,
                args,
                kwargs,
            } => {
                let positional = args
                    .iter()
                    .map(|arg| self.eval(arg, ns))
                    .collect::<Result<Vec<_>>>()?;
                let keywords = kwargs
                    .iter()
                    .map(|(name, arg)| Ok((name.clone(), self.eval(arg, ns)?)))
                    .collect::<Result<Vec<_>>>()?;
                self.call(function, &CallArgs { positional, keywords }, ns)
            }
            Expr::Index { target, index } => {
                let target = self.eval(target, ns)?;
                let index = self.eval(index, ns)?;
                index_value(target, index)
            }
        }
    }

    fn lookup(&self, name: &str, ns: &dyn Namespace) -> Result<Value> {
        match ns.lookup(name) {
            Err(FlowError::UnboundName(missing)) => {
                self.constant(name).ok_or(FlowError::UnboundName(missing))
            }
            other => other,
        }
    }

    fn constant(&self, name: &str) -> Option<Value> {
        if let Some((module, symbol)) = self.scope.symbols.get(name) {
            return self.functions.constant(module, symbol);
        }
        if let Some((alias, symbol)) = name.rsplit_once('.') {
            if let Some(module) = self.scope.modules.get(alias) {
                return self.functions.constant(module, symbol);
            }
        }
        self.functions.constant(BUILTINS, name)
    }

    /// Resolution order: local `def`, imported symbol, `alias.function`,
    /// builtins.
    pub fn call(&self, function: &str, args: &CallArgs, ns: &dyn Namespace) -> Result<Value> {
        if let Some(local) = self.scope.functions.get(function) {
            return self.call_local(local, args, ns);
        }
        if self.scope.opaque.contains(function) {
            return Err(FlowError::eval(format!(
                "function '{function}' uses constructs that cannot be executed"
            )));
        }
        if let Some((module, name)) = self.scope.symbols.get(function) {
            return self.functions.call(module, name, args);
        }
        if let Some((alias, name)) = function.rsplit_once('.') {
            if let Some(module) = self.scope.modules.get(alias) {
                return self.functions.call(module, name, args);
            }
        }
        match self.functions.function(BUILTINS, function) {
            Some(callable) => callable.call(args),
            None => Err(FlowError::UnboundName(function.to_string())),
        }
    }

    fn call_local(&self, function: &LocalFunction, args: &CallArgs, ns: &dyn Namespace) -> Result<Value> {
        let name = &function.name;
        let depth = self.depth.get();
        if depth >= MAX_CALL_DEPTH {
            return Err(FlowError::eval(format!(
                "maximum call depth exceeded in '{name}'"
            )));
        }
        if args.positional.len() > function.params.len() {
            return Err(FlowError::eval(format!(
                "{name}() takes {} positional arguments but {} were given",
                function.params.len(),
                args.positional.len()
            )));
        }
        let frame = LocalNamespace::function_frame(ns);
        for (param, value) in function.params.iter().zip(&args.positional) {
            frame.bind(param, value.clone());
        }
        for (key, value) in &args.keywords {
            if !function.params.contains(key) {
                return Err(FlowError::eval(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )));
            }
            if frame.is_bound(key) {
                return Err(FlowError::eval(format!(
                    "{name}() got multiple values for argument '{key}'"
                )));
            }
            frame.bind(key, value.clone());
        }
        if let Some(missing) = function.params.iter().find(|p| !frame.is_bound(p)) {
            return Err(FlowError::eval(format!(
                "{name}() missing required argument '{missing}'"
            )));
        }

        self.depth.set(depth + 1);
        let result = self.run_body(function, &frame);
        self.depth.set(depth);
        result
    }

    fn run_body(&self, function: &LocalFunction, frame: &LocalNamespace<'_>) -> Result<Value> {
        for (targets, expr) in &function.body {
            let value = self.eval(expr, frame)?;
            self.assign(targets, value, frame)?;
        }
        match &function.result {
            Some(expr) => self.eval(expr, frame),
            None => Ok(Value::None),
        }
    }

    /// Run one statement. Outputs are written through `ns`.
    pub fn execute(&self, statement: &Statement, ns: &dyn Namespace) -> Result<()> {
        match statement {
            Statement::Call(call) => {
                let mut args = CallArgs::default();
                for input in &call.inputs {
                    let value = match &input.binding {
                        Binding::Literal(lit) => lit.to_value(),
                        Binding::Name(name) => self.lookup(name, ns)?,
                    };
                    if input.keyword {
                        args.keywords.push((input.name.clone(), value));
                    } else {
                        args.positional.push(value);
                    }
                }
                let result = self.call(&call.function, &args, ns)?;
                self.assign(&call.output_names(), result, ns)
            }
            Statement::General(general) => match &general.kind {
                GeneralKind::Assign { targets, value } => {
                    let value = self.eval(value, ns)?;
                    self.assign(targets, value, ns)
                }
                GeneralKind::Expr(expr) => self.eval(expr, ns).map(|_| ()),
                GeneralKind::Raw => Err(FlowError::Parse {
                    line: general.line,
                    message: format!(
                        "unsupported statement: {}",
                        general.source.lines().next().unwrap_or_default()
                    ),
                }),
            },
            Statement::Group(group) => match &group.header {
                None => group
                    .statements
                    .iter()
                    .try_for_each(|inner| self.execute(inner, ns)),
                Some(header) => {
                    let iterable = self.eval(&header.iterable, ns)?;
                    for item in iterate(iterable)? {
                        let frame = LocalNamespace::loop_frame(ns, &header.variable, item);
                        for inner in &group.statements {
                            self.execute(inner, &frame)?;
                        }
                    }
                    Ok(())
                }
            },
        }
    }

    /// Assign `value` to `targets`, unpacking when there are several.
    pub fn assign(&self, targets: &[String], value: Value, ns: &dyn Namespace) -> Result<()> {
        match targets {
            [] => Ok(()),
            [single] => ns.assign(single, value),
            many => {
                let parts = unpack(value, many.len())?;
                for (target, part) in many.iter().zip(parts) {
                    ns.assign(target, part)?;
                }
                Ok(())
            }
        }
    }

    fn binary(&self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
        match (&lhs, &rhs) {
            (Value::Str(a), Value::Str(b)) => string_binary(op, a, b),
            (Value::List(a), Value::List(b)) if op == BinaryOp::Add => {
                Ok(Value::List(a.iter().chain(b).cloned().collect()))
            }
            (Value::None, _) | (_, Value::None) if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => {
                let same = matches!((&lhs, &rhs), (Value::None, Value::None));
                Ok(Value::Bool(same == (op == BinaryOp::Eq)))
            }
            (Value::Array(_), _) | (_, Value::Array(_)) => self.array_binary(op, &lhs, &rhs),
            _ => scalar_binary(op, &lhs, &rhs),
        }
    }

    /// Elementwise operation; a differing unit tag on the right operand is
    /// converted to the left operand's units for additive and comparison
    /// operators.
    fn array_binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
        let left = lhs.to_array()?;
        let mut right = rhs.to_array()?;
        if op.keeps_units() || op.is_comparison() {
            let target = match (left.units(), right.units()) {
                (Some(to), Some(from)) if to != from => Some(to.to_string()),
                _ => None,
            };
            if let Some(to) = target {
                right = self.units.convert(&right, &to)?;
            }
        }
        Ok(Value::Array(left.binary(&right, op)?))
    }
}

fn unsupported(op: &str, lhs: &Value, rhs: &Value) -> FlowError {
    FlowError::eval(format!(
        "unsupported operand types for {op}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn string_binary(op: BinaryOp, a: &str, b: &str) -> Result<Value> {
    Ok(match op {
        BinaryOp::Add => Value::Str(format!("{a}{b}")),
        BinaryOp::Eq => Value::Bool(a == b),
        BinaryOp::Ne => Value::Bool(a != b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        other => {
            return Err(unsupported(
                other.symbol(),
                &Value::Str(a.to_string()),
                &Value::Str(b.to_string()),
            ))
        }
    })
}

fn is_integral(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Bool(_))
}

/// Python floor division and modulo on integers.
fn floor_div_mod(a: i64, b: i64) -> Option<(i64, i64)> {
    let q = a.checked_div(b)?;
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some((q - 1, r + b))
    } else {
        Some((q, r))
    }
}

fn scalar_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    let (Some(x), Some(y)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(unsupported(op.symbol(), lhs, rhs));
    };
    if op.is_comparison() || op.is_logical() {
        return Ok(Value::Bool(op.apply(x, y) != 0.0));
    }
    let divides = matches!(op, BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod);
    if divides && y == 0.0 {
        return Err(FlowError::eval("division by zero"));
    }
    if op == BinaryOp::Div {
        return Ok(Value::Float(x / y));
    }
    if let (true, Some(a), Some(b)) = (is_integral(lhs) && is_integral(rhs), lhs.as_i64(), rhs.as_i64()) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::FloorDiv => floor_div_mod(a, b).map(|(q, _)| q),
            BinaryOp::Mod => floor_div_mod(a, b).map(|(_, r)| r),
            BinaryOp::Pow if b >= 0 => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
            _ => None,
        };
        if let Some(value) = exact {
            return Ok(Value::Int(value));
        }
    }
    Ok(Value::Float(op.apply(x, y)))
}

fn unary(op: UnaryOp, value: Value) -> Result<Value> {
    let bad = |value: &Value| {
        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Not => "not",
        };
        FlowError::eval(format!(
            "bad operand type for unary {symbol}: '{}'",
            value.type_name()
        ))
    };
    match (op, value) {
        (UnaryOp::Not, Value::Array(a)) => Ok(Value::Array(a.logical_not())),
        (UnaryOp::Not, other) => Ok(Value::Bool(!other.truthy())),
        (UnaryOp::Neg, Value::Int(i)) => Ok(i
            .checked_neg()
            .map(Value::Int)
            .unwrap_or(Value::Float(-(i as f64)))),
        (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-(b as i64))),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::Array(a)) => Ok(Value::Array(a.map(|v| -v))),
        (UnaryOp::Pos, Value::Bool(b)) => Ok(Value::Int(b as i64)),
        (UnaryOp::Pos, value @ (Value::Int(_) | Value::Float(_) | Value::Array(_))) => Ok(value),
        (_, other) => Err(bad(&other)),
    }
}

/// Rank-0 arrays unwrap to scalars of their dtype.
fn array_scalar(array: Array) -> Value {
    if array.ndim() > 0 {
        return Value::Array(array);
    }
    match (array.dtype(), array.as_scalar()) {
        (DType::Bool, Some(v)) => Value::Bool(v != 0.0),
        (DType::Int, Some(v)) => Value::Int(v as i64),
        (_, Some(v)) => Value::Float(v),
        (_, None) => Value::Array(array),
    }
}

fn normalize_index(index: &Value, len: usize) -> Result<usize> {
    let i = index.as_i64().ok_or_else(|| {
        FlowError::eval(format!(
            "indices must be integers, not {}",
            index.type_name()
        ))
    })?;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved as usize >= len {
        return Err(FlowError::eval(format!(
            "index {i} is out of bounds for length {len}"
        )));
    }
    Ok(resolved as usize)
}

fn index_value(target: Value, index: Value) -> Result<Value> {
    match (target, index) {
        (Value::List(items), index) => {
            let i = normalize_index(&index, items.len())?;
            Ok(items[i].clone())
        }
        (Value::Str(s), index) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(&index, chars.len())?;
            Ok(Value::Str(chars[i].to_string()))
        }
        (Value::Array(a), index @ (Value::Array(_) | Value::List(_))) => {
            let selector = index.to_array()?;
            if selector.dtype() == DType::Bool {
                return Ok(Value::Array(a.compress(&selector)?));
            }
            let indices = selector
                .iter()
                .map(|v| normalize_index(&Value::Float(v), a.len()))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(a.take(&indices)?))
        }
        (Value::Array(a), index) => {
            let i = normalize_index(&index, a.len())?;
            Ok(array_scalar(a.row(i)?))
        }
        (Value::Context(c), Value::Str(name)) => c.get_dotted(&name),
        (target, _) => Err(FlowError::eval(format!(
            "'{}' object is not subscriptable",
            target.type_name()
        ))),
    }
}

fn unpack(value: Value, count: usize) -> Result<Vec<Value>> {
    let parts = match value {
        Value::List(items) => items,
        Value::Array(a) if a.ndim() > 0 => (0..a.len())
            .map(|i| a.row(i).map(array_scalar))
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(FlowError::eval(format!(
                "cannot unpack non-sequence {}",
                other.type_name()
            )))
        }
    };
    if parts.len() != count {
        return Err(FlowError::eval(format!(
            "expected {count} values to unpack, got {}",
            parts.len()
        )));
    }
    Ok(parts)
}

fn iterate(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        Value::Array(a) if a.ndim() > 0 => (0..a.len()).map(|i| a.row(i).map(array_scalar)).collect(),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(FlowError::eval(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::parser::{parse_expression, parse_source};
    use crate::numeric::ScaleUnits;

    #[derive(Default)]
    struct MapNamespace(RefCell<HashMap<String, Value>>);

    impl MapNamespace {
        fn with(self, name: &str, value: impl Into<Value>) -> Self {
            self.0.borrow_mut().insert(name.to_string(), value.into());
            self
        }

        fn get(&self, name: &str) -> Option<Value> {
            self.0.borrow().get(name).cloned()
        }
    }

    impl Namespace for MapNamespace {
        fn lookup(&self, name: &str) -> Result<Value> {
            self.get(name)
                .ok_or_else(|| FlowError::UnboundName(name.to_string()))
        }

        fn assign(&self, name: &str, value: Value) -> Result<()> {
            self.0.borrow_mut().insert(name.to_string(), value);
            Ok(())
        }
    }

    fn eval_in(source: &str, ns: &MapNamespace) -> Result<Value> {
        let registry = FunctionRegistry::standard();
        let scope = Scope::default();
        let units = ScaleUnits::standard();
        Evaluator::new(&registry, &scope, &units).eval(&parse_expression(source, 1)?, ns)
    }

    fn run(source: &str, ns: &MapNamespace) -> Result<()> {
        let registry = FunctionRegistry::standard();
        let parsed = parse_source(source)?;
        let scope = Scope::from_preamble(&parsed.preamble, &registry)?;
        let units = ScaleUnits::standard();
        let evaluator = Evaluator::new(&registry, &scope, &units);
        for statement in &parsed.statements {
            evaluator.execute(statement, ns)?;
        }
        Ok(())
    }

    #[test]
    fn test_integer_arithmetic_follows_python() {
        let ns = MapNamespace::default();
        assert_eq!(eval_in("7 // -2", &ns).unwrap(), Value::Int(-4));
        assert_eq!(eval_in("-7 % 3", &ns).unwrap(), Value::Int(2));
        assert_eq!(eval_in("2 ** 10", &ns).unwrap(), Value::Int(1024));
        assert_eq!(eval_in("7 / 2", &ns).unwrap(), Value::Float(3.5));
        assert!(eval_in("1 // 0", &ns).is_err());
    }

    #[test]
    fn test_array_filter_expression() {
        let ns = MapNamespace::default().with("depth", vec![0.0, 10.0, 20.0, 30.0]);
        let mask = eval_in("depth > 5 and depth < 25", &ns).unwrap();
        let mask = mask.as_array().cloned().unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        assert_eq!(mask.nonzero(), vec![1, 2]);
    }

    #[test]
    fn test_scalar_and_short_circuits() {
        let ns = MapNamespace::default();
        assert_eq!(eval_in("0 and missing", &ns).unwrap(), Value::Int(0));
        assert_eq!(eval_in("1 or missing", &ns).unwrap(), Value::Int(1));
        assert!(matches!(eval_in("1 and missing", &ns), Err(FlowError::UnboundName(n)) if n == "missing"));
    }

    #[test]
    fn test_units_convert_right_operand() {
        let ns = MapNamespace::default()
            .with("a", Array::from_vec(vec![1.0]).with_units("m"))
            .with("b", Array::from_vec(vec![50.0]).with_units("cm"));
        let sum = eval_in("a + b", &ns).unwrap();
        let sum = sum.as_array().cloned().unwrap();
        assert_eq!(sum.to_vec(), vec![1.5]);
        assert_eq!(sum.units(), Some("m"));

        let ns = ns.with("t", Array::from_vec(vec![1.0]).with_units("s"));
        assert!(matches!(
            eval_in("a + t", &ns),
            Err(FlowError::InvalidConversion { .. })
        ));
    }

    #[test]
    fn test_indexing() {
        let ns = MapNamespace::default().with("x", vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(eval_in("x[-1]", &ns).unwrap(), Value::Float(4.0));
        let picked = eval_in("x[[3, 0]]", &ns).unwrap();
        assert_eq!(picked.as_array().map(Array::to_vec), Some(vec![4.0, 1.0]));
        let masked = eval_in("x[x > 2]", &ns).unwrap();
        assert_eq!(masked.as_array().map(Array::to_vec), Some(vec![3.0, 4.0]));
        assert!(eval_in("x[9]", &ns).is_err());
    }

    #[test]
    fn test_imports_and_constants() {
        let ns = MapNamespace::default().with("x", vec![4.0, 9.0]);
        run("import numpy as np\nfrom math import pi\ny = np.sqrt(x)\nz = pi * 2", &ns).unwrap();
        assert_eq!(ns.get("y").and_then(|v| v.as_array().map(Array::to_vec)), Some(vec![2.0, 3.0]));
        assert_eq!(ns.get("z"), Some(Value::Float(std::f64::consts::PI * 2.0)));

        let err = run("import scipy\n", &MapNamespace::default()).unwrap_err();
        assert!(matches!(err, FlowError::Import { .. }));
    }

    #[test]
    fn test_unimported_module_is_unbound() {
        let ns = MapNamespace::default().with("x", 4.0);
        let err = run("y = np.sqrt(x)", &ns).unwrap_err();
        assert!(matches!(err, FlowError::UnboundName(n) if n == "np.sqrt"));
    }

    #[test]
    fn test_local_function_and_unpacking() {
        let ns = MapNamespace::default().with("x", 3);
        run("def split(v):\n    lo = v - 1\n    return lo, v + 1\na, b = split(x)", &ns).unwrap();
        assert_eq!(ns.get("a"), Some(Value::Int(2)));
        assert_eq!(ns.get("b"), Some(Value::Int(4)));
        assert_eq!(ns.get("lo"), None);
    }

    #[test]
    fn test_loop_writes_through_to_namespace() {
        let ns = MapNamespace::default().with("total", 0);
        run("for i in range(4):\n    total = total + i", &ns).unwrap();
        assert_eq!(ns.get("total"), Some(Value::Int(6)));
        assert_eq!(ns.get("i"), None);
    }

    #[test]
    fn test_raw_statement_fails_at_execution() {
        let ns = MapNamespace::default();
        let err = run("while True:\n    x = 1", &ns).unwrap_err();
        assert!(matches!(err, FlowError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_recursion_is_bounded() {
        let ns = MapNamespace::default();
        let err = run("def f(n):\n    return f(n)\ny = f(1)", &ns).unwrap_err();
        assert!(err.to_string().contains("maximum call depth"));
    }
}
