//! Core value types shared across flowbench
//!
//! [`Value`] is the dynamically typed content of a context slot and of every
//! expression result. [`DynamicObject`] is an opaque host object with
//! observable string attributes; it is what dynamic bindings key on.

use crate::context::hub::{EventHub, ListenerId};
use crate::context::Context;
use crate::error::{FlowError, Result};
use crate::numeric::{truthy, Array, DType};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Value bound to a name in a context.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Array),
    List(Vec<Value>),
    /// A nested context (sub-context binding)
    Context(Context),
    /// A host object taking part in dynamic binding
    Object(DynamicObject),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::List(_) => "list",
            Value::Context(_) => "context",
            Value::Object(_) => "object",
        }
    }

    /// Identity comparison used by the event merge rules.
    ///
    /// Arrays, contexts and objects compare by pointer; plain values by value.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Context(a), Value::Context(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_same(y))
            }
            _ => self == other,
        }
    }

    /// True for arrays of rank ≥ 1, the only values that become context items.
    pub fn is_array_data(&self) -> bool {
        matches!(self, Value::Array(a) if a.is_pipeline_data())
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&Context> {
        match self {
            Value::Context(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&DynamicObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric scalar view (bools and ints widen; one-element arrays unwrap).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Array(a) if a.ndim() == 0 => a.as_scalar(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Coerce to an array: scalars become rank-0 arrays, numeric lists 1-D.
    pub fn to_array(&self) -> Result<Array> {
        match self {
            Value::Array(a) => Ok(a.clone()),
            Value::Bool(b) => Ok(Array::scalar(if *b { 1.0 } else { 0.0 }).with_dtype(DType::Bool)),
            Value::Int(i) => Ok(Array::scalar(*i as f64).with_dtype(DType::Int)),
            Value::Float(f) => Ok(Array::scalar(*f)),
            Value::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut dtype = DType::Bool;
                for item in items {
                    let v = item.as_f64().ok_or_else(|| {
                        FlowError::eval(format!("cannot convert {} to a number", item.type_name()))
                    })?;
                    dtype = dtype.promote(match item {
                        Value::Bool(_) => DType::Bool,
                        Value::Int(_) => DType::Int,
                        _ => DType::Float,
                    });
                    values.push(v);
                }
                Ok(Array::from_vec(values).with_dtype(if items.is_empty() { DType::Float } else { dtype }))
            }
            other => Err(FlowError::eval(format!(
                "cannot convert {} to an array",
                other.type_name()
            ))),
        }
    }

    /// Python-style truthiness. Arrays are truthy only when every element is.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => truthy(*f),
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => a.all(),
            Value::List(l) => !l.is_empty(),
            Value::Context(_) | Value::Object(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Context(a), Value::Context(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (a, b) => match (a.scalar_f64(), b.scalar_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl Value {
    fn scalar_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => self.as_f64(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Array(a) => write!(f, "{a:?}"),
            Value::Context(c) => write!(f, "Context({})", c.name()),
            Value::Object(o) => write!(f, "{o:?}"),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => write!(f, "'{s}'"),
            Value::Array(a) => write!(f, "{a}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Context(c) => write!(f, "<context {}>", c.name()),
            Value::Object(o) => write!(f, "{o:?}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(Array::from_vec(v))
    }
}

impl From<Context> for Value {
    fn from(v: Context) -> Self {
        Value::Context(v)
    }
}

impl From<DynamicObject> for Value {
    fn from(v: DynamicObject) -> Self {
        Value::Object(v)
    }
}

// ==================== Dynamic Objects ====================

/// Emitted when an attribute of a [`DynamicObject`] changes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChanged {
    pub attr: String,
    pub old: Option<String>,
    pub new: String,
}

struct ObjectInner {
    kind: String,
    attrs: RefCell<BTreeMap<String, String>>,
    changed: EventHub<AttributeChanged>,
}

/// Host object with observable string attributes.
///
/// Clones share identity; equality is pointer identity.
#[derive(Clone)]
pub struct DynamicObject(Rc<ObjectInner>);

impl DynamicObject {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(Rc::new(ObjectInner {
            kind: kind.into(),
            attrs: RefCell::new(BTreeMap::new()),
            changed: EventHub::new("object.attribute_changed"),
        }))
    }

    pub fn with_attr(self, attr: &str, value: impl Into<String>) -> Self {
        self.0
            .attrs
            .borrow_mut()
            .insert(attr.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn attr(&self, attr: &str) -> Option<String> {
        self.0.attrs.borrow().get(attr).cloned()
    }

    /// Set an attribute and notify observers if the value changed.
    pub fn set_attr(&self, attr: &str, value: impl Into<String>) {
        let value = value.into();
        let old = self
            .0
            .attrs
            .borrow_mut()
            .insert(attr.to_string(), value.clone());
        if old.as_deref() == Some(value.as_str()) {
            return;
        }
        self.0.changed.emit(&AttributeChanged {
            attr: attr.to_string(),
            old,
            new: value,
        });
    }

    pub fn on_change(&self, listener: impl Fn(&AttributeChanged) -> Result<()> + 'static) -> ListenerId {
        self.0.changed.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.0.changed.unsubscribe(id)
    }

    pub fn ptr_eq(&self, other: &DynamicObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DynamicObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicObject")
            .field("kind", &self.0.kind)
            .field("attrs", &self.0.attrs.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_identity_vs_equality() {
        let a = Array::from_vec(vec![1.0, 2.0]);
        let b = Array::from_vec(vec![1.0, 2.0]);
        assert_eq!(Value::from(a.clone()), Value::from(b.clone()));
        assert!(!Value::from(a.clone()).is_same(&Value::from(b)));
        assert!(Value::from(a.clone()).is_same(&Value::from(a)));
        assert!(Value::Int(3).is_same(&Value::Float(3.0)));
    }

    #[test]
    fn test_list_to_array() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let array = list.to_array().unwrap();
        assert_eq!(array.dtype(), DType::Int);
        assert_eq!(array.to_vec(), vec![1.0, 2.0]);
        assert!(Value::from("x").to_array().is_err());
    }

    #[test]
    fn test_scalars_are_not_array_data() {
        assert!(!Value::Array(Array::scalar(1.0)).is_array_data());
        assert!(Value::from(vec![1.0]).is_array_data());
    }

    #[test]
    fn test_object_notifies_only_on_change() {
        let obj = DynamicObject::new("well").with_attr("name", "w1");
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        obj.on_change(move |change| {
            assert_eq!(change.attr, "name");
            count_clone.set(count_clone.get() + 1);
            Ok(())
        });
        obj.set_attr("name", "w1");
        obj.set_attr("name", "w2");
        assert_eq!(count.get(), 1);
        assert_eq!(obj.attr("name").as_deref(), Some("w2"));
    }
}
