//! Numeric capability used by the context pipeline.
//!
//! The pipeline only relies on a small capability set: shape, dtype,
//! elementwise binary operations, `take`, `compress` and `put`. [`Array`]
//! provides it over `ndarray`; [`UnitAdapter`] converts between unit tags.

pub mod array;
pub mod units;

pub use array::{truthy, Array};
pub use units::{ScaleUnits, UnitAdapter};

use serde::{Deserialize, Serialize};

/// Element type tag. Storage is always `f64`; the tag drives promotion and
/// display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum DType {
    Bool,
    Int,
    #[default]
    Float,
}

impl DType {
    /// Wider of the two types (bool < int < float).
    pub fn promote(self, other: DType) -> DType {
        self.max(other)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::Bool => write!(f, "bool"),
            DType::Int => write!(f, "int64"),
            DType::Float => write!(f, "float64"),
        }
    }
}

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        let flag = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::FloorDiv => (a / b).floor(),
            BinaryOp::Mod => a - b * (a / b).floor(),
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Lt => flag(a < b),
            BinaryOp::Le => flag(a <= b),
            BinaryOp::Gt => flag(a > b),
            BinaryOp::Ge => flag(a >= b),
            BinaryOp::Eq => flag(a == b),
            BinaryOp::Ne => flag(a != b),
            BinaryOp::And => flag(truthy(a) && truthy(b)),
            BinaryOp::Or => flag(truthy(a) || truthy(b)),
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn result_dtype(self, lhs: DType, rhs: DType) -> DType {
        if self.is_comparison() || self.is_logical() {
            return DType::Bool;
        }
        match self {
            BinaryOp::Div => DType::Float,
            BinaryOp::Pow if rhs == DType::Float => DType::Float,
            _ => lhs.promote(rhs).max(DType::Int),
        }
    }

    /// Additive operators keep the operands' unit tag.
    pub fn keeps_units(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mod)
    }

    /// Source spelling of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}
