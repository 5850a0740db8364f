//! Expression tree, rendering and free-name analysis.

use crate::context::NumericContext;
use crate::error::Result;
use crate::numeric::BinaryOp;
use crate::types::Value;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::None => Value::None,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(v) if v.is_finite() => write!(f, "{v:?}"),
            Literal::Float(v) => write!(f, "float('{v}')"),
            Literal::Str(s) => {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('\'', "\\'")
                    .replace('\n', "\\n")
                    .replace('\t', "\\t");
                write!(f, "'{escaped}'")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Plain or dotted name (`depth`, `well.gr`, `np.pi`)
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
}

impl Expr {
    /// Names read by the expression. Called function names are excluded.
    pub fn names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Name(name) => {
                out.insert(name.clone());
            }
            Expr::List(items) | Expr::Tuple(items) => {
                items.iter().for_each(|e| e.collect_names(out));
            }
            Expr::Unary { operand, .. } => operand.collect_names(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_names(out);
                rhs.collect_names(out);
            }
            Expr::Call { args, kwargs, .. } => {
                args.iter().for_each(|e| e.collect_names(out));
                kwargs.iter().for_each(|(_, e)| e.collect_names(out));
            }
            Expr::Index { target, index } => {
                target.collect_names(out);
                index.collect_names(out);
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => binary_precedence(*op),
            Expr::Unary { op: UnaryOp::Not, .. } => 3,
            Expr::Unary { .. } => 7,
            Expr::Literal(Literal::Int(i)) if *i < 0 => 7,
            Expr::Literal(Literal::Float(v)) if v.is_sign_negative() => 7,
            _ => 10,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Expr::Literal(lit) => lit.to_string(),
            Expr::Name(name) => name.clone(),
            Expr::List(items) => format!("[{}]", render_list(items)),
            Expr::Tuple(items) if items.len() == 1 => format!("({},)", items[0].render()),
            Expr::Tuple(items) => format!("({})", render_list(items)),
            Expr::Unary { op, operand } => {
                let inner = wrap(operand, self.precedence(), false);
                match op {
                    UnaryOp::Neg => format!("-{inner}"),
                    UnaryOp::Pos => format!("+{inner}"),
                    UnaryOp::Not => format!("not {inner}"),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let own = self.precedence();
                // `**` is right-associative, everything else left.
                let right_assoc = *op == BinaryOp::Pow;
                let left = wrap(lhs, own, right_assoc);
                let right = wrap(rhs, own, !right_assoc);
                format!("{left} {} {right}", op.symbol())
            }
            Expr::Call {
                function,
                args,
                kwargs,
            } => {
                let mut parts: Vec<String> = args.iter().map(Expr::render).collect();
                parts.extend(kwargs.iter().map(|(k, v)| format!("{k}={}", v.render())));
                format!("{function}({})", parts.join(", "))
            }
            Expr::Index { target, index } => {
                format!("{}[{}]", wrap(target, 10, false), index.render())
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn render_list(items: &[Expr]) -> String {
    items.iter().map(Expr::render).collect::<Vec<_>>().join(", ")
}

fn wrap(expr: &Expr, parent: u8, strict: bool) -> String {
    let own = expr.precedence();
    if own < parent || (strict && own == parent) {
        format!("({})", expr.render())
    } else {
        expr.render()
    }
}

pub(crate) fn binary_precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne => 4,
        BinaryOp::Add | BinaryOp::Sub => 5,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => 6,
        BinaryOp::Pow => 8,
    }
}

/// A compiled standalone expression (filter conditions, evaluated items).
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    expr: Expr,
    names: BTreeSet<String>,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self> {
        let expr = super::parser::parse_expression(source, 1)?;
        let names = expr.names();
        Ok(Self {
            source: source.trim().to_string(),
            expr,
            names,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Names the expression reads.
    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn depends_on<'a>(&self, mut names: impl Iterator<Item = &'a String>) -> bool {
        names.any(|n| self.names.contains(n))
    }

    /// Evaluate against `context` with the builtins module in scope.
    pub fn evaluate(&self, context: &dyn NumericContext) -> Result<Value> {
        let config = context.config();
        let scope = super::eval::Scope::default();
        let evaluator = super::eval::Evaluator::new(&config.functions, &scope, &*config.units);
        evaluator.eval(&self.expr, &super::eval::ContextNamespace::new(context))
    }
}
