//! Statement kinds of a block and their source rendering.

use super::ast::{Expr, Literal};
use std::collections::BTreeSet;

/// Value bound to a function-call input: a literal or a name reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Literal(Literal),
    Name(String),
}

impl Binding {
    pub fn render(&self) -> String {
        match self {
            Binding::Literal(lit) => lit.to_string(),
            Binding::Name(name) => name.clone(),
        }
    }

    pub fn to_expr(&self) -> Expr {
        match self {
            Binding::Literal(lit) => Expr::Literal(lit.clone()),
            Binding::Name(name) => Expr::Name(name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputArg {
    pub name: String,
    pub binding: Binding,
    /// Rendered as `name=binding` instead of positionally
    pub keyword: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputArg {
    pub name: String,
    /// Variable receiving the output
    pub binding: String,
}

/// `out1, out2 = function(in1, key=in2)` with literal or name arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: String,
    pub inputs: Vec<InputArg>,
    pub outputs: Vec<OutputArg>,
}

impl FunctionCall {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Add a positional input.
    pub fn arg(mut self, binding: Binding) -> Self {
        let name = match &binding {
            Binding::Name(name) => name.clone(),
            Binding::Literal(_) => format!("arg{}", self.inputs.len()),
        };
        self.inputs.push(InputArg {
            name,
            binding,
            keyword: false,
        });
        self
    }

    /// Add a keyword input.
    pub fn kwarg(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.inputs.push(InputArg {
            name: name.into(),
            binding,
            keyword: true,
        });
        self
    }

    pub fn output(mut self, binding: impl Into<String>) -> Self {
        let binding = binding.into();
        self.outputs.push(OutputArg {
            name: binding.clone(),
            binding,
        });
        self
    }

    pub fn input_names(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .filter_map(|input| match &input.binding {
                Binding::Name(name) => Some(name.clone()),
                Binding::Literal(_) => None,
            })
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.binding.clone()).collect()
    }

    pub fn render(&self) -> String {
        let args: Vec<String> = self
            .inputs
            .iter()
            .map(|input| {
                if input.keyword {
                    format!("{}={}", input.name, input.binding.render())
                } else {
                    input.binding.render()
                }
            })
            .collect();
        let call = format!("{}({})", self.function, args.join(", "));
        if self.outputs.is_empty() {
            call
        } else {
            format!("{} = {call}", self.output_names().join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneralKind {
    Assign { targets: Vec<String>, value: Expr },
    Expr(Expr),
    /// Construct outside the supported language, kept verbatim
    Raw,
}

/// Statement that is not a simple function call. Renders verbatim.
#[derive(Debug, Clone)]
pub struct GeneralExpression {
    pub source: String,
    pub line: usize,
    pub kind: GeneralKind,
}

impl PartialEq for GeneralExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.kind == other.kind
    }
}

impl GeneralExpression {
    pub fn inputs(&self) -> BTreeSet<String> {
        match &self.kind {
            GeneralKind::Assign { value, .. } => value.names(),
            GeneralKind::Expr(expr) => expr.names(),
            GeneralKind::Raw => BTreeSet::new(),
        }
    }

    pub fn outputs(&self) -> BTreeSet<String> {
        match &self.kind {
            GeneralKind::Assign { targets, .. } => targets.iter().cloned().collect(),
            _ => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopHeader {
    pub variable: String,
    pub iterable: Expr,
}

/// Nested statements, optionally run once per item of a loop.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallGroup {
    pub header: Option<LoopHeader>,
    pub statements: Vec<Statement>,
}

impl FunctionCallGroup {
    pub fn plain(statements: Vec<Statement>) -> Self {
        Self {
            header: None,
            statements,
        }
    }

    pub fn inputs(&self) -> BTreeSet<String> {
        let mut inputs = BTreeSet::new();
        let mut produced = BTreeSet::new();
        for statement in &self.statements {
            inputs.extend(statement.inputs().difference(&produced).cloned());
            produced.extend(statement.outputs());
        }
        if let Some(header) = &self.header {
            inputs.remove(&header.variable);
            inputs.extend(header.iterable.names());
        }
        inputs
    }

    pub fn outputs(&self) -> BTreeSet<String> {
        let mut outputs: BTreeSet<String> =
            self.statements.iter().flat_map(Statement::outputs).collect();
        if let Some(header) = &self.header {
            outputs.remove(&header.variable);
        }
        outputs
    }

    pub fn render(&self) -> String {
        match &self.header {
            None => self
                .statements
                .iter()
                .map(Statement::render)
                .collect::<Vec<_>>()
                .join("\n"),
            Some(header) => {
                let mut out = format!(
                    "for {} in {}:",
                    header.variable,
                    header.iterable.render()
                );
                for statement in &self.statements {
                    for line in statement.render().lines() {
                        out.push_str("\n    ");
                        out.push_str(line);
                    }
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Call(FunctionCall),
    General(GeneralExpression),
    Group(FunctionCallGroup),
}

impl Statement {
    pub fn inputs(&self) -> BTreeSet<String> {
        match self {
            Statement::Call(call) => call.input_names(),
            Statement::General(general) => general.inputs(),
            Statement::Group(group) => group.inputs(),
        }
    }

    pub fn outputs(&self) -> BTreeSet<String> {
        match self {
            Statement::Call(call) => call.output_names().into_iter().collect(),
            Statement::General(general) => general.outputs(),
            Statement::Group(group) => group.outputs(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Statement::Call(call) => call.render(),
            Statement::General(general) => general.source.clone(),
            Statement::Group(group) => group.render(),
        }
    }

    /// First rendered line, used to identify the statement in errors.
    pub fn label(&self) -> String {
        self.render().lines().next().unwrap_or_default().to_string()
    }
}

/// One `import` line of a block preamble.
#[derive(Debug, Clone, PartialEq)]
pub enum Import {
    /// `import module [as alias]`
    Module { module: String, alias: String },
    /// `from module import name [as alias]`
    Symbol {
        module: String,
        name: String,
        alias: String,
    },
}

/// A `def` compiled into assignments plus an optional return expression.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFunction {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<(Vec<String>, Expr)>,
    pub result: Option<Expr>,
}

/// Imports and definitions retained verbatim ahead of the statements.
#[derive(Debug, Clone, PartialEq)]
pub enum PreambleItem {
    Import {
        source: String,
        imports: Vec<Import>,
    },
    Def {
        source: String,
        name: String,
        /// `None` when the body uses unsupported constructs
        function: Option<LocalFunction>,
    },
}

impl PreambleItem {
    pub fn source(&self) -> &str {
        match self {
            PreambleItem::Import { source, .. } | PreambleItem::Def { source, .. } => source,
        }
    }
}
