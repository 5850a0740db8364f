//! Execution blocks
//!
//! A [`Block`] is parsed from Python-style source into preamble items
//! (imports and `def`s) and statements. Statements form a dataflow graph
//! over variable names ([`graph::DependencyGraph`]) that can be sorted,
//! restricted to an input/output slice, and executed against a context
//! ([`executor`]).
//!
//! Supported statement forms:
//! - `a, b = f(x, key=1.5)` function calls with name or literal arguments
//! - `y = <expression>` and bare expressions
//! - `for v in <expression>:` loops over nested statements
//!
//! Anything else is kept as raw source and fails when executed.

pub mod ast;
pub mod eval;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod lexer;
pub mod library;
pub mod parser;
pub mod statement;

pub use ast::{Expr, Expression, Literal};
pub use executor::{execute, execute_restricted, ExecutionReport};
pub use functions::{CallArgs, Callable, FunctionRegistry, Module};
pub use graph::DependencyGraph;
pub use statement::{
    Binding, FunctionCall, FunctionCallGroup, GeneralExpression, Import, PreambleItem, Statement,
};

use crate::error::{FlowError, Result};
use eval::Scope;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    preamble: Vec<PreambleItem>,
    statements: Vec<Statement>,
}

impl Block {
    pub fn new(preamble: Vec<PreambleItem>, statements: Vec<Statement>) -> Self {
        Self {
            preamble,
            statements,
        }
    }

    pub fn parse(source: &str) -> Result<Self> {
        let parsed = parser::parse_source(source)?;
        Ok(Self::new(parsed.preamble, parsed.statements))
    }

    pub fn preamble(&self) -> &[PreambleItem] {
        &self.preamble
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Source text: preamble, a blank line, then the statements.
    pub fn render(&self) -> String {
        let preamble: Vec<&str> = self.preamble.iter().map(PreambleItem::source).collect();
        let body: Vec<String> = self.statements.iter().map(Statement::render).collect();
        match (preamble.is_empty(), body.is_empty()) {
            (true, _) => body.join("\n"),
            (false, true) => preamble.join("\n"),
            (false, false) => format!("{}\n\n{}", preamble.join("\n"), body.join("\n")),
        }
    }

    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::build(&self.statements)
    }

    /// Names the block reads from its context. Imported names and local
    /// functions are excluded.
    pub fn inputs(&self) -> Result<BTreeSet<String>> {
        let preamble_names = self.preamble_names();
        Ok(self
            .graph()
            .inputs_of()?
            .into_iter()
            .filter(|name| {
                let head = name.split('.').next().unwrap_or(name);
                !preamble_names.contains(head)
            })
            .collect())
    }

    pub fn outputs(&self) -> BTreeSet<String> {
        self.graph().outputs_of()
    }

    fn preamble_names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for item in &self.preamble {
            match item {
                PreambleItem::Import { imports, .. } => {
                    names.extend(imports.iter().map(|import| match import {
                        Import::Module { alias, .. } | Import::Symbol { alias, .. } => alias.as_str(),
                    }));
                }
                PreambleItem::Def { name, .. } => {
                    names.insert(name.as_str());
                }
            }
        }
        names
    }

    pub fn topological_order(&self) -> Result<Vec<usize>> {
        self.graph().topological_order()
    }

    /// Copy with statements in dependency order.
    pub fn sorted(&self) -> Result<Block> {
        let order = self.topological_order()?;
        Ok(self.select(&order))
    }

    /// Sub-block computing `outputs` from `inputs`, in dependency order.
    pub fn restrict(&self, inputs: Option<&BTreeSet<String>>, outputs: Option<&BTreeSet<String>>) -> Result<Block> {
        let order = self.graph().restrict(inputs, outputs)?;
        Ok(self.select(&order))
    }

    fn select(&self, order: &[usize]) -> Block {
        Block::new(
            self.preamble.clone(),
            order.iter().map(|&i| self.statements[i].clone()).collect(),
        )
    }

    /// Resolve the preamble against `registry`.
    pub fn scope(&self, registry: &FunctionRegistry) -> Result<Scope> {
        Scope::from_preamble(&self.preamble, registry)
    }

    /// Append a statement. A statement that would close a cycle is
    /// rejected and the block is left unchanged.
    pub fn add_statement(&mut self, statement: Statement) -> Result<()> {
        self.statements.push(statement);
        if let Err(e) = self.topological_order() {
            self.statements.pop();
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_statement(&mut self, index: usize) -> Result<Statement> {
        self.check_index(index)?;
        Ok(self.statements.remove(index))
    }

    /// Wrap the statements at `indices` into one plain group placed at the
    /// position of the first of them.
    pub fn group(&mut self, indices: &[usize]) -> Result<()> {
        let mut indices: Vec<usize> = indices.to_vec();
        indices.sort_unstable();
        indices.dedup();
        let Some(&first) = indices.first() else {
            return Ok(());
        };
        for &index in &indices {
            self.check_index(index)?;
        }

        let mut grouped = Vec::with_capacity(indices.len());
        for &index in indices.iter().rev() {
            grouped.push(self.statements.remove(index));
        }
        grouped.reverse();
        self.statements
            .insert(first, Statement::Group(FunctionCallGroup::plain(grouped)));
        Ok(())
    }

    /// Replace the group at `index` by its statements.
    pub fn ungroup(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let Statement::Group(group) = &self.statements[index] else {
            return Err(FlowError::eval(format!("statement {index} is not a group")));
        };
        let inner = group.statements.clone();
        self.statements.splice(index..=index, inner);
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.statements.len() {
            return Err(FlowError::eval(format!(
                "statement index {index} out of range for block of {}",
                self.statements.len()
            )));
        }
        Ok(())
    }
}
