//! Error handling for flowbench
//!
//! This module defines the crate-wide error type and a Result alias used by
//! the context pipeline, the block parser and the execution engine.

use thiserror::Error;

/// Main error type for flowbench operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// Structural violations: shape mismatch within a group, bad group
    /// replacement, malformed filter output
    #[error("Numeric context error for '{name}': {message}")]
    NumericContext { name: String, message: String },

    /// Writes to reserved names or lookups of names that are not bound
    #[error("Invalid name '{name}': {message}")]
    InvalidName { name: String, message: String },

    /// Dependency cycle found while sorting or restricting a block
    #[error("Dependency cycle between statements: {}", statements.join(" -> "))]
    Cycle { statements: Vec<String> },

    /// A statement raised during execution
    #[error("Statement '{statement}' failed: {source}")]
    StatementFailed {
        statement: String,
        #[source]
        source: Box<FlowError>,
    },

    /// A name could not be resolved while evaluating an expression
    #[error("Unbound name '{0}'")]
    UnboundName(String),

    /// An evaluated item referenced itself while being computed
    #[error("Recursive definition of '{0}'")]
    RecursiveDefinition(String),

    /// The unit adapter cannot bridge two unit families
    #[error("Cannot convert from '{from}' to '{to}'")]
    InvalidConversion { from: String, to: String },

    /// Errors evaluating a value (type mismatches, bad arguments)
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Source text that could not be parsed
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Import statements that do not resolve against the function registry
    #[error("Cannot import '{name}' from '{module}'")]
    Import { module: String, name: String },

    /// Errors related to Rhai script compilation and execution
    #[error("Script error: {0}")]
    Script(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        FlowError::Script(err.to_string())
    }

    pub fn numeric(name: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::NumericContext {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::InvalidName {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn eval(message: impl Into<String>) -> Self {
        FlowError::Evaluation(message.into())
    }

    /// Wrap an error raised while running `statement`.
    ///
    /// Unbound names and recursive definitions surface unwrapped so callers
    /// can match on the name directly.
    pub fn statement_failed(statement: impl Into<String>, source: FlowError) -> Self {
        match source {
            FlowError::UnboundName(_)
            | FlowError::RecursiveDefinition(_)
            | FlowError::StatementFailed { .. } => source,
            other => FlowError::StatementFailed {
                statement: statement.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip `WithContext` layers and return the underlying error.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::WithContext { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for flowbench operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| FlowError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| FlowError::from_rhai_error(e).with_context(f()))
    }
}
