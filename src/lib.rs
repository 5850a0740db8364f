//! # flowbench: reactive numeric contexts and dataflow blocks
//!
//! A scientific-analysis core built from two halves that meet in the
//! [`context::NumericContext`] interface.
//!
//! ## Architecture
//!
//! - **Context**: an observable name → value store holding arrays, scalars,
//!   sub-contexts and evaluated expressions, with shape groups and merged
//!   change events
//! - **Pipeline**: stages stacked on a context that filter, reorder, cache,
//!   select or defer without copying the data
//! - **Filters**: expression, index, NaN, polygon and aggregate filters
//!   producing masks or index lists for the pipeline
//! - **Block**: a parser and executor for Python-style statement blocks
//!   whose dependency graph can be sorted and restricted
//! - **Scripting**: rhai modules exposed to blocks as importable functions
//!
//! ## Configuration
//!
//! Workbench settings live in the platform config directory under
//! `dev.flowbench`; see [`config`].
//!
//! ## Example
//!
//! ```ignore
//! use flowbench::{block::{execute, Block}, context::Context, filter::ExpressionFilter,
//!                 pipeline::ContextPipeline};
//! use std::rc::Rc;
//!
//! let root = Context::new("well");
//! root.set("depth", vec![0.0, 10.0, 20.0, 30.0])?;
//! let pipeline = ContextPipeline::new(root)
//!     .reduction(Some(Rc::new(ExpressionFilter::new("depth > 5")?)), false);
//!
//! let block = Block::parse("import numpy as np\nlog_depth = np.log10(depth)")?;
//! execute(&block, &*pipeline.tail())?;
//! ```

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod numeric;
pub mod pipeline;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use block::{Block, ExecutionReport};
pub use config::{ProjectFile, WorkbenchSettings};
pub use context::{Context, ContextConfig, ContextModified, ContextRef, DictModified, NumericContext};
pub use error::{FlowError, Result, ResultExt};
pub use numeric::{Array, DType};
pub use pipeline::{ContextPipeline, Stage, StageKind};
pub use types::{DynamicObject, Value};
