//! Context pipeline: stages stacked on a root context.
//!
//! Every stage is itself a [`NumericContext`](crate::context::NumericContext),
//! so stages chain. Data stays in the root; stages transform reads and
//! writes on the way through and re-publish upstream events.
//!
//! # Architecture
//!
//! ```text
//! [Context] ──► [Reduction] ──► [Mapping] ──► [Cached] ──► consumer
//!     ▲              │ filter
//!     └──── writes ──┘
//! ```
//!
//! # Design
//!
//! - **Single-threaded**: stages share `Rc` handles and hold `Weak` back
//!   references in their listeners, so a dropped stage goes quiet.
//! - **Lazy views**: a filtering stage evaluates its filter on first read
//!   after an upstream change, not on the change itself.
//! - **Host-driven time**: deferred and traits stages never sleep; a
//!   [`Scheduler`] runs their flushes.

mod builder;
mod scheduler;
mod stage;

pub use builder::ContextPipeline;
pub use scheduler::{EventLoop, ManualScheduler, Scheduler, Task, TaskId};
pub use stage::{Stage, StageKind, TraitChanged};

#[cfg(test)]
pub use scheduler::MockScheduler;
