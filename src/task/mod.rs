//! Task module - the registry's view of a dispatched unit of work.
//!
//! The orchestrator only observes tasks; the substrate (the worker side)
//! is the one that moves them through their lifecycle:
//! - All transitions go through [`TaskState::can_transition_to`]
//! - Terminal states (`DONE`, `ERROR`, `CANCELLED`) are never left

pub mod task;
mod registry;

pub use registry::{InMemoryTaskRegistry, SharedTaskRegistry, TaskRegistry, TaskUpdate};
pub use task::{StacktraceItem, Task, TaskError, TaskId, TaskResult, TaskState};
