// src/tasks/mod.rs

//! The invocation pipeline.
//!
//! - [`runner`] is the generic step executor with a rollback stack.
//! - [`context`] holds the state the steps share.
//! - [`builtin`] contains the steps a run (or a listing) is assembled from.

pub mod builtin;
pub mod context;
pub mod runner;

pub use context::RunContext;
pub use runner::{
    BoxFuture, RunLimits, Task, TaskFailure, TaskRunReport, TaskRunner, TaskRunnerStatus,
    Teardown,
};
