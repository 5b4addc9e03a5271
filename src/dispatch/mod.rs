// src/dispatch/mod.rs

//! Worker pool and group scheduling.
//!
//! - [`dispatcher`] owns the pool, the queue and all retry/timeout/crash
//!   policy for one phase.
//! - [`job`] drives one group on one worker and reports back over the
//!   dispatcher's event channel.

pub mod dispatcher;
pub mod job;

pub use dispatcher::{Dispatcher, DispatcherSettings, WORKER_CRASH_MESSAGE};
pub use job::WorkerHandle;
