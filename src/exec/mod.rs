// src/exec/mod.rs

//! Worker transport layer.
//!
//! - [`backend`] provides the `WorkerLauncher` trait and the typed
//!   `WorkerCommand` / `WorkerEvent` channels the dispatcher drives.
//! - [`process`] launches workers as child processes (`testherd worker`)
//!   talking newline-delimited JSON over stdio.
//! - [`in_process`] runs the worker loop on a tokio task over an in-memory
//!   pipe.

pub mod backend;
pub mod in_process;
pub mod process;

pub use backend::{WorkerCommand, WorkerConnection, WorkerEvent, WorkerLauncher};
pub use in_process::InProcessLauncher;
pub use process::ProcessLauncher;
