// src/exec/in_process.rs

//! Workers running on the host's own runtime.
//!
//! Same protocol and same test execution as a worker process, minus the
//! process boundary: handy when the host binary cannot re-invoke itself, and
//! in tests.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::worker::run_worker;

use super::backend::{WorkerConnection, WorkerEvent, WorkerLauncher, pump};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher;

impl InProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(
        &self,
        worker_index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerConnection>> + Send + '_>> {
        Box::pin(async move {
            let (host_side, worker_side) = tokio::io::duplex(PIPE_CAPACITY);
            let (worker_read, worker_write) = tokio::io::split(worker_side);
            let (host_read, host_write) = tokio::io::split(host_side);

            let worker = tokio::spawn(async move {
                if let Err(err) = run_worker(worker_read, worker_write).await {
                    warn!(worker_index, error = %err, "in-process worker failed");
                    return Some(1);
                }
                Some(0)
            });
            let abort = worker.abort_handle();

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                pump(worker_index, host_read, host_write, cmd_rx, &evt_tx, || abort.abort()).await;

                let code = worker.await.unwrap_or_else(|err| {
                    debug!(worker_index, error = %err, "in-process worker aborted");
                    None
                });
                let _ = evt_tx.send(WorkerEvent::Exited { code });
            });

            Ok(WorkerConnection {
                pid: None,
                commands: cmd_tx,
                events: evt_rx,
            })
        })
    }
}
