// src/exec/process.rs

//! Worker processes spawned from the `testherd` binary itself.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::{Result, TestherdError};

use super::backend::{WorkerConnection, WorkerEvent, WorkerLauncher, pump};

/// Launches `<program> worker` and speaks JSON lines over its stdio.
///
/// The worker's stderr carries its own log output and is forwarded at debug
/// level.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launcher re-invoking the currently running executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        worker_index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerConnection>> + Send + '_>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.program);
            cmd.arg("worker")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|e| {
                TestherdError::WorkerLaunch(format!(
                    "spawning '{} worker': {e}",
                    self.program.display()
                ))
            })?;

            let pid = child.id();
            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(TestherdError::WorkerLaunch(
                    "worker process has no stdio pipes".to_string(),
                ));
            };

            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stderr);
                    let mut buf = Vec::new();
                    loop {
                        buf.clear();
                        match reader.read_until(b'\n', &mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                let line = String::from_utf8_lossy(&buf);
                                debug!(worker_index, "worker: {}", line.trim_end());
                            }
                        }
                    }
                });
            }

            info!(worker_index, pid, "worker process started");

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                pump(worker_index, stdout, stdin, cmd_rx, &evt_tx, || {
                    if let Err(err) = child.start_kill() {
                        debug!(worker_index, error = %err, "failed to kill worker process");
                    }
                })
                .await;

                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(err) => {
                        debug!(worker_index, error = %err, "waiting for worker failed");
                        None
                    }
                };
                info!(worker_index, ?code, "worker process exited");
                let _ = evt_tx.send(WorkerEvent::Exited { code });
            });

            Ok(WorkerConnection {
                pid,
                commands: cmd_tx,
                events: evt_rx,
            })
        })
    }
}
