// src/exec/backend.rs

//! Pluggable worker launcher abstraction.
//!
//! The dispatcher talks to a `WorkerLauncher` instead of spawning processes
//! itself. This makes it easy to swap in a scripted fake in tests while
//! keeping the production transport in [`super::process`].
//!
//! - `ProcessLauncher` runs each worker as a child process speaking
//!   newline-delimited JSON over stdio.
//! - `InProcessLauncher` runs the worker loop on a tokio task over an
//!   in-memory pipe.
//! - Tests can provide their own `WorkerLauncher` that answers `Run` messages
//!   directly with canned `WorkerMessage`s.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::protocol::{HostMessage, WorkerMessage, decode_line, encode_line};
use crate::types::TestError;

/// Instruction from the dispatcher to a worker transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Send(HostMessage),
    /// Terminate the worker without waiting for it to cooperate.
    Kill,
}

/// Something that happened on a worker transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// The transport closed. Always the last event of a connection.
    Exited { code: Option<i32> },
}

/// Live connection to a launched worker.
///
/// Dropping `commands` kills the worker.
#[derive(Debug)]
pub struct WorkerConnection {
    pub pid: Option<u32>,
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Trait abstracting how worker processes come into existence.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        worker_index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerConnection>> + Send + '_>>;
}

/// Shuttle messages between a byte transport and the typed channels until the
/// worker's output stream closes.
///
/// `kill` is invoked on [`WorkerCommand::Kill`] and when the command channel
/// is dropped. The caller is responsible for sending the final
/// [`WorkerEvent::Exited`].
pub(crate) async fn pump<R, W>(
    worker_index: usize,
    reader: R,
    writer: W,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    mut kill: impl FnMut() + Send,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut writer = Some(writer);
    let mut commands_open = true;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let message = match decode_line::<WorkerMessage>(&line) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(worker_index, error = %err, "undecodable worker message");
                            WorkerMessage::FatalError {
                                error: TestError::new(format!("Malformed worker message: {err}"))
                                    .with_details(line),
                            }
                        }
                    };
                    let _ = events.send(WorkerEvent::Message(message));
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(worker_index, error = %err, "worker output stream failed");
                    break;
                }
            },

            cmd = commands.recv(), if commands_open => match cmd {
                Some(WorkerCommand::Send(message)) => {
                    let Some(w) = writer.as_mut() else { continue };
                    let written = async {
                        let line = encode_line(&message).map_err(std::io::Error::other)?;
                        w.write_all(line.as_bytes()).await?;
                        w.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        debug!(worker_index, error = %err, "failed to write to worker; closing input");
                        writer = None;
                    }
                }
                Some(WorkerCommand::Kill) => {
                    debug!(worker_index, "killing worker");
                    kill();
                }
                None => {
                    commands_open = false;
                    writer = None;
                    kill();
                }
            },
        }
    }
}
