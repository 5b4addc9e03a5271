// src/worker/command.rs

//! Running one shell command on behalf of a test or fixture.

use std::collections::VecDeque;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::WorkerMessage;
use crate::types::{TestError, TestId};

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Consecutive read failures tolerated before a child stream is abandoned.
const MAX_READ_ERRORS: u32 = 16;

/// Where a command's output should be attributed.
#[derive(Debug, Clone)]
pub struct CommandContext<'a> {
    pub test_id: Option<&'a TestId>,
    pub env: &'a [(&'static str, String)],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Error describing a non-successful run, `None` on success.
    pub fn error(&self, what: &str) -> Option<TestError> {
        let message = match self.exit_code {
            Some(0) => return None,
            Some(code) => format!("{what} exited with code {code}"),
            None => format!("{what} was terminated by a signal"),
        };
        let err = TestError::new(message);
        Some(if self.stderr_tail.is_empty() {
            err
        } else {
            err.with_details(self.stderr_tail.clone())
        })
    }
}

/// Run `cmd` through the platform shell, streaming its output as
/// `stdout` / `stderr` messages.
///
/// The child is killed if the returned future is dropped.
pub async fn run_shell(
    cmd: &str,
    ctx: CommandContext<'_>,
    out: &mpsc::UnboundedSender<WorkerMessage>,
) -> Result<CommandOutcome> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .envs(ctx.env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group: a terminal Ctrl-C reaches the host, which decides
    // how the worker stops its children.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning '{cmd}'"))?;
    debug!(cmd, pid = child.id(), "command started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let test_id = ctx.test_id.cloned();
    let forward_stdout = forward(stdout, out, test_id.clone(), Stream::Stdout);
    let forward_stderr = forward(stderr, out, test_id, Stream::Stderr);

    let (_, tail, status) = tokio::join!(forward_stdout, forward_stderr, child.wait());
    let status = status.with_context(|| format!("waiting for '{cmd}'"))?;

    info!(cmd, exit_code = ?status.code(), "command finished");
    Ok(CommandOutcome {
        exit_code: status.code(),
        stderr_tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
    })
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward a child stream line by line; returns the last lines seen.
///
/// Reads until EOF so the child never sees a closed pipe. Bytes that are not
/// UTF-8 are replaced rather than ending the stream.
async fn forward<R: AsyncRead + Unpin>(
    stream: Option<R>,
    out: &mpsc::UnboundedSender<WorkerMessage>,
    test_id: Option<TestId>,
    kind: Stream,
) -> VecDeque<String> {
    let mut tail = VecDeque::new();
    let Some(stream) = stream else {
        return tail;
    };

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut read_errors = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => read_errors = 0,
            Err(err) => {
                debug!(error = %err, "reading child output");
                read_errors += 1;
                if read_errors > MAX_READ_ERRORS {
                    break;
                }
                if buf.is_empty() {
                    continue;
                }
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.strip_suffix('\n').unwrap_or(&text);
        let line = line.strip_suffix('\r').unwrap_or(line);
        let chunk = format!("{line}\n");
        let message = match kind {
            Stream::Stdout => WorkerMessage::Stdout {
                test_id: test_id.clone(),
                chunk,
            },
            Stream::Stderr => {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
                WorkerMessage::Stderr {
                    test_id: test_id.clone(),
                    chunk,
                }
            }
        };
        let _ = out.send(message);
    }
    tail
}
