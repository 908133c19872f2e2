//! Plumbing for adapters that stream a child process's stdout.
//!
//! Every spawned child is owned by a reaper task that waits for it to exit,
//! collects stderr and reports the outcome on a oneshot channel. The reader
//! handed to callers holds a cancellation guard: dropping the reader, even
//! halfway through, kills the child and lets the reaper collect it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// How a child process ended.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr: String,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None => "killed by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        }
    }
}

/// Hand `child` to a background task that reaps it.
///
/// The child is killed when `cancel` fires or after `deadline`, whichever
/// comes first; otherwise it is left to finish on its own.
pub fn spawn_reaper(
    mut child: Child,
    label: String,
    cancel: CancellationToken,
    deadline: Duration,
) -> oneshot::Receiver<ExitReport> {
    let (tx, rx) = oneshot::channel();
    let stderr = child.stderr.take();

    tokio::spawn(async move {
        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    debug!(command = %label, "Killing cancelled subprocess");
                    let _ = child.start_kill();
                    child.wait().await
                }
                _ = tokio::time::sleep(deadline) => {
                    warn!(command = %label, ?deadline, "Subprocess exceeded its deadline, killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        };
        let (status, stderr) = tokio::join!(wait, drain(stderr));

        let report = match status {
            Ok(status) => ExitReport {
                success: status.success(),
                code: status.code(),
                stderr,
            },
            Err(e) => ExitReport {
                success: false,
                code: None,
                stderr: format!("failed to wait for subprocess: {}", e),
            },
        };
        // The receiver is gone when the reader was dropped early.
        let _ = tx.send(report);
    });

    rx
}

async fn drain(stderr: Option<ChildStderr>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A subprocess's stdout as an [`AsyncRead`].
///
/// Bytes already pulled off the pipe (to prove the process started
/// delivering) are replayed first. At end of stream the exit status is
/// checked: a non-zero exit after partial output surfaces as an error
/// instead of a silently truncated object.
pub struct ProcessReader {
    prefix: Bytes,
    stdout: ChildStdout,
    exit: Option<oneshot::Receiver<ExitReport>>,
    stdout_done: bool,
    _kill_on_drop: DropGuard,
}

impl ProcessReader {
    pub fn new(
        prefix: Bytes,
        stdout: ChildStdout,
        exit: oneshot::Receiver<ExitReport>,
        guard: DropGuard,
    ) -> Self {
        Self {
            prefix,
            stdout,
            exit: Some(exit),
            stdout_done: false,
            _kill_on_drop: guard,
        }
    }
}

impl AsyncRead for ProcessReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        if !this.stdout_done {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
            if buf.filled().len() > before || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            this.stdout_done = true;
        }

        let Some(exit) = this.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let outcome = ready!(Pin::new(exit).poll(cx));
        this.exit = None;
        match outcome {
            Ok(report) if report.success => Poll::Ready(Ok(())),
            Ok(report) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("subprocess failed mid-stream: {}", report.describe()),
            ))),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "subprocess reaper went away",
            ))),
        }
    }
}
