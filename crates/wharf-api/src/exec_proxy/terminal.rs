//! Terminal session negotiation
//!
//! Decides whether a session runs as an interactive terminal (raw mode) and
//! derives the remote stream options from that decision. In raw mode stdout
//! and stderr share one channel, and terminal sizes reported by the client are
//! forwarded to the remote process by a watcher task.

use futures::channel::mpsc;
use futures::SinkExt;
use kube::api::{AttachParams, TerminalSize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::params::ExecDescriptor;

/// Sender half of a size queue, fed by the duplex reader
pub type SizeSender = watch::Sender<Option<TerminalSize>>;

/// Terminal sizes reported by the client.
///
/// Only the latest size matters, so this is backed by a watch channel: the
/// first call to [`SizeQueue::next`] yields the current size (if any), later
/// calls wait for changes.
#[derive(Debug)]
pub struct SizeQueue {
    rx: watch::Receiver<Option<TerminalSize>>,
    started: bool,
}

impl SizeQueue {
    /// Create a queue and the sender that feeds it
    pub fn channel() -> (SizeSender, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx, started: false })
    }

    /// Next size to apply; `None` once the sender is gone
    pub async fn next(&mut self) -> Option<TerminalSize> {
        if !self.started {
            self.started = true;
            if let Some(size) = self.latest() {
                return Some(size);
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            if let Some(size) = self.latest() {
                return Some(size);
            }
        }
    }

    fn latest(&mut self) -> Option<TerminalSize> {
        self.rx
            .borrow_and_update()
            .as_ref()
            .map(|s| TerminalSize {
                width: s.width,
                height: s.height,
            })
    }
}

/// Negotiated shape of a session's terminal
#[derive(Debug)]
pub struct TerminalState {
    /// Interactive terminal: unbuffered input, merged output
    pub raw: bool,
    /// Input is forwarded to the remote process
    pub stdin: bool,
    /// Remote stdout is attached
    pub stdout: bool,
    /// Remote stderr is attached as a separate channel
    pub stderr: bool,
    size_source: Option<SizeQueue>,
}

impl TerminalState {
    /// Take the size source (present only in raw mode)
    pub fn take_size_source(&mut self) -> Option<SizeQueue> {
        self.size_source.take()
    }

    /// Whether a size source is still attached
    pub fn has_size_source(&self) -> bool {
        self.size_source.is_some()
    }

    /// Options for opening the remote exec stream
    pub fn stream_options(&self, container: &str, command: &[String]) -> ExecStreamOptions {
        ExecStreamOptions {
            container: container.to_string(),
            command: command.to_vec(),
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.raw,
        }
    }
}

/// Options for the remote exec stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecStreamOptions {
    /// Target container
    pub container: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Open a stdin stream
    pub stdin: bool,
    /// Open a stdout stream
    pub stdout: bool,
    /// Open a separate stderr stream
    pub stderr: bool,
    /// Allocate a TTY
    pub tty: bool,
}

impl ExecStreamOptions {
    /// Convert to kube AttachParams
    pub fn attach_params(&self) -> AttachParams {
        AttachParams {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.tty,
            container: Some(self.container.clone()),
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        }
    }
}

/// Decide the terminal shape for an exec session.
///
/// Without stdin there is no interactive terminal, whatever `tty` says. With
/// stdin and tty the session is raw: output is merged onto one channel and
/// `sizes` is kept for the size watcher. Otherwise `sizes` is dropped.
pub fn negotiate(descriptor: &ExecDescriptor, sizes: SizeQueue) -> TerminalState {
    let raw = descriptor.stdin && descriptor.tty;
    TerminalState {
        raw,
        stdin: descriptor.stdin,
        stdout: descriptor.stdout,
        stderr: descriptor.stderr && !raw,
        size_source: raw.then_some(sizes),
    }
}

/// Forward sizes to the remote stream until the source ends, the remote side
/// hangs up, or `cancel` fires
pub fn spawn_size_watcher(
    mut sizes: SizeQueue,
    mut resize: mpsc::Sender<TerminalSize>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let size = tokio::select! {
                _ = cancel.cancelled() => break,
                size = sizes.next() => size,
            };
            let Some(size) = size else { break };

            debug!(width = size.width, height = size.height, "Forwarding terminal resize");
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = resize.send(size) => sent,
            };
            if sent.is_err() {
                break;
            }
        }
        debug!("Terminal size watcher stopped");
    })
}
