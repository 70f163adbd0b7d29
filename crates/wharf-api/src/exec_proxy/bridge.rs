//! Stream bridge between a client WebSocket and a remote exec or log stream
//!
//! Target checks (`prepare_exec`, `prepare_logs`) run before the WebSocket
//! upgrade so failures can still be reported as HTTP errors. Once upgraded,
//! `run_exec_bridge` / `run_log_bridge` copy bytes in both directions until
//! either side ends, then tear everything down and close the socket with the
//! outcome.

use std::fmt::Display;

use axum::extract::ws::Message;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Sink, Stream};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::duplex::{DuplexReader, DuplexWriter};
use super::params::{ExecDescriptor, LogDescriptor};
use super::terminal::{negotiate, spawn_size_watcher, SizeQueue, TerminalState};
use super::websocket::close_code;
use crate::backend::{
    LogStreamOptions, PodBackend, PodTarget, RemoteExecHandle, RemoteReader, RemoteWriter,
};
use crate::error::{Error, Result};

/// Pod phases that can no longer run commands
const COMPLETED_PHASES: [&str; 2] = ["Succeeded", "Failed"];

/// Read size for remote output
const READ_BUFFER_SIZE: usize = 4096;

/// Remote output chunks buffered ahead of the socket
const OUTPUT_QUEUE_SIZE: usize = 64;

/// Client input chunks buffered ahead of the remote stdin
const STDIN_QUEUE_SIZE: usize = 64;

/// Resolved target of an exec session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecTarget {
    /// Container the command runs in
    pub container: String,
}

/// How a bridged session ended
#[derive(Debug)]
pub struct BridgeOutcome {
    /// 200 when the session completed, 500 otherwise
    pub status: StatusCode,
    /// The failure, if any
    pub error: Option<Error>,
}

impl BridgeOutcome {
    /// Outcome for a session result
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                status: StatusCode::OK,
                error: None,
            },
            Err(e) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: Some(e),
            },
        }
    }

    /// Whether the session completed without error
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Check that the pod can run commands and resolve the container
pub async fn prepare_exec(
    backend: &dyn PodBackend,
    descriptor: &ExecDescriptor,
) -> Result<ExecTarget> {
    let pod = backend
        .get_pod(&descriptor.namespace, &descriptor.pod_name)
        .await?;

    if let Some(phase) = pod
        .phase
        .as_deref()
        .filter(|p| COMPLETED_PHASES.contains(p))
    {
        return Err(Error::TargetNotExecutable(phase.to_string()));
    }

    let container = resolve_container(&pod, descriptor.container.as_deref(), &descriptor.pod_name)?;
    Ok(ExecTarget { container })
}

/// Resolve the container for a log session and build the stream options
pub async fn prepare_logs(
    backend: &dyn PodBackend,
    descriptor: &LogDescriptor,
) -> Result<LogStreamOptions> {
    let pod = backend
        .get_pod(&descriptor.namespace, &descriptor.pod_name)
        .await?;
    let container = resolve_container(&pod, descriptor.container.as_deref(), &descriptor.pod_name)?;

    Ok(LogStreamOptions {
        container,
        follow: descriptor.follow,
        timestamps: descriptor.timestamps,
        since: descriptor.since,
    })
}

fn resolve_container(pod: &PodTarget, requested: Option<&str>, pod_name: &str) -> Result<String> {
    match requested {
        Some(name) => Ok(name.to_string()),
        None => pod
            .containers
            .first()
            .cloned()
            .ok_or_else(|| Error::RemoteStream(format!("pod {pod_name} has no containers"))),
    }
}

/// Negotiate the terminal, open the remote exec stream and relay it.
///
/// Runs after the upgrade; a failure to open the stream is reported in the
/// close frame.
pub async fn bridge_exec<R, W, E>(
    backend: &dyn PodBackend,
    reader: DuplexReader<R>,
    mut writer: DuplexWriter<W>,
    sizes: SizeQueue,
    descriptor: &ExecDescriptor,
    target: &ExecTarget,
    cancel: CancellationToken,
) -> BridgeOutcome
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let terminal = negotiate(descriptor, sizes);
    let options = terminal.stream_options(&target.container, &descriptor.command);

    info!(
        namespace = %descriptor.namespace,
        pod = %descriptor.pod_name,
        container = %target.container,
        raw = terminal.raw,
        "Opening exec stream"
    );

    match backend
        .exec(&descriptor.namespace, &descriptor.pod_name, &options)
        .await
    {
        Ok(remote) => run_exec_bridge(reader, writer, remote, terminal, cancel).await,
        Err(e) => {
            cancel.cancel();
            finish(&mut writer, Err(e), "").await
        }
    }
}

/// Open the remote log stream and relay it
pub async fn bridge_logs<R, W, E>(
    backend: &dyn PodBackend,
    reader: DuplexReader<R>,
    mut writer: DuplexWriter<W>,
    descriptor: &LogDescriptor,
    options: &LogStreamOptions,
    cancel: CancellationToken,
) -> BridgeOutcome
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    info!(
        namespace = %descriptor.namespace,
        pod = %descriptor.pod_name,
        container = %options.container,
        follow = options.follow,
        "Opening log stream"
    );

    match backend
        .logs(&descriptor.namespace, &descriptor.pod_name, options)
        .await
    {
        Ok(logs) => run_log_bridge(reader, writer, logs, cancel).await,
        Err(e) => {
            cancel.cancel();
            finish(&mut writer, Err(e), "").await
        }
    }
}

/// Relay an exec session until the remote process exits or the client leaves.
///
/// Output pumps, the stdin pump and the size watcher run as separate tasks so
/// a stalled direction never blocks the other. Every exit path cancels
/// `cancel`, joins those tasks, aborts the remote stream and closes the socket.
pub async fn run_exec_bridge<R, W, E>(
    mut reader: DuplexReader<R>,
    mut writer: DuplexWriter<W>,
    mut remote: RemoteExecHandle,
    mut terminal: TerminalState,
    cancel: CancellationToken,
) -> BridgeOutcome
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let watcher = match (terminal.take_size_source(), remote.resize.take()) {
        (Some(sizes), Some(resize)) => Some(spawn_size_watcher(sizes, resize, cancel.child_token())),
        _ => None,
    };

    let (output_tx, mut output_rx) = mpsc::channel::<Result<Bytes>>(OUTPUT_QUEUE_SIZE);
    let mut pumps = Vec::new();
    for stream in [remote.stdout.take(), remote.stderr.take()].into_iter().flatten() {
        let tx = output_tx.clone();
        let token = cancel.clone();
        pumps.push(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = forward_reader_to_channel(stream, tx) => {}
            }
        }));
    }
    // Drop our copy so the channel closes when the remote output ends
    drop(output_tx);

    let (mut stdin_tx, stdin_pump) = match remote.stdin.take() {
        Some(stdin) => {
            let (tx, rx) = mpsc::channel::<Bytes>(STDIN_QUEUE_SIZE);
            let pump = tokio::spawn(forward_channel_to_writer(rx, stdin, cancel.clone()));
            (Some(tx), Some(pump))
        }
        None => (None, None),
    };
    let mut status = remote.status.take();

    let result: Result<()> = async {
        // client input waiting for room in the stdin queue
        let mut pending: Option<Bytes> = None;
        let mut output_open = true;

        loop {
            let mut stdin_closed = false;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                input = reader.read_chunk(), if pending.is_none() => match input? {
                    Some(data) => {
                        if stdin_tx.is_some() {
                            pending = Some(data);
                        }
                    }
                    None => {
                        debug!("Client disconnected, ending exec session");
                        return Ok(());
                    }
                },

                permit = reserve(&stdin_tx), if pending.is_some() => match permit {
                    Some(permit) => {
                        if let Some(data) = pending.take() {
                            permit.send(data);
                        }
                    }
                    None => {
                        debug!("Remote stdin closed");
                        stdin_closed = true;
                        pending = None;
                    }
                },

                output = output_rx.recv(), if output_open => match output {
                    Some(Ok(data)) => {
                        writer.write(&data).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    // All output streams closed
                    None => {
                        output_open = false;
                        if status.is_none() {
                            return Ok(());
                        }
                    }
                },

                // Client input is still read while waiting, so a disconnect ends the session
                exit = wait_status(&mut status), if !output_open => {
                    return match exit {
                        Some(s) if s.status.as_deref() == Some("Failure") => Err(Error::RemoteStream(
                            s.message.unwrap_or_else(|| "command failed".to_string()),
                        )),
                        _ => Ok(()),
                    };
                }
            }
            if stdin_closed {
                stdin_tx = None;
            }
        }
    }
    .await;

    cancel.cancel();
    if let Some(watcher) = watcher {
        if let Err(e) = watcher.await {
            warn!(error = %e, "Terminal size watcher panicked");
        }
    }
    for pump in pumps {
        let _ = pump.await;
    }
    drop(stdin_tx);
    if let Some(pump) = stdin_pump {
        let _ = pump.await;
    }
    remote.abort();

    finish(&mut writer, result, "exec session ended").await
}

/// Wait for room in the stdin queue; `None` once the stdin pump is gone
async fn reserve(tx: &Option<mpsc::Sender<Bytes>>) -> Option<mpsc::Permit<'_, Bytes>> {
    match tx {
        Some(tx) => tx.reserve().await.ok(),
        None => None,
    }
}

/// Resolve the remote exit status; `None` when the stream reports none
async fn wait_status(status: &mut Option<BoxFuture<'static, Option<Status>>>) -> Option<Status> {
    match status.as_mut() {
        Some(status) => status.await,
        None => None,
    }
}

/// Relay a log stream until it ends or the client leaves
pub async fn run_log_bridge<R, W, E>(
    mut reader: DuplexReader<R>,
    mut writer: DuplexWriter<W>,
    mut logs: RemoteReader,
    cancel: CancellationToken,
) -> BridgeOutcome
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let result: Result<()> = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                input = reader.read_chunk() => {
                    // Log sessions take no input; only a close matters
                    if input?.is_none() {
                        debug!("Client disconnected, ending log session");
                        return Ok(());
                    }
                }

                read = logs.read(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        writer.write(&buf[..n]).await?;
                    }
                    Err(e) => return Err(Error::RemoteStream(e.to_string())),
                },
            }
        }
    }
    .await;

    cancel.cancel();
    drop(logs);

    finish(&mut writer, result, "log stream ended").await
}

/// Close the socket with the session result
async fn finish<W>(writer: &mut DuplexWriter<W>, result: Result<()>, done: &str) -> BridgeOutcome
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match &result {
        Ok(()) => writer.close(close_code::NORMAL, done).await,
        Err(e) => writer.close(close_code::INTERNAL, &e.to_string()).await,
    }
    BridgeOutcome::from_result(result)
}

/// Forward an async reader to a channel
///
/// Reads in 4KB chunks. Stops when the reader is exhausted or the channel
/// closes; a read error is passed on as the last item.
async fn forward_reader_to_channel<R>(mut reader: R, tx: mpsc::Sender<Result<Bytes>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Remote output stream failed");
                let _ = tx.send(Err(Error::RemoteStream(e.to_string()))).await;
                break;
            }
        }
    }
}

/// Write queued client input to the remote stdin until the queue closes,
/// the remote stops accepting input, or `cancel` fires
async fn forward_channel_to_writer(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: RemoteWriter,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = async {
                writer.write_all(&data).await?;
                writer.flush().await
            } => written,
        };
        if let Err(e) = written {
            debug!(error = %e, "Remote stdin closed");
            break;
        }
    }
}
