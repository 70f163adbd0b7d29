//! Bridge tests driven by in-memory sockets and pipes

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::Message;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::TerminalSize;
use mockall::predicate::{always, eq};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::backend::{LogStreamOptions, MockPodBackend, PodTarget, RemoteExecHandle, RemoteReader};
use crate::error::Error;

type Inbound = std::result::Result<Message, axum::Error>;
type TestReader = DuplexReader<mpsc::UnboundedReceiver<Inbound>>;
type TestWriter = DuplexWriter<mpsc::UnboundedSender<Message>>;

/// The browser end of an in-memory WebSocket
struct Client {
    input: mpsc::UnboundedSender<Inbound>,
    output: mpsc::UnboundedReceiver<Message>,
}

impl Client {
    fn send_text(&self, text: &str) {
        self.input
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .unwrap();
    }

    fn send_binary(&self, data: &[u8]) {
        self.input
            .unbounded_send(Ok(Message::Binary(Bytes::copy_from_slice(data))))
            .unwrap();
    }

    fn disconnect(&self) {
        self.input.unbounded_send(Ok(Message::Close(None))).unwrap();
    }

    /// Collect frames up to and including the close frame
    async fn frames(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Some(message) = self.output.next().await {
            let is_close = matches!(message, Message::Close(_));
            frames.push(message);
            if is_close {
                break;
            }
        }
        frames
    }
}

fn socket() -> (Client, TestReader, TestWriter, SizeQueue) {
    let (input, inbound) = mpsc::unbounded();
    let (outbound, output) = mpsc::unbounded();
    let (sizes_tx, sizes) = SizeQueue::channel();
    (
        Client { input, output },
        DuplexReader::new(inbound, sizes_tx),
        DuplexWriter::new(outbound, Duration::from_secs(1)),
        sizes,
    )
}

fn exec_descriptor(stdin: bool, tty: bool) -> ExecDescriptor {
    ExecDescriptor {
        namespace: "default".into(),
        pod_name: "web-1".into(),
        container: None,
        command: vec!["sh".into(), "-c".into(), "echo hi".into()],
        stdin,
        stdout: true,
        stderr: true,
        tty,
    }
}

fn target() -> ExecTarget {
    ExecTarget {
        container: "app".into(),
    }
}

fn status(phase: &str, message: Option<&str>) -> Status {
    Status {
        status: Some(phase.into()),
        message: message.map(str::to_string),
        ..Default::default()
    }
}

fn text_of(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        _ => None,
    }
}

fn close_of(message: Option<&Message>) -> (u16, String) {
    match message {
        Some(Message::Close(Some(frame))) => (frame.code, frame.reason.as_str().to_string()),
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// Remote handle whose stdout is the read end of a pipe
fn remote_with_stdout(stdout: DuplexStream) -> RemoteExecHandle {
    RemoteExecHandle {
        stdout: Some(Box::new(stdout)),
        ..Default::default()
    }
}

fn abort_flag(handle: &mut RemoteExecHandle) -> Arc<AtomicBool> {
    let aborted = Arc::new(AtomicBool::new(false));
    let flag = aborted.clone();
    handle.abort_hook = Some(Box::new(move || flag.store(true, Ordering::SeqCst)));
    aborted
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("bridge should finish promptly")
}

// =============================================================================
// Target checks
// =============================================================================

#[tokio::test]
async fn test_prepare_exec_defaults_to_first_container() {
    let mut backend = MockPodBackend::new();
    backend
        .expect_get_pod()
        .with(eq("default"), eq("web-1"))
        .returning(|_, _| {
            Ok(PodTarget {
                phase: Some("Running".into()),
                containers: vec!["app".into(), "sidecar".into()],
            })
        });

    let target = prepare_exec(&backend, &exec_descriptor(false, false))
        .await
        .unwrap();
    assert_eq!(target.container, "app");
}

#[tokio::test]
async fn test_prepare_exec_keeps_requested_container() {
    let mut backend = MockPodBackend::new();
    backend.expect_get_pod().returning(|_, _| {
        Ok(PodTarget {
            phase: Some("Pending".into()),
            containers: vec!["app".into(), "sidecar".into()],
        })
    });

    let mut descriptor = exec_descriptor(false, false);
    descriptor.container = Some("sidecar".into());
    let target = prepare_exec(&backend, &descriptor).await.unwrap();
    assert_eq!(target.container, "sidecar");
}

#[tokio::test]
async fn test_prepare_exec_rejects_completed_pods() {
    for phase in ["Succeeded", "Failed"] {
        let mut backend = MockPodBackend::new();
        let reported = phase.to_string();
        backend.expect_get_pod().returning(move |_, _| {
            Ok(PodTarget {
                phase: Some(reported.clone()),
                containers: vec!["app".into()],
            })
        });
        backend.expect_exec().never();

        let result = prepare_exec(&backend, &exec_descriptor(true, true)).await;
        match result {
            Err(Error::TargetNotExecutable(p)) => assert_eq!(p, phase),
            other => panic!("expected TargetNotExecutable, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_prepare_exec_pod_without_containers() {
    let mut backend = MockPodBackend::new();
    backend
        .expect_get_pod()
        .returning(|_, _| Ok(PodTarget::default()));

    let result = prepare_exec(&backend, &exec_descriptor(false, false)).await;
    assert!(matches!(result, Err(Error::RemoteStream(_))));
}

#[tokio::test]
async fn test_prepare_logs_allows_completed_pods() {
    let mut backend = MockPodBackend::new();
    backend.expect_get_pod().returning(|_, _| {
        Ok(PodTarget {
            phase: Some("Succeeded".into()),
            containers: vec!["main".into()],
        })
    });

    let descriptor = LogDescriptor {
        namespace: "default".into(),
        pod_name: "job-1".into(),
        container: None,
        follow: true,
        timestamps: true,
        since: None,
    };
    let options = prepare_logs(&backend, &descriptor).await.unwrap();
    assert_eq!(
        options,
        LogStreamOptions {
            container: "main".into(),
            follow: true,
            timestamps: true,
            since: None,
        }
    );
}

// =============================================================================
// Exec sessions
// =============================================================================

#[tokio::test]
async fn test_exec_one_shot_command_completes() {
    let (mut client, reader, writer, sizes) = socket();

    let (mut remote_out, stdout) = tokio::io::duplex(1024);
    remote_out.write_all(b"hi\n").await.unwrap();
    drop(remote_out);

    let mut handle = remote_with_stdout(stdout);
    handle.status = Some(futures::future::ready(Some(status("Success", None))).boxed());
    let aborted = abort_flag(&mut handle);

    let seen = Arc::new(Mutex::new(None));
    let seen_options = seen.clone();
    let mut backend = MockPodBackend::new();
    backend
        .expect_exec()
        .with(eq("default"), eq("web-1"), always())
        .return_once(move |_, _, options| {
            *seen_options.lock().unwrap() = Some(ExecStreamOptions::clone(options));
            Ok(handle)
        });

    let outcome = within(bridge_exec(
        &backend,
        reader,
        writer,
        sizes,
        &exec_descriptor(false, false),
        &target(),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(outcome.status, StatusCode::OK);
    assert!(outcome.is_success());
    assert!(aborted.load(Ordering::SeqCst));

    let options = seen.lock().unwrap().clone().unwrap();
    assert_eq!(options.container, "app");
    assert_eq!(options.command, vec!["sh", "-c", "echo hi"]);
    assert!(!options.stdin && !options.tty && options.stdout && options.stderr);

    let frames = client.frames().await;
    assert_eq!(text_of(&frames[0]), Some("hi\n"));
    assert_eq!(close_of(frames.last()).0, close_code::NORMAL);
}

#[tokio::test]
async fn test_exec_tty_session_forwards_input_and_resizes() {
    let (mut client, reader, writer, sizes) = socket();

    let (mut remote_out, stdout) = tokio::io::duplex(1024);
    let (stdin, mut remote_in) = tokio::io::duplex(1024);
    let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalSize>(4);

    let mut handle = remote_with_stdout(stdout);
    handle.stdin = Some(Box::new(stdin));
    handle.resize = Some(resize_tx);

    let seen = Arc::new(Mutex::new(None));
    let seen_options = seen.clone();
    let mut backend = MockPodBackend::new();
    backend.expect_exec().return_once(move |_, _, options| {
        *seen_options.lock().unwrap() = Some(ExecStreamOptions::clone(options));
        Ok(handle)
    });

    let bridge = tokio::spawn(async move {
        bridge_exec(
            &backend,
            reader,
            writer,
            sizes,
            &exec_descriptor(true, true),
            &target(),
            CancellationToken::new(),
        )
        .await
    });

    // Channel 4, width=80, height=24
    client.send_binary(&[4, 0x50, 0x00, 0x18, 0x00]);
    client.send_text("ls\n");

    let size = within(resize_rx.next()).await.unwrap();
    assert_eq!((size.width, size.height), (80, 24));

    let mut typed = [0u8; 3];
    within(remote_in.read_exact(&mut typed)).await.unwrap();
    assert_eq!(&typed, b"ls\n");

    remote_out.write_all(b"$ ").await.unwrap();
    drop(remote_out);

    let outcome = within(bridge).await.unwrap();
    assert!(outcome.is_success());

    // one merged output channel for a terminal
    let options = seen.lock().unwrap().clone().unwrap();
    assert!(options.tty && options.stdin && !options.stderr);

    // the size watcher has exited and released the resize sender
    assert!(within(resize_rx.next()).await.is_none());

    let frames = client.frames().await;
    assert_eq!(text_of(&frames[0]), Some("$ "));
    assert_eq!(close_of(frames.last()).0, close_code::NORMAL);
}

#[tokio::test]
async fn test_exec_failure_status_closes_with_message() {
    let (mut client, reader, writer, sizes) = socket();

    let (remote_out, stdout) = tokio::io::duplex(1024);
    drop(remote_out);

    let mut handle = remote_with_stdout(stdout);
    handle.status = Some(
        futures::future::ready(Some(status(
            "Failure",
            Some("command terminated with non-zero exit code"),
        )))
        .boxed(),
    );

    let mut backend = MockPodBackend::new();
    backend.expect_exec().return_once(move |_, _, _| Ok(handle));

    let outcome = within(bridge_exec(
        &backend,
        reader,
        writer,
        sizes,
        &exec_descriptor(false, false),
        &target(),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(matches!(outcome.error, Some(Error::RemoteStream(_))));

    let frames = client.frames().await;
    let (code, reason) = close_of(frames.last());
    assert_eq!(code, close_code::INTERNAL);
    assert!(reason.contains("non-zero exit code"), "{reason}");
}

#[tokio::test]
async fn test_exec_open_failure_closes_socket() {
    let (mut client, reader, writer, sizes) = socket();

    let mut backend = MockPodBackend::new();
    backend
        .expect_exec()
        .returning(|_, _, _| Err(Error::RemoteStream("exec failed: forbidden".into())));

    let outcome = within(bridge_exec(
        &backend,
        reader,
        writer,
        sizes,
        &exec_descriptor(true, false),
        &target(),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
    let frames = client.frames().await;
    let (code, reason) = close_of(frames.last());
    assert_eq!(code, close_code::INTERNAL);
    assert!(reason.contains("forbidden"), "{reason}");
}

#[tokio::test]
async fn test_exec_client_disconnect_tears_down_remote() {
    let (client, reader, writer, sizes) = socket();

    // remote output stays open: only the client can end this session
    let (_remote_out, stdout) = tokio::io::duplex(1024);
    let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalSize>(4);
    let mut handle = remote_with_stdout(stdout);
    handle.resize = Some(resize_tx);
    let aborted = abort_flag(&mut handle);

    let mut backend = MockPodBackend::new();
    backend.expect_exec().return_once(move |_, _, _| Ok(handle));

    let cancel = CancellationToken::new();
    let bridge = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            bridge_exec(
                &backend,
                reader,
                writer,
                sizes,
                &exec_descriptor(true, true),
                &target(),
                cancel,
            )
            .await
        }
    });

    client.send_binary(&[4, 0x78, 0x00, 0x28, 0x00]);
    let size = within(resize_rx.next()).await.unwrap();
    assert_eq!((size.width, size.height), (120, 40));

    client.disconnect();
    let outcome = within(bridge).await.unwrap();

    assert!(outcome.is_success());
    assert!(cancel.is_cancelled());
    assert!(aborted.load(Ordering::SeqCst));
    assert!(within(resize_rx.next()).await.is_none());
}

#[tokio::test]
async fn test_exec_client_write_failure_ends_session() {
    let (client, reader, writer, sizes) = socket();
    let Client { input, output } = client;
    drop(output);

    let (mut remote_out, stdout) = tokio::io::duplex(1024);
    let mut handle = remote_with_stdout(stdout);
    let aborted = abort_flag(&mut handle);

    remote_out.write_all(b"lost").await.unwrap();

    let outcome = within(run_exec_bridge(
        reader,
        writer,
        handle,
        negotiate(&exec_descriptor(false, false), sizes),
        CancellationToken::new(),
    ))
    .await;

    assert!(matches!(outcome.error, Some(Error::ConnectionClosed(_))));
    assert!(aborted.load(Ordering::SeqCst));
    drop(input);
}

#[tokio::test]
async fn test_exec_external_cancel_stops_bridge() {
    let (_client, reader, writer, sizes) = socket();
    let (_remote_out, stdout) = tokio::io::duplex(1024);
    let mut handle = remote_with_stdout(stdout);
    let aborted = abort_flag(&mut handle);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = within(run_exec_bridge(
        reader,
        writer,
        handle,
        negotiate(&exec_descriptor(false, false), sizes),
        cancel,
    ))
    .await;

    assert!(outcome.is_success());
    assert!(aborted.load(Ordering::SeqCst));
}

/// Remote output that fails on the first read
struct ResetStream;

impl tokio::io::AsyncRead for ResetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

fn stdin_only_descriptor() -> ExecDescriptor {
    ExecDescriptor {
        stdout: false,
        stderr: false,
        ..exec_descriptor(true, false)
    }
}

#[tokio::test]
async fn test_exec_stdin_only_session_ends_on_client_disconnect() {
    let (client, reader, writer, sizes) = socket();

    let (stdin, mut remote_in) = tokio::io::duplex(1024);
    let mut handle = RemoteExecHandle {
        stdin: Some(Box::new(stdin)),
        status: Some(futures::future::pending::<Option<Status>>().boxed()),
        ..Default::default()
    };
    let aborted = abort_flag(&mut handle);

    let bridge = tokio::spawn(run_exec_bridge(
        reader,
        writer,
        handle,
        negotiate(&stdin_only_descriptor(), sizes),
        CancellationToken::new(),
    ));

    client.send_text("hello\n");
    let mut received = [0u8; 6];
    within(remote_in.read_exact(&mut received)).await.unwrap();
    assert_eq!(&received, b"hello\n");

    client.disconnect();
    let outcome = within(bridge).await.unwrap();

    assert!(outcome.is_success());
    assert!(aborted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_exec_stdin_only_session_ends_with_exit_status() {
    let (mut client, reader, writer, sizes) = socket();

    let (stdin, _remote_in) = tokio::io::duplex(1024);
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<Status>();
    let handle = RemoteExecHandle {
        stdin: Some(Box::new(stdin)),
        status: Some(async move { exit_rx.await.ok() }.boxed()),
        ..Default::default()
    };

    let bridge = tokio::spawn(run_exec_bridge(
        reader,
        writer,
        handle,
        negotiate(&stdin_only_descriptor(), sizes),
        CancellationToken::new(),
    ));

    exit_tx
        .send(status("Failure", Some("command terminated with exit code 2")))
        .unwrap();
    let outcome = within(bridge).await.unwrap();

    assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
    let (code, reason) = close_of(client.frames().await.last());
    assert_eq!(code, close_code::INTERNAL);
    assert!(reason.contains("exit code 2"), "{reason}");
}

#[tokio::test]
async fn test_exec_remote_read_error_fails_session() {
    let (mut client, reader, writer, sizes) = socket();

    let mut handle = RemoteExecHandle {
        stdout: Some(Box::new(ResetStream)),
        ..Default::default()
    };
    let aborted = abort_flag(&mut handle);

    let outcome = within(run_exec_bridge(
        reader,
        writer,
        handle,
        negotiate(&exec_descriptor(false, false), sizes),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(matches!(outcome.error, Some(Error::RemoteStream(_))));
    assert!(aborted.load(Ordering::SeqCst));

    let (code, reason) = close_of(client.frames().await.last());
    assert_eq!(code, close_code::INTERNAL);
    assert!(reason.contains("connection reset"), "{reason}");
}

#[tokio::test]
async fn test_exec_large_paste_into_echoing_process() {
    const FRAMES: usize = 200;
    const FRAME_SIZE: usize = 4096;

    let (mut client, reader, writer, sizes) = socket();

    // the remote echoes stdin to stdout through small pipes, like `cat`
    let (stdin, mut remote_in) = tokio::io::duplex(1024);
    let (mut remote_out, stdout) = tokio::io::duplex(1024);
    let echo = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut remote_in, &mut remote_out).await;
    });

    let mut handle = remote_with_stdout(stdout);
    handle.stdin = Some(Box::new(stdin));

    let bridge = tokio::spawn(run_exec_bridge(
        reader,
        writer,
        handle,
        negotiate(&exec_descriptor(true, false), sizes),
        CancellationToken::new(),
    ));

    let chunk = "a".repeat(FRAME_SIZE);
    for _ in 0..FRAMES {
        client.send_text(&chunk);
    }

    let echoed = within(async {
        let mut total = 0;
        while total < FRAMES * FRAME_SIZE {
            match client.output.next().await {
                Some(Message::Text(text)) => total += text.len(),
                other => panic!("expected echoed text, got {other:?}"),
            }
        }
        total
    })
    .await;
    assert_eq!(echoed, FRAMES * FRAME_SIZE);

    client.disconnect();
    assert!(within(bridge).await.unwrap().is_success());
    within(echo).await.unwrap();
}

// =============================================================================
// Log sessions
// =============================================================================

fn log_descriptor() -> LogDescriptor {
    LogDescriptor {
        namespace: "default".into(),
        pod_name: "web-1".into(),
        container: None,
        follow: false,
        timestamps: false,
        since: None,
    }
}

fn log_options(follow: bool) -> LogStreamOptions {
    LogStreamOptions {
        container: "app".into(),
        follow,
        timestamps: false,
        since: None,
    }
}

#[tokio::test]
async fn test_logs_stream_until_end() {
    let (mut client, reader, writer, _sizes) = socket();

    let (mut remote_out, logs) = tokio::io::duplex(1024);
    remote_out.write_all(b"line 1\nline 2\n").await.unwrap();
    drop(remote_out);

    let mut backend = MockPodBackend::new();
    backend
        .expect_logs()
        .with(eq("default"), eq("web-1"), eq(log_options(false)))
        .return_once(move |_, _, _| Ok(Box::new(logs) as RemoteReader));

    let outcome = within(bridge_logs(
        &backend,
        reader,
        writer,
        &log_descriptor(),
        &log_options(false),
        CancellationToken::new(),
    ))
    .await;

    assert!(outcome.is_success());
    let frames = client.frames().await;
    let text: String = frames.iter().filter_map(text_of).collect();
    assert_eq!(text, "line 1\nline 2\n");
    assert_eq!(close_of(frames.last()).0, close_code::NORMAL);
}

#[tokio::test]
async fn test_logs_follow_ends_when_client_leaves() {
    let (client, reader, writer, _sizes) = socket();
    let (_remote_out, logs) = tokio::io::duplex(1024);

    let mut backend = MockPodBackend::new();
    backend
        .expect_logs()
        .return_once(move |_, _, _| Ok(Box::new(logs) as RemoteReader));

    let bridge = tokio::spawn(async move {
        bridge_logs(
            &backend,
            reader,
            writer,
            &log_descriptor(),
            &log_options(true),
            CancellationToken::new(),
        )
        .await
    });

    // input frames are ignored for logs
    client.send_text("ignored");
    let Client { input, .. } = client;
    drop(input);

    let outcome = within(bridge).await.unwrap();
    assert_eq!(outcome.status, StatusCode::OK);
}

#[tokio::test]
async fn test_logs_open_failure_closes_socket() {
    let (mut client, reader, writer, _sizes) = socket();

    let mut backend = MockPodBackend::new();
    backend
        .expect_logs()
        .returning(|_, _, _| Err(Error::RemoteStream("log stream failed: gone".into())));

    let outcome = within(bridge_logs(
        &backend,
        reader,
        writer,
        &log_descriptor(),
        &log_options(false),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
    let (code, _) = close_of(client.frames().await.last());
    assert_eq!(code, close_code::INTERNAL);
}
