//! WebSocket as a pair of byte channels
//!
//! The bridge moves bytes, the socket moves frames. `DuplexReader` turns
//! inbound frames into stdin chunks (diverting resize frames to the session's
//! size queue) and `DuplexWriter` sends each output chunk as one frame.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use kube::api::TerminalSize;
use tracing::{debug, warn};

use super::terminal::{SizeQueue, SizeSender};
use super::websocket::{close_reason, parse_client_frame, ClientFrame};
use crate::error::{Error, Result};

/// Default bound on sending the close frame
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Split an upgraded socket into reader, writer and the size queue fed by the reader
pub fn split(
    socket: WebSocket,
    close_timeout: Duration,
) -> (
    DuplexReader<SplitStream<WebSocket>>,
    DuplexWriter<SplitSink<WebSocket, Message>>,
    SizeQueue,
) {
    let (sink, stream) = socket.split();
    let (sizes_tx, sizes) = SizeQueue::channel();
    (
        DuplexReader::new(stream, sizes_tx),
        DuplexWriter::new(sink, close_timeout),
        sizes,
    )
}

/// Inbound half: client frames as stdin bytes
pub struct DuplexReader<S> {
    stream: S,
    pending: Option<Bytes>,
    sizes: SizeSender,
}

impl<S, E> DuplexReader<S>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    /// Wrap a frame stream; resize frames are published on `sizes`
    pub fn new(stream: S, sizes: SizeSender) -> Self {
        Self {
            stream,
            pending: None,
            sizes,
        }
    }

    /// Next chunk of client input, or `None` once the client has closed.
    ///
    /// Returns the unread remainder of a previous frame first. Cancel safe.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(rest) = self.pending.take() {
            return Ok(Some(rest));
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(Error::ConnectionClosed(e.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) if !text.is_empty() => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())));
                }
                Message::Binary(data) => match parse_client_frame(&data) {
                    Some(ClientFrame::Stdin(payload)) if !payload.is_empty() => {
                        return Ok(Some(payload));
                    }
                    Some(ClientFrame::Resize { width, height }) => {
                        self.sizes.send_replace(Some(TerminalSize { width, height }));
                    }
                    _ => {}
                },
                Message::Close(frame) => {
                    debug!(?frame, "Client closed the WebSocket");
                    return Ok(None);
                }
                // pings are answered by the server library
                Message::Text(_) | Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    /// Copy client input into `buf`; `Ok(0)` means the client closed.
    ///
    /// A frame larger than `buf` is returned over several calls.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(mut chunk) = self.read_chunk().await? else {
            return Ok(0);
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.pending = Some(chunk.split_off(n));
        }
        Ok(n)
    }
}

/// Outbound half: each chunk becomes one frame
pub struct DuplexWriter<S> {
    sink: S,
    close_timeout: Duration,
    closed: bool,
    // incomplete UTF-8 sequence held back from the previous write
    utf8_tail: Vec<u8>,
}

impl<S> DuplexWriter<S>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    /// Wrap a frame sink; `close_timeout` bounds the close handshake
    pub fn new(sink: S, close_timeout: Duration) -> Self {
        Self {
            sink,
            close_timeout,
            closed: false,
            utf8_tail: Vec::new(),
        }
    }

    /// Send `data` as a single frame and flush.
    ///
    /// Valid UTF-8 goes out as a text frame, anything else as binary. A
    /// multi-byte character cut off at the end of `data` is held back and
    /// prefixed to the next write, so text split across reads stays text.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut pending = std::mem::take(&mut self.utf8_tail);
        pending.extend_from_slice(data);

        let checked = std::str::from_utf8(&pending).map(|_| ());
        let message = match checked {
            Ok(()) => text_frame(&pending),
            // incomplete sequence at the end: send the valid prefix, keep the rest
            Err(e) if e.error_len().is_none() => {
                self.utf8_tail = pending.split_off(e.valid_up_to());
                if pending.is_empty() {
                    return Ok(data.len());
                }
                text_frame(&pending)
            }
            Err(_) => Message::Binary(Bytes::from(pending)),
        };
        self.send(message).await?;
        Ok(data.len())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.sink
            .send(message)
            .await
            .map_err(|e| Error::ConnectionClosed(e.to_string()))
    }

    /// Send a close frame, at most once, giving up after the close timeout
    pub async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let tail = std::mem::take(&mut self.utf8_tail);
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: close_reason(reason).to_owned().into(),
        }));
        let sink = &mut self.sink;
        let close = async move {
            if !tail.is_empty() {
                sink.send(Message::Binary(Bytes::from(tail))).await?;
            }
            sink.send(frame).await?;
            sink.close().await
        };

        match tokio::time::timeout(self.close_timeout, close).await {
            Ok(Ok(())) => debug!(code, "WebSocket closed"),
            Ok(Err(e)) => debug!(code, error = %e, "WebSocket already gone while closing"),
            Err(_) => warn!(code, timeout = ?self.close_timeout, "Timed out sending close frame"),
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Text frame for bytes already checked to be UTF-8
fn text_frame(data: &[u8]) -> Message {
    Message::Text(String::from_utf8_lossy(data).into_owned().into())
}
