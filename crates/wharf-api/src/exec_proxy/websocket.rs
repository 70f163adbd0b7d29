//! WebSocket frame helpers
//!
//! Browser clients send keystrokes as text frames. Binary frames use the
//! Kubernetes channel convention: the first byte selects the channel, with
//! channel 4 carrying terminal resizes.

use bytes::Bytes;

/// Channel IDs understood on inbound binary frames
pub mod channel {
    /// Channel 0: stdin
    pub const STDIN: u8 = 0;
    /// Channel 1: stdout
    pub const STDOUT: u8 = 1;
    /// Channel 2: stderr
    pub const STDERR: u8 = 2;
    /// Channel 3: error
    pub const ERROR: u8 = 3;
    /// Channel 4: terminal resize
    pub const RESIZE: u8 = 4;
}

/// WebSocket close codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Server hit an unexpected condition
    pub const INTERNAL: u16 = 1011;
}

/// Largest close reason that fits a control frame (125 bytes minus the code)
pub const MAX_CLOSE_REASON: usize = 123;

/// A decoded inbound binary frame
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Bytes for the remote process's stdin
    Stdin(Bytes),
    /// New terminal dimensions
    Resize {
        /// Terminal width in columns
        width: u16,
        /// Terminal height in rows
        height: u16,
    },
}

/// Decode a binary frame from the client.
///
/// Returns `None` for an empty frame. Unknown channel bytes are treated as raw
/// stdin including the first byte, so clients that never prefix still work.
pub fn parse_client_frame(data: &Bytes) -> Option<ClientFrame> {
    let (&channel, payload) = data.split_first()?;

    match channel {
        channel::RESIZE if payload.len() >= 4 => {
            let width = u16::from_le_bytes([payload[0], payload[1]]);
            let height = u16::from_le_bytes([payload[2], payload[3]]);
            Some(ClientFrame::Resize { width, height })
        }
        channel::STDIN => Some(ClientFrame::Stdin(data.slice(1..))),
        channel::STDOUT | channel::STDERR | channel::ERROR => {
            tracing::warn!(
                channel,
                "received server-only channel from client, treating as stdin"
            );
            Some(ClientFrame::Stdin(data.slice(1..)))
        }
        _ => Some(ClientFrame::Stdin(data.clone())),
    }
}

/// Trim a close reason to fit a control frame without splitting a character
pub fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
