//! WebSocket bridge for container exec and log streams
//!
//! Upgrades an HTTP request and relays a browser WebSocket to a pod's exec or
//! log stream, with terminal sizing and raw-mode negotiation.

mod bridge;
mod duplex;
mod handlers;
mod params;
mod terminal;
mod websocket;

#[cfg(test)]
mod tests;

pub use bridge::{
    bridge_exec, bridge_logs, prepare_exec, prepare_logs, run_exec_bridge, run_log_bridge,
    BridgeOutcome, ExecTarget,
};
pub use duplex::{split, DuplexReader, DuplexWriter, DEFAULT_CLOSE_TIMEOUT};
pub use handlers::{exec_stream_handler, log_stream_handler};
pub use params::{
    parse_bool, parse_exec_query, parse_log_query, parse_log_query_at, parse_since,
    ExecDescriptor, ExecInput, LogDescriptor, LogInput,
};
pub use terminal::{
    negotiate, spawn_size_watcher, ExecStreamOptions, SizeQueue, SizeSender, TerminalState,
};
pub use websocket::{channel, close_code, parse_client_frame, ClientFrame};
