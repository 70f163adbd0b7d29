//! Wharf API
//!
//! HTTP/WebSocket front end for pod exec, log tailing and chart release
//! actions. The action endpoints hand out WebSocket URLs; the stream
//! endpoints upgrade and bridge the socket to the pod's exec or log stream.
//!
//! # Architecture
//!
//! ```text
//! browser ──POST /v1/actions/exec──► {"url": "ws://.../v1/stream/exec?..."}
//!         ──WS   /v1/stream/exec───► Translator ──► Negotiator ──► Bridge ──► K8s exec
//! ```
//!
//! # Endpoints
//!
//! - `POST /v1/actions/exec` - Returns the exec stream URL for a request body
//! - `POST /v1/actions/logs` - Returns the log stream URL for a request body
//! - `GET /v1/stream/exec` - WebSocket exec session
//! - `GET /v1/stream/logs` - WebSocket log session
//! - `POST /v1/namespaces/{name}/actions/upgrade` - Chart upgrade
//! - `POST /v1/namespaces/{name}/actions/rollback` - Chart rollback
//! - `GET /healthz` - Health check

#![deny(missing_docs)]

pub mod actions;
pub mod backend;
pub mod config;
pub mod error;
pub mod exec_proxy;
pub mod release_actions;
pub mod server;

pub use backend::{KubePodBackend, PodBackend, PodTarget, RemoteExecHandle};
pub use config::Config;
pub use error::{Error, Result};
pub use release_actions::ReleaseRunner;
pub use server::{router, start_server, AppState, ServerConfig};
