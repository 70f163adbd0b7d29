//! Exec and logs actions
//!
//! The actions do not open anything themselves: they validate the request body
//! and answer with the WebSocket URL the client should connect to.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Error, Result};
use crate::exec_proxy::{parse_exec_query, parse_log_query, ExecInput, LogInput};
use crate::server::AppState;

/// Path of the exec stream endpoint
pub const EXEC_STREAM_PATH: &str = "/v1/stream/exec";

/// Path of the log stream endpoint
pub const LOG_STREAM_PATH: &str = "/v1/stream/logs";

/// Response body of the exec and logs actions
#[derive(Clone, Debug, Serialize)]
pub struct ActionResponse {
    /// WebSocket URL to connect to
    pub url: String,
}

/// Where clients reach the stream endpoints
#[derive(Clone, Debug)]
pub struct StreamEndpoint {
    public_url: Option<Url>,
    tls: bool,
}

impl StreamEndpoint {
    /// Use `public_url` when set (http(s) or ws(s)), otherwise the request's Host header
    pub fn new(public_url: Option<Url>, tls: bool) -> Result<Self> {
        let public_url = public_url.map(websocket_url).transpose()?;
        Ok(Self { public_url, tls })
    }

    /// Build the WebSocket URL for `path` with an encoded `query`
    pub fn stream_url(&self, headers: &HeaderMap, path: &str, query: &str) -> Result<String> {
        let mut url = match &self.public_url {
            Some(base) => base.clone(),
            None => {
                let host = headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .ok_or(Error::MissingParameter("Host"))?;
                let scheme = if self.tls { "wss" } else { "ws" };
                Url::parse(&format!("{scheme}://{host}")).map_err(|e| Error::InvalidParameter {
                    name: "Host",
                    reason: e.to_string(),
                })?
            }
        };

        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}{path}"));
        url.set_query(Some(query));
        Ok(url.into())
    }
}

/// Map an http(s) base URL onto ws(s)
fn websocket_url(mut url: Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::Config(format!(
                "public URL scheme must be http, https, ws or wss, got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot use {url} as a WebSocket URL")))?;
    Ok(url)
}

/// `POST /v1/actions/exec`
#[instrument(skip_all, fields(otel.kind = "server"))]
pub async fn exec_action_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<ExecInput>,
) -> Result<Json<ActionResponse>> {
    let query = input.to_query();
    // Reject now rather than after the client connects
    parse_exec_query(&query)?;

    let url = state.streams.stream_url(&headers, EXEC_STREAM_PATH, &query)?;
    debug!(namespace = %input.namespace, pod = %input.pod_name, url = %url, "Built exec stream URL");
    Ok(Json(ActionResponse { url }))
}

/// `POST /v1/actions/logs`
#[instrument(skip_all, fields(otel.kind = "server"))]
pub async fn log_action_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<LogInput>,
) -> Result<Json<ActionResponse>> {
    let query = input.to_query();
    parse_log_query(&query)?;

    let url = state.streams.stream_url(&headers, LOG_STREAM_PATH, &query)?;
    debug!(namespace = %input.namespace, pod = %input.pod_name, url = %url, "Built log stream URL");
    Ok(Json(ActionResponse { url }))
}
