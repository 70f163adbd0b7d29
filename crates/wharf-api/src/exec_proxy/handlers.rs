//! WebSocket handlers for exec and log streams
//!
//! Parameters are validated and the target pod checked before the upgrade,
//! so those failures come back as HTTP errors. Everything after the upgrade is
//! reported in the close frame.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::bridge::{
    bridge_exec, bridge_logs, prepare_exec, prepare_logs, BridgeOutcome, ExecTarget,
};
use super::duplex;
use super::params::{parse_exec_query, parse_log_query, ExecDescriptor, LogDescriptor};
use crate::backend::LogStreamOptions;
use crate::error::Result;
use crate::server::AppState;

/// `GET /v1/stream/exec` - upgrade to an exec session
#[instrument(skip_all, fields(otel.kind = "server"))]
pub async fn exec_stream_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let descriptor = parse_exec_query(query.as_deref().unwrap_or_default())?;
    let target = prepare_exec(state.backend.as_ref(), &descriptor).await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    Ok(ws
        .on_upgrade(move |socket| exec_session(socket, state, descriptor, target))
        .into_response())
}

/// `GET /v1/stream/logs` - upgrade to a log session
#[instrument(skip_all, fields(otel.kind = "server"))]
pub async fn log_stream_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let descriptor = parse_log_query(query.as_deref().unwrap_or_default())?;
    let options = prepare_logs(state.backend.as_ref(), &descriptor).await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    Ok(ws
        .on_upgrade(move |socket| log_session(socket, state, descriptor, options))
        .into_response())
}

async fn exec_session(
    socket: WebSocket,
    state: AppState,
    descriptor: ExecDescriptor,
    target: ExecTarget,
) {
    info!(
        namespace = %descriptor.namespace,
        pod = %descriptor.pod_name,
        "Exec WebSocket connection established"
    );

    let (reader, writer, sizes) = duplex::split(socket, state.close_timeout);
    let outcome = bridge_exec(
        state.backend.as_ref(),
        reader,
        writer,
        sizes,
        &descriptor,
        &target,
        CancellationToken::new(),
    )
    .await;

    log_outcome("exec", &descriptor.namespace, &descriptor.pod_name, &outcome);
}

async fn log_session(
    socket: WebSocket,
    state: AppState,
    descriptor: LogDescriptor,
    options: LogStreamOptions,
) {
    info!(
        namespace = %descriptor.namespace,
        pod = %descriptor.pod_name,
        "Log WebSocket connection established"
    );

    let (reader, writer, _sizes) = duplex::split(socket, state.close_timeout);
    let outcome = bridge_logs(
        state.backend.as_ref(),
        reader,
        writer,
        &descriptor,
        &options,
        CancellationToken::new(),
    )
    .await;

    log_outcome("logs", &descriptor.namespace, &descriptor.pod_name, &outcome);
}

fn log_outcome(session: &str, namespace: &str, pod: &str, outcome: &BridgeOutcome) {
    match &outcome.error {
        None => info!(
            session,
            namespace,
            pod,
            status = outcome.status.as_u16(),
            "Stream session closed"
        ),
        Some(e) => error!(
            session,
            namespace,
            pod,
            status = outcome.status.as_u16(),
            error = %e,
            "Stream session failed"
        ),
    }
}
