//! Stream and action server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::actions::{
    exec_action_handler, log_action_handler, StreamEndpoint, EXEC_STREAM_PATH, LOG_STREAM_PATH,
};
use crate::backend::PodBackend;
use crate::error::Error;
use crate::exec_proxy::{exec_stream_handler, log_stream_handler};
use crate::release_actions::{rollback_handler, upgrade_handler, ReleaseRunner};

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate and key PEM; plain HTTP when `None`
    pub tls: Option<(Vec<u8>, Vec<u8>)>,
    /// Where clients reach the stream endpoints
    pub streams: StreamEndpoint,
    /// Bound on the WebSocket close handshake
    pub close_timeout: Duration,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Cluster access for exec and log streams
    pub backend: Arc<dyn PodBackend>,
    /// Chart release actions
    pub releases: Arc<dyn ReleaseRunner>,
    /// Where clients reach the stream endpoints
    pub streams: StreamEndpoint,
    /// Bound on the WebSocket close handshake
    pub close_timeout: Duration,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/healthz", get(|| async { "ok" }))
        // Actions return the WebSocket URL to connect to
        .route("/v1/actions/exec", post(exec_action_handler))
        .route("/v1/actions/logs", post(log_action_handler))
        // WebSocket upgrade routes
        .route(EXEC_STREAM_PATH, get(exec_stream_handler))
        .route(LOG_STREAM_PATH, get(log_stream_handler))
        // Chart release actions
        .route("/v1/namespaces/{name}/actions/upgrade", post(upgrade_handler))
        .route(
            "/v1/namespaces/{name}/actions/rollback",
            post(rollback_handler),
        )
        .with_state(state)
}

/// Start the server
pub async fn start_server(
    config: ServerConfig,
    backend: Arc<dyn PodBackend>,
    releases: Arc<dyn ReleaseRunner>,
) -> Result<(), Error> {
    let state = AppState {
        backend,
        releases,
        streams: config.streams.clone(),
        close_timeout: config.close_timeout,
    };
    let app = router(state);

    match config.tls {
        Some((cert_pem, key_pem)) => {
            let tls_config = RustlsConfig::from_pem(cert_pem, key_pem)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, tls = true, "Starting wharf server");
            axum_server::bind_rustls(config.addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;
        }
        None => {
            info!(addr = %config.addr, tls = false, "Starting wharf server");
            axum_server::bind(config.addr)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;
        }
    }

    Ok(())
}
