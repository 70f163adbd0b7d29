//! Wharf - container exec, log streaming and chart release actions

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::info;

use wharf_api::actions::StreamEndpoint;
use wharf_api::{start_server, Config, KubePodBackend, ServerConfig};
use wharf_common::{init_telemetry, TelemetryConfig};
use wharf_release::{KubeReleaseStore, ReleaseActions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS use (server or kube client)
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let config = Config::parse();

    init_telemetry(TelemetryConfig {
        json: !config.log_text,
        ..Default::default()
    })?;

    let backend = KubePodBackend::infer().await?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create K8s client: {}", e))?;

    let releases = ReleaseActions::new(
        config.release_config(),
        Arc::new(KubeReleaseStore::new(client)),
    );

    let server_config = ServerConfig {
        addr: config.listen_addr,
        tls: config.tls_pem().await?,
        streams: StreamEndpoint::new(config.public_url.clone(), config.tls_enabled())?,
        close_timeout: config.close_timeout(),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        chart_cache = %config.release_config().cache_dir.display(),
        "Wharf starting"
    );

    start_server(server_config, Arc::new(backend), Arc::new(releases)).await?;
    Ok(())
}
