//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use wharf_common::DEFAULT_API_PORT;
use wharf_release::ReleaseConfig;

use crate::error::{Error, Result};

/// Wharf - container exec, log streaming and chart release actions over HTTP/WebSocket
#[derive(Parser, Debug, Clone)]
#[command(name = "wharf", version, about, long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "WHARF_LISTEN_ADDR", default_value_t = default_listen_addr())]
    pub listen_addr: SocketAddr,

    /// TLS certificate (PEM); serves plain HTTP when unset
    #[arg(long, env = "WHARF_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "WHARF_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Externally visible base URL used in returned stream URLs
    #[arg(long, env = "WHARF_PUBLIC_URL")]
    pub public_url: Option<Url>,

    /// Chart tool binary
    #[arg(long, env = "WHARF_HELM_BIN", default_value = "helm")]
    pub helm_bin: PathBuf,

    /// Release engine binary
    #[arg(long, env = "WHARF_TILLER_BIN", default_value = "tiller")]
    pub tiller_bin: PathBuf,

    /// Directory chart files are written under (defaults to ~/helm-controller)
    #[arg(long, env = "WHARF_CHART_CACHE_DIR")]
    pub chart_cache_dir: Option<PathBuf>,

    /// Seconds to wait when sending a WebSocket close frame
    #[arg(long, env = "WHARF_CLOSE_TIMEOUT_SECS", default_value_t = 30)]
    pub close_timeout_secs: u64,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "WHARF_LOG_TEXT")]
    pub log_text: bool,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT))
}

impl Config {
    /// Bound on the WebSocket close handshake
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Whether the server terminates TLS itself
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Settings for release actions
    pub fn release_config(&self) -> ReleaseConfig {
        let defaults = ReleaseConfig::default();
        ReleaseConfig {
            chart_bin: self.helm_bin.clone(),
            engine_bin: self.tiller_bin.clone(),
            cache_dir: self
                .chart_cache_dir
                .clone()
                .unwrap_or(defaults.cache_dir),
            engine_ready_timeout: defaults.engine_ready_timeout,
        }
    }

    /// Read the TLS certificate and key
    pub async fn tls_pem(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };
        let cert_pem = tokio::fs::read(cert)
            .await
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", cert.display())))?;
        let key_pem = tokio::fs::read(key)
            .await
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", key.display())))?;
        Ok(Some((cert_pem, key_pem)))
    }
}
