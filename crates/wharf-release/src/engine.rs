//! Release engine supervision
//!
//! The release engine (tiller) is started per action on a loopback port chosen
//! by the OS, scoped to a single namespace, and killed when the action's
//! cancellation token fires.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Environment variable that scopes the release engine to a namespace
pub const ENGINE_NAMESPACE_ENV: &str = "TILLER_NAMESPACE";

/// Interval between readiness probes
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ask the OS for a free loopback port.
///
/// The listener is dropped before the port is handed to the engine, so another
/// process could grab it in between; the window is far smaller than picking a
/// number from a fixed range.
pub fn ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| Error::process("release engine", format!("no free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::process("release engine", format!("no free port: {e}")))?
        .port();
    Ok(port)
}

/// A running release engine bound to one namespace
pub struct ReleaseEngine {
    addr: SocketAddr,
    cancel: CancellationToken,
    supervisor: JoinHandle<Option<ExitStatus>>,
}

impl ReleaseEngine {
    /// Spawn the engine and wait (up to `ready_timeout`) for it to accept connections.
    ///
    /// The engine keeps running until `cancel` fires or [`ReleaseEngine::stop`]
    /// is called. An engine that never becomes ready is not an error here: the
    /// chart tool reports the connection failure with better context.
    pub async fn start(
        program: &Path,
        namespace: &str,
        ready_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let port = ephemeral_port()?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let child = Command::new(program)
            .arg("--listen")
            .arg(addr.to_string())
            .env(ENGINE_NAMESPACE_ENV, namespace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::process(program.display().to_string(), e.to_string()))?;

        info!(namespace, %addr, pid = ?child.id(), "Release engine started");

        let supervisor = tokio::spawn(supervise(child, cancel.clone(), namespace.to_string()));

        let engine = Self {
            addr,
            cancel,
            supervisor,
        };
        engine.wait_ready(ready_timeout).await;
        Ok(engine)
    }

    /// Address the chart tool should talk to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Value for the chart tool's host variable (`127.0.0.1:<port>`)
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Whether the engine process has already exited
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    async fn wait_ready(&self, ready_timeout: Duration) {
        let probe = async {
            loop {
                if self.supervisor.is_finished() {
                    return false;
                }
                if TcpStream::connect(self.addr).await.is_ok() {
                    return true;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(ready_timeout, probe).await {
            Ok(true) => debug!(addr = %self.addr, "Release engine accepting connections"),
            Ok(false) => warn!(addr = %self.addr, "Release engine exited during startup"),
            Err(_) => warn!(addr = %self.addr, ?ready_timeout, "Release engine not ready yet"),
        }
    }

    /// Kill the engine and wait for it to exit
    pub async fn stop(self) -> Option<ExitStatus> {
        self.cancel.cancel();
        match self.supervisor.await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Release engine supervisor panicked");
                None
            }
        }
    }
}

/// Own the child until it exits on its own or the token is cancelled
async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    namespace: String,
) -> Option<ExitStatus> {
    tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(namespace = %namespace, error = %e, "Failed to kill release engine");
            }
            let status = child.wait().await.ok();
            debug!(namespace = %namespace, ?status, "Release engine stopped");
            status
        }
        status = child.wait() => {
            match status {
                Ok(status) => {
                    warn!(namespace = %namespace, %status, "Release engine exited before the action finished");
                    Some(status)
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to wait on release engine");
                    None
                }
            }
        }
    }
}
