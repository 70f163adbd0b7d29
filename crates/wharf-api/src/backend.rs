//! Pod backend abstraction
//!
//! The stream bridge only needs three things from the cluster: a pod's phase
//! and containers, an exec stream and a log stream. `PodBackend` captures that
//! so the bridge can be driven by in-memory pipes in tests; `KubePodBackend`
//! is the kube-rs implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, LogParams, TerminalSize};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec_proxy::ExecStreamOptions;

/// Boxed byte source from the remote side
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink to the remote side
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What the bridge needs to know about a pod before opening a stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodTarget {
    /// `status.phase`, if reported
    pub phase: Option<String>,
    /// Container names in spec order
    pub containers: Vec<String>,
}

impl From<&Pod> for PodTarget {
    fn from(pod: &Pod) -> Self {
        Self {
            phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
            containers: pod
                .spec
                .as_ref()
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
        }
    }
}

/// Options for the remote log stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogStreamOptions {
    /// Target container
    pub container: String,
    /// Keep streaming new lines
    pub follow: bool,
    /// Prefix lines with timestamps
    pub timestamps: bool,
    /// Only lines newer than this instant
    pub since: Option<DateTime<Utc>>,
}

impl LogStreamOptions {
    /// Convert to kube LogParams
    pub fn log_params(&self) -> LogParams {
        LogParams {
            container: Some(self.container.clone()),
            follow: self.follow,
            timestamps: self.timestamps,
            since_time: self.since,
            ..Default::default()
        }
    }
}

/// A live remote exec stream
///
/// Streams not requested are `None`. The bridge owns the handle and calls
/// [`RemoteExecHandle::abort`] on every exit path.
#[derive(Default)]
pub struct RemoteExecHandle {
    /// Process stdin
    pub stdin: Option<RemoteWriter>,
    /// Process stdout (or the merged terminal output)
    pub stdout: Option<RemoteReader>,
    /// Process stderr (never set for a TTY)
    pub stderr: Option<RemoteReader>,
    /// Terminal size updates (TTY only)
    pub resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
    /// Resolves with the process's final status once it exits
    pub status: Option<BoxFuture<'static, Option<Status>>>,
    /// Tears down the underlying connection
    pub abort_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl RemoteExecHandle {
    /// Tear down the remote stream; later calls do nothing
    pub fn abort(&mut self) {
        if let Some(hook) = self.abort_hook.take() {
            hook();
        }
    }
}

/// Cluster operations used by the stream bridge
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodBackend: Send + Sync {
    /// Fetch a pod's phase and containers
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodTarget>;

    /// Open an exec stream
    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        options: &ExecStreamOptions,
    ) -> Result<RemoteExecHandle>;

    /// Open a log stream
    async fn logs(
        &self,
        namespace: &str,
        name: &str,
        options: &LogStreamOptions,
    ) -> Result<RemoteReader>;
}

/// Pod backend talking to the Kubernetes API.
///
/// A client is built from the stored config for every call, so a session never
/// shares connection state with another.
#[derive(Clone)]
pub struct KubePodBackend {
    config: Config,
}

impl KubePodBackend {
    /// Use explicit client configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Infer configuration from the environment (in-cluster or kubeconfig)
    pub async fn infer() -> Result<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| Error::Config(format!("failed to load cluster config: {e}")))?;
        Ok(Self::new(config))
    }

    fn pods(&self, namespace: &str) -> Result<Api<Pod>> {
        let client = Client::try_from(self.config.clone())
            .map_err(|e| Error::Internal(format!("failed to create K8s client: {e}")))?;
        Ok(Api::namespaced(client, namespace))
    }
}

#[async_trait]
impl PodBackend for KubePodBackend {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodTarget> {
        let pod = self.pods(namespace)?.get(name).await?;
        Ok(PodTarget::from(&pod))
    }

    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        options: &ExecStreamOptions,
    ) -> Result<RemoteExecHandle> {
        let mut attached = self
            .pods(namespace)?
            .exec(name, options.command.clone(), &options.attach_params())
            .await
            .map_err(|e| Error::RemoteStream(format!("exec failed: {e}")))?;

        debug!(namespace, pod = name, container = %options.container, "Exec stream opened");

        let stdin = attached.stdin().map(|w| Box::new(w) as RemoteWriter);
        let stdout = attached.stdout().map(|r| Box::new(r) as RemoteReader);
        let stderr = attached.stderr().map(|r| Box::new(r) as RemoteReader);
        let resize = attached.terminal_size();
        let status = attached.take_status().map(|s| s.boxed());

        Ok(RemoteExecHandle {
            stdin,
            stdout,
            stderr,
            resize,
            status,
            abort_hook: Some(Box::new(move || attached.abort())),
        })
    }

    async fn logs(
        &self,
        namespace: &str,
        name: &str,
        options: &LogStreamOptions,
    ) -> Result<RemoteReader> {
        let stream = self
            .pods(namespace)?
            .log_stream(name, &options.log_params())
            .await
            .map_err(|e| Error::RemoteStream(format!("log stream failed: {e}")))?;

        debug!(namespace, pod = name, container = %options.container, "Log stream opened");
        Ok(Box::new(stream.compat()))
    }
}
