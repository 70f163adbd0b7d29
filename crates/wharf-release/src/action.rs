//! Upgrade and rollback actions

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::chart::ChartTool;
use crate::engine::ReleaseEngine;
use crate::error::Result;
use crate::store::ReleaseStore;
use crate::templates::write_chart_dir;

/// Directory under the home directory used to cache chart files
const CHART_CACHE_DIR_NAME: &str = "helm-controller";

/// Binaries and paths used by release actions
#[derive(Clone, Debug)]
pub struct ReleaseConfig {
    /// Chart tool binary
    pub chart_bin: PathBuf,
    /// Release engine binary
    pub engine_bin: PathBuf,
    /// Root directory chart files are written under
    pub cache_dir: PathBuf,
    /// How long to wait for the release engine to accept connections
    pub engine_ready_timeout: Duration,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        let cache_root = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            chart_bin: PathBuf::from("helm"),
            engine_bin: PathBuf::from("tiller"),
            cache_dir: cache_root.join(CHART_CACHE_DIR_NAME),
            engine_ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs chart actions against namespaces
#[derive(Clone)]
pub struct ReleaseActions {
    config: ReleaseConfig,
    chart: ChartTool,
    store: Arc<dyn ReleaseStore>,
}

impl ReleaseActions {
    /// Create the action runner
    pub fn new(config: ReleaseConfig, store: Arc<dyn ReleaseStore>) -> Self {
        let chart = ChartTool::new(config.chart_bin.clone());
        Self {
            config,
            chart,
            store,
        }
    }

    /// Point the namespace's release at `external_id` and upgrade it
    #[instrument(skip(self))]
    pub async fn upgrade(&self, namespace: &str, external_id: &str) -> Result<()> {
        self.store.set_external_id(namespace, external_id).await?;

        let files = self.store.template_files(external_id).await?;
        let chart_dir = write_chart_dir(&self.config.cache_dir, &files).await?;

        self.with_engine(namespace, |host, cancel| {
            let chart = self.chart.clone();
            let chart_dir = chart_dir.clone();
            async move { chart.upgrade(&host, namespace, &chart_dir, &cancel).await }
        })
        .await?;

        self.store.record_action(namespace, "upgrade").await?;
        info!(namespace, external_id, "Release upgraded");
        Ok(())
    }

    /// Roll the namespace's release back to `revision`
    #[instrument(skip(self))]
    pub async fn rollback(&self, namespace: &str, revision: &str) -> Result<()> {
        self.with_engine(namespace, |host, cancel| {
            let chart = self.chart.clone();
            async move { chart.rollback(&host, namespace, revision, &cancel).await }
        })
        .await?;

        self.store.record_action(namespace, "rollback").await?;
        info!(namespace, revision, "Release rolled back");
        Ok(())
    }

    /// Run `f` with a release engine scoped to `namespace`.
    ///
    /// The engine is stopped on every path, including when the caller's future
    /// is dropped (the drop guard cancels the engine's token).
    async fn with_engine<F, Fut>(&self, namespace: &str, f: F) -> Result<()>
    where
        F: FnOnce(String, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let engine = ReleaseEngine::start(
            &self.config.engine_bin,
            namespace,
            self.config.engine_ready_timeout,
            cancel.child_token(),
        )
        .await?;

        let result = f(engine.host(), cancel.child_token()).await;
        engine.stop().await;

        if let Err(e) = &result {
            error!(namespace, error = %e, "Release action failed");
        }
        result
    }
}
