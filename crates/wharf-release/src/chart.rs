//! Chart tool invocation (helm)

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable pointing the chart tool at the release engine
pub const CHART_HOST_ENV: &str = "HELM_HOST";

/// Thin wrapper around the chart binary
#[derive(Clone, Debug)]
pub struct ChartTool {
    program: PathBuf,
}

impl ChartTool {
    /// Use the chart binary at `program` (resolved via `PATH` when relative)
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `upgrade --namespace <release> <release> <chart_dir>`
    pub async fn upgrade(
        &self,
        engine_host: &str,
        release: &str,
        chart_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(release, chart = %chart_dir.display(), "Upgrading release");
        let args: Vec<OsString> = vec![
            "upgrade".into(),
            "--namespace".into(),
            release.into(),
            release.into(),
            chart_dir.into(),
        ];
        self.run(engine_host, args, cancel).await
    }

    /// `rollback <release> <revision>`
    pub async fn rollback(
        &self,
        engine_host: &str,
        release: &str,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(release, revision, "Rolling back release");
        let args: Vec<OsString> = vec!["rollback".into(), release.into(), revision.into()];
        self.run(engine_host, args, cancel).await
    }

    async fn run(
        &self,
        engine_host: &str,
        args: Vec<OsString>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let program = self.program.display().to_string();

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .env(CHART_HOST_ENV, engine_host)
            .stdin(Stdio::null())
            // losing the select below drops the child, which kills it
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = command.output() => output.map_err(|e| Error::process(&program, e.to_string()))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(program = %program, output = %stdout.trim(), "Chart tool output");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::process(
                program,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(())
    }
}
