//! Namespace release actions (upgrade, rollback)

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{info, instrument};

use wharf_release::ReleaseActions;

use crate::error::{Error, Result};
use crate::server::AppState;

/// Body of the upgrade action
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeInput {
    /// Template version to move the namespace's release to
    pub external_id: String,
}

/// Body of the rollback action
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackInput {
    /// Release revision to roll back to
    pub revision: String,
}

/// Chart release operations used by the HTTP handlers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseRunner: Send + Sync {
    /// Upgrade the namespace's release to a template version
    async fn upgrade(&self, namespace: &str, external_id: &str) -> wharf_release::Result<()>;

    /// Roll the namespace's release back to a revision
    async fn rollback(&self, namespace: &str, revision: &str) -> wharf_release::Result<()>;
}

#[async_trait]
impl ReleaseRunner for ReleaseActions {
    async fn upgrade(&self, namespace: &str, external_id: &str) -> wharf_release::Result<()> {
        ReleaseActions::upgrade(self, namespace, external_id).await
    }

    async fn rollback(&self, namespace: &str, revision: &str) -> wharf_release::Result<()> {
        ReleaseActions::rollback(self, namespace, revision).await
    }
}

/// `POST /v1/namespaces/{name}/actions/upgrade`
#[instrument(skip_all, fields(otel.kind = "server"))]
pub async fn upgrade_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<UpgradeInput>,
) -> Result<StatusCode> {
    if input.external_id.is_empty() {
        return Err(Error::MissingParameter("externalId"));
    }
    state.releases.upgrade(&name, &input.external_id).await?;
    info!(namespace = %name, external_id = %input.external_id, "Upgrade action completed");
    Ok(StatusCode::OK)
}

/// `POST /v1/namespaces/{name}/actions/rollback`
#[instrument(skip_all, fields(otel.kind = "server"))]
pub async fn rollback_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<RollbackInput>,
) -> Result<StatusCode> {
    if input.revision.is_empty() {
        return Err(Error::MissingParameter("revision"));
    }
    state.releases.rollback(&name, &input.revision).await?;
    info!(namespace = %name, revision = %input.revision, "Rollback action completed");
    Ok(StatusCode::OK)
}
