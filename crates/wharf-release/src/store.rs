//! Resource store used by release actions
//!
//! Release actions need three things from the cluster: record which template
//! version a namespace runs, read the files of that template version, and mark
//! the namespace after an action. The `ReleaseStore` trait keeps the actions
//! testable; `KubeReleaseStore` is the in-cluster implementation.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use wharf_common::EXTERNAL_ID_ANNOTATION;

use crate::error::{Error, Result};

/// Annotation recording the last release action run against a namespace
pub const LAST_ACTION_ANNOTATION: &str = "wharf.io/last-release-action";

/// Annotation recording when the last release action finished
pub const LAST_ACTION_TIME_ANNOTATION: &str = "wharf.io/last-release-action-time";

/// One file of a chart template version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFile {
    /// Path relative to the chart cache root (e.g., "wordpress/Chart.yaml")
    pub name: String,
    /// File contents
    #[serde(default)]
    pub contents: String,
}

/// Access to the namespace resource and chart template versions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Persist the template version reference on the namespace
    async fn set_external_id(&self, namespace: &str, external_id: &str) -> Result<()>;

    /// Fetch the files of a template version
    async fn template_files(&self, external_id: &str) -> Result<Vec<TemplateFile>>;

    /// Record that `action` completed against the namespace
    async fn record_action(&self, namespace: &str, action: &str) -> Result<()>;
}

/// Release store backed by the Kubernetes API
///
/// The template version reference lives in an annotation on the core
/// `Namespace`; template versions are read as dynamic objects so no generated
/// client is needed.
#[derive(Clone)]
pub struct KubeReleaseStore {
    client: Client,
    template_resource: ApiResource,
}

impl KubeReleaseStore {
    /// Create a store reading `TemplateVersion` objects from `management.cattle.io/v3`
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("management.cattle.io", "v3", "TemplateVersion");
        Self::with_template_resource(
            client,
            ApiResource::from_gvk_with_plural(&gvk, "templateversions"),
        )
    }

    /// Create a store reading template versions from a custom resource type
    pub fn with_template_resource(client: Client, template_resource: ApiResource) -> Self {
        Self {
            client,
            template_resource,
        }
    }

    async fn annotate(&self, namespace: &str, annotations: serde_json::Value) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(namespace, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReleaseStore for KubeReleaseStore {
    async fn set_external_id(&self, namespace: &str, external_id: &str) -> Result<()> {
        debug!(namespace, external_id, "Recording template version on namespace");
        self.annotate(
            namespace,
            serde_json::json!({ EXTERNAL_ID_ANNOTATION: external_id }),
        )
        .await
    }

    async fn template_files(&self, external_id: &str) -> Result<Vec<TemplateFile>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.template_resource);
        let version = api.get(external_id).await?;
        files_from_template_version(&version)
    }

    async fn record_action(&self, namespace: &str, action: &str) -> Result<()> {
        self.annotate(
            namespace,
            serde_json::json!({
                LAST_ACTION_ANNOTATION: action,
                LAST_ACTION_TIME_ANNOTATION: Utc::now().to_rfc3339(),
            }),
        )
        .await
    }
}

/// Extract `spec.files` from a template version object
fn files_from_template_version(version: &DynamicObject) -> Result<Vec<TemplateFile>> {
    let files = version
        .data
        .get("spec")
        .and_then(|spec| spec.get("files"))
        .cloned()
        .ok_or_else(|| {
            Error::Template(format!(
                "template version {} has no spec.files",
                version.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;
    serde_json::from_value(files).map_err(|e| Error::Template(e.to_string()))
}
