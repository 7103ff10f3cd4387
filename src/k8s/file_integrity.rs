//! File integrity database re-initialisation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::Api;
use kube::api::{DynamicObject, Patch, PatchParams};
use tracing::info;

use super::api_resource;
use crate::cluster::FileIntegrity;
use crate::status::FIELD_MANAGER;

const FILE_INTEGRITY_NAMESPACE: &str = "openshift-file-integrity";
const FILE_INTEGRITY_NAME: &str = "osd-fileintegrity";

/// Merge patch that sets the re-init annotation.
pub fn reinit_patch() -> serde_json::Value {
    serde_json::json!({
        "metadata": { "annotations": { "file-integrity.openshift.io/re-init": "" } }
    })
}

pub struct KubeFileIntegrity {
    client: kube::Client,
}

impl KubeFileIntegrity {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FileIntegrity for KubeFileIntegrity {
    async fn reinit(&self) -> Result<()> {
        let ar = api_resource("fileintegrity.openshift.io", "v1alpha1", "FileIntegrity", "fileintegrities");
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), FILE_INTEGRITY_NAMESPACE, &ar);
        api.patch(
            FILE_INTEGRITY_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&reinit_patch()),
        )
        .await
        .with_context(|| {
            format!("Failed to annotate file integrity {FILE_INTEGRITY_NAME} in {FILE_INTEGRITY_NAMESPACE}")
        })?;
        info!("File integrity database re-initialisation requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinit_patch_sets_annotation() {
        let patch = reinit_patch();
        assert_eq!(
            patch["metadata"]["annotations"]["file-integrity.openshift.io/re-init"],
            ""
        );
    }
}
