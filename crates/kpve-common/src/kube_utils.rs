//! Thin Kubernetes accessors used by the provider core
//!
//! The core only reads the cluster CA and writes template status. Both are
//! behind traits so tests can substitute them, with kube-rs implementations
//! for production.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{ProxmoxTemplate, ProxmoxTemplateStatus};
use crate::{Error, FIELD_MANAGER};

/// ConfigMap published in every namespace with the cluster CA bundle
pub const ROOT_CA_CONFIGMAP: &str = "kube-root-ca.crt";

/// Key of the CA bundle inside [`ROOT_CA_CONFIGMAP`]
pub const ROOT_CA_KEY: &str = "ca.crt";

/// Source of cluster-wide facts rendered into node bootstrap data
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterInfoSource: Send + Sync {
    /// PEM-encoded cluster CA bundle
    async fn cluster_ca(&self) -> Result<String, Error>;
}

/// Persists the status of template classes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TemplateStatusStore: Send + Sync {
    /// Replace the status of the named template class
    async fn patch_status(&self, name: &str, status: &ProxmoxTemplateStatus) -> Result<(), Error>;
}

/// Reads the cluster CA from the `kube-root-ca.crt` ConfigMap
pub struct KubeClusterInfo {
    client: Client,
    namespace: String,
}

impl KubeClusterInfo {
    /// Read from the given namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ClusterInfoSource for KubeClusterInfo {
    async fn cluster_ca(&self) -> Result<String, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = api
            .get_opt(ROOT_CA_CONFIGMAP)
            .await?
            .ok_or_else(|| Error::not_found("configmap", ROOT_CA_CONFIGMAP))?;

        ca_from_configmap(&cm)
    }
}

/// Extract the CA bundle from a root CA ConfigMap
pub fn ca_from_configmap(cm: &ConfigMap) -> Result<String, Error> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(ROOT_CA_KEY))
        .filter(|ca| !ca.trim().is_empty())
        .cloned()
        .ok_or_else(|| {
            Error::configuration(
                ROOT_CA_CONFIGMAP,
                format!("configmap has no '{}' entry", ROOT_CA_KEY),
            )
        })
}

/// Writes ProxmoxTemplate status through the status subresource
pub struct KubeTemplateStatusStore {
    client: Client,
}

impl KubeTemplateStatusStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TemplateStatusStore for KubeTemplateStatusStore {
    async fn patch_status(&self, name: &str, status: &ProxmoxTemplateStatus) -> Result<(), Error> {
        let api: Api<ProxmoxTemplate> = Api::all(self.client.clone());

        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        debug!(template = %name, zones = status.zones.len(), "patched template status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_ca_from_configmap() {
        let cm = ConfigMap {
            data: Some(BTreeMap::from([(
                ROOT_CA_KEY.to_string(),
                "-----BEGIN CERTIFICATE-----\n...".to_string(),
            )])),
            ..Default::default()
        };
        assert!(ca_from_configmap(&cm)
            .expect("has ca")
            .starts_with("-----BEGIN"));
    }

    #[test]
    fn test_ca_missing_is_configuration_error() {
        let err = ca_from_configmap(&ConfigMap::default()).expect_err("no data");
        assert!(matches!(err, Error::Configuration { .. }));

        let blank = ConfigMap {
            data: Some(BTreeMap::from([(ROOT_CA_KEY.to_string(), "  ".to_string())])),
            ..Default::default()
        };
        assert!(ca_from_configmap(&blank).is_err());
    }

    #[tokio::test]
    async fn test_mock_store_records_status() {
        let mut store = MockTemplateStatusStore::new();
        store
            .expect_patch_status()
            .withf(|name, status| name == "noble" && status.zones == vec!["r1/z1/9000"])
            .times(1)
            .returning(|_, _| Ok(()));

        let status = ProxmoxTemplateStatus {
            image_id: Some("local:import/noble.qcow2".to_string()),
            zones: vec!["r1/z1/9000".to_string()],
        };
        store
            .patch_status("noble", &status)
            .await
            .expect("patch succeeds");
    }
}
