//! NodeClaim: a request for one node, and the node that satisfied it
//!
//! Mirrors the fields of the Karpenter `karpenter.sh/v1` NodeClaim that the
//! provider reads and writes.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Requirement, Requirements, ResourceList, Taint};

/// Reference from a NodeClaim to the NodeClass describing how to realize it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassReference {
    /// API group of the node class
    #[serde(default)]
    pub group: String,
    /// Kind of the node class
    #[serde(default)]
    pub kind: String,
    /// Name of the node class
    pub name: String,
}

/// Desired node
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "karpenter.sh",
    version = "v1",
    kind = "NodeClaim",
    status = "NodeClaimStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".metadata.labels.node\\.kubernetes\\.io/instance-type"}"#,
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".metadata.labels.topology\\.kubernetes\\.io/zone"}"#,
    printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Node class used to launch this node
    pub node_class_ref: NodeClassReference,

    /// Scheduling requirements the launched node must satisfy
    #[serde(default)]
    pub requirements: Vec<Requirement>,

    /// Minimum resources the node must offer
    #[serde(default)]
    pub resources: ResourceList,

    /// Taints applied for the lifetime of the node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Taints applied at startup and removed by an external agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
}

/// Observed node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// `proxmox://<region>/<vmid>`
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Template the VM was cloned from, `<region>/<zone>/<vmid>`
    #[serde(default, rename = "imageID", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Name of the Kubernetes node once registered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Total resources of the node
    #[serde(default)]
    pub capacity: ResourceList,

    /// Resources available to pods
    #[serde(default)]
    pub allocatable: ResourceList,
}

impl NodeClaim {
    /// Scheduling requirements as a queryable set
    pub fn requirements(&self) -> Requirements<'_> {
        Requirements(&self.spec.requirements)
    }

    /// Provider id recorded in status, if launched
    pub fn provider_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Label value on the claim
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().get(key).map(String::as_str)
    }

    /// Labels, creating the map if absent
    pub fn labels_mut_or_default(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.labels.get_or_insert_with(BTreeMap::new)
    }

    /// Annotations, creating the map if absent
    pub fn annotations_mut_or_default(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.annotations.get_or_insert_with(BTreeMap::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LABEL_REGION;

    #[test]
    fn test_provider_id_ignores_empty_string() {
        let mut claim = NodeClaim::new("worker-abc", NodeClaimSpec::default());
        assert_eq!(claim.provider_id(), None);

        claim.status = Some(NodeClaimStatus {
            provider_id: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(claim.provider_id(), None);

        claim.status = Some(NodeClaimStatus {
            provider_id: Some("proxmox://r1/1001".to_string()),
            ..Default::default()
        });
        assert_eq!(claim.provider_id(), Some("proxmox://r1/1001"));
    }

    #[test]
    fn test_status_serializes_with_karpenter_field_names() {
        let status = NodeClaimStatus {
            provider_id: Some("proxmox://r1/1001".to_string()),
            image_id: Some("r1/z1/9000".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).expect("serializable");
        assert_eq!(json["providerID"], "proxmox://r1/1001");
        assert_eq!(json["imageID"], "r1/z1/9000");
    }

    #[test]
    fn test_label_accessors() {
        let mut claim = NodeClaim::new("worker-abc", NodeClaimSpec::default());
        claim
            .labels_mut_or_default()
            .insert(LABEL_REGION.to_string(), "r1".to_string());
        assert_eq!(claim.label(LABEL_REGION), Some("r1"));
    }
}
