//! ProxmoxNodeClass: how to realize nodes on the hypervisor
//!
//! Example:
//! ```yaml
//! apiVersion: karpenter.kpve.dev/v1alpha1
//! kind: ProxmoxNodeClass
//! metadata:
//!   name: default
//! spec:
//!   region: r1
//!   placementStrategy:
//!     zoneBalance: Balanced
//!   instanceTemplateRef:
//!     name: ubuntu-noble
//!   bootDevice:
//!     size: 30
//!   securityGroups:
//!     - name: kubernetes
//!   metadataOptions:
//!     type: cdrom
//! ```

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How zones are ordered when several can host a node
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ZoneBalance {
    /// Random order, to spread launches and avoid herding
    AvailabilityFirst,
    /// Least CPU-loaded zone first
    #[default]
    Balanced,
}

/// Placement policy of a node class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStrategy {
    /// Zone ordering policy
    #[serde(default)]
    pub zone_balance: ZoneBalance,
}

/// Reference to a ProxmoxTemplate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TemplateReference {
    /// Name of the template class
    pub name: String,
}

/// Boot disk settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootDevice {
    /// Requested size in GiB; grown to the instance type's ephemeral storage if smaller
    #[serde(default)]
    pub size: u64,

    /// Storage for the cloned disks; defaults to the template's storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// Firewall security group applied to the VM
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    /// Cluster-level security group name
    pub name: String,

    /// Restrict the rule to one interface (e.g., "net0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// How instance metadata (cloud-init) reaches the VM
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataDelivery {
    /// Metadata is baked into the template or delivered out of band
    #[default]
    None,
    /// Rendered cloud-init attached as an ISO on a CD-ROM drive
    Cdrom,
}

/// Metadata delivery settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOptions {
    /// Delivery mode
    #[serde(default, rename = "type")]
    pub delivery: MetadataDelivery,
}

/// Kubelet settings passed through cloud-init
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    /// Override the instance type's pod limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<u64>,

    /// Cluster DNS addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_dns: Vec<String>,
}

/// Node class specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "karpenter.kpve.dev",
    version = "v1alpha1",
    kind = "ProxmoxNodeClass",
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.instanceTemplateRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxNodeClassSpec {
    /// Hypervisor cluster to launch in; unset means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Zone ordering policy
    #[serde(default)]
    pub placement_strategy: PlacementStrategy,

    /// Template to clone nodes from
    pub instance_template_ref: TemplateReference,

    /// Boot disk settings
    #[serde(default)]
    pub boot_device: BootDevice,

    /// Extra VM tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Firewall security groups, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<SecurityGroup>,

    /// How cloud-init reaches the VM
    #[serde(default)]
    pub metadata_options: MetadataOptions,

    /// Hypervisor resource pool for launched VMs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,

    /// Pin vCPUs to a NUMA-local CPU set
    #[serde(default)]
    pub numa_pinning: bool,

    /// Kubelet overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletConfiguration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_spec_defaults() {
        let spec: ProxmoxNodeClassSpec =
            serde_json::from_str(r#"{"instanceTemplateRef":{"name":"noble"}}"#)
                .expect("valid spec");
        assert_eq!(spec.placement_strategy.zone_balance, ZoneBalance::Balanced);
        assert_eq!(spec.metadata_options.delivery, MetadataDelivery::None);
        assert!(spec.region.is_none());
        assert!(!spec.numa_pinning);
    }

    #[test]
    fn test_cdrom_delivery_parses() {
        let spec: ProxmoxNodeClassSpec = serde_json::from_str(
            r#"{
                "region": "r1",
                "instanceTemplateRef": {"name": "noble"},
                "placementStrategy": {"zoneBalance": "AvailabilityFirst"},
                "metadataOptions": {"type": "cdrom"},
                "securityGroups": [{"name": "kubernetes"}, {"name": "ssh", "interface": "net0"}]
            }"#,
        )
        .expect("valid spec");
        assert_eq!(spec.metadata_options.delivery, MetadataDelivery::Cdrom);
        assert_eq!(
            spec.placement_strategy.zone_balance,
            ZoneBalance::AvailabilityFirst
        );
        assert_eq!(spec.security_groups[1].interface.as_deref(), Some("net0"));
    }
}
