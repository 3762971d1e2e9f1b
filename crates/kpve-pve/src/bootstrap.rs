//! Node bootstrap collaborators: join tokens and cloud-init rendering
//!
//! Both are implemented outside the provider core. The orchestrator issues a
//! short-lived token per node claim, feeds it with the cluster CA and kubelet
//! overrides into the renderer, and attaches the result as an ISO.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use kpve_common::crd::{InstanceTypeOverhead, KubeletConfiguration, ResourceList, Taint};
use kpve_common::Error;

/// A bootstrap token a node uses to join the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinToken {
    /// Public token id
    pub id: String,
    /// Token secret
    pub secret: String,
    /// When the token stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl JoinToken {
    /// The `<id>.<secret>` form kubeadm expects
    pub fn token(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    /// Whether the token has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Issues and revokes node join tokens
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapTokenProvider: Send + Sync {
    /// Issue a token for a node claim
    async fn issue(&self, node_claim: &str, ttl: Duration) -> Result<JoinToken, Error>;

    /// Revoke a token; revoking an unknown token succeeds
    async fn delete(&self, token_id: &str) -> Result<(), Error>;

    /// Remove expired tokens; returns how many were removed
    async fn sweep_expired(&self) -> Result<usize, Error>;
}

/// Kubelet settings derived from an instance type's overhead
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KubeletOverrides {
    /// `--kube-reserved`
    pub kube_reserved: BTreeMap<String, String>,
    /// `--system-reserved`
    pub system_reserved: BTreeMap<String, String>,
    /// `--eviction-hard`, as `<signal>` -> `<quantity>`
    pub eviction_hard: BTreeMap<String, String>,
    /// `--max-pods`
    pub max_pods: Option<u64>,
    /// `--cluster-dns`
    pub cluster_dns: Vec<String>,
}

impl KubeletOverrides {
    /// Derive from reserved and evicted resources, applying node class overrides
    pub fn from_overhead(
        overhead: &InstanceTypeOverhead,
        pods: u64,
        kubelet: Option<&KubeletConfiguration>,
    ) -> Self {
        let mut eviction_hard = BTreeMap::new();
        if overhead.eviction_threshold.memory_bytes > 0 {
            eviction_hard.insert(
                "memory.available".to_string(),
                format!("{}Mi", overhead.eviction_threshold.memory_mib()),
            );
        }
        if overhead.eviction_threshold.ephemeral_storage_bytes > 0 {
            eviction_hard.insert(
                "nodefs.available".to_string(),
                format!("{}Gi", overhead.eviction_threshold.ephemeral_storage_gib()),
            );
        }

        Self {
            kube_reserved: reserved_map(&overhead.kube_reserved),
            system_reserved: reserved_map(&overhead.system_reserved),
            eviction_hard,
            max_pods: kubelet
                .and_then(|k| k.max_pods)
                .or((pods > 0).then_some(pods)),
            cluster_dns: kubelet.map(|k| k.cluster_dns.clone()).unwrap_or_default(),
        }
    }

    /// Render a reservation map as `k=v,k=v`
    pub fn join(map: &BTreeMap<String, String>) -> String {
        map.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn reserved_map(resources: &ResourceList) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if resources.cpu_millis > 0 {
        map.insert("cpu".to_string(), format!("{}m", resources.cpu_millis));
    }
    if resources.memory_bytes > 0 {
        map.insert("memory".to_string(), format!("{}Mi", resources.memory_mib()));
    }
    if resources.ephemeral_storage_bytes > 0 {
        map.insert(
            "ephemeral-storage".to_string(),
            format!("{}Gi", resources.ephemeral_storage_gib()),
        );
    }
    map
}

/// Addressing of one guest interface for the network-config document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceValues {
    /// Interface name inside the guest (`eth0`, ...)
    pub name: String,
    /// MAC address
    pub mac: Option<String>,
    /// MTU
    pub mtu: Option<u32>,
    /// IPv4 address in CIDR form, or "dhcp"
    pub ipv4: Option<String>,
    /// IPv4 gateway
    pub gateway4: Option<String>,
    /// IPv6 address in CIDR form, "dhcp" or "auto"
    pub ipv6: Option<String>,
    /// IPv6 gateway
    pub gateway6: Option<String>,
}

/// Everything the renderer needs to produce a node's cloud-init documents
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudInitValues {
    /// Guest hostname
    pub hostname: String,
    /// Cluster name
    pub cluster_name: String,
    /// Node provider id
    pub provider_id: String,
    /// Region
    pub region: String,
    /// Zone
    pub zone: String,
    /// Instance type name
    pub instance_type: String,
    /// PEM-encoded cluster CA
    pub cluster_ca: String,
    /// `<id>.<secret>` bootstrap token
    pub join_token: String,
    /// Kubelet settings
    pub kubelet: KubeletOverrides,
    /// Node labels registered by the kubelet
    pub labels: BTreeMap<String, String>,
    /// Node taints registered by the kubelet
    pub taints: Vec<Taint>,
    /// Guest interfaces
    pub interfaces: Vec<InterfaceValues>,
}

/// Rendered cloud-init documents
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudInitDocuments {
    /// user-data
    pub user_data: String,
    /// meta-data
    pub meta_data: String,
    /// vendor-data
    pub vendor_data: String,
    /// network-config
    pub network_config: String,
}

/// Renders cloud-init documents for a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudInitRenderer: Send + Sync {
    /// Render the documents for one node
    async fn render(&self, values: &CloudInitValues) -> Result<CloudInitDocuments, Error>;
}
