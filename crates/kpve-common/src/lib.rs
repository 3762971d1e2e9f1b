//! Common types for kpve: CRDs, instance types, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod hash;
pub mod keyed_lock;
pub mod kube_utils;
pub mod poll;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Scheme prefix of node provider ids (`proxmox://<region>/<vmid>`)
pub const PROVIDER_ID_SCHEME: &str = "proxmox://";

/// Well-known topology label for the hypervisor cluster
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";

/// Well-known topology label for the hypervisor node
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";

/// Well-known instance type label
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

/// Karpenter capacity type label
pub const LABEL_CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";

/// Instance family label (prefix of the instance type name)
pub const LABEL_INSTANCE_FAMILY: &str = "karpenter.kpve.dev/instance-family";

/// CPU model label of the launched VM
pub const LABEL_INSTANCE_CPU_TYPE: &str = "karpenter.kpve.dev/instance-cpu-type";

/// Annotation holding the bootstrap token id issued for a node claim
pub const ANNOTATION_BOOTSTRAP_TOKEN: &str = "karpenter.kpve.dev/bootstrap-token";

/// Annotation holding the template the node was cloned from
pub const ANNOTATION_TEMPLATE_ID: &str = "karpenter.kpve.dev/template-id";

/// Taint placed on a node until it has registered with the cluster
pub const TAINT_UNREGISTERED: &str = "karpenter.sh/unregistered";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "kpve-controller";
