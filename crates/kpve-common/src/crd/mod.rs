//! Custom Resource Definitions and scheduling types for kpve

mod instance_type;
mod node_claim;
mod node_class;
mod template;
mod types;

pub use instance_type::{InstanceType, InstanceTypeOverhead, Offering};
pub use node_claim::{NodeClaim, NodeClaimSpec, NodeClaimStatus, NodeClassReference};
pub use node_class::{
    BootDevice, KubeletConfiguration, MetadataDelivery, MetadataOptions, PlacementStrategy,
    ProxmoxNodeClass, ProxmoxNodeClassSpec, SecurityGroup, TemplateReference, ZoneBalance,
};
pub use template::{
    AgentSpec, ChecksumAlgorithm, CpuSpec, ImageSource, NetworkInterfaceSpec, PciDeviceSpec,
    ProxmoxTemplate, ProxmoxTemplateSpec, ProxmoxTemplateStatus, TemplateInstallation, VgaSpec,
};
pub use types::{
    CapacityType, Requirement, RequirementOperator, Requirements, ResourceList, Taint, TaintEffect,
};
