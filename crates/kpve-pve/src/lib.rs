//! Hypervisor-facing interfaces for kpve
//!
//! The wire-level API client, capacity bookkeeping and bootstrap credential
//! issuance live outside this workspace. This crate defines the traits the
//! provider core drives them through, plus the typed VM configuration that
//! crosses that boundary.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod capacity;
pub mod client;
pub mod device;
pub mod task;
pub mod vm;
pub mod vmid;

pub use bootstrap::{
    BootstrapTokenProvider, CloudInitDocuments, CloudInitRenderer, CloudInitValues,
    InterfaceValues, JoinToken, KubeletOverrides,
};
pub use capacity::{
    BridgeInfo, CapacityProvider, IpFamily, NetworkInfo, StorageInfo, VmResourceOptions,
};
pub use client::{
    CloneRequest, ClusterPool, DownloadRequest, FirewallRule, HypervisorClient, StorageContent,
    TaskId, TaskStatus,
};
pub use task::{wait_for_task, wait_for_task_status};
pub use vm::{VmConfig, VmLocation, VmMetadata, VmOptions, VmStatus};
pub use vmid::VmIdAllocator;
