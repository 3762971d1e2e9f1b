//! Capacity bookkeeping interface
//!
//! The capacity provider tracks per-zone CPU, memory, storage and address
//! usage of a region. Reservations are keyed by VM id and may be released
//! after a failed launch, so allocate and release must tolerate being
//! interleaved with the VM's own lifecycle.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use kpve_common::crd::ResourceList;
use kpve_common::Error;

use crate::device::CpuSet;
use crate::vm::VmConfig;

/// The unit of capacity reservation
///
/// A successful allocation must be matched by exactly one release carrying
/// an equal or compatible descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmResourceOptions {
    /// VM id the reservation belongs to
    pub vmid: u32,
    /// vCPUs
    pub cpus: u32,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Boot disk size in GiB
    pub disk_gib: u64,
    /// Storage backing the boot disk
    pub storage_id: Option<String>,
    /// Request host CPU pinning
    pub numa: bool,
    /// Host CPUs granted when pinning was requested
    pub cpu_set: Option<CpuSet>,
}

impl VmResourceOptions {
    /// Reservation for a VM of the given capacity
    pub fn new(vmid: u32, capacity: &ResourceList, disk_gib: u64) -> Self {
        Self {
            vmid,
            cpus: capacity.vcpus(),
            memory_mib: capacity.memory_mib(),
            disk_gib,
            ..Default::default()
        }
    }

    /// Reconstruct the reservation of an existing VM from its configuration
    pub fn from_config(vmid: u32, config: &VmConfig) -> Self {
        let boot = config.boot_disk().map(|(_, disk)| disk);
        Self {
            vmid,
            cpus: config.vcpus(),
            memory_mib: config.memory_mib.unwrap_or_default(),
            disk_gib: boot.and_then(|d| d.size_gib()).unwrap_or_default(),
            storage_id: boot.and_then(|d| d.storage_id()).map(str::to_string),
            numa: config.numa || config.affinity.is_some(),
            cpu_set: config.affinity.clone(),
        }
    }

    /// Whether releasing `other` undoes this reservation
    pub fn is_compatible(&self, other: &VmResourceOptions) -> bool {
        self.vmid == other.vmid
            && self.cpus == other.cpus
            && self.memory_mib == other.memory_mib
            && self.disk_gib <= other.disk_gib
    }
}

/// A storage as seen from a region
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageInfo {
    /// Storage id
    pub id: String,
    /// Content types the storage accepts
    pub content: Vec<String>,
    /// Zones the storage is reachable from
    pub zones: Vec<String>,
    /// Shared across zones
    pub shared: bool,
}

impl StorageInfo {
    /// Whether the storage accepts a content type
    pub fn supports(&self, content: &str) -> bool {
        self.content.iter().any(|c| c == content)
    }
}

/// Address family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// A host bridge and its addressing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeInfo {
    /// Bridge name
    pub name: String,
    /// MTU
    pub mtu: Option<u32>,
    /// IPv4 subnet (CIDR)
    pub ipv4_subnet: Option<String>,
    /// IPv4 gateway
    pub ipv4_gateway: Option<String>,
    /// IPv6 subnet (CIDR)
    pub ipv6_subnet: Option<String>,
    /// IPv6 gateway
    pub ipv6_gateway: Option<String>,
}

/// Networking of a zone
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Host bridges
    pub bridges: Vec<BridgeInfo>,
}

impl NetworkInfo {
    /// Look up a bridge by name
    pub fn bridge(&self, name: &str) -> Option<&BridgeInfo> {
        self.bridges.iter().find(|b| b.name == name)
    }
}

/// Per-region, per-zone resource bookkeeping
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Regions with capacity data
    fn regions(&self) -> Vec<String>;

    /// Zones of a region
    fn zones(&self, region: &str) -> Vec<String>;

    /// Zones of a region that can fit `capacity`
    fn available_zones(&self, region: &str, capacity: &ResourceList) -> Vec<String>;

    /// Whether a zone can fit `capacity`
    fn fit(&self, region: &str, zone: &str, capacity: &ResourceList) -> bool;

    /// CPU load of a zone, 0-100
    fn cpu_load(&self, region: &str, zone: &str) -> f64;

    /// A storage of a region
    fn get_storage(&self, region: &str, id: &str) -> Option<StorageInfo>;

    /// Networking of a zone
    fn get_network(&self, region: &str, zone: &str) -> Result<NetworkInfo, Error>;

    /// Reserve resources for a VM; returns the granted reservation
    async fn allocate_capacity_in_zone(
        &self,
        region: &str,
        zone: &str,
        options: &VmResourceOptions,
    ) -> Result<VmResourceOptions, Error>;

    /// Return a reservation
    async fn release_capacity_in_zone(
        &self,
        region: &str,
        zone: &str,
        options: &VmResourceOptions,
    ) -> Result<(), Error>;

    /// Claim a free address on a bridge for a VM; returns it in CIDR form
    async fn occupy_address(
        &self,
        region: &str,
        zone: &str,
        bridge: &str,
        vmid: u32,
        family: IpFamily,
    ) -> Result<String, Error>;

    /// Re-read a zone's usage from the hypervisor
    async fn refresh_capacity(&self, region: &str, zone: &str) -> Result<(), Error>;
}
