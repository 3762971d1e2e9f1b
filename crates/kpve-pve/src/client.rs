//! Hypervisor API client interface
//!
//! One [`HypervisorClient`] talks to one hypervisor cluster (a region). The
//! [`ClusterPool`] hands out the client for a region. Operations that run as
//! hypervisor tasks return a [`TaskId`] to be awaited with
//! [`wait_for_task`](crate::task::wait_for_task).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use kpve_common::Error;

use crate::bootstrap::CloudInitDocuments;
use crate::vm::{VmConfig, VmLocation, VmOptions};

/// Identifier of an asynchronous hypervisor task (a UPID)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Wrap a task identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of an asynchronous task
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskStatus {
    /// Still running
    pub running: bool,
    /// Exit status once stopped; "OK" on success
    pub exit_status: Option<String>,
}

impl TaskStatus {
    /// Exit status reported by successful tasks
    pub const OK: &'static str = "OK";

    /// A task still in progress
    pub fn running() -> Self {
        Self {
            running: true,
            exit_status: None,
        }
    }

    /// A stopped task with the given exit status
    pub fn stopped(exit_status: impl Into<String>) -> Self {
        Self {
            running: false,
            exit_status: Some(exit_status.into()),
        }
    }

    /// Whether the task stopped
    pub fn is_finished(&self) -> bool {
        !self.running
    }

    /// Whether the task stopped successfully
    pub fn is_success(&self) -> bool {
        !self.running && self.exit_status.as_deref() == Some(Self::OK)
    }
}

/// Parameters for cloning a VM
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloneRequest {
    /// Zone holding the source VM
    pub source_zone: String,
    /// Source VM (usually a template)
    pub source_vmid: u32,
    /// Id of the new VM
    pub new_vmid: u32,
    /// Zone the clone lands in; differs from the source only on shared storage
    pub target_zone: String,
    /// Name of the new VM
    pub name: String,
    /// Full (independent) clone rather than a linked clone
    pub full: bool,
    /// Target storage for the clone's disks
    pub storage: Option<String>,
    /// Resource pool to add the clone to
    pub pool: Option<String>,
}

/// A firewall rule attached to a VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    /// Rule type ("group" for security-group references)
    pub kind: String,
    /// Action, or the security group name for group rules
    pub action: String,
    /// Interface the rule is bound to
    pub iface: Option<String>,
    /// Enabled
    pub enable: bool,
}

impl FirewallRule {
    /// A rule that applies a security group
    pub fn group(name: impl Into<String>, iface: Option<String>) -> Self {
        Self {
            kind: "group".to_string(),
            action: name.into(),
            iface,
            enable: true,
        }
    }
}

/// One volume on a storage
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageContent {
    /// Volume id, `<storage>:<content>/<file>`
    pub volid: String,
    /// Content type ("import", "images", "iso", ...)
    pub content: String,
    /// Size in bytes
    pub size: u64,
}

/// Download of a remote file onto a storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Source URL
    pub url: String,
    /// Content type of the target
    pub content: String,
    /// File name on the storage
    pub filename: String,
    /// Expected checksum
    pub checksum: Option<String>,
    /// Checksum algorithm ("sha256", "sha512")
    pub checksum_algorithm: Option<String>,
}

/// Operations against one hypervisor cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Next free VM id at or above `floor`
    async fn next_id(&self, floor: u32) -> Result<u32, Error>;

    /// Locate a VM anywhere in the cluster
    async fn find_vm(&self, vmid: u32) -> Result<Option<VmLocation>, Error>;

    /// Locate a template VM by name on one zone
    async fn find_template_by_name(&self, zone: &str, name: &str) -> Result<Option<u32>, Error>;

    /// Every template VM in the cluster
    async fn list_templates(&self) -> Result<Vec<VmLocation>, Error>;

    /// Current configuration of a VM; `NotFound` if it does not exist
    async fn get_vm_config(&self, zone: &str, vmid: u32) -> Result<VmConfig, Error>;

    /// Clone a VM
    async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskId, Error>;

    /// Create a VM from raw options
    async fn create_vm(&self, zone: &str, vmid: u32, options: &VmOptions) -> Result<TaskId, Error>;

    /// Apply a configuration change
    async fn configure_vm(&self, zone: &str, vmid: u32, options: &VmOptions) -> Result<(), Error>;

    /// Grow a disk to an absolute size
    async fn resize_disk(&self, zone: &str, vmid: u32, disk: &str, size_gib: u64)
        -> Result<(), Error>;

    /// Power on
    async fn start_vm(&self, zone: &str, vmid: u32) -> Result<TaskId, Error>;

    /// Power off immediately
    async fn stop_vm(&self, zone: &str, vmid: u32) -> Result<TaskId, Error>;

    /// Destroy a VM and its disks
    async fn delete_vm(&self, zone: &str, vmid: u32) -> Result<TaskId, Error>;

    /// Attach a firewall rule
    async fn create_firewall_rule(&self, zone: &str, vmid: u32, rule: &FirewallRule)
        -> Result<(), Error>;

    /// Rebuild the hypervisor-managed cloud-init drive
    async fn regenerate_cloudinit(&self, zone: &str, vmid: u32) -> Result<(), Error>;

    /// Upload rendered cloud-init documents as an ISO and attach it
    async fn attach_cloudinit_iso(
        &self,
        zone: &str,
        vmid: u32,
        storage: &str,
        documents: &CloudInitDocuments,
    ) -> Result<(), Error>;

    /// Volumes of one content type on a storage
    async fn list_storage_content(
        &self,
        zone: &str,
        storage: &str,
        content: &str,
    ) -> Result<Vec<StorageContent>, Error>;

    /// Download a URL onto a storage
    async fn download_url(
        &self,
        zone: &str,
        storage: &str,
        request: &DownloadRequest,
    ) -> Result<TaskId, Error>;

    /// Delete a volume
    async fn delete_volume(&self, zone: &str, volid: &str) -> Result<TaskId, Error>;

    /// Progress of a task
    async fn task_status(&self, zone: &str, task: &TaskId) -> Result<TaskStatus, Error>;
}

/// Per-region hypervisor clients
#[cfg_attr(test, automock)]
pub trait ClusterPool: Send + Sync {
    /// Configured regions
    fn regions(&self) -> Vec<String>;

    /// Client for a region; `NotFound` for unknown regions
    fn client(&self, region: &str) -> Result<Arc<dyn HypervisorClient>, Error>;
}
