//! Test doubles for the collaborators the provisioning path drives
//!
//! automock output of kpve-pve and kpve-common is not visible outside those
//! crates, so the doubles are declared here with `mock!`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use kpve_common::crd::ResourceList;
use kpve_common::kube_utils::ClusterInfoSource;
use kpve_common::Error;
use kpve_pve::{
    BootstrapTokenProvider, CapacityProvider, CloneRequest, CloudInitDocuments, CloudInitRenderer,
    CloudInitValues, ClusterPool, DownloadRequest, FirewallRule, HypervisorClient, IpFamily,
    JoinToken, NetworkInfo, StorageContent, StorageInfo, TaskId, TaskStatus, VmConfig, VmLocation,
    VmOptions, VmResourceOptions,
};

mock! {
    pub Hypervisor {}

    #[async_trait]
    impl HypervisorClient for Hypervisor {
        async fn next_id(&self, floor: u32) -> Result<u32, Error>;
        async fn find_vm(&self, vmid: u32) -> Result<Option<VmLocation>, Error>;
        async fn find_template_by_name(&self, zone: &str, name: &str) -> Result<Option<u32>, Error>;
        async fn list_templates(&self) -> Result<Vec<VmLocation>, Error>;
        async fn get_vm_config(&self, zone: &str, vmid: u32) -> Result<VmConfig, Error>;
        async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskId, Error>;
        async fn create_vm(&self, zone: &str, vmid: u32, options: &VmOptions) -> Result<TaskId, Error>;
        async fn configure_vm(&self, zone: &str, vmid: u32, options: &VmOptions) -> Result<(), Error>;
        async fn resize_disk(&self, zone: &str, vmid: u32, disk: &str, size_gib: u64) -> Result<(), Error>;
        async fn start_vm(&self, zone: &str, vmid: u32) -> Result<TaskId, Error>;
        async fn stop_vm(&self, zone: &str, vmid: u32) -> Result<TaskId, Error>;
        async fn delete_vm(&self, zone: &str, vmid: u32) -> Result<TaskId, Error>;
        async fn create_firewall_rule(&self, zone: &str, vmid: u32, rule: &FirewallRule) -> Result<(), Error>;
        async fn regenerate_cloudinit(&self, zone: &str, vmid: u32) -> Result<(), Error>;
        async fn attach_cloudinit_iso(
            &self,
            zone: &str,
            vmid: u32,
            storage: &str,
            documents: &CloudInitDocuments,
        ) -> Result<(), Error>;
        async fn list_storage_content(&self, zone: &str, storage: &str, content: &str) -> Result<Vec<StorageContent>, Error>;
        async fn download_url(&self, zone: &str, storage: &str, request: &DownloadRequest) -> Result<TaskId, Error>;
        async fn delete_volume(&self, zone: &str, volid: &str) -> Result<TaskId, Error>;
        async fn task_status(&self, zone: &str, task: &TaskId) -> Result<TaskStatus, Error>;
    }
}

mock! {
    pub Pool {}

    impl ClusterPool for Pool {
        fn regions(&self) -> Vec<String>;
        fn client(&self, region: &str) -> Result<Arc<dyn HypervisorClient>, Error>;
    }
}

mock! {
    pub Capacity {}

    #[async_trait]
    impl CapacityProvider for Capacity {
        fn regions(&self) -> Vec<String>;
        fn zones(&self, region: &str) -> Vec<String>;
        fn available_zones(&self, region: &str, capacity: &ResourceList) -> Vec<String>;
        fn fit(&self, region: &str, zone: &str, capacity: &ResourceList) -> bool;
        fn cpu_load(&self, region: &str, zone: &str) -> f64;
        fn get_storage(&self, region: &str, id: &str) -> Option<StorageInfo>;
        fn get_network(&self, region: &str, zone: &str) -> Result<NetworkInfo, Error>;
        async fn allocate_capacity_in_zone(&self, region: &str, zone: &str, options: &VmResourceOptions) -> Result<VmResourceOptions, Error>;
        async fn release_capacity_in_zone(&self, region: &str, zone: &str, options: &VmResourceOptions) -> Result<(), Error>;
        async fn occupy_address(&self, region: &str, zone: &str, bridge: &str, vmid: u32, family: IpFamily) -> Result<String, Error>;
        async fn refresh_capacity(&self, region: &str, zone: &str) -> Result<(), Error>;
    }
}

mock! {
    pub Tokens {}

    #[async_trait]
    impl BootstrapTokenProvider for Tokens {
        async fn issue(&self, node_claim: &str, ttl: Duration) -> Result<JoinToken, Error>;
        async fn delete(&self, token_id: &str) -> Result<(), Error>;
        async fn sweep_expired(&self) -> Result<usize, Error>;
    }
}

mock! {
    pub Renderer {}

    #[async_trait]
    impl CloudInitRenderer for Renderer {
        async fn render(&self, values: &CloudInitValues) -> Result<CloudInitDocuments, Error>;
    }
}

mock! {
    pub ClusterInfo {}

    #[async_trait]
    impl ClusterInfoSource for ClusterInfo {
        async fn cluster_ca(&self) -> Result<String, Error>;
    }
}

/// A pool with a single region served by `client`
pub fn single_region_pool(region: &str, client: Arc<MockHypervisor>) -> MockPool {
    let region = region.to_string();
    let mut pool = MockPool::new();
    let regions = vec![region.clone()];
    pool.expect_regions().returning(move || regions.clone());
    pool.expect_client().returning(move |r| {
        if r == region {
            Ok(client.clone() as Arc<dyn HypervisorClient>)
        } else {
            Err(Error::not_found("region", r))
        }
    });
    pool
}

/// A finished task; the hypervisor reports success on the first probe
pub fn finished_tasks(client: &mut MockHypervisor) {
    client
        .expect_task_status()
        .returning(|_, _| Ok(TaskStatus::stopped(TaskStatus::OK)));
}
