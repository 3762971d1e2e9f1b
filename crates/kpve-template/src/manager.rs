//! Template class lifecycle: install, update, uninstall
//!
//! Installing a class downloads its image onto import storage and creates a
//! template VM from it in each target zone. Both steps run under the zone's
//! lock for their whole duration, including the waits on hypervisor tasks,
//! so concurrent installs into one zone never race on the image file or the
//! template name.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kpve_common::crd::{ProxmoxTemplate, ProxmoxTemplateSpec, ProxmoxTemplateStatus, TemplateInstallation};
use kpve_common::keyed_lock::KeyedLock;
use kpve_common::kube_utils::TemplateStatusStore;
use kpve_common::poll::PollConfig;
use kpve_common::Error;
use kpve_pve::{
    wait_for_task, wait_for_task_status, CapacityProvider, ClusterPool, DownloadRequest,
    HypervisorClient, VmIdAllocator,
};

use crate::image::{
    image_file_name, import_storages_in_zone, import_volume, resolve_storage_roles, StorageRoles,
    IMPORT_CONTENT,
};
use crate::inventory::{InstanceTemplateInfo, TemplateFilter, TemplateInventory};
use crate::skeleton::{mutable_config, template_options};

/// Drives template classes through their lifecycle
pub struct TemplateManager {
    pool: Arc<dyn ClusterPool>,
    capacity: Arc<dyn CapacityProvider>,
    inventory: Arc<TemplateInventory>,
    status_store: Arc<dyn TemplateStatusStore>,
    vmids: Arc<VmIdAllocator>,
    zone_locks: KeyedLock,
    poll: PollConfig,
}

fn zone_key(region: &str, zone: &str) -> String {
    format!("{}/{}", region, zone)
}

/// Record a zone install, replacing whatever was recorded for that zone
fn record_installation(installed: &mut Vec<String>, entry: TemplateInstallation) {
    installed.retain(|recorded| match recorded.parse::<TemplateInstallation>() {
        Ok(inst) => inst.region != entry.region || inst.zone != entry.zone,
        Err(_) => true,
    });
    installed.push(entry.to_string());
}

impl TemplateManager {
    /// Create a manager
    pub fn new(
        pool: Arc<dyn ClusterPool>,
        capacity: Arc<dyn CapacityProvider>,
        inventory: Arc<TemplateInventory>,
        status_store: Arc<dyn TemplateStatusStore>,
        vmids: Arc<VmIdAllocator>,
        poll: PollConfig,
    ) -> Self {
        Self {
            pool,
            capacity,
            inventory,
            status_store,
            vmids,
            zone_locks: KeyedLock::new(),
            poll,
        }
    }

    /// The inventory this manager refreshes
    pub fn inventory(&self) -> &Arc<TemplateInventory> {
        &self.inventory
    }

    /// Available templates matching every filter
    pub fn list(&self, filters: &[TemplateFilter]) -> Vec<InstanceTemplateInfo> {
        self.inventory.list_with_filter(filters)
    }

    /// Rebuild the inventory of every region
    pub async fn sync(&self) -> Result<(), Error> {
        self.inventory.sync_all().await
    }

    /// Install a class in every target zone of every candidate region
    ///
    /// Already installed zones are kept and revisited idempotently. The
    /// resulting status is persisted when at least one zone is installed.
    /// Any zone failure is returned after the others were attempted.
    #[instrument(skip(self, template, cancel), fields(template = %template.name_any()))]
    pub async fn create(
        &self,
        template: &ProxmoxTemplate,
        cancel: &CancellationToken,
    ) -> Result<ProxmoxTemplateStatus, Error> {
        let name = template.name_any();
        let spec = &template.spec;
        let current = template.status.clone().unwrap_or_default();
        let image_file = image_file_name(&name, &spec.image);

        if let Some(installed) = current.image_id.as_deref() {
            if installed != image_file && !current.zones.is_empty() {
                return Err(Error::configuration(
                    name,
                    format!(
                        "image {} is installed but {} is desired; delete the template first",
                        installed, image_file
                    ),
                ));
            }
        }

        let regions = match &spec.region {
            Some(region) => vec![region.clone()],
            None => self.pool.regions(),
        };

        let mut installed: Vec<String> = current.zones.clone();
        let mut errors = Vec::new();

        for region in &regions {
            let roles = match resolve_storage_roles(self.capacity.as_ref(), region, &spec.storage_ids) {
                Ok(roles) => roles,
                Err(e) => {
                    warn!(region = %region, error = %e, "cannot resolve template storages");
                    errors.push(e);
                    continue;
                }
            };

            for zone in &roles.zones {
                match self
                    .install_zone(&name, spec, region, zone, &roles, &image_file, cancel)
                    .await
                {
                    Ok(vmid) => {
                        let entry = TemplateInstallation {
                            region: region.clone(),
                            zone: zone.clone(),
                            vmid,
                        };
                        record_installation(&mut installed, entry);
                    }
                    Err(e) => {
                        warn!(region = %region, zone = %zone, error = %e, "template install failed");
                        errors.push(e);
                    }
                }
            }
        }

        let status = ProxmoxTemplateStatus {
            image_id: Some(image_file),
            zones: installed,
        };
        if !status.zones.is_empty() {
            self.status_store.patch_status(&name, &status).await?;
        }

        match Error::join(format!("template {}", name), errors) {
            Some(e) => Err(e),
            None if status.zones.is_empty() => Err(Error::configuration(
                name,
                "no region offers storage for this template",
            )),
            None => {
                info!(zones = status.zones.len(), "template installed");
                Ok(status)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn install_zone(
        &self,
        name: &str,
        spec: &ProxmoxTemplateSpec,
        region: &str,
        zone: &str,
        roles: &StorageRoles,
        image_file: &str,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        let client = self.pool.client(region)?;

        let vmid = {
            let _guard = self.zone_locks.lock(&zone_key(region, zone)).await;
            self.ensure_image(client.as_ref(), name, spec, zone, &roles.import.id, image_file, cancel)
                .await?;
            self.ensure_template(client.as_ref(), name, spec, region, zone, roles, image_file, cancel)
                .await?
        };

        if let Err(e) = self.inventory.sync_region(region).await {
            warn!(region = %region, error = %e, "inventory refresh after install failed");
        }
        Ok(vmid)
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_image(
        &self,
        client: &dyn HypervisorClient,
        name: &str,
        spec: &ProxmoxTemplateSpec,
        zone: &str,
        storage: &str,
        image_file: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let volid = import_volume(storage, image_file);
        let content = client.list_storage_content(zone, storage, IMPORT_CONTENT).await?;
        if content.iter().any(|c| c.volid == volid) {
            debug!(zone = %zone, volid = %volid, "image already present");
            return Ok(());
        }

        info!(zone = %zone, volid = %volid, url = %spec.image.url, "downloading image");
        let request = DownloadRequest {
            url: spec.image.url.clone(),
            content: IMPORT_CONTENT.to_string(),
            filename: image_file.to_string(),
            checksum: spec.image.checksum.clone(),
            checksum_algorithm: spec
                .image
                .checksum
                .as_ref()
                .map(|_| spec.image.checksum_algorithm.as_str().to_string()),
        };
        let task = client.download_url(zone, storage, &request).await?;
        let status = wait_for_task_status(client, zone, &task, &self.poll, cancel).await?;
        if status.is_success() {
            return Ok(());
        }

        let exit = status.exit_status.unwrap_or_default();
        if exit.to_ascii_lowercase().contains("checksum") {
            return Err(Error::validation_for_field(
                name,
                "spec.image.checksum",
                format!("download of {} failed verification: {}", spec.image.url, exit),
            ));
        }
        Err(Error::infrastructure(
            format!("download {}", volid),
            exit,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_template(
        &self,
        client: &dyn HypervisorClient,
        name: &str,
        spec: &ProxmoxTemplateSpec,
        region: &str,
        zone: &str,
        roles: &StorageRoles,
        image_file: &str,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        if let Some(vmid) = client.find_template_by_name(zone, name).await? {
            debug!(zone = %zone, vmid, "template VM already exists");
            return Ok(vmid);
        }

        let vmid = self.vmids.allocate(region, client).await?;
        let options = template_options(name, spec, roles, image_file);

        info!(zone = %zone, vmid, "creating template VM");
        // A rejected create owns nothing; the id may belong to someone else
        let task = client.create_vm(zone, vmid, &options).await?;

        if let Err(e) = wait_for_task(client, zone, &task, &self.poll, cancel).await {
            // A failed create task may leave a half-built VM behind
            match client.delete_vm(zone, vmid).await {
                Ok(task) => {
                    if let Err(cleanup) = wait_for_task(client, zone, &task, &self.poll, cancel).await {
                        warn!(zone = %zone, vmid, error = %cleanup, "cleanup of failed template VM did not finish");
                    }
                }
                Err(cleanup) if cleanup.is_not_found() => {}
                Err(cleanup) => {
                    warn!(zone = %zone, vmid, error = %cleanup, "cleanup of failed template VM failed");
                }
            }
            return Err(e);
        }

        Ok(vmid)
    }

    /// Re-apply the class's mutable configuration to every installed template VM
    ///
    /// Zones are updated independently; all failures are returned together.
    #[instrument(skip(self, template), fields(template = %template.name_any()))]
    pub async fn update(&self, template: &ProxmoxTemplate) -> Result<(), Error> {
        let name = template.name_any();
        let status = template.status.clone().unwrap_or_default();

        let mut errors = Vec::new();
        let mut regions = BTreeSet::new();

        for entry in &status.zones {
            let result = match entry.parse::<TemplateInstallation>() {
                Ok(inst) => {
                    regions.insert(inst.region.clone());
                    self.update_zone(&template.spec, &inst).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(entry = %entry, error = %e, "template update failed");
                errors.push(e);
            }
        }

        for region in &regions {
            if let Err(e) = self.inventory.sync_region(region).await {
                warn!(region = %region, error = %e, "inventory refresh after update failed");
            }
        }

        match Error::join(format!("template {}", name), errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn update_zone(
        &self,
        spec: &ProxmoxTemplateSpec,
        inst: &TemplateInstallation,
    ) -> Result<(), Error> {
        let client = self.pool.client(&inst.region)?;
        let current = client.get_vm_config(&inst.zone, inst.vmid).await?;

        let options = mutable_config(spec, Some(&current));
        if options.is_empty() {
            return Ok(());
        }
        client.configure_vm(&inst.zone, inst.vmid, &options).await?;
        debug!(zone = %inst.zone, vmid = inst.vmid, "template VM updated");
        Ok(())
    }

    /// Remove every installed template VM and its source image
    ///
    /// Entries that could not be cleaned up stay in the persisted status and
    /// the call fails, so the caller retries instead of forgetting them.
    #[instrument(skip(self, template, cancel), fields(template = %template.name_any()))]
    pub async fn delete(
        &self,
        template: &ProxmoxTemplate,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let name = template.name_any();
        let status = template.status.clone().unwrap_or_default();
        let image_file = status
            .image_id
            .clone()
            .unwrap_or_else(|| image_file_name(&name, &template.spec.image));

        let mut remaining = Vec::new();
        let mut errors = Vec::new();
        let mut regions = BTreeSet::new();

        for entry in &status.zones {
            let result = match entry.parse::<TemplateInstallation>() {
                Ok(inst) => {
                    regions.insert(inst.region.clone());
                    self.uninstall_zone(&template.spec, &inst, &image_file, cancel)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(entry = %entry, error = %e, "template removal failed");
                remaining.push(entry.clone());
                errors.push(e);
            }
        }

        let new_status = ProxmoxTemplateStatus {
            image_id: (!remaining.is_empty()).then_some(image_file),
            zones: remaining,
        };
        self.status_store.patch_status(&name, &new_status).await?;

        for region in &regions {
            if let Err(e) = self.inventory.sync_region(region).await {
                warn!(region = %region, error = %e, "inventory refresh after delete failed");
            }
        }

        match Error::join(format!("template {}", name), errors) {
            Some(e) => Err(e),
            None => {
                info!("template removed");
                Ok(())
            }
        }
    }

    async fn uninstall_zone(
        &self,
        spec: &ProxmoxTemplateSpec,
        inst: &TemplateInstallation,
        image_file: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let client = self.pool.client(&inst.region)?;
        let _guard = self.zone_locks.lock(&zone_key(&inst.region, &inst.zone)).await;

        match client.find_vm(inst.vmid).await? {
            Some(vm) => {
                let task = client.delete_vm(&vm.zone, inst.vmid).await?;
                wait_for_task(client.as_ref(), &vm.zone, &task, &self.poll, cancel).await?;
                info!(zone = %vm.zone, vmid = inst.vmid, "template VM deleted");
            }
            None => debug!(vmid = inst.vmid, "template VM already gone"),
        }

        let storages =
            import_storages_in_zone(self.capacity.as_ref(), &inst.region, &inst.zone, &spec.storage_ids);
        for storage in storages {
            let volid = import_volume(&storage, image_file);
            let content = client
                .list_storage_content(&inst.zone, &storage, IMPORT_CONTENT)
                .await?;
            if !content.iter().any(|c| c.volid == volid) {
                continue;
            }
            let task = client.delete_volume(&inst.zone, &volid).await?;
            wait_for_task(client.as_ref(), &inst.zone, &task, &self.poll, cancel).await?;
            info!(zone = %inst.zone, volid = %volid, "image deleted");
        }

        Ok(())
    }
}
