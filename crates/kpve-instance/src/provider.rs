//! Launch, look up and tear down nodes
//!
//! # Launch
//!
//! [`InstanceProvider::create`] walks instance types cheapest first, then
//! candidate regions, then zones in placement order, and launches in the
//! first zone that works. Per-zone failures are collected rather than
//! returned so the rest of the search still runs; an exhausted search
//! reports every attempt as insufficient capacity.
//!
//! One launch reserves capacity, clones the template, shapes the VM,
//! configures its networking and firewall, optionally attaches cloud-init,
//! and starts it. Each side effect pushes its undo step onto a
//! [`RollbackStack`] as soon as it succeeds, so a failure at any point
//! leaves no VM, reservation or token behind.

use std::sync::Arc;

use kube::ResourceExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kpve_common::config::ProviderConfig;
use kpve_common::crd::{
    InstanceType, MetadataDelivery, NodeClaim, ProxmoxNodeClass, TemplateInstallation,
};
use kpve_common::kube_utils::ClusterInfoSource;
use kpve_common::poll::PollConfig;
use kpve_common::{Error, ANNOTATION_BOOTSTRAP_TOKEN, LABEL_REGION};
use kpve_pve::{
    wait_for_task, BootstrapTokenProvider, CapacityProvider, CloneRequest, CloudInitRenderer,
    ClusterPool, FirewallRule, HypervisorClient, VmConfig, VmIdAllocator, VmLocation, VmMetadata,
    VmOptions, VmResourceOptions, VmStatus,
};
use kpve_template::skeleton::TEMPLATE_TAG;
use kpve_template::{InstanceTemplateInfo, TemplateInventory};

use crate::cloudinit::{cloud_init_values, BootstrapInputs};
use crate::network::{configure_network, NetworkTarget};
use crate::node::{launched_node, node_from_vm, parse_provider_id, LaunchedVm};
use crate::placement::{
    candidate_regions, candidate_zones, order_by_price, order_zones, resolve_capacity_type,
    Candidate,
};
use crate::rollback::{Compensation, RollbackContext, RollbackStack};

/// Node bootstrap collaborators
#[derive(Clone)]
pub struct BootstrapServices {
    /// Join token issuer
    pub tokens: Arc<dyn BootstrapTokenProvider>,
    /// Cloud-init renderer
    pub renderer: Arc<dyn CloudInitRenderer>,
    /// Source of the cluster CA
    pub cluster: Arc<dyn ClusterInfoSource>,
}

/// Creates, finds and deletes node VMs
pub struct InstanceProvider {
    pool: Arc<dyn ClusterPool>,
    capacity: Arc<dyn CapacityProvider>,
    templates: Arc<TemplateInventory>,
    bootstrap: BootstrapServices,
    vmids: Arc<VmIdAllocator>,
    config: ProviderConfig,
    poll: PollConfig,
    rng: Mutex<StdRng>,
}

impl InstanceProvider {
    /// Create a provider
    pub fn new(
        pool: Arc<dyn ClusterPool>,
        capacity: Arc<dyn CapacityProvider>,
        templates: Arc<TemplateInventory>,
        bootstrap: BootstrapServices,
        vmids: Arc<VmIdAllocator>,
        config: ProviderConfig,
    ) -> Self {
        let poll = config.task_poll();
        Self {
            pool,
            capacity,
            templates,
            bootstrap,
            vmids,
            config,
            poll,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed seed for zone shuffling
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Launch a VM satisfying `claim` and return the claim describing it
    #[instrument(skip_all, fields(node_claim = %claim.name_any(), node_class = %class.name_any()))]
    pub async fn create(
        &self,
        claim: &NodeClaim,
        class: &ProxmoxNodeClass,
        instance_types: &[InstanceType],
        cancel: &CancellationToken,
    ) -> Result<NodeClaim, Error> {
        let reqs = claim.requirements();
        let (ordered, unpriced) = order_by_price(instance_types, &reqs);

        let mut attempts: Vec<String> = unpriced
            .iter()
            .map(|it| format!("{}: no compatible offering", it.name))
            .collect();

        for instance_type in ordered {
            for region in candidate_regions(class, &reqs, self.capacity.as_ref()) {
                let zones = candidate_zones(&reqs, self.capacity.as_ref(), &region, instance_type);
                if zones.is_empty() {
                    attempts.push(format!("{}/{}: no zone has room", instance_type.name, region));
                    continue;
                }

                let zones = {
                    let mut rng = self.rng.lock();
                    order_zones(
                        zones,
                        class.spec.placement_strategy.zone_balance,
                        |zone| self.capacity.cpu_load(&region, zone),
                        &mut *rng,
                    )
                };

                for zone in &zones {
                    if cancel.is_cancelled() {
                        return Err(Error::infrastructure("create", "cancelled"));
                    }

                    let candidate = Candidate {
                        claim,
                        class,
                        instance_type,
                        region: &region,
                        zone,
                    };
                    match self.launch(candidate, cancel).await {
                        Ok(node) => {
                            info!(
                                instance_type = %instance_type.name,
                                region = %region,
                                zone = %zone,
                                provider_id = node.provider_id().unwrap_or_default(),
                                "node launched"
                            );
                            return Ok(node);
                        }
                        Err(e) => {
                            warn!(
                                instance_type = %instance_type.name,
                                region = %region,
                                zone = %zone,
                                error = %e,
                                "launch failed, trying next candidate"
                            );
                            attempts.push(format!(
                                "{}/{}/{}: {}",
                                instance_type.name, region, zone, e
                            ));
                        }
                    }
                }
            }
        }

        Err(Error::insufficient_capacity(attempts))
    }

    /// Launch in one zone, undoing everything on failure
    async fn launch(&self, c: Candidate<'_>, cancel: &CancellationToken) -> Result<NodeClaim, Error> {
        let template_name = &c.class.spec.instance_template_ref.name;
        let template = self
            .templates
            .find_for_zone(c.region, c.zone, template_name)
            .ok_or_else(|| {
                Error::not_found("template", format!("{} for {}/{}", template_name, c.region, c.zone))
            })?;

        let client = self.pool.client(c.region)?;
        let vmid = self.vmids.allocate(c.region, client.as_ref()).await?;

        let mut rollback = RollbackStack::new();
        let result = self
            .provision(&c, &template, client.as_ref(), vmid, &mut rollback, cancel)
            .await;

        match result {
            Ok(node) => {
                rollback.commit();
                if let Err(e) = self.capacity.refresh_capacity(c.region, c.zone).await {
                    warn!(region = %c.region, zone = %c.zone, error = %e, "capacity refresh failed");
                }
                Ok(node)
            }
            Err(e) => {
                let ctx = RollbackContext {
                    client: client.as_ref(),
                    capacity: self.capacity.as_ref(),
                    tokens: self.bootstrap.tokens.as_ref(),
                    poll: &self.poll,
                };
                let steps = rollback.len();
                let failed = rollback.unwind(&ctx).await;
                if failed == 0 {
                    self.vmids.release(c.region, vmid);
                } else {
                    warn!(vmid, steps, failed, "rollback incomplete");
                }
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        c: &Candidate<'_>,
        template: &InstanceTemplateInfo,
        client: &dyn HypervisorClient,
        vmid: u32,
        rollback: &mut RollbackStack,
        cancel: &CancellationToken,
    ) -> Result<NodeClaim, Error> {
        let spec = &c.class.spec;
        let it = c.instance_type;
        let disk_gib = spec.boot_device.size.max(it.capacity.ephemeral_storage_gib());
        let storage = spec
            .boot_device
            .storage
            .clone()
            .or_else(|| template.storage_id.clone());

        let mut request = VmResourceOptions::new(vmid, &it.capacity, disk_gib);
        request.storage_id = storage.clone();
        request.numa = spec.numa_pinning;

        let granted = self
            .capacity
            .allocate_capacity_in_zone(c.region, c.zone, &request)
            .await?;
        rollback.push(Compensation::ReleaseCapacity {
            region: c.region.to_string(),
            zone: c.zone.to_string(),
            options: granted.clone(),
        });
        debug!(vmid, cpus = granted.cpus, memory_mib = granted.memory_mib, disk_gib, "capacity reserved");

        let clone = CloneRequest {
            source_zone: template.zone.clone(),
            source_vmid: template.template_id,
            new_vmid: vmid,
            target_zone: c.zone.to_string(),
            name: c.claim.name_any(),
            full: true,
            storage,
            pool: spec.resource_pool.clone(),
        };
        // A rejected clone created nothing; the id may be another creator's
        let task = client.clone_vm(&clone).await?;
        rollback.push(Compensation::DeleteVm {
            zone: c.zone.to_string(),
            vmid,
        });
        wait_for_task(client, &template.zone, &task, &self.poll, cancel).await?;

        let config = client.get_vm_config(c.zone, vmid).await?;
        let capacity_type = resolve_capacity_type(it, &c.claim.requirements(), c.region, c.zone);
        let installation = TemplateInstallation {
            region: c.region.to_string(),
            zone: template.zone.clone(),
            vmid: template.template_id,
        };

        let meta = VmMetadata {
            node_claim: Some(c.claim.name_any()),
            node_class: Some(c.class.name_any()),
            instance_type: Some(it.name.clone()),
            capacity_type: Some(capacity_type.as_str().to_string()),
            template: Some(installation.to_string()),
        };
        let shape = self.shape_options(c, &config, &granted, &meta);
        client.configure_vm(c.zone, vmid, &shape).await?;

        let (slot, boot) = config.boot_disk().ok_or_else(|| {
            Error::configuration(template.name.clone(), "template has no boot disk")
        })?;
        if boot.size_mib().unwrap_or_default() < disk_gib * 1024 {
            client.resize_disk(c.zone, vmid, slot, disk_gib).await?;
        }

        let target = NetworkTarget {
            region: c.region,
            zone: c.zone,
            vmid,
        };
        let interfaces = configure_network(client, self.capacity.as_ref(), target, &config).await?;

        for group in &spec.security_groups {
            let rule = FirewallRule::group(&group.name, group.interface.clone());
            client.create_firewall_rule(c.zone, vmid, &rule).await?;
        }

        let launched = LaunchedVm {
            region: c.region,
            zone: c.zone,
            vmid,
            instance_type: it,
            capacity_type,
            cpu_type: config.cpu.as_ref().map(|cpu| cpu.model.as_str()),
            template: &installation,
            token_id: None,
        };

        let node = match spec.metadata_options.delivery {
            MetadataDelivery::None => launched_node(c.claim, &launched),
            MetadataDelivery::Cdrom => {
                let token = self
                    .bootstrap
                    .tokens
                    .issue(&c.claim.name_any(), self.config.token_ttl())
                    .await?;
                rollback.push(Compensation::DeleteToken {
                    token_id: token.id.clone(),
                });

                let node = launched_node(
                    c.claim,
                    &LaunchedVm {
                        token_id: Some(&token.id),
                        ..launched.clone()
                    },
                );

                let cluster_ca = self.bootstrap.cluster.cluster_ca().await?;
                let values = cloud_init_values(BootstrapInputs {
                    node: &node,
                    class: c.class,
                    instance_type: it,
                    cluster_name: &self.config.cluster_name,
                    cluster_ca: &cluster_ca,
                    token: &token,
                    interfaces,
                });
                let documents = self.bootstrap.renderer.render(&values).await?;
                client
                    .attach_cloudinit_iso(c.zone, vmid, &self.config.iso_storage, &documents)
                    .await?;
                node
            }
        };

        let task = client.start_vm(c.zone, vmid).await?;
        wait_for_task(client, c.zone, &task, &self.poll, cancel).await?;

        Ok(node)
    }

    fn shape_options(
        &self,
        c: &Candidate<'_>,
        config: &VmConfig,
        granted: &VmResourceOptions,
        meta: &VmMetadata,
    ) -> VmOptions {
        let mut tags = vec![self.config.cluster_name.clone()];
        for tag in config.tags.iter().chain(&c.class.spec.tags) {
            if tag != TEMPLATE_TAG && !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let mut opts = VmOptions::default();
        opts.set("cores", granted.cpus)
            .set("sockets", 1)
            .set("memory", granted.memory_mib)
            .set("tags", tags.join(";"))
            .set("description", meta.to_description());
        if let Some(cpu_set) = &granted.cpu_set {
            opts.set("affinity", cpu_set).set("numa", 1);
        }
        opts
    }

    /// Stop and delete the VM behind `claim`, then return its capacity
    ///
    /// A VM that no longer exists is a `NotFound` error and nothing is
    /// released. Once the VM is gone, releasing its reservation and join token
    /// is best effort.
    #[instrument(skip_all, fields(node_claim = %claim.name_any()))]
    pub async fn delete(&self, claim: &NodeClaim, cancel: &CancellationToken) -> Result<(), Error> {
        let id = claim.provider_id().ok_or_else(|| {
            Error::validation_for_field("nodeclaim", "status.providerID", "not launched")
        })?;
        let parsed = parse_provider_id(id)?;
        let region = parsed
            .region
            .or_else(|| claim.label(LABEL_REGION).map(str::to_string))
            .ok_or_else(|| Error::validation(format!("cannot tell the region of {}", id)))?;

        let client = self.pool.client(&region)?;
        let location = client
            .find_vm(parsed.vmid)
            .await?
            .ok_or_else(|| Error::not_found("vm", id))?;
        let zone = location.zone.as_str();
        let config = client.get_vm_config(zone, location.vmid).await?;

        if location.status != VmStatus::Stopped {
            let task = client.stop_vm(zone, location.vmid).await?;
            wait_for_task(client.as_ref(), zone, &task, &self.poll, cancel).await?;
        }
        let task = client.delete_vm(zone, location.vmid).await?;
        wait_for_task(client.as_ref(), zone, &task, &self.poll, cancel).await?;
        info!(region = %region, zone = %zone, vmid = location.vmid, "node vm deleted");

        let reservation = VmResourceOptions::from_config(location.vmid, &config);
        if let Err(e) = self
            .capacity
            .release_capacity_in_zone(&region, zone, &reservation)
            .await
        {
            warn!(region = %region, zone = %zone, vmid = location.vmid, error = %e, "capacity release failed");
        }
        if let Some(token) = claim.annotations().get(ANNOTATION_BOOTSTRAP_TOKEN) {
            if let Err(e) = self.bootstrap.tokens.delete(token).await {
                warn!(token_id = %token, error = %e, "join token revocation failed");
            }
        }
        self.vmids.release(&region, location.vmid);
        if let Err(e) = self.capacity.refresh_capacity(&region, zone).await {
            warn!(region = %region, zone = %zone, error = %e, "capacity refresh failed");
        }

        Ok(())
    }

    /// Describe the VM behind `provider_id`
    ///
    /// Ids without a region are searched for in every region.
    #[instrument(skip(self))]
    pub async fn get(&self, provider_id: &str) -> Result<NodeClaim, Error> {
        let parsed = parse_provider_id(provider_id)?;
        let regions = match parsed.region {
            Some(region) => vec![region],
            None => self.pool.regions(),
        };

        for region in regions {
            let client = self.pool.client(&region)?;
            if let Some(location) = client.find_vm(parsed.vmid).await? {
                return self.describe(client.as_ref(), &region, &location).await;
            }
        }
        Err(Error::not_found("vm", provider_id))
    }

    async fn describe(
        &self,
        client: &dyn HypervisorClient,
        region: &str,
        location: &VmLocation,
    ) -> Result<NodeClaim, Error> {
        let config = client.get_vm_config(&location.zone, location.vmid).await?;
        Ok(node_from_vm(region, location, &config))
    }
}
