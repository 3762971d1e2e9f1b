//! Provider ids and the node descriptor returned for a launched VM

use std::collections::BTreeMap;

use kube::ResourceExt;

use kpve_common::crd::{
    CapacityType, InstanceType, NodeClaim, NodeClaimSpec, NodeClaimStatus, NodeClassReference,
    ResourceList, Taint, TaintEffect, TemplateInstallation,
};
use kpve_common::{
    Error, ANNOTATION_BOOTSTRAP_TOKEN, ANNOTATION_TEMPLATE_ID, LABEL_CAPACITY_TYPE,
    LABEL_INSTANCE_CPU_TYPE, LABEL_INSTANCE_FAMILY, LABEL_INSTANCE_TYPE, LABEL_REGION, LABEL_ZONE,
    PROVIDER_ID_SCHEME, TAINT_UNREGISTERED,
};
use kpve_pve::{VmConfig, VmLocation};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// `proxmox://<region>/<vmid>`
pub fn provider_id(region: &str, vmid: u32) -> String {
    format!("{}{}/{}", PROVIDER_ID_SCHEME, region, vmid)
}

/// A parsed provider id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderId {
    /// Region, absent in ids written as `proxmox://<vmid>`
    pub region: Option<String>,
    /// VM id
    pub vmid: u32,
}

/// Parse `proxmox://<region>/<vmid>` or `proxmox://<vmid>`
pub fn parse_provider_id(id: &str) -> Result<ProviderId, Error> {
    let invalid = || Error::validation(format!("invalid provider id '{}'", id));

    let rest = id.strip_prefix(PROVIDER_ID_SCHEME).ok_or_else(invalid)?;
    let (region, vmid) = match rest.rsplit_once('/') {
        Some((region, vmid)) if !region.is_empty() && !region.contains('/') => {
            (Some(region.to_string()), vmid)
        }
        Some(_) => return Err(invalid()),
        None => (None, rest),
    };
    let vmid = vmid.parse().map_err(|_| invalid())?;

    Ok(ProviderId { region, vmid })
}

/// Facts about a freshly launched VM that end up on its node claim
#[derive(Clone, Debug)]
pub struct LaunchedVm<'a> {
    /// Region
    pub region: &'a str,
    /// Zone
    pub zone: &'a str,
    /// VM id
    pub vmid: u32,
    /// Launched shape
    pub instance_type: &'a InstanceType,
    /// Resolved capacity type
    pub capacity_type: CapacityType,
    /// CPU model of the VM, if set
    pub cpu_type: Option<&'a str>,
    /// Template the VM was cloned from
    pub template: &'a TemplateInstallation,
    /// Join token issued for the node
    pub token_id: Option<&'a str>,
}

/// The claim as returned to the caller after a successful launch
///
/// Carries topology and shape labels, the provider id, capacity and
/// allocatable, and a no-execute taint that keeps workloads off the node
/// until it has registered.
pub fn launched_node(claim: &NodeClaim, vm: &LaunchedVm<'_>) -> NodeClaim {
    let mut node = claim.clone();

    let labels = node.labels_mut_or_default();
    labels.insert(LABEL_REGION.to_string(), vm.region.to_string());
    labels.insert(LABEL_ZONE.to_string(), vm.zone.to_string());
    labels.insert(LABEL_INSTANCE_TYPE.to_string(), vm.instance_type.name.clone());
    labels.insert(
        LABEL_CAPACITY_TYPE.to_string(),
        vm.capacity_type.as_str().to_string(),
    );
    labels.insert(
        LABEL_INSTANCE_FAMILY.to_string(),
        vm.instance_type.family().to_string(),
    );
    if let Some(cpu) = vm.cpu_type {
        labels.insert(LABEL_INSTANCE_CPU_TYPE.to_string(), cpu.to_string());
    }

    let annotations = node.annotations_mut_or_default();
    annotations.insert(ANNOTATION_TEMPLATE_ID.to_string(), vm.template.to_string());
    if let Some(token) = vm.token_id {
        annotations.insert(ANNOTATION_BOOTSTRAP_TOKEN.to_string(), token.to_string());
    }

    if !node.spec.taints.iter().any(|t| t.key == TAINT_UNREGISTERED) {
        node.spec.taints.push(unregistered_taint());
    }

    let status = node.status.get_or_insert_with(NodeClaimStatus::default);
    status.provider_id = Some(provider_id(vm.region, vm.vmid));
    status.image_id = Some(vm.template.to_string());
    status.capacity = vm.instance_type.capacity.clone();
    status.allocatable = vm.instance_type.allocatable();

    node
}

/// Taint held by a node until it has joined the cluster
pub fn unregistered_taint() -> Taint {
    Taint {
        key: TAINT_UNREGISTERED.to_string(),
        value: None,
        effect: TaintEffect::NoExecute,
    }
}

/// Rebuild a node claim for an existing VM from what the hypervisor knows
///
/// Shape and ownership come from the metadata written to the VM
/// description at launch; capacity is read off the VM configuration.
pub fn node_from_vm(region: &str, location: &VmLocation, config: &VmConfig) -> NodeClaim {
    let meta = config.metadata();
    let name = meta
        .node_claim
        .clone()
        .unwrap_or_else(|| location.name.clone());

    let spec = NodeClaimSpec {
        node_class_ref: NodeClassReference {
            name: meta.node_class.clone().unwrap_or_default(),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut node = NodeClaim::new(&name, spec);

    let mut labels = BTreeMap::from([
        (LABEL_REGION.to_string(), region.to_string()),
        (LABEL_ZONE.to_string(), location.zone.clone()),
    ]);
    if let Some(it) = &meta.instance_type {
        labels.insert(LABEL_INSTANCE_TYPE.to_string(), it.clone());
        labels.insert(
            LABEL_INSTANCE_FAMILY.to_string(),
            it.split('.').next().unwrap_or(it).to_string(),
        );
    }
    if let Some(ct) = &meta.capacity_type {
        labels.insert(LABEL_CAPACITY_TYPE.to_string(), ct.clone());
    }
    if let Some(cpu) = &config.cpu {
        labels.insert(LABEL_INSTANCE_CPU_TYPE.to_string(), cpu.model.clone());
    }
    node.labels_mut().extend(labels);

    let capacity = ResourceList {
        cpu_millis: u64::from(config.vcpus()) * 1000,
        memory_bytes: config.memory_mib.unwrap_or_default() * MIB,
        pods: 0,
        ephemeral_storage_bytes: config
            .boot_disk()
            .and_then(|(_, disk)| disk.size_gib())
            .unwrap_or_default()
            * GIB,
    };
    node.status = Some(NodeClaimStatus {
        provider_id: Some(provider_id(region, location.vmid)),
        image_id: meta.template,
        node_name: None,
        allocatable: capacity.clone(),
        capacity,
    });

    node
}
