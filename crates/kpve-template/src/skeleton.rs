//! Template VM configuration built from a template class

use std::collections::BTreeMap;

use kpve_common::crd::ProxmoxTemplateSpec;
use kpve_pve::device::{CpuConfig, DiskDevice, NetworkDevice, PciDevice};
use kpve_pve::{VmConfig, VmOptions};

use crate::image::{import_volume, StorageRoles};

/// Tag carried by every template VM this crate creates
pub const TEMPLATE_TAG: &str = "kpve-template";

/// Disk slot of the template's boot volume
pub const BOOT_DISK: &str = "scsi0";

const DEFAULT_NIC_MODEL: &str = "virtio";

/// Options for creating a class's template VM in one zone
///
/// The boot disk is imported from the downloaded image; a cloud-init drive is
/// attached so clones can receive per-node settings.
pub fn template_options(
    class: &str,
    spec: &ProxmoxTemplateSpec,
    roles: &StorageRoles,
    image_file: &str,
) -> VmOptions {
    let boot_disk = DiskDevice {
        volume: format!("{}:0", roles.images.id),
        options: BTreeMap::from([
            (
                "import-from".to_string(),
                import_volume(&roles.import.id, image_file),
            ),
            ("discard".to_string(), "on".to_string()),
        ]),
        ..Default::default()
    };

    let mut opts = VmOptions::default();
    opts.set("name", class)
        .set("template", 1)
        .set("ostype", "l26")
        .set("scsihw", "virtio-scsi-single")
        .set("cores", 1)
        .set("memory", 512)
        .set("serial0", "socket")
        .set(BOOT_DISK, boot_disk)
        .set("ide2", format!("{}:cloudinit", roles.images.id))
        .set("boot", format!("order={}", BOOT_DISK));

    // A new VM has nothing to clear, only values to set
    for (key, value) in mutable_config(spec, None).set {
        opts.set(key, value);
    }
    opts
}

/// Options bringing a template VM's mutable configuration in line with `spec`
///
/// Boot disk and identity are never touched. Fields the class leaves unset
/// are removed, as are interfaces and PCI devices beyond the declared lists.
/// Existing MAC addresses are kept.
pub fn mutable_config(spec: &ProxmoxTemplateSpec, current: Option<&VmConfig>) -> VmOptions {
    let mut opts = VmOptions::default();

    opts.set_or_delete("machine", spec.machine.as_ref());
    opts.set_or_delete(
        "agent",
        spec.agent.as_ref().map(|a| {
            format!(
                "enabled={},fstrim_cloned_disks={}",
                u8::from(a.enabled),
                u8::from(a.fstrim)
            )
        }),
    );
    opts.set_or_delete(
        "cpu",
        spec.cpu.as_ref().map(|c| CpuConfig {
            model: c.model.clone(),
            flags: c.flags.clone(),
        }),
    );
    opts.set_or_delete(
        "vga",
        spec.vga.as_ref().map(|v| match v.memory {
            Some(mem) => format!("{},memory={}", v.kind, mem),
            None => v.kind.clone(),
        }),
    );

    for (idx, nic) in spec.network.iter().enumerate() {
        let mac = current
            .and_then(|c| c.networks.get(&(idx as u8)))
            .and_then(|n| n.mac.clone());
        let device = NetworkDevice {
            model: nic
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_NIC_MODEL.to_string()),
            mac,
            bridge: nic.bridge.clone(),
            firewall: nic.firewall,
            mtu: nic.mtu,
            tag: nic.vlan,
            link_down: false,
        };
        opts.set(format!("net{}", idx), device);
    }

    for (idx, pci) in spec.pci_devices.iter().enumerate() {
        let device = PciDevice {
            mapping: Some(pci.mapping.clone()),
            pcie: pci.pcie,
            ..Default::default()
        };
        opts.set(format!("hostpci{}", idx), device);
    }

    if let Some(current) = current {
        for idx in current.networks.keys().filter(|i| usize::from(**i) >= spec.network.len()) {
            opts.delete(format!("net{}", idx));
        }
        for idx in current
            .pci_devices
            .keys()
            .filter(|i| usize::from(**i) >= spec.pci_devices.len())
        {
            opts.delete(format!("hostpci{}", idx));
        }
    }

    let mut tags = vec![TEMPLATE_TAG.to_string()];
    tags.extend(spec.tags.iter().filter(|t| *t != TEMPLATE_TAG).cloned());
    opts.set("tags", tags.join(";"));

    opts
}
