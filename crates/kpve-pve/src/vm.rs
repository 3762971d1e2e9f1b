//! VM configuration as a typed value
//!
//! [`VmConfig::from_options`] and [`VmOptions`] are the only places where the
//! hypervisor's flat `key -> option string` map is read or produced.

use std::collections::{BTreeMap, BTreeSet};

use kpve_common::Error;

use crate::device::{CpuConfig, CpuSet, DiskDevice, IpConfig, NetworkDevice, PciDevice, Smbios};

/// Config keys that feed cloud-init and therefore the template fingerprint
pub const CLOUD_INIT_KEYS: &[&str] = &[
    "cicustom",
    "cipassword",
    "citype",
    "ciupgrade",
    "ciuser",
    "nameserver",
    "searchdomain",
    "sshkeys",
];

const DISK_PREFIXES: &[&str] = &["scsi", "virtio", "sata", "ide", "efidisk", "tpmstate"];

fn indexed(key: &str, prefix: &str) -> Option<u8> {
    key.strip_prefix(prefix).and_then(|rest| rest.parse().ok())
}

fn is_disk_key(key: &str) -> bool {
    DISK_PREFIXES.iter().any(|p| {
        key.strip_prefix(p)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Typed view of a VM's configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmConfig {
    /// VM name
    pub name: Option<String>,
    /// Free-form description; carries [`VmMetadata`] for managed VMs
    pub description: Option<String>,
    /// Tags
    pub tags: Vec<String>,
    /// Whether the VM is a template
    pub template: bool,
    /// Cores per socket
    pub cores: Option<u32>,
    /// Sockets
    pub sockets: Option<u32>,
    /// Memory in MiB
    pub memory_mib: Option<u64>,
    /// CPU model
    pub cpu: Option<CpuConfig>,
    /// Host CPU affinity
    pub affinity: Option<CpuSet>,
    /// NUMA emulation enabled
    pub numa: bool,
    /// Machine type
    pub machine: Option<String>,
    /// Guest agent option string
    pub agent: Option<String>,
    /// Display adapter option string
    pub vga: Option<String>,
    /// SMBIOS block
    pub smbios: Option<Smbios>,
    /// Network interfaces by index
    pub networks: BTreeMap<u8, NetworkDevice>,
    /// Cloud-init IP configuration by interface index
    pub ip_configs: BTreeMap<u8, IpConfig>,
    /// PCI passthrough devices by index
    pub pci_devices: BTreeMap<u8, PciDevice>,
    /// Disks and optical drives by slot (e.g., "scsi0", "ide2")
    pub disks: BTreeMap<String, DiskDevice>,
    /// Cloud-init settings (see [`CLOUD_INIT_KEYS`])
    pub cloud_init: BTreeMap<String, String>,
    /// Everything else, kept verbatim
    pub other: BTreeMap<String, String>,
}

impl VmConfig {
    /// Parse the hypervisor's option map
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, Error> {
        let mut cfg = VmConfig::default();

        for (key, value) in options {
            let key = key.as_str();
            match key {
                "name" => cfg.name = Some(value.clone()),
                "description" => cfg.description = Some(value.clone()),
                "tags" => {
                    cfg.tags = value
                        .split([';', ',', ' '])
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "template" => cfg.template = value == "1",
                "cores" => cfg.cores = Some(parse_field(key, value)?),
                "sockets" => cfg.sockets = Some(parse_field(key, value)?),
                "memory" => cfg.memory_mib = Some(parse_field(key, value)?),
                "cpu" => cfg.cpu = Some(value.parse()?),
                "affinity" => cfg.affinity = Some(value.parse()?),
                "numa" => cfg.numa = value == "1",
                "machine" => cfg.machine = Some(value.clone()),
                "agent" => cfg.agent = Some(value.clone()),
                "vga" => cfg.vga = Some(value.clone()),
                "smbios1" => cfg.smbios = Some(value.parse()?),
                k if CLOUD_INIT_KEYS.contains(&k) => {
                    cfg.cloud_init.insert(key.to_string(), value.clone());
                }
                k if indexed(k, "net").is_some() => {
                    let idx = indexed(k, "net").unwrap_or_default();
                    cfg.networks.insert(idx, value.parse()?);
                }
                k if indexed(k, "ipconfig").is_some() => {
                    let idx = indexed(k, "ipconfig").unwrap_or_default();
                    cfg.ip_configs.insert(idx, value.parse()?);
                }
                k if indexed(k, "hostpci").is_some() => {
                    let idx = indexed(k, "hostpci").unwrap_or_default();
                    cfg.pci_devices.insert(idx, value.parse()?);
                }
                k if is_disk_key(k) => {
                    cfg.disks.insert(key.to_string(), value.parse()?);
                }
                _ => {
                    cfg.other.insert(key.to_string(), value.clone());
                }
            }
        }

        Ok(cfg)
    }

    /// Every key/value this config sets, in wire form
    pub fn to_options(&self) -> VmOptions {
        let mut opts = VmOptions::default();
        opts.set_opt("name", self.name.as_ref());
        opts.set_opt("description", self.description.as_ref());
        if !self.tags.is_empty() {
            opts.set("tags", self.tags.join(";"));
        }
        if self.template {
            opts.set("template", "1");
        }
        opts.set_opt("cores", self.cores);
        opts.set_opt("sockets", self.sockets);
        opts.set_opt("memory", self.memory_mib);
        opts.set_opt("cpu", self.cpu.as_ref());
        opts.set_opt("affinity", self.affinity.as_ref());
        if self.numa {
            opts.set("numa", "1");
        }
        opts.set_opt("machine", self.machine.as_ref());
        opts.set_opt("agent", self.agent.as_ref());
        opts.set_opt("vga", self.vga.as_ref());
        opts.set_opt("smbios1", self.smbios.as_ref());
        for (idx, nic) in &self.networks {
            opts.set(format!("net{}", idx), nic);
        }
        for (idx, ip) in &self.ip_configs {
            opts.set(format!("ipconfig{}", idx), ip);
        }
        for (idx, pci) in &self.pci_devices {
            opts.set(format!("hostpci{}", idx), pci);
        }
        for (slot, disk) in &self.disks {
            opts.set(slot.clone(), disk);
        }
        for (k, v) in self.cloud_init.iter().chain(self.other.iter()) {
            opts.set(k.clone(), v);
        }
        opts
    }

    /// Distinct storage ids referenced by non-optical disks
    pub fn storage_ids(&self) -> BTreeSet<String> {
        self.disks
            .values()
            .filter(|d| !d.is_cdrom() && !d.is_cloudinit())
            .filter_map(|d| d.storage_id().map(str::to_string))
            .collect()
    }

    /// The boot disk: the first slot named in `boot: order=`, else the first non-optical disk
    pub fn boot_disk(&self) -> Option<(&str, &DiskDevice)> {
        let from_order = self
            .other
            .get("boot")
            .and_then(|b| b.strip_prefix("order="))
            .and_then(|order| order.split(';').find(|slot| self.disks.contains_key(*slot)))
            .and_then(|slot| self.disks.get_key_value(slot));

        from_order
            .or_else(|| self.disks.iter().find(|(_, d)| !d.is_cdrom() && !d.is_cloudinit()))
            .map(|(slot, disk)| (slot.as_str(), disk))
    }

    /// Whether a hypervisor-managed cloud-init drive is attached
    pub fn has_cloudinit_drive(&self) -> bool {
        self.disks.values().any(DiskDevice::is_cloudinit)
    }

    /// Total vCPUs (sockets x cores)
    pub fn vcpus(&self) -> u32 {
        self.sockets.unwrap_or(1) * self.cores.unwrap_or(1)
    }

    /// Managed-VM metadata parsed from the description
    pub fn metadata(&self) -> VmMetadata {
        self.description
            .as_deref()
            .map(VmMetadata::parse)
            .unwrap_or_default()
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::serialization(format!("vm config: invalid {} '{}'", key, value)))
}

/// A configuration change: keys to set and keys to remove
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmOptions {
    /// Keys to set
    pub set: BTreeMap<String, String>,
    /// Keys to remove
    pub delete: BTreeSet<String>,
}

impl VmOptions {
    /// Set a key
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        let key = key.into();
        self.delete.remove(&key);
        self.set.insert(key, value.to_string());
        self
    }

    /// Set a key when a value is present
    pub fn set_opt<V: ToString>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        if let Some(v) = value {
            self.set(key, v);
        }
        self
    }

    /// Remove a key
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        let key = key.into();
        self.set.remove(&key);
        self.delete.insert(key);
        self
    }

    /// Set `key` to `value`, or remove it when `value` is absent
    pub fn set_or_delete<V: ToString>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        match value {
            Some(v) => self.set(key, v),
            None => self.delete(key),
        }
    }

    /// Whether the change does nothing
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }
}

/// Marker line identifying VMs launched by this provider
pub const METADATA_MARKER: &str = "managed-by=kpve";

/// Provider bookkeeping stored in a VM's description
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmMetadata {
    /// NodeClaim name
    pub node_claim: Option<String>,
    /// NodeClass name
    pub node_class: Option<String>,
    /// Instance type name
    pub instance_type: Option<String>,
    /// Capacity type label value
    pub capacity_type: Option<String>,
    /// Template the VM was cloned from, `<region>/<zone>/<vmid>`
    pub template: Option<String>,
}

impl VmMetadata {
    /// Parse `key=value` lines; unknown lines are ignored
    pub fn parse(description: &str) -> Self {
        let mut meta = VmMetadata::default();
        for line in description.lines() {
            let Some((k, v)) = line.trim().split_once('=') else {
                continue;
            };
            let v = Some(v.to_string());
            match k {
                "nodeclaim" => meta.node_claim = v,
                "nodeclass" => meta.node_class = v,
                "instance-type" => meta.instance_type = v,
                "capacity-type" => meta.capacity_type = v,
                "template" => meta.template = v,
                _ => {}
            }
        }
        meta
    }

    /// Render as a description
    pub fn to_description(&self) -> String {
        let mut lines = vec![METADATA_MARKER.to_string()];
        for (k, v) in [
            ("nodeclaim", &self.node_claim),
            ("nodeclass", &self.node_class),
            ("instance-type", &self.instance_type),
            ("capacity-type", &self.capacity_type),
            ("template", &self.template),
        ] {
            if let Some(v) = v {
                lines.push(format!("{}={}", k, v));
            }
        }
        lines.join("\n")
    }
}

/// Power state of a VM
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VmStatus {
    /// Running
    Running,
    /// Stopped
    #[default]
    Stopped,
    /// Anything else (paused, suspended, unknown)
    Other,
}

/// Where a VM lives
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmLocation {
    /// VM id
    pub vmid: u32,
    /// Hypervisor node
    pub zone: String,
    /// VM name
    pub name: String,
    /// Power state
    pub status: VmStatus,
    /// Whether the VM is a template
    pub template: bool,
}
