//! ProxmoxTemplate: a golden image and the template VMs built from it
//!
//! Example:
//! ```yaml
//! apiVersion: karpenter.kpve.dev/v1alpha1
//! kind: ProxmoxTemplate
//! metadata:
//!   name: ubuntu-noble
//! spec:
//!   storageIDs: [local, local-lvm]
//!   image:
//!     url: https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img
//!     checksum: 0123abcd...
//!     checksumType: sha256
//!   machine: q35
//!   cpu:
//!     type: host
//!   network:
//!     - bridge: vmbr0
//!       firewall: true
//! ```

use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Checksum algorithm for image verification
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256
    #[default]
    Sha256,
    /// SHA-512
    Sha512,
}

impl ChecksumAlgorithm {
    /// Name the hypervisor API expects
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Source image of a template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Download URL
    pub url: String,

    /// Expected checksum; downloads are verified when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Checksum algorithm
    #[serde(default, rename = "checksumType")]
    pub checksum_algorithm: ChecksumAlgorithm,
}

/// Guest agent settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Enable the QEMU guest agent device
    #[serde(default)]
    pub enabled: bool,

    /// Trim the disk after moves/clones
    #[serde(default)]
    pub fstrim: bool,
}

/// CPU model settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    /// CPU model (e.g., "host", "x86-64-v3")
    #[serde(rename = "type")]
    pub model: String,

    /// CPU flags, each prefixed with '+' or '-'
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

/// Display adapter settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VgaSpec {
    /// Adapter type (e.g., "serial0", "std")
    #[serde(rename = "type")]
    pub kind: String,

    /// Video memory in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
}

/// One network interface of the template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    /// Host bridge
    pub bridge: String,

    /// NIC model; defaults to virtio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Enable the hypervisor firewall on this interface
    #[serde(default)]
    pub firewall: bool,

    /// MTU; unset inherits the bridge MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// VLAN tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

/// PCI passthrough device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PciDeviceSpec {
    /// Cluster resource mapping name
    pub mapping: String,

    /// Attach as PCIe (requires q35)
    #[serde(default)]
    pub pcie: bool,
}

/// Template class specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "karpenter.kpve.dev",
    version = "v1alpha1",
    kind = "ProxmoxTemplate",
    status = "ProxmoxTemplateStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.imageID"}"#,
    printcolumn = r#"{"name":"Zones","type":"string","jsonPath":".status.zones"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxTemplateSpec {
    /// Hypervisor cluster to install in; unset means all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Candidate storages; one must hold "import" content and one "images"
    #[serde(default, rename = "storageIDs")]
    pub storage_ids: Vec<String>,

    /// Source image
    pub image: ImageSource,

    /// Machine type (e.g., "q35")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,

    /// Guest agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,

    /// CPU model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,

    /// Display adapter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vga: Option<VgaSpec>,

    /// Network interfaces, net0 first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkInterfaceSpec>,

    /// PCI passthrough devices, hostpci0 first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pci_devices: Vec<PciDeviceSpec>,

    /// Tags of the template VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Template class status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxTemplateStatus {
    /// Derived id of the installed source image
    #[serde(default, rename = "imageID", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Installed template VMs as `<region>/<zone>/<vmid>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
}

/// One installed template VM
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateInstallation {
    /// Hypervisor cluster
    pub region: String,
    /// Hypervisor node
    pub zone: String,
    /// Template VM id
    pub vmid: u32,
}

impl fmt::Display for TemplateInstallation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.vmid)
    }
}

impl FromStr for TemplateInstallation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::serialization(format!("invalid template installation '{}'", s));

        let mut parts = s.split('/');
        let (Some(region), Some(zone), Some(vmid), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if region.is_empty() || zone.is_empty() {
            return Err(invalid());
        }
        let vmid = vmid.parse().map_err(|_| invalid())?;

        Ok(Self {
            region: region.to_string(),
            zone: zone.to_string(),
            vmid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installation_format_round_trip() {
        let inst: TemplateInstallation = "r1/z1/9000".parse().expect("valid");
        assert_eq!(inst.region, "r1");
        assert_eq!(inst.zone, "z1");
        assert_eq!(inst.vmid, 9000);
        assert_eq!(inst.to_string(), "r1/z1/9000");
    }

    #[test]
    fn test_installation_rejects_malformed_entries() {
        for bad in ["r1/z1", "r1/z1/abc", "r1/z1/9000/x", "/z1/9000", ""] {
            assert!(bad.parse::<TemplateInstallation>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_spec_field_names() {
        let spec: ProxmoxTemplateSpec = serde_json::from_str(
            r#"{
                "storageIDs": ["local"],
                "image": {"url": "https://example.com/noble.img", "checksum": "abc", "checksumType": "sha512"}
            }"#,
        )
        .expect("valid spec");
        assert_eq!(spec.storage_ids, vec!["local"]);
        assert_eq!(spec.image.checksum_algorithm, ChecksumAlgorithm::Sha512);
    }
}
