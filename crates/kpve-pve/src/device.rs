//! Strongly typed VM device configuration
//!
//! The hypervisor encodes device settings as comma-separated option strings
//! (`virtio=BC:24:11:00:00:01,bridge=vmbr0,firewall=1`). Each device class has
//! a value type here with `parse` and `Display`, so the rest of the crate never
//! touches raw strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kpve_common::Error;

/// Split `a,b=c,d=e` into the positional head and the keyed options
fn split_options(s: &str) -> (Option<&str>, BTreeMap<&str, &str>) {
    let mut head = None;
    let mut opts = BTreeMap::new();
    for (i, part) in s.split(',').map(str::trim).enumerate() {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                opts.insert(k, v);
            }
            None if i == 0 => head = Some(part),
            None => {
                opts.insert(part, "");
            }
        }
    }
    (head, opts)
}

fn parse_flag(v: Option<&&str>) -> bool {
    matches!(v, Some(&"1") | Some(&"on") | Some(&"true"))
}

fn parse_num<T: FromStr>(device: &str, key: &str, v: Option<&&str>) -> Result<Option<T>, Error> {
    v.map(|raw| {
        raw.parse().map_err(|_| {
            Error::serialization(format!("{}: invalid {} '{}'", device, key, raw))
        })
    })
    .transpose()
}

const NIC_MODELS: &[&str] = &["virtio", "e1000", "e1000e", "rtl8139", "vmxnet3"];

/// A `netN` network interface
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkDevice {
    /// NIC model (e.g., "virtio")
    pub model: String,
    /// MAC address, generated by the hypervisor when unset
    pub mac: Option<String>,
    /// Host bridge
    pub bridge: String,
    /// Hypervisor firewall enabled
    pub firewall: bool,
    /// MTU
    pub mtu: Option<u32>,
    /// VLAN tag
    pub tag: Option<u16>,
    /// Link disabled
    pub link_down: bool,
}

impl FromStr for NetworkDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, opts) = split_options(s);

        // The model is either `model=MAC`, a bare leading `model`, or `model=<name>`.
        let keyed = opts
            .iter()
            .find(|(k, _)| NIC_MODELS.contains(*k))
            .map(|(k, v)| (k.to_string(), (!v.is_empty()).then(|| v.to_string())));
        let (model, mac) = keyed
            .or_else(|| {
                head.filter(|h| NIC_MODELS.contains(h))
                    .map(|h| (h.to_string(), None))
            })
            .or_else(|| opts.get("model").map(|m| (m.to_string(), None)))
            .ok_or_else(|| Error::serialization(format!("network device without model: '{}'", s)))?;

        Ok(Self {
            model,
            mac: mac.or_else(|| opts.get("macaddr").map(|m| m.to_string())),
            bridge: opts.get("bridge").map(|b| b.to_string()).unwrap_or_default(),
            firewall: parse_flag(opts.get("firewall")),
            mtu: parse_num("network device", "mtu", opts.get("mtu"))?,
            tag: parse_num("network device", "tag", opts.get("tag"))?,
            link_down: parse_flag(opts.get("link_down")),
        })
    }
}

impl fmt::Display for NetworkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mac {
            Some(mac) => write!(f, "{}={}", self.model, mac)?,
            None => write!(f, "{}", self.model)?,
        }
        if !self.bridge.is_empty() {
            write!(f, ",bridge={}", self.bridge)?;
        }
        if self.firewall {
            write!(f, ",firewall=1")?;
        }
        if self.link_down {
            write!(f, ",link_down=1")?;
        }
        if let Some(mtu) = self.mtu {
            write!(f, ",mtu={}", mtu)?;
        }
        if let Some(tag) = self.tag {
            write!(f, ",tag={}", tag)?;
        }
        Ok(())
    }
}

/// Address assignment of one IP family on a cloud-init interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpAssignment {
    /// DHCP
    Dhcp,
    /// SLAAC (IPv6 only)
    Auto,
    /// Placeholder: take a free address from the host bridge subnet
    Host,
    /// Fixed address in CIDR notation
    Static(String),
}

impl IpAssignment {
    fn parse(raw: &str) -> Self {
        match raw {
            "dhcp" => IpAssignment::Dhcp,
            "auto" => IpAssignment::Auto,
            "host" => IpAssignment::Host,
            other => IpAssignment::Static(other.to_string()),
        }
    }

    /// Wire form
    pub fn as_str(&self) -> &str {
        match self {
            IpAssignment::Dhcp => "dhcp",
            IpAssignment::Auto => "auto",
            IpAssignment::Host => "host",
            IpAssignment::Static(cidr) => cidr,
        }
    }
}

/// A cloud-init `ipconfigN` entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpConfig {
    /// IPv4 assignment
    pub ip: Option<IpAssignment>,
    /// IPv4 gateway
    pub gw: Option<String>,
    /// IPv6 assignment
    pub ip6: Option<IpAssignment>,
    /// IPv6 gateway
    pub gw6: Option<String>,
}

impl IpConfig {
    /// Whether any family still carries a host-relative placeholder
    pub fn has_placeholder(&self) -> bool {
        self.ip == Some(IpAssignment::Host) || self.ip6 == Some(IpAssignment::Host)
    }
}

impl FromStr for IpConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, opts) = split_options(s);
        if let Some(head) = head {
            return Err(Error::serialization(format!(
                "ip config: unexpected value '{}'",
                head
            )));
        }
        Ok(Self {
            ip: opts.get("ip").map(|v| IpAssignment::parse(v)),
            gw: opts.get("gw").map(|v| v.to_string()),
            ip6: opts.get("ip6").map(|v| IpAssignment::parse(v)),
            gw6: opts.get("gw6").map(|v| v.to_string()),
        })
    }
}

impl fmt::Display for IpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ip) = &self.ip {
            parts.push(format!("ip={}", ip.as_str()));
        }
        if let Some(gw) = &self.gw {
            parts.push(format!("gw={}", gw));
        }
        if let Some(ip6) = &self.ip6 {
            parts.push(format!("ip6={}", ip6.as_str()));
        }
        if let Some(gw6) = &self.gw6 {
            parts.push(format!("gw6={}", gw6));
        }
        f.write_str(&parts.join(","))
    }
}

/// A `hostpciN` passthrough device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PciDevice {
    /// Cluster resource mapping name
    pub mapping: Option<String>,
    /// Raw host PCI address (e.g., "0000:01:00.0")
    pub host: Option<String>,
    /// Attach as PCIe
    pub pcie: bool,
    /// Primary GPU
    pub x_vga: bool,
}

impl FromStr for PciDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, opts) = split_options(s);
        let dev = Self {
            mapping: opts.get("mapping").map(|m| m.to_string()),
            host: head
                .map(str::to_string)
                .or_else(|| opts.get("host").map(|h| h.to_string())),
            pcie: parse_flag(opts.get("pcie")),
            x_vga: parse_flag(opts.get("x-vga")),
        };
        if dev.mapping.is_none() && dev.host.is_none() {
            return Err(Error::serialization(format!(
                "pci device without mapping or host: '{}'",
                s
            )));
        }
        Ok(dev)
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.mapping, &self.host) {
            (Some(mapping), _) => write!(f, "mapping={}", mapping)?,
            (None, Some(host)) => write!(f, "{}", host)?,
            (None, None) => {}
        }
        if self.pcie {
            write!(f, ",pcie=1")?;
        }
        if self.x_vga {
            write!(f, ",x-vga=1")?;
        }
        Ok(())
    }
}

/// The `smbios1` system information block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Smbios {
    /// System UUID
    pub uuid: Option<String>,
    /// Serial number
    pub serial: Option<String>,
    /// Manufacturer
    pub manufacturer: Option<String>,
    /// Product name
    pub product: Option<String>,
    /// Values are base64 encoded
    pub base64: bool,
}

impl FromStr for Smbios {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, opts) = split_options(s);
        Ok(Self {
            uuid: opts.get("uuid").map(|v| v.to_string()),
            serial: opts.get("serial").map(|v| v.to_string()),
            manufacturer: opts.get("manufacturer").map(|v| v.to_string()),
            product: opts.get("product").map(|v| v.to_string()),
            base64: parse_flag(opts.get("base64")),
        })
    }
}

impl fmt::Display for Smbios {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.base64 {
            parts.push("base64=1".to_string());
        }
        for (k, v) in [
            ("manufacturer", &self.manufacturer),
            ("product", &self.product),
            ("serial", &self.serial),
            ("uuid", &self.uuid),
        ] {
            if let Some(v) = v {
                parts.push(format!("{}={}", k, v));
            }
        }
        f.write_str(&parts.join(","))
    }
}

/// The `cpu` model setting
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuConfig {
    /// CPU model (e.g., "host")
    pub model: String,
    /// Flags, each prefixed with '+' or '-'
    pub flags: Vec<String>,
}

impl FromStr for CpuConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, opts) = split_options(s);
        let model = head
            .or_else(|| opts.get("cputype").copied())
            .unwrap_or("kvm64")
            .to_string();
        let flags = opts
            .get("flags")
            .map(|f| f.split(';').filter(|x| !x.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self { model, flags })
    }
}

impl fmt::Display for CpuConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model)?;
        if !self.flags.is_empty() {
            write!(f, ",flags={}", self.flags.join(";"))?;
        }
        Ok(())
    }
}

/// A disk or CD-ROM attachment (`scsiN`, `virtioN`, `ideN`, ...)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskDevice {
    /// Volume id (`<storage>:<volume>`) or "none"
    pub volume: String,
    /// Size as reported by the hypervisor (e.g., "32G")
    pub size: Option<String>,
    /// Media type; "cdrom" for optical drives
    pub media: Option<String>,
    /// Remaining options, kept verbatim
    pub options: BTreeMap<String, String>,
}

impl DiskDevice {
    /// Storage id of the volume, if it lives on a storage
    pub fn storage_id(&self) -> Option<&str> {
        self.volume
            .split_once(':')
            .map(|(storage, _)| storage)
            .filter(|s| !s.is_empty())
    }

    /// Whether this is an optical drive
    pub fn is_cdrom(&self) -> bool {
        self.media.as_deref() == Some("cdrom")
    }

    /// Whether this is the hypervisor-managed cloud-init drive
    pub fn is_cloudinit(&self) -> bool {
        self.volume.contains("cloudinit")
    }

    /// Size in MiB, if reported in a unit we understand
    pub fn size_mib(&self) -> Option<u64> {
        let raw = self.size.as_deref()?;
        let (num, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit())?);
        let num: u64 = num.parse().ok()?;
        match unit {
            "T" => Some(num * 1024 * 1024),
            "G" => Some(num * 1024),
            "M" => Some(num),
            _ => None,
        }
    }

    /// Size in GiB, rounded up
    pub fn size_gib(&self) -> Option<u64> {
        self.size_mib().map(|mib| mib.div_ceil(1024))
    }
}

impl FromStr for DiskDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, opts) = split_options(s);
        let volume = head
            .map(str::to_string)
            .or_else(|| opts.get("file").map(|f| f.to_string()))
            .ok_or_else(|| Error::serialization(format!("disk without volume: '{}'", s)))?;

        let mut options: BTreeMap<String, String> = opts
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let size = options.remove("size");
        let media = options.remove("media");
        options.remove("file");

        Ok(Self {
            volume,
            size,
            media,
            options,
        })
    }
}

impl fmt::Display for DiskDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.volume)?;
        for (k, v) in &self.options {
            if v.is_empty() {
                write!(f, ",{}", k)?;
            } else {
                write!(f, ",{}={}", k, v)?;
            }
        }
        if let Some(media) = &self.media {
            write!(f, ",media={}", media)?;
        }
        if let Some(size) = &self.size {
            write!(f, ",size={}", size)?;
        }
        Ok(())
    }
}

/// A set of host CPUs, rendered as ranges (`0-3,8-11`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(Vec<u32>);

impl CpuSet {
    /// Build from CPU numbers in any order, dropping duplicates
    pub fn new(cpus: impl IntoIterator<Item = u32>) -> Self {
        let mut cpus: Vec<u32> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        Self(cpus)
    }

    /// CPU numbers in ascending order
    pub fn cpus(&self) -> &[u32] {
        &self.0
    }

    /// Number of CPUs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for CpuSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::serialization(format!("invalid cpu set '{}'", s));
        let mut cpus = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.parse().map_err(|_| invalid())?;
                    let hi: u32 = hi.parse().map_err(|_| invalid())?;
                    if lo > hi {
                        return Err(invalid());
                    }
                    cpus.extend(lo..=hi);
                }
                None => cpus.push(part.parse().map_err(|_| invalid())?),
            }
        }
        Ok(Self::new(cpus))
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges = Vec::new();
        let mut iter = self.0.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                ranges.push(start.to_string());
            } else {
                ranges.push(format!("{}-{}", start, end));
            }
        }
        f.write_str(&ranges.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_device_parse() {
        let nic: NetworkDevice = "virtio=BC:24:11:00:00:01,bridge=vmbr0,firewall=1,mtu=9000,tag=20"
            .parse()
            .expect("valid nic");
        assert_eq!(nic.model, "virtio");
        assert_eq!(nic.mac.as_deref(), Some("BC:24:11:00:00:01"));
        assert_eq!(nic.bridge, "vmbr0");
        assert!(nic.firewall);
        assert_eq!(nic.mtu, Some(9000));
        assert_eq!(nic.tag, Some(20));
    }

    #[test]
    fn test_network_device_without_mac_renders_bare_model() {
        let nic = NetworkDevice {
            model: "virtio".to_string(),
            bridge: "vmbr1".to_string(),
            mtu: Some(1500),
            ..Default::default()
        };
        assert_eq!(nic.to_string(), "virtio,bridge=vmbr1,mtu=1500");
        assert_eq!(nic.to_string().parse::<NetworkDevice>().ok(), Some(nic));
    }

    #[test]
    fn test_network_device_requires_model() {
        assert!("bridge=vmbr0".parse::<NetworkDevice>().is_err());
        assert!("virtio,bridge=vmbr0,mtu=big".parse::<NetworkDevice>().is_err());
    }

    #[test]
    fn test_ip_config_placeholders() {
        let cfg: IpConfig = "ip=host,gw=10.0.0.1,ip6=auto".parse().expect("valid");
        assert_eq!(cfg.ip, Some(IpAssignment::Host));
        assert_eq!(cfg.ip6, Some(IpAssignment::Auto));
        assert!(cfg.has_placeholder());

        let resolved = IpConfig {
            ip: Some(IpAssignment::Static("10.0.0.23/24".to_string())),
            ..cfg
        };
        assert!(!resolved.has_placeholder());
        assert_eq!(resolved.to_string(), "ip=10.0.0.23/24,gw=10.0.0.1,ip6=auto");
    }

    #[test]
    fn test_pci_device_mapping_and_raw_host() {
        let mapped: PciDevice = "mapping=gpu,pcie=1".parse().expect("valid");
        assert_eq!(mapped.mapping.as_deref(), Some("gpu"));
        assert!(mapped.pcie);
        assert_eq!(mapped.to_string(), "mapping=gpu,pcie=1");

        let raw: PciDevice = "0000:01:00.0,x-vga=1".parse().expect("valid");
        assert_eq!(raw.host.as_deref(), Some("0000:01:00.0"));
        assert!(raw.x_vga);

        assert!("pcie=1".parse::<PciDevice>().is_err());
    }

    #[test]
    fn test_smbios_and_cpu() {
        let smbios: Smbios = "uuid=7d8e,base64=1,serial=aGVsbG8=".parse().expect("valid");
        assert!(smbios.base64);
        assert_eq!(smbios.to_string(), "base64=1,serial=aGVsbG8=,uuid=7d8e");

        let cpu: CpuConfig = "host,flags=+aes;-pcid".parse().expect("valid");
        assert_eq!(cpu.model, "host");
        assert_eq!(cpu.flags, vec!["+aes", "-pcid"]);
        assert_eq!(cpu.to_string(), "host,flags=+aes;-pcid");
    }

    #[test]
    fn test_disk_storage_and_size() {
        let disk: DiskDevice = "local-lvm:vm-100-disk-0,iothread=1,size=32G"
            .parse()
            .expect("valid");
        assert_eq!(disk.storage_id(), Some("local-lvm"));
        assert_eq!(disk.size_gib(), Some(32));
        assert_eq!(disk.size_mib(), Some(32 * 1024));
        assert!(!disk.is_cdrom());

        let odd: DiskDevice = "local-lvm:vm-100-disk-0,size=30700M".parse().expect("valid");
        assert_eq!(odd.size_mib(), Some(30700));
        assert_eq!(odd.size_gib(), Some(30));

        let ci: DiskDevice = "local-lvm:vm-100-cloudinit,media=cdrom".parse().expect("valid");
        assert!(ci.is_cdrom());
        assert!(ci.is_cloudinit());

        let empty: DiskDevice = "none,media=cdrom".parse().expect("valid");
        assert_eq!(empty.storage_id(), None);
    }

    #[test]
    fn test_cpu_set_ranges() {
        let set: CpuSet = "8-11,0-3,2".parse().expect("valid");
        assert_eq!(set.len(), 8);
        assert_eq!(set.to_string(), "0-3,8-11");
        assert_eq!(CpuSet::new([5]).to_string(), "5");
        assert!("3-1".parse::<CpuSet>().is_err());
        assert!("a-b".parse::<CpuSet>().is_err());
    }
}
