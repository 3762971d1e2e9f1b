//! Guest networking of a freshly cloned VM
//!
//! Interfaces come from the clone's configuration. Each one inherits the
//! bridge MTU when it has none, and gets an address assignment: an explicit
//! `ipconfigN` wins, otherwise an address from the bridge subnet when the
//! bridge has one, otherwise DHCP. Host-relative placeholders are turned into
//! concrete addresses through the capacity provider.

use tracing::debug;

use kpve_common::Error;
use kpve_pve::device::{IpAssignment, IpConfig};
use kpve_pve::{
    BridgeInfo, CapacityProvider, HypervisorClient, InterfaceValues, IpFamily, VmConfig,
    VmOptions,
};

/// Where the interfaces being configured live
#[derive(Clone, Copy, Debug)]
pub struct NetworkTarget<'a> {
    /// Region
    pub region: &'a str,
    /// Zone
    pub zone: &'a str,
    /// VM id
    pub vmid: u32,
}

/// Settle addressing for every interface of the VM and write it back
///
/// Returns the interfaces as the guest will see them, for the
/// network-config document. The cloud-init drive is regenerated when
/// anything changed, so a drive attached by the template picks up the
/// new addressing.
pub async fn configure_network(
    client: &dyn HypervisorClient,
    capacity: &dyn CapacityProvider,
    target: NetworkTarget<'_>,
    config: &VmConfig,
) -> Result<Vec<InterfaceValues>, Error> {
    if config.networks.is_empty() {
        return Ok(Vec::new());
    }

    let network = capacity.get_network(target.region, target.zone)?;
    let mut opts = VmOptions::default();
    let mut interfaces = Vec::with_capacity(config.networks.len());

    for (idx, nic) in &config.networks {
        let bridge = network.bridge(&nic.bridge);

        let mut device = nic.clone();
        if device.mtu.is_none() {
            device.mtu = bridge.and_then(|b| b.mtu);
        }
        if device != *nic {
            opts.set(format!("net{}", idx), &device);
        }

        let current = config.ip_configs.get(idx);
        let mut ip = current.cloned().unwrap_or_else(|| default_ip_config(bridge));
        resolve_placeholders(capacity, target, &nic.bridge, bridge, &mut ip).await?;
        if current != Some(&ip) {
            opts.set(format!("ipconfig{}", idx), &ip);
        }

        interfaces.push(InterfaceValues {
            name: format!("eth{}", idx),
            mac: device.mac.clone(),
            mtu: device.mtu,
            ipv4: ip.ip.as_ref().map(|a| a.as_str().to_string()),
            gateway4: ip.gw.clone(),
            ipv6: ip.ip6.as_ref().map(|a| a.as_str().to_string()),
            gateway6: ip.gw6.clone(),
        });
    }

    if !opts.is_empty() {
        client.configure_vm(target.zone, target.vmid, &opts).await?;
        if config.has_cloudinit_drive() {
            client.regenerate_cloudinit(target.zone, target.vmid).await?;
        }
        debug!(zone = %target.zone, vmid = target.vmid, changed = opts.set.len(), "configured vm networking");
    }

    Ok(interfaces)
}

fn default_ip_config(bridge: Option<&BridgeInfo>) -> IpConfig {
    let v4 = bridge.is_some_and(|b| b.ipv4_subnet.is_some());
    let v6 = bridge.is_some_and(|b| b.ipv6_subnet.is_some());
    IpConfig {
        ip: Some(if v4 { IpAssignment::Host } else { IpAssignment::Dhcp }),
        ip6: v6.then_some(IpAssignment::Host),
        ..Default::default()
    }
}

async fn resolve_placeholders(
    capacity: &dyn CapacityProvider,
    target: NetworkTarget<'_>,
    bridge_name: &str,
    bridge: Option<&BridgeInfo>,
    ip: &mut IpConfig,
) -> Result<(), Error> {
    if ip.ip == Some(IpAssignment::Host) {
        let addr = capacity
            .occupy_address(target.region, target.zone, bridge_name, target.vmid, IpFamily::V4)
            .await?;
        ip.ip = Some(IpAssignment::Static(addr));
        if ip.gw.is_none() {
            ip.gw = bridge.and_then(|b| b.ipv4_gateway.clone());
        }
    }
    if ip.ip6 == Some(IpAssignment::Host) {
        let addr = capacity
            .occupy_address(target.region, target.zone, bridge_name, target.vmid, IpFamily::V6)
            .await?;
        ip.ip6 = Some(IpAssignment::Static(addr));
        if ip.gw6.is_none() {
            ip.gw6 = bridge.and_then(|b| b.ipv6_gateway.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCapacity, MockHypervisor};
    use kpve_pve::NetworkInfo;
    use std::collections::BTreeMap;

    const TARGET: NetworkTarget<'static> = NetworkTarget {
        region: "r1",
        zone: "z1",
        vmid: 1042,
    };

    fn config(pairs: &[(&str, &str)]) -> VmConfig {
        let options = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        VmConfig::from_options(&options).expect("valid config")
    }

    fn bridges() -> NetworkInfo {
        NetworkInfo {
            bridges: vec![
                BridgeInfo {
                    name: "vmbr0".to_string(),
                    mtu: Some(9000),
                    ipv4_subnet: Some("10.0.0.0/24".to_string()),
                    ipv4_gateway: Some("10.0.0.1".to_string()),
                    ..Default::default()
                },
                BridgeInfo {
                    name: "vmbr1".to_string(),
                    ..Default::default()
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_bridge_subnet_yields_static_address() {
        let mut capacity = MockCapacity::new();
        capacity.expect_get_network().returning(|_, _| Ok(bridges()));
        capacity
            .expect_occupy_address()
            .withf(|r, z, b, vmid, f| {
                r == "r1" && z == "z1" && b == "vmbr0" && *vmid == 1042 && *f == IpFamily::V4
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok("10.0.0.42/24".to_string()));

        let mut client = MockHypervisor::new();
        client
            .expect_configure_vm()
            .withf(|_, _, opts| {
                opts.set["net0"] == "virtio=BC:24:11:00:00:01,bridge=vmbr0,mtu=9000"
                    && opts.set["ipconfig0"] == "ip=10.0.0.42/24,gw=10.0.0.1"
                    && opts.set["ipconfig1"] == "ip=dhcp"
                    && !opts.set.contains_key("net1")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        client
            .expect_regenerate_cloudinit()
            .times(1)
            .returning(|_, _| Ok(()));

        let vm = config(&[
            ("net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0"),
            ("net1", "virtio=BC:24:11:00:00:02,bridge=vmbr1"),
            ("ide2", "local-lvm:vm-1042-cloudinit,media=cdrom"),
        ]);
        let interfaces = configure_network(&client, &capacity, TARGET, &vm)
            .await
            .expect("configure");

        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].name, "eth0");
        assert_eq!(interfaces[0].mtu, Some(9000));
        assert_eq!(interfaces[0].ipv4.as_deref(), Some("10.0.0.42/24"));
        assert_eq!(interfaces[0].gateway4.as_deref(), Some("10.0.0.1"));
        assert_eq!(interfaces[1].ipv4.as_deref(), Some("dhcp"));
        assert_eq!(interfaces[1].mac.as_deref(), Some("BC:24:11:00:00:02"));
    }

    #[tokio::test]
    async fn test_explicit_host_placeholder_keeps_given_gateway() {
        let mut capacity = MockCapacity::new();
        capacity.expect_get_network().returning(|_, _| Ok(bridges()));
        capacity
            .expect_occupy_address()
            .returning(|_, _, _, _, _| Ok("10.0.0.43/24".to_string()));

        let mut client = MockHypervisor::new();
        client
            .expect_configure_vm()
            .withf(|_, _, opts| opts.set["ipconfig0"] == "ip=10.0.0.43/24,gw=10.0.0.254")
            .times(1)
            .returning(|_, _, _| Ok(()));
        client.expect_regenerate_cloudinit().never();

        let vm = config(&[
            ("net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0,mtu=1500"),
            ("ipconfig0", "ip=host,gw=10.0.0.254"),
        ]);
        let interfaces = configure_network(&client, &capacity, TARGET, &vm)
            .await
            .expect("configure");
        assert_eq!(interfaces[0].mtu, Some(1500));
    }

    #[tokio::test]
    async fn test_settled_config_is_left_alone() {
        let mut capacity = MockCapacity::new();
        capacity.expect_get_network().returning(|_, _| Ok(bridges()));
        capacity.expect_occupy_address().never();

        let mut client = MockHypervisor::new();
        client.expect_configure_vm().never();
        client.expect_regenerate_cloudinit().never();

        let vm = config(&[
            ("net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0,mtu=9000"),
            ("ipconfig0", "ip=10.0.0.9/24,gw=10.0.0.1"),
        ]);
        let interfaces = configure_network(&client, &capacity, TARGET, &vm)
            .await
            .expect("configure");
        assert_eq!(interfaces[0].ipv4.as_deref(), Some("10.0.0.9/24"));
    }

    #[tokio::test]
    async fn test_failed_address_claim_propagates() {
        let mut capacity = MockCapacity::new();
        capacity.expect_get_network().returning(|_, _| Ok(bridges()));
        capacity
            .expect_occupy_address()
            .returning(|_, _, _, _, _| Err(Error::infrastructure("ipam", "subnet exhausted")));
        let mut client = MockHypervisor::new();
        client.expect_configure_vm().never();

        let vm = config(&[("net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0")]);
        let err = configure_network(&client, &capacity, TARGET, &vm)
            .await
            .expect_err("no address");
        assert!(err.is_retryable());
    }
}
