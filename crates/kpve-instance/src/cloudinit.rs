//! Inputs of the cloud-init documents for a node

use kube::ResourceExt;

use kpve_common::crd::{InstanceType, NodeClaim, ProxmoxNodeClass};
use kpve_common::{LABEL_REGION, LABEL_ZONE};
use kpve_pve::{CloudInitValues, InterfaceValues, JoinToken, KubeletOverrides};

/// Kubelet settings for `instance_type`, with node class overrides applied
pub fn kubelet_overrides(instance_type: &InstanceType, class: &ProxmoxNodeClass) -> KubeletOverrides {
    KubeletOverrides::from_overhead(
        &instance_type.overhead,
        instance_type.capacity.pods,
        class.spec.kubelet.as_ref(),
    )
}

/// Everything the renderer is fed for one node
pub struct BootstrapInputs<'a> {
    /// The node claim as it will be returned, labels and taints included
    pub node: &'a NodeClaim,
    /// Node class
    pub class: &'a ProxmoxNodeClass,
    /// Launched shape
    pub instance_type: &'a InstanceType,
    /// Cluster name
    pub cluster_name: &'a str,
    /// PEM-encoded cluster CA
    pub cluster_ca: &'a str,
    /// Join token issued for the node
    pub token: &'a JoinToken,
    /// Guest interfaces
    pub interfaces: Vec<InterfaceValues>,
}

/// Assemble renderer values
///
/// Labels and taints are registered by the kubelet itself, startup taints
/// included, so the node joins already carrying them.
pub fn cloud_init_values(inputs: BootstrapInputs<'_>) -> CloudInitValues {
    let node = inputs.node;
    let mut taints = node.spec.taints.clone();
    for taint in &node.spec.startup_taints {
        if !taints.contains(taint) {
            taints.push(taint.clone());
        }
    }

    CloudInitValues {
        hostname: node.name_any(),
        cluster_name: inputs.cluster_name.to_string(),
        provider_id: node.provider_id().unwrap_or_default().to_string(),
        region: node.label(LABEL_REGION).unwrap_or_default().to_string(),
        zone: node.label(LABEL_ZONE).unwrap_or_default().to_string(),
        instance_type: inputs.instance_type.name.clone(),
        cluster_ca: inputs.cluster_ca.to_string(),
        join_token: inputs.token.token(),
        kubelet: kubelet_overrides(inputs.instance_type, inputs.class),
        labels: node.labels().clone(),
        taints,
        interfaces: inputs.interfaces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kpve_common::crd::{
        KubeletConfiguration, NodeClaimSpec, NodeClaimStatus, ProxmoxNodeClassSpec, ResourceList,
        Taint, TaintEffect,
    };

    fn instance_type() -> InstanceType {
        InstanceType {
            name: "c1.small".to_string(),
            capacity: ResourceList {
                cpu_millis: 2000,
                pods: 110,
                ..Default::default()
            },
            overhead: Default::default(),
            offerings: Vec::new(),
        }
    }

    fn startup_taint() -> Taint {
        Taint {
            key: "node.cilium.io/agent-not-ready".to_string(),
            value: None,
            effect: TaintEffect::NoSchedule,
        }
    }

    #[test]
    fn test_values_carry_identity_and_taints() {
        let mut node = NodeClaim::new(
            "default-abc12",
            NodeClaimSpec {
                taints: vec![crate::node::unregistered_taint()],
                startup_taints: vec![startup_taint(), crate::node::unregistered_taint()],
                ..Default::default()
            },
        );
        node.labels_mut_or_default()
            .insert(LABEL_REGION.to_string(), "r1".to_string());
        node.labels_mut_or_default()
            .insert(LABEL_ZONE.to_string(), "z2".to_string());
        node.status = Some(NodeClaimStatus {
            provider_id: Some("proxmox://r1/1042".to_string()),
            ..Default::default()
        });

        let class = ProxmoxNodeClass::new(
            "default",
            ProxmoxNodeClassSpec {
                kubelet: Some(KubeletConfiguration {
                    max_pods: Some(32),
                    cluster_dns: vec!["10.96.0.10".to_string()],
                }),
                ..Default::default()
            },
        );
        let token = JoinToken {
            id: "abcdef".to_string(),
            secret: "0123456789abcdef".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        let it = instance_type();

        let values = cloud_init_values(BootstrapInputs {
            node: &node,
            class: &class,
            instance_type: &it,
            cluster_name: "prod",
            cluster_ca: "-----BEGIN CERTIFICATE-----",
            token: &token,
            interfaces: Vec::new(),
        });

        assert_eq!(values.hostname, "default-abc12");
        assert_eq!(values.provider_id, "proxmox://r1/1042");
        assert_eq!(values.region, "r1");
        assert_eq!(values.zone, "z2");
        assert_eq!(values.join_token, "abcdef.0123456789abcdef");
        assert_eq!(values.kubelet.max_pods, Some(32));
        assert_eq!(values.kubelet.cluster_dns, vec!["10.96.0.10"]);
        assert_eq!(values.taints.len(), 2);
        assert_eq!(values.taints[1], startup_taint());
    }

    #[test]
    fn test_pods_capacity_is_default_max_pods() {
        let class = ProxmoxNodeClass::new("default", ProxmoxNodeClassSpec::default());
        assert_eq!(kubelet_overrides(&instance_type(), &class).max_pods, Some(110));
    }
}
