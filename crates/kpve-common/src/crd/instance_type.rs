//! Instance types and their offerings
//!
//! An instance type is a VM shape the scheduler can ask for. Each
//! [`Offering`] says where (region, zone) and how (capacity type) the shape
//! can be obtained and at what price.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{CapacityType, Requirements, ResourceList};
use crate::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_REGION, LABEL_ZONE};

/// Resources held back from pods on a node
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeOverhead {
    /// Reserved for kubelet and the container runtime
    #[serde(default)]
    pub kube_reserved: ResourceList,
    /// Reserved for the operating system
    #[serde(default)]
    pub system_reserved: ResourceList,
    /// Hard eviction thresholds
    #[serde(default)]
    pub eviction_threshold: ResourceList,
}

impl InstanceTypeOverhead {
    /// Sum of all overhead components
    pub fn total(&self) -> ResourceList {
        self.kube_reserved
            .add(&self.system_reserved)
            .add(&self.eviction_threshold)
    }
}

/// Where and how an instance type can be launched
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Offering {
    /// Hourly price
    pub price: f64,
    /// Whether capacity is currently believed to exist
    pub available: bool,
    /// Single-valued labels: region, zone, capacity type, instance type
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
}

impl Offering {
    /// Build an offering for a region/zone/capacity type
    pub fn new(
        instance_type: &str,
        region: &str,
        zone: &str,
        capacity_type: CapacityType,
        price: f64,
        available: bool,
    ) -> Self {
        let requirements = BTreeMap::from([
            (LABEL_INSTANCE_TYPE.to_string(), instance_type.to_string()),
            (LABEL_REGION.to_string(), region.to_string()),
            (LABEL_ZONE.to_string(), zone.to_string()),
            (LABEL_CAPACITY_TYPE.to_string(), capacity_type.as_str().to_string()),
        ]);
        Self {
            price,
            available,
            requirements,
        }
    }

    /// Region of this offering, if it names one
    pub fn region(&self) -> Option<&str> {
        self.requirements.get(LABEL_REGION).map(String::as_str)
    }

    /// Zone of this offering, if it names one
    pub fn zone(&self) -> Option<&str> {
        self.requirements.get(LABEL_ZONE).map(String::as_str)
    }

    /// Capacity type of this offering; unlabeled offerings are on-demand
    pub fn capacity_type(&self) -> CapacityType {
        self.requirements
            .get(LABEL_CAPACITY_TYPE)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Whether this offering is available and satisfies `reqs`
    pub fn is_compatible(&self, reqs: &Requirements<'_>) -> bool {
        self.available && reqs.compatible(&self.requirements)
    }
}

/// A launchable VM shape
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceType {
    /// Name, `<family>.<size>` (e.g., "t1.2VCPU-4GB")
    pub name: String,
    /// Advertised capacity
    pub capacity: ResourceList,
    /// Resources held back from pods
    #[serde(default)]
    pub overhead: InstanceTypeOverhead,
    /// Where the type can be obtained
    #[serde(default)]
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Family part of the name (everything before the first '.')
    pub fn family(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Capacity minus overhead
    pub fn allocatable(&self) -> ResourceList {
        self.capacity.saturating_sub(&self.overhead.total())
    }

    /// Available offerings compatible with `reqs`
    pub fn compatible_offerings<'a>(
        &'a self,
        reqs: &'a Requirements<'a>,
    ) -> impl Iterator<Item = &'a Offering> + 'a {
        self.offerings.iter().filter(move |o| o.is_compatible(reqs))
    }

    /// Lowest price among compatible offerings
    pub fn cheapest_compatible_price(&self, reqs: &Requirements<'_>) -> Option<f64> {
        self.offerings
            .iter()
            .filter(|o| o.is_compatible(reqs))
            .map(|o| o.price)
            .min_by(|a, b| a.total_cmp(b))
    }
}
