//! Shared types used across kpve CRDs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Compute resources in integer base units
///
/// CPU is in millicores; memory and ephemeral storage are in bytes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    /// CPU in millicores
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
    /// Maximum number of pods
    #[serde(default)]
    pub pods: u64,
    /// Ephemeral storage in bytes
    #[serde(default)]
    pub ephemeral_storage_bytes: u64,
}

impl ResourceList {
    /// Whole vCPUs, rounding partial cores up
    pub fn vcpus(&self) -> u32 {
        self.cpu_millis.div_ceil(1000) as u32
    }

    /// Memory in MiB, rounding up
    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes.div_ceil(MIB)
    }

    /// Ephemeral storage in GiB, rounding up
    pub fn ephemeral_storage_gib(&self) -> u64 {
        self.ephemeral_storage_bytes.div_ceil(GIB)
    }

    /// Component-wise sum
    pub fn add(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis + other.cpu_millis,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            pods: self.pods + other.pods,
            ephemeral_storage_bytes: self.ephemeral_storage_bytes + other.ephemeral_storage_bytes,
        }
    }

    /// Component-wise difference, floored at zero
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            pods: self.pods.saturating_sub(other.pods),
            ephemeral_storage_bytes: self
                .ephemeral_storage_bytes
                .saturating_sub(other.ephemeral_storage_bytes),
        }
    }
}

/// How a node is billed / reclaimed
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    /// Regular capacity
    #[default]
    OnDemand,
    /// Interruptible capacity
    Spot,
    /// Pre-purchased capacity
    Reserved,
}

impl CapacityType {
    /// Label value for this capacity type
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityType::OnDemand => "on-demand",
            CapacityType::Spot => "spot",
            CapacityType::Reserved => "reserved",
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapacityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-demand" => Ok(CapacityType::OnDemand),
            "spot" => Ok(CapacityType::Spot),
            "reserved" => Ok(CapacityType::Reserved),
            other => Err(Error::validation(format!("unknown capacity type '{}'", other))),
        }
    }
}

/// Operator of a scheduling requirement
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RequirementOperator {
    /// Value must be one of `values`
    In,
    /// Value must not be one of `values`
    NotIn,
    /// Key must be present
    Exists,
    /// Key must be absent
    DoesNotExist,
}

/// A single node selector requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Label key
    pub key: String,
    /// Match operator
    pub operator: RequirementOperator,
    /// Values for In / NotIn, in caller-declared order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    /// `key In values`
    pub fn is_in(key: impl Into<String>, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator: RequirementOperator::In,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Whether a label value (or its absence) satisfies this requirement
    pub fn allows(&self, value: Option<&str>) -> bool {
        match (self.operator, value) {
            (RequirementOperator::In, Some(v)) => self.values.iter().any(|x| x == v),
            (RequirementOperator::In, None) => false,
            (RequirementOperator::NotIn, Some(v)) => !self.values.iter().any(|x| x == v),
            (RequirementOperator::NotIn, None) => true,
            (RequirementOperator::Exists, v) => v.is_some(),
            (RequirementOperator::DoesNotExist, v) => v.is_none(),
        }
    }
}

/// A set of requirements that must all hold
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirements<'a>(pub &'a [Requirement]);

impl<'a> Requirements<'a> {
    /// Values of the first `In` requirement on `key`, in declared order
    pub fn values(&self, key: &str) -> Option<&'a [String]> {
        self.0
            .iter()
            .find(|r| r.key == key && r.operator == RequirementOperator::In)
            .map(|r| r.values.as_slice())
    }

    /// Whether `value` for `key` satisfies every requirement on that key
    pub fn allows(&self, key: &str, value: &str) -> bool {
        self.0
            .iter()
            .filter(|r| r.key == key)
            .all(|r| r.allows(Some(value)))
    }

    /// Whether a label set is compatible with these requirements
    ///
    /// Only keys the label set defines are checked; an offering that says
    /// nothing about a key does not rule itself out.
    pub fn compatible(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.iter().all(|(k, v)| self.allows(k, v))
    }
}

/// Effect of a node taint
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TaintEffect {
    /// Do not schedule new pods
    NoSchedule,
    /// Prefer not to schedule new pods
    PreferNoSchedule,
    /// Evict running pods
    NoExecute,
}

/// A node taint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Optional taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect
    pub effect: TaintEffect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LABEL_REGION, LABEL_ZONE};

    #[test]
    fn test_resource_rounding() {
        let r = ResourceList {
            cpu_millis: 1500,
            memory_bytes: 2 * GIB + 1,
            pods: 110,
            ephemeral_storage_bytes: 20 * GIB,
        };
        assert_eq!(r.vcpus(), 2);
        assert_eq!(r.memory_mib(), 2049);
        assert_eq!(r.ephemeral_storage_gib(), 20);
    }

    #[test]
    fn test_saturating_sub_floors_at_zero() {
        let a = ResourceList {
            cpu_millis: 100,
            ..Default::default()
        };
        let b = ResourceList {
            cpu_millis: 200,
            pods: 1,
            ..Default::default()
        };
        assert_eq!(a.saturating_sub(&b), ResourceList::default());
    }

    #[test]
    fn test_capacity_type_round_trip_through_label_value() {
        for ct in [CapacityType::OnDemand, CapacityType::Spot, CapacityType::Reserved] {
            assert_eq!(ct.as_str().parse::<CapacityType>().ok(), Some(ct));
        }
        assert!("preemptible".parse::<CapacityType>().is_err());
    }

    #[test]
    fn test_requirements_values_keep_declared_order() {
        let reqs = vec![Requirement::is_in("karpenter.sh/capacity-type", &["reserved", "spot"])];
        let reqs = Requirements(&reqs);
        assert_eq!(
            reqs.values("karpenter.sh/capacity-type"),
            Some(&["reserved".to_string(), "spot".to_string()][..])
        );
        assert_eq!(reqs.values(LABEL_ZONE), None);
    }

    #[test]
    fn test_compatible_checks_only_defined_keys() {
        let reqs = vec![
            Requirement::is_in(LABEL_REGION, &["r1"]),
            Requirement {
                key: LABEL_ZONE.to_string(),
                operator: RequirementOperator::NotIn,
                values: vec!["z3".to_string()],
            },
        ];
        let reqs = Requirements(&reqs);

        let ok = BTreeMap::from([
            (LABEL_REGION.to_string(), "r1".to_string()),
            (LABEL_ZONE.to_string(), "z1".to_string()),
        ]);
        let wrong_zone = BTreeMap::from([(LABEL_ZONE.to_string(), "z3".to_string())]);
        let wrong_region = BTreeMap::from([(LABEL_REGION.to_string(), "r2".to_string())]);

        assert!(reqs.compatible(&ok));
        assert!(!reqs.compatible(&wrong_zone));
        assert!(!reqs.compatible(&wrong_region));
        assert!(reqs.compatible(&BTreeMap::new()));
    }

    #[test]
    fn test_exists_and_does_not_exist() {
        let exists = Requirement {
            key: "gpu".to_string(),
            operator: RequirementOperator::Exists,
            values: vec![],
        };
        assert!(exists.allows(Some("a100")));
        assert!(!exists.allows(None));

        let absent = Requirement {
            operator: RequirementOperator::DoesNotExist,
            ..exists
        };
        assert!(absent.allows(None));
    }
}
