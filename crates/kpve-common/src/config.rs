//! Provider configuration
//!
//! Tunables shared by the instance orchestrator and the template lifecycle
//! manager. A binary fills this from flags or a file; every field has a
//! usable default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poll::PollConfig;
use crate::{Error, Result};

/// Lowest VM id the hypervisor accepts
pub const MIN_VMID: u32 = 100;

/// Provider-wide settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// Kubernetes cluster name, written into VM tags and descriptions
    pub cluster_name: String,

    /// VM ids are allocated at or above this value
    pub vmid_floor: u32,

    /// How long a freshly allocated VM id is held back from other requests
    pub vmid_recent_ttl_secs: u64,

    /// Bound on waiting for a single hypervisor task
    pub task_timeout_secs: u64,

    /// First delay between task status probes
    pub task_poll_interval_secs: u64,

    /// Period of the template inventory refresh
    pub inventory_sync_interval_secs: u64,

    /// Lifetime of node join tokens
    pub token_ttl_secs: u64,

    /// Storage receiving generated cloud-init ISOs
    pub iso_storage: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cluster_name: "kubernetes".to_string(),
            vmid_floor: 1000,
            vmid_recent_ttl_secs: 30,
            task_timeout_secs: 300,
            task_poll_interval_secs: 2,
            inventory_sync_interval_secs: 60,
            token_ttl_secs: 3600,
            iso_storage: "local".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::validation_for_field(
                "config",
                "clusterName",
                "must not be empty",
            ));
        }
        if self.vmid_floor < MIN_VMID {
            return Err(Error::validation_for_field(
                "config",
                "vmidFloor",
                format!("must be at least {}", MIN_VMID),
            ));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "config",
                "taskTimeoutSecs",
                "must be positive",
            ));
        }
        if self.task_poll_interval_secs > self.task_timeout_secs {
            return Err(Error::validation_for_field(
                "config",
                "taskPollIntervalSecs",
                "must not exceed taskTimeoutSecs",
            ));
        }
        Ok(())
    }

    /// Recently-used window for VM id allocation
    pub fn vmid_recent_ttl(&self) -> Duration {
        Duration::from_secs(self.vmid_recent_ttl_secs)
    }

    /// Period of the template inventory refresh
    pub fn inventory_sync_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_sync_interval_secs)
    }

    /// Lifetime of node join tokens
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Polling settings for hypervisor tasks
    pub fn task_poll(&self) -> PollConfig {
        let interval = Duration::from_secs(self.task_poll_interval_secs.max(1));
        PollConfig {
            timeout: Duration::from_secs(self.task_timeout_secs),
            initial_interval: interval,
            max_interval: interval * 4,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProviderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_poll().timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: ProviderConfig =
            serde_json::from_str(r#"{"clusterName":"prod","vmidFloor":5000}"#)
                .expect("valid config");
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.vmid_floor, 5000);
        assert_eq!(config.vmid_recent_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_low_vmid_floor() {
        let config = ProviderConfig {
            vmid_floor: 50,
            ..Default::default()
        };
        let err = config.validate().expect_err("floor below hypervisor minimum");
        assert!(err.to_string().contains("at least 100"));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = ProviderConfig {
            task_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
