//! Template inventory
//!
//! A per-region snapshot of every template VM, rebuilt wholesale by
//! [`TemplateInventory::sync_region`]. Rebuilds happen outside the lock and
//! are swapped in under the write lock, so readers see either the old or the
//! new snapshot and never a partial one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kpve_common::hash::fingerprint_pairs;
use kpve_common::Error;
use kpve_pve::{CapacityProvider, ClusterPool, VmConfig, VmLocation};

/// Usability of a template VM as a clone source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TemplateStatus {
    /// Usable
    Available,
    /// Locked by a running hypervisor operation
    Disabled,
    /// Configuration could not be read or has no disk
    #[default]
    Unknown,
    /// Disks span more than one storage
    MultipleStorageIDs,
}

/// One template VM as seen by the last sync
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceTemplateInfo {
    /// Template VM name (the class name for managed templates)
    pub name: String,
    /// Region
    pub region: String,
    /// Zone
    pub zone: String,
    /// Template VM id
    pub template_id: u32,
    /// Fingerprint of the cloud-init settings
    pub hash: String,
    /// Tags
    pub tags: Vec<String>,
    /// Storage backing all disks, when there is exactly one
    pub storage_id: Option<String>,
    /// Backing storage is shared across zones
    pub shared: bool,
    /// Usability
    pub status: TemplateStatus,
}

/// Predicate over inventory entries; [`TemplateInventory::list_with_filter`] ANDs them
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateFilter {
    /// In this region
    Region(String),
    /// In this zone
    Zone(String),
    /// With this name
    Name(String),
    /// With this template VM id
    TemplateId(u32),
    /// Carrying this tag
    Tag(String),
    /// On shared storage
    Shared,
}

impl TemplateFilter {
    fn matches(&self, info: &InstanceTemplateInfo) -> bool {
        match self {
            TemplateFilter::Region(r) => info.region == *r,
            TemplateFilter::Zone(z) => info.zone == *z,
            TemplateFilter::Name(n) => info.name == *n,
            TemplateFilter::TemplateId(id) => info.template_id == *id,
            TemplateFilter::Tag(t) => info.tags.contains(t),
            TemplateFilter::Shared => info.shared,
        }
    }
}

/// Snapshot of template VMs across regions
pub struct TemplateInventory {
    pool: Arc<dyn ClusterPool>,
    capacity: Arc<dyn CapacityProvider>,
    regions: RwLock<HashMap<String, Vec<InstanceTemplateInfo>>>,
}

impl TemplateInventory {
    /// Create an empty inventory
    pub fn new(pool: Arc<dyn ClusterPool>, capacity: Arc<dyn CapacityProvider>) -> Self {
        Self {
            pool,
            capacity,
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the snapshot of one region
    ///
    /// A failed listing leaves the previous snapshot in place. Templates whose
    /// configuration cannot be read are kept with status `Unknown`.
    #[instrument(skip(self))]
    pub async fn sync_region(&self, region: &str) -> Result<(), Error> {
        let client = self.pool.client(region)?;
        let templates = client.list_templates().await?;

        let mut infos = Vec::with_capacity(templates.len());
        for vm in templates.into_iter().filter(|vm| vm.template) {
            let info = match client.get_vm_config(&vm.zone, vm.vmid).await {
                Ok(config) => self.classify(region, &vm, &config),
                Err(e) => {
                    warn!(zone = %vm.zone, vmid = vm.vmid, error = %e, "cannot read template config");
                    InstanceTemplateInfo {
                        name: vm.name.clone(),
                        region: region.to_string(),
                        zone: vm.zone.clone(),
                        template_id: vm.vmid,
                        ..Default::default()
                    }
                }
            };
            infos.push(info);
        }

        debug!(templates = infos.len(), "template inventory rebuilt");
        self.replace_region(region, infos);
        Ok(())
    }

    fn classify(&self, region: &str, vm: &VmLocation, config: &VmConfig) -> InstanceTemplateInfo {
        let storage_ids = config.storage_ids();
        let storage_id = (storage_ids.len() == 1)
            .then(|| storage_ids.iter().next().cloned())
            .flatten();

        let status = if config.other.contains_key("lock") {
            TemplateStatus::Disabled
        } else {
            match storage_ids.len() {
                0 => TemplateStatus::Unknown,
                1 => TemplateStatus::Available,
                _ => TemplateStatus::MultipleStorageIDs,
            }
        };

        let shared = storage_id
            .as_deref()
            .and_then(|id| self.capacity.get_storage(region, id))
            .is_some_and(|s| s.shared);

        let hash = fingerprint_pairs(
            config
                .cloud_init
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        InstanceTemplateInfo {
            name: config.name.clone().unwrap_or_else(|| vm.name.clone()),
            region: region.to_string(),
            zone: vm.zone.clone(),
            template_id: vm.vmid,
            hash,
            tags: config.tags.clone(),
            storage_id,
            shared,
            status,
        }
    }

    /// Rebuild every region; regions are synced concurrently
    pub async fn sync_all(&self) -> Result<(), Error> {
        let regions = self.pool.regions();
        let results = join_all(regions.iter().map(|r| self.sync_region(r))).await;

        let errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        match Error::join("template inventory sync", errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Swap in a new snapshot for a region
    pub fn replace_region(&self, region: &str, templates: Vec<InstanceTemplateInfo>) {
        self.regions.write().insert(region.to_string(), templates);
    }

    /// Available templates matching every filter
    pub fn list_with_filter(&self, filters: &[TemplateFilter]) -> Vec<InstanceTemplateInfo> {
        self.regions
            .read()
            .values()
            .flatten()
            .filter(|t| t.status == TemplateStatus::Available)
            .filter(|t| filters.iter().all(|f| f.matches(t)))
            .cloned()
            .collect()
    }

    /// Every template of a region regardless of status
    pub fn list_region(&self, region: &str) -> Vec<InstanceTemplateInfo> {
        self.regions.read().get(region).cloned().unwrap_or_default()
    }

    /// Clone source for a node in `zone`
    ///
    /// Prefers a template in the zone itself, then falls back to one on shared
    /// storage elsewhere in the region.
    pub fn find_for_zone(&self, region: &str, zone: &str, name: &str) -> Option<InstanceTemplateInfo> {
        let base = [
            TemplateFilter::Region(region.to_string()),
            TemplateFilter::Name(name.to_string()),
        ];

        let mut local = base.to_vec();
        local.push(TemplateFilter::Zone(zone.to_string()));
        if let Some(t) = self.list_with_filter(&local).into_iter().next() {
            return Some(t);
        }

        let mut shared = base.to_vec();
        shared.push(TemplateFilter::Shared);
        self.list_with_filter(&shared).into_iter().next()
    }

    /// Current fingerprint of a template, for drift detection on running nodes
    pub fn fingerprint(&self, region: &str, template_id: u32) -> Option<String> {
        self.list_with_filter(&[
            TemplateFilter::Region(region.to_string()),
            TemplateFilter::TemplateId(template_id),
        ])
        .into_iter()
        .next()
        .map(|t| t.hash)
    }

    /// Resync every `interval` until cancelled
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "starting template inventory sync");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("template inventory sync stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_all().await {
                        warn!(error = %e, "template inventory sync failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{empty_pool, single_region_pool, storage, MockCapacity, MockHypervisor};
    use kpve_pve::VmStatus;
    use std::collections::BTreeMap;

    fn template_vm(zone: &str, vmid: u32, name: &str) -> VmLocation {
        VmLocation {
            vmid,
            zone: zone.to_string(),
            name: name.to_string(),
            status: VmStatus::Stopped,
            template: true,
        }
    }

    fn config(pairs: &[(&str, &str)]) -> VmConfig {
        let options: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        VmConfig::from_options(&options).expect("valid config")
    }

    fn capacity() -> Arc<MockCapacity> {
        let mut capacity = MockCapacity::new();
        capacity.expect_get_storage().returning(|_, id| match id {
            "ceph" => Some(storage("ceph", &["images"], &["z1", "z2"], true)),
            _ => Some(storage(id, &["images"], &["z1"], false)),
        });
        Arc::new(capacity)
    }

    fn info(zone: &str, id: u32, name: &str, status: TemplateStatus) -> InstanceTemplateInfo {
        InstanceTemplateInfo {
            name: name.to_string(),
            region: "r1".to_string(),
            zone: zone.to_string(),
            template_id: id,
            status,
            ..Default::default()
        }
    }

    /// Disks on {a, a, b} make a template unusable; disks all on {a} make it available
    #[tokio::test]
    async fn story_status_follows_backing_storages() {
        let mut client = MockHypervisor::new();
        client.expect_list_templates().returning(|| {
            Ok(vec![
                template_vm("z1", 9000, "mixed"),
                template_vm("z1", 9001, "clean"),
                template_vm("z1", 9002, "broken"),
            ])
        });
        client.expect_get_vm_config().returning(|_, vmid| match vmid {
            9000 => Ok(config(&[
                ("name", "mixed"),
                ("scsi0", "a:base-9000-disk-0,size=3G"),
                ("scsi1", "a:base-9000-disk-1,size=1G"),
                ("scsi2", "b:base-9000-disk-2,size=1G"),
            ])),
            9001 => Ok(config(&[
                ("name", "clean"),
                ("scsi0", "a:base-9001-disk-0,size=3G"),
                ("ide2", "a:vm-9001-cloudinit,media=cdrom"),
            ])),
            _ => Err(Error::infrastructure("config", "connection reset")),
        });

        let pool = single_region_pool("r1", Arc::new(client));
        let inventory = TemplateInventory::new(Arc::new(pool), capacity());
        inventory.sync_region("r1").await.expect("sync succeeds");

        let all = inventory.list_region("r1");
        let status = |id| all.iter().find(|t| t.template_id == id).map(|t| t.status);
        assert_eq!(status(9000), Some(TemplateStatus::MultipleStorageIDs));
        assert_eq!(status(9001), Some(TemplateStatus::Available));
        assert_eq!(status(9002), Some(TemplateStatus::Unknown));

        let available = inventory.list_with_filter(&[]);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].storage_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_locked_template_is_disabled() {
        let mut client = MockHypervisor::new();
        client
            .expect_list_templates()
            .returning(|| Ok(vec![template_vm("z1", 9000, "noble")]));
        client.expect_get_vm_config().returning(|_, _| {
            Ok(config(&[("scsi0", "a:base-9000-disk-0,size=3G"), ("lock", "clone")]))
        });

        let pool = single_region_pool("r1", Arc::new(client));
        let inventory = TemplateInventory::new(Arc::new(pool), capacity());
        inventory.sync_region("r1").await.expect("sync succeeds");
        assert_eq!(inventory.list_region("r1")[0].status, TemplateStatus::Disabled);
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_previous_snapshot() {
        let mut client = MockHypervisor::new();
        client
            .expect_list_templates()
            .returning(|| Err(Error::infrastructure("list", "timeout")));

        let pool = single_region_pool("r1", Arc::new(client));
        let inventory = TemplateInventory::new(Arc::new(pool), capacity());
        inventory.replace_region("r1", vec![info("z1", 9000, "noble", TemplateStatus::Available)]);

        assert!(inventory.sync_region("r1").await.is_err());
        assert_eq!(inventory.list_region("r1").len(), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_cloud_init_settings() {
        let mut client = MockHypervisor::new();
        client
            .expect_list_templates()
            .returning(|| Ok(vec![template_vm("z1", 9000, "noble")]));
        client.expect_get_vm_config().returning(|_, _| {
            Ok(config(&[
                ("scsi0", "ceph:base-9000-disk-0,size=3G"),
                ("ciuser", "ubuntu"),
                ("citype", "nocloud"),
            ]))
        });

        let pool = single_region_pool("r1", Arc::new(client));
        let inventory = TemplateInventory::new(Arc::new(pool), capacity());
        inventory.sync_region("r1").await.expect("sync succeeds");

        let expected = fingerprint_pairs([("citype", "nocloud"), ("ciuser", "ubuntu")]);
        assert_eq!(inventory.fingerprint("r1", 9000), Some(expected));
        assert_eq!(inventory.fingerprint("r1", 9999), None);
        assert!(inventory.list_region("r1")[0].shared);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let inventory = TemplateInventory::new(empty_pool(), capacity());
        let mut tagged = info("z1", 9000, "noble", TemplateStatus::Available);
        tagged.tags = vec!["gpu".to_string()];
        inventory.replace_region(
            "r1",
            vec![
                tagged,
                info("z2", 9001, "noble", TemplateStatus::Available),
                info("z1", 9002, "jammy", TemplateStatus::Available),
            ],
        );

        let hits = inventory.list_with_filter(&[
            TemplateFilter::Name("noble".to_string()),
            TemplateFilter::Zone("z1".to_string()),
        ]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].template_id, 9000);

        assert_eq!(inventory.list_with_filter(&[TemplateFilter::Tag("gpu".to_string())]).len(), 1);
        assert_eq!(inventory.list_with_filter(&[TemplateFilter::Name("noble".to_string())]).len(), 2);
    }

    #[test]
    fn test_find_for_zone_falls_back_to_shared_storage() {
        let inventory = TemplateInventory::new(empty_pool(), capacity());
        let mut shared = info("z1", 9000, "noble", TemplateStatus::Available);
        shared.shared = true;
        inventory.replace_region(
            "r1",
            vec![shared, info("z2", 9001, "jammy", TemplateStatus::Available)],
        );

        let local = inventory.find_for_zone("r1", "z1", "noble").expect("local template");
        assert_eq!(local.template_id, 9000);

        let remote = inventory.find_for_zone("r1", "z3", "noble").expect("shared template");
        assert_eq!(remote.zone, "z1");

        assert!(inventory.find_for_zone("r1", "z3", "jammy").is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let inventory = Arc::new(TemplateInventory::new(empty_pool(), capacity()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            inventory.run(Duration::from_secs(60), cancel),
        )
        .await
        .expect("loop exits after cancel");
    }
}
