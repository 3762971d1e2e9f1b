//! VM id allocation
//!
//! The hypervisor hands out the next free id, but two concurrent launches
//! asking at the same moment get the same answer. Ids handed out recently are
//! remembered for a short window and skipped. This narrows the race without
//! closing it; the hypervisor still rejects a duplicate create.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use kpve_common::Error;

use crate::client::HypervisorClient;

/// Upper bound on ids skipped before giving up
const MAX_SKIPS: u32 = 64;

/// Allocates VM ids above a floor, avoiding recently allocated ones
pub struct VmIdAllocator {
    floor: u32,
    ttl: Duration,
    recent: Mutex<HashMap<(String, u32), Instant>>,
}

impl VmIdAllocator {
    /// Allocate at or above `floor`, holding ids back for `ttl`
    pub fn new(floor: u32, ttl: Duration) -> Self {
        Self {
            floor,
            ttl,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Next id in `region` that has not been handed out within the window
    pub async fn allocate(&self, region: &str, client: &dyn HypervisorClient) -> Result<u32, Error> {
        let mut floor = self.floor;

        for _ in 0..MAX_SKIPS {
            let candidate = client.next_id(floor).await?;
            if self.claim(region, candidate) {
                debug!(region = %region, vmid = candidate, "allocated vm id");
                return Ok(candidate);
            }
            floor = candidate + 1;
        }

        Err(Error::infrastructure(
            "vmid allocation",
            format!("no unclaimed id found in region {} after {} attempts", region, MAX_SKIPS),
        ))
    }

    /// Record `vmid` as taken unless it already is
    fn claim(&self, region: &str, vmid: u32) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.retain(|_, at| now.duration_since(*at) < self.ttl);

        let key = (region.to_string(), vmid);
        if recent.contains_key(&key) {
            return false;
        }
        recent.insert(key, now);
        true
    }

    /// Forget an id, e.g. after its VM was deleted
    pub fn release(&self, region: &str, vmid: u32) {
        self.recent.lock().remove(&(region.to_string(), vmid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockHypervisorClient;

    /// Hypervisor that always reports the lowest id at or above the floor as free
    fn lowest_free() -> MockHypervisorClient {
        let mut client = MockHypervisorClient::new();
        client.expect_next_id().returning(Ok);
        client
    }

    #[tokio::test]
    async fn test_recent_ids_are_skipped() {
        let client = lowest_free();
        let alloc = VmIdAllocator::new(1000, Duration::from_secs(30));

        assert_eq!(alloc.allocate("r1", &client).await.expect("id"), 1000);
        assert_eq!(alloc.allocate("r1", &client).await.expect("id"), 1001);
        // Regions have separate id spaces
        assert_eq!(alloc.allocate("r2", &client).await.expect("id"), 1000);
    }

    #[tokio::test]
    async fn test_ids_return_after_window() {
        let client = lowest_free();
        let alloc = VmIdAllocator::new(1000, Duration::ZERO);

        assert_eq!(alloc.allocate("r1", &client).await.expect("id"), 1000);
        assert_eq!(alloc.allocate("r1", &client).await.expect("id"), 1000);
    }

    #[tokio::test]
    async fn test_released_id_is_reusable() {
        let client = lowest_free();
        let alloc = VmIdAllocator::new(1000, Duration::from_secs(30));

        let id = alloc.allocate("r1", &client).await.expect("id");
        alloc.release("r1", id);
        assert_eq!(alloc.allocate("r1", &client).await.expect("id"), id);
    }

    #[tokio::test]
    async fn test_hypervisor_error_propagates() {
        let mut client = MockHypervisorClient::new();
        client
            .expect_next_id()
            .returning(|_| Err(Error::infrastructure("nextid", "connection refused")));

        let alloc = VmIdAllocator::new(1000, Duration::from_secs(30));
        assert!(alloc.allocate("r1", &client).await.is_err());
    }
}
