//! Candidate search: which instance type, where, and in what order

use rand::seq::SliceRandom;
use rand::Rng;

use kpve_common::crd::{
    CapacityType, InstanceType, NodeClaim, ProxmoxNodeClass, Requirements, ZoneBalance,
};
use kpve_common::{LABEL_CAPACITY_TYPE, LABEL_REGION, LABEL_ZONE};
use kpve_pve::CapacityProvider;

/// One place to try launching a node
#[derive(Clone, Copy, Debug)]
pub struct Candidate<'a> {
    /// The claim being satisfied
    pub claim: &'a NodeClaim,
    /// How to realize it
    pub class: &'a ProxmoxNodeClass,
    /// Shape to launch
    pub instance_type: &'a InstanceType,
    /// Region
    pub region: &'a str,
    /// Zone
    pub zone: &'a str,
}

/// Instance types ordered by their cheapest compatible offering, ties by name
///
/// Types without any compatible offering are returned separately.
pub fn order_by_price<'a>(
    types: &'a [InstanceType],
    reqs: &Requirements<'_>,
) -> (Vec<&'a InstanceType>, Vec<&'a InstanceType>) {
    let mut priced = Vec::new();
    let mut unpriced = Vec::new();
    for it in types {
        match it.cheapest_compatible_price(reqs) {
            Some(price) => priced.push((price, it)),
            None => unpriced.push(it),
        }
    }

    priced.sort_by(|(pa, a), (pb, b)| pa.total_cmp(pb).then_with(|| a.name.cmp(&b.name)));
    (priced.into_iter().map(|(_, it)| it).collect(), unpriced)
}

/// Regions to search: the node class's region, else the claim's, else all
pub fn candidate_regions(
    class: &ProxmoxNodeClass,
    reqs: &Requirements<'_>,
    capacity: &dyn CapacityProvider,
) -> Vec<String> {
    if let Some(region) = &class.spec.region {
        return vec![region.clone()];
    }
    match reqs.values(LABEL_REGION) {
        Some(values) if !values.is_empty() => values.to_vec(),
        _ => capacity.regions(),
    }
}

/// Zones of `region` to try for `instance_type`
///
/// Zones the claim names explicitly are used as given, limited to those the
/// region has. Otherwise every zone with room for the type is a candidate.
pub fn candidate_zones(
    reqs: &Requirements<'_>,
    capacity: &dyn CapacityProvider,
    region: &str,
    instance_type: &InstanceType,
) -> Vec<String> {
    match reqs.values(LABEL_ZONE) {
        Some(values) if !values.is_empty() => {
            let known = capacity.zones(region);
            values
                .iter()
                .filter(|z| known.contains(z))
                .cloned()
                .collect()
        }
        _ => capacity.available_zones(region, &instance_type.capacity),
    }
}

/// Order zones by placement policy
///
/// `Balanced` puts the least CPU-loaded zone first, ties by name.
/// `AvailabilityFirst` shuffles.
pub fn order_zones<R: Rng + ?Sized>(
    mut zones: Vec<String>,
    balance: ZoneBalance,
    load: impl Fn(&str) -> f64,
    rng: &mut R,
) -> Vec<String> {
    match balance {
        ZoneBalance::AvailabilityFirst => zones.shuffle(rng),
        ZoneBalance::Balanced => {
            let mut loaded: Vec<(f64, String)> = zones.into_iter().map(|z| (load(&z), z)).collect();
            loaded.sort_by(|(la, a), (lb, b)| la.total_cmp(lb).then_with(|| a.cmp(b)));
            zones = loaded.into_iter().map(|(_, z)| z).collect();
        }
    }
    zones
}

/// Capacity type for a launch in `region`/`zone`
///
/// The first requested type, in the claim's order, with an available
/// offering there wins. Without a match, or without a request, the node is
/// on-demand.
pub fn resolve_capacity_type(
    instance_type: &InstanceType,
    reqs: &Requirements<'_>,
    region: &str,
    zone: &str,
) -> CapacityType {
    let Some(requested) = reqs.values(LABEL_CAPACITY_TYPE) else {
        return CapacityType::OnDemand;
    };

    requested
        .iter()
        .filter_map(|v| v.parse::<CapacityType>().ok())
        .find(|ct| {
            instance_type.offerings.iter().any(|o| {
                o.available
                    && o.region().map_or(true, |r| r == region)
                    && o.zone().map_or(true, |z| z == zone)
                    && o.capacity_type() == *ct
            })
        })
        .unwrap_or_default()
}
