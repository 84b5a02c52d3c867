//! InstanceAvailabilityFilter — which existing instances can host a job.
//!
//! Instances are narrowed by profile constraints, then turned into offers:
//! one per exclusive instance, and for shared (multi-block) instances the
//! smallest block slice that still satisfies the job.

use serde::{Deserialize, Serialize};

use fleetgrid_state::{Availability, Instance, Offer, Profile, Requirements, allowed};

/// Where an attached volume lives. Jobs using it must run in the same place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLocation {
    pub backend: String,
    pub region: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
}

impl VolumeLocation {
    fn admits(&self, backend: &str, region: &str, zone: Option<&str>) -> bool {
        if !self.backend.eq_ignore_ascii_case(backend) || !self.region.eq_ignore_ascii_case(region) {
            return false;
        }
        match (&self.availability_zone, zone) {
            (Some(want), Some(zone)) => want.eq_ignore_ascii_case(zone),
            _ => true,
        }
    }
}

/// Constraints an existing instance must satisfy to host a job.
#[derive(Debug, Clone, Copy)]
pub struct InstanceFilter<'a> {
    pub profile: &'a Profile,
    pub requirements: &'a Requirements,
    /// Only instances of this fleet.
    pub fleet_id: Option<&'a str>,
    /// Other nodes of a multi-node job follow the master's backend and region.
    pub master: Option<&'a Instance>,
    pub volumes: &'a [VolumeLocation],
    /// Allow taking a slice of a multi-block instance.
    pub shared: bool,
}

impl<'a> InstanceFilter<'a> {
    pub fn new(profile: &'a Profile, requirements: &'a Requirements) -> Self {
        Self {
            profile,
            requirements,
            fleet_id: None,
            master: None,
            volumes: &[],
            shared: true,
        }
    }

    /// Instances that could host the job, before resource matching.
    pub fn pool_instances<'i>(&self, instances: &'i [Instance]) -> Vec<&'i Instance> {
        instances.iter().filter(|i| self.admits(i)).collect()
    }

    fn admits(&self, instance: &Instance) -> bool {
        if instance.deleted || instance.unreachable || !instance.status.is_available() {
            return false;
        }
        if let Some(fleet_id) = self.fleet_id
            && instance.fleet_id.as_deref() != Some(fleet_id)
        {
            return false;
        }
        // Still provisioning: neither shared nor exclusive yet.
        if instance.total_blocks.is_none() {
            return false;
        }
        let Some(offer) = &instance.offer else {
            return false;
        };
        let zone = instance
            .launched
            .as_ref()
            .and_then(|l| l.availability_zone.as_deref());

        if !allowed(self.profile.backends.as_deref(), &offer.backend)
            || !allowed(self.profile.regions.as_deref(), &offer.region)
            || !allowed(self.profile.instance_types.as_deref(), &offer.instance.name)
        {
            return false;
        }
        if let Some(zone) = zone
            && !allowed(self.profile.availability_zones.as_deref(), zone)
        {
            return false;
        }
        if let Some(master_offer) = self.master.and_then(|m| m.offer.as_ref())
            && (!master_offer.backend.eq_ignore_ascii_case(&offer.backend)
                || !master_offer.region.eq_ignore_ascii_case(&offer.region))
        {
            return false;
        }
        self.volumes
            .iter()
            .all(|v| v.admits(&offer.backend, &offer.region, zone))
    }

    /// Offers on existing instances, cheapest first.
    ///
    /// Exclusive instances come before shared slices at equal price.
    pub fn offers(&self, instances: &[Instance]) -> Vec<Offer> {
        let pool = self.pool_instances(instances);
        let (exclusive, shared): (Vec<&Instance>, Vec<&Instance>) = pool
            .into_iter()
            .partition(|i| i.total_blocks == Some(1));

        let mut offers: Vec<Offer> = exclusive
            .into_iter()
            .chain(shared)
            .filter_map(|i| self.instance_offer(i))
            .collect();
        offers.sort_by(|a, b| a.price.total_cmp(&b.price));
        offers
    }

    fn instance_offer(&self, instance: &Instance) -> Option<Offer> {
        let offer = instance.offer.as_ref()?;
        let total = instance.total_blocks?;
        let free = instance.free_blocks().unwrap_or_default();

        // Whole instance unless a slice is allowed and useful.
        let sizes: Vec<u32> = if total > 1 && self.shared {
            (1..=total).collect()
        } else {
            vec![total]
        };
        sizes.into_iter().find_map(|blocks| {
            let resources = offer.instance.resources.slice(blocks, total);
            let price = offer.price * f64::from(blocks) / f64::from(total);
            if !self.requirements.matches(&resources, price) {
                return None;
            }
            let availability = if blocks <= free {
                Availability::Idle
            } else {
                Availability::Busy
            };
            let mut candidate = offer.clone();
            candidate.instance.resources = resources;
            candidate.price = price;
            candidate.availability = availability;
            candidate.blocks = blocks;
            candidate.total_blocks = total;
            candidate.instance_id = Some(instance.id.clone());
            if let Some(zone) = instance
                .launched
                .as_ref()
                .and_then(|l| l.availability_zone.clone())
            {
                candidate.availability_zones = Some(vec![zone]);
            }
            Some(candidate)
        })
    }
}
