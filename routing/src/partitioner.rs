use model::{
    DistributionGroup, DistributionRegion, Hyperrectangle, NodeAddr, RegionEvent, RegionId,
    TableName,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::events::RegionEventBus;

/// Current region layout of one distribution group and the tables created
/// in it.
///
/// How regions are split or merged is decided elsewhere; this type only
/// records the outcome and announces every change on the event bus.
pub struct SpacePartitioner {
    group: DistributionGroup,
    regions: RwLock<BTreeMap<RegionId, DistributionRegion>>,
    tables: RwLock<BTreeSet<String>>,
    events: Arc<RegionEventBus>,
}

impl SpacePartitioner {
    pub fn new(group: DistributionGroup, events: Arc<RegionEventBus>) -> Self {
        Self {
            group,
            regions: RwLock::new(BTreeMap::new()),
            tables: RwLock::new(BTreeSet::new()),
            events,
        }
    }

    pub fn group(&self) -> &DistributionGroup {
        &self.group
    }

    /// Records that `table` exists. Returns false if it was already known.
    pub fn create_table(&self, table: &TableName) -> bool {
        debug_assert_eq!(table.group, self.group);
        let created = self
            .tables
            .write()
            .expect("No one should panic while holding this lock")
            .insert(table.table.clone());
        if created {
            info!(table = %table, "Table created");
        }
        created
    }

    pub fn has_table(&self, table: &TableName) -> bool {
        table.group == self.group
            && self
                .tables
                .read()
                .expect("No one should panic while holding this lock")
                .contains(&table.table)
    }

    pub fn region(&self, id: RegionId) -> Option<DistributionRegion> {
        self.regions
            .read()
            .expect("No one should panic while holding this lock")
            .get(&id)
            .cloned()
    }

    pub fn regions(&self) -> Vec<DistributionRegion> {
        self.regions
            .read()
            .expect("No one should panic while holding this lock")
            .values()
            .cloned()
            .collect()
    }

    /// Regions whose covering box intersects `bbox`, ordered by id.
    pub fn regions_for(&self, bbox: &Hyperrectangle) -> Vec<DistributionRegion> {
        self.regions
            .read()
            .expect("No one should panic while holding this lock")
            .values()
            .filter(|r| r.covering_box.intersects(bbox))
            .cloned()
            .collect()
    }

    /// Regions intersecting `bbox` that `node` holds a replica of.
    pub fn local_regions(&self, node: &NodeAddr, bbox: &Hyperrectangle) -> Vec<RegionId> {
        self.regions_for(bbox)
            .into_iter()
            .filter(|r| r.systems.contains(node))
            .map(|r| r.id)
            .collect()
    }

    /// Inserts or replaces a region and publishes the change.
    pub fn put_region(&self, region: DistributionRegion) {
        debug_assert_eq!(region.group, self.group);
        let previous = self
            .regions
            .write()
            .expect("No one should panic while holding this lock")
            .insert(region.id, region.clone());

        info!(
            group = %self.group,
            region = %region.id,
            bbox = %region.covering_box,
            "Region updated"
        );
        let event = match previous {
            None => RegionEvent::Added(region),
            Some(_) => RegionEvent::Changed(region),
        };
        self.events.publish(event);
    }

    pub fn remove_region(&self, id: RegionId) -> Option<DistributionRegion> {
        let removed = self
            .regions
            .write()
            .expect("No one should panic while holding this lock")
            .remove(&id)?;
        info!(group = %self.group, region = %id, "Region removed");
        self.events.publish(RegionEvent::Removed(removed.clone()));
        Some(removed)
    }
}

/// Explicitly constructed cache of all partitioners known to a process.
pub struct SpacePartitionerCache {
    partitioners: RwLock<HashMap<DistributionGroup, Arc<SpacePartitioner>>>,
    events: Arc<RegionEventBus>,
}

impl Default for SpacePartitionerCache {
    fn default() -> Self {
        Self {
            partitioners: RwLock::new(HashMap::new()),
            events: RegionEventBus::new(),
        }
    }
}

impl SpacePartitionerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &Arc<RegionEventBus> {
        &self.events
    }

    pub fn get(&self, group: &DistributionGroup) -> Option<Arc<SpacePartitioner>> {
        self.partitioners
            .read()
            .expect("No one should panic while holding this lock")
            .get(group)
            .cloned()
    }

    pub fn get_or_create(&self, group: &DistributionGroup) -> Arc<SpacePartitioner> {
        self.partitioners
            .write()
            .expect("No one should panic while holding this lock")
            .entry(group.clone())
            .or_insert_with(|| Arc::new(SpacePartitioner::new(group.clone(), self.events.clone())))
            .clone()
    }

    pub fn has_table(&self, table: &TableName) -> bool {
        self.get(&table.group).is_some_and(|p| p.has_table(table))
    }

    pub fn remove(&self, group: &DistributionGroup) -> Option<Arc<SpacePartitioner>> {
        self.partitioners
            .write()
            .expect("No one should panic while holding this lock")
            .remove(group)
    }
}
