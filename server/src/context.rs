use model::{Hyperrectangle, NodeAddr, RegionId, TableName, Tuple};
use protocol::{Gossip, RoutingHeader};
use query::{FilterRegistry, ProcessorContext, RemoteFetcher};
use routing::{SpacePartitioner, SpacePartitionerCache};
use std::sync::Arc;
use storage::TupleStoreRegistry;
use tracing::trace;

use crate::ServerError;

/// Everything a connection needs from the node it runs on. Constructed
/// once per node and shared by all connections.
pub struct ServerContext {
    pub local_node: NodeAddr,
    pub storage: Arc<TupleStoreRegistry>,
    pub partitioners: Arc<SpacePartitionerCache>,
    pub filters: Arc<FilterRegistry>,
    pub remote: Option<Arc<dyn RemoteFetcher>>,
}

impl ServerContext {
    pub fn new(
        local_node: NodeAddr,
        storage: Arc<TupleStoreRegistry>,
        partitioners: Arc<SpacePartitionerCache>,
    ) -> Self {
        Self {
            local_node,
            storage,
            partitioners,
            filters: Arc::new(FilterRegistry::new()),
            remote: None,
        }
    }

    pub fn with_filters(mut self, filters: Arc<FilterRegistry>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteFetcher>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn processor_context(&self) -> ProcessorContext {
        ProcessorContext {
            storage: self.storage.clone(),
            filters: self.filters.clone(),
            remote: self.remote.clone(),
        }
    }

    pub fn partitioner(&self, table: &TableName) -> Result<Arc<SpacePartitioner>, ServerError> {
        self.partitioners
            .get(&table.group)
            .ok_or_else(|| ServerError::UnknownTable(table.clone()))
    }

    /// Regions of `table` replicated on this node that intersect `bbox`.
    pub fn local_regions(
        &self,
        table: &TableName,
        bbox: &Hyperrectangle,
    ) -> Result<Vec<RegionId>, ServerError> {
        Ok(self.partitioner(table)?.local_regions(&self.local_node, bbox))
    }

    /// Stores `tuple` in every addressed local region and returns how many
    /// regions received it. A routed request addresses the regions of its
    /// current hop, a direct one every local region the tuple intersects.
    pub fn insert(
        &self,
        table: &TableName,
        tuple: Tuple,
        routing: &RoutingHeader,
    ) -> Result<usize, ServerError> {
        let regions = match routing.current_hop() {
            Some(hop) if hop.node == self.local_node => {
                self.partitioner(table)?;
                hop.regions.clone()
            }
            _ => self.local_regions(table, &tuple.bbox)?,
        };
        for region in &regions {
            self.storage.get_or_create(&table.local(*region)).insert(tuple.clone());
        }
        trace!(table = %table, key = %tuple.key, regions = regions.len(), "Inserted tuple");
        Ok(regions.len())
    }

    /// Keys of gossiped tuples this node should hold but only has in an
    /// older version, or not at all.
    pub fn outdated_keys(&self, gossip: &Gossip) -> Vec<String> {
        let Some(partitioner) = self.partitioners.get(&gossip.table.group) else {
            return Vec::new();
        };
        let stores = self.storage.stores_of(&gossip.table);
        gossip
            .tuples
            .iter()
            .filter(|tuple| !partitioner.local_regions(&self.local_node, &tuple.bbox).is_empty())
            .filter(|tuple| {
                let newest = stores
                    .iter()
                    .filter_map(|store| store.newest(&tuple.key))
                    .map(|local| local.version)
                    .max();
                newest.map_or(true, |version| version < tuple.version)
            })
            .map(|tuple| tuple.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{DistributionGroup, DistributionRegion, RoutingHop};

    fn rect(coords: &[f64]) -> Hyperrectangle {
        Hyperrectangle::from_coordinates(coords).unwrap()
    }

    fn context() -> ServerContext {
        let local = NodeAddr::new("local", 7000);
        let partitioners = Arc::new(SpacePartitionerCache::new());
        let partitioner = partitioners.get_or_create(&DistributionGroup::new("osm"));
        partitioner.put_region(DistributionRegion {
            group: DistributionGroup::new("osm"),
            id: RegionId(1),
            covering_box: rect(&[0.0, 10.0, 0.0, 10.0]),
            systems: vec![local.clone()],
        });
        partitioner.put_region(DistributionRegion {
            group: DistributionGroup::new("osm"),
            id: RegionId(2),
            covering_box: rect(&[10.0, 20.0, 0.0, 10.0]),
            systems: vec![NodeAddr::new("other", 7000)],
        });
        ServerContext::new(local, Arc::new(TupleStoreRegistry::new()), partitioners)
    }

    #[test]
    fn direct_inserts_land_in_intersecting_local_regions() {
        let context = context();
        let table = TableName::new("osm", "roads");
        let tuple = Tuple::new("a", rect(&[5.0, 15.0, 1.0, 2.0]), "", 1);
        assert_eq!(context.insert(&table, tuple, &RoutingHeader::direct()).unwrap(), 1);
        assert_eq!(context.storage.get(&table.local(RegionId(1))).unwrap().len(), 1);
        assert!(context.storage.get(&table.local(RegionId(2))).is_err());
    }

    #[test]
    fn routed_inserts_use_the_regions_of_the_hop() {
        let context = context();
        let table = TableName::new("osm", "roads");
        let routing = RoutingHeader::routed(vec![RoutingHop {
            node: context.local_node.clone(),
            regions: vec![RegionId(1), RegionId(9)],
        }]);
        let tuple = Tuple::new("a", rect(&[1.0, 2.0, 1.0, 2.0]), "", 1);
        assert_eq!(context.insert(&table, tuple, &routing).unwrap(), 2);
    }

    #[test]
    fn unknown_groups_are_rejected() {
        let context = context();
        let tuple = Tuple::new("a", rect(&[1.0, 2.0, 1.0, 2.0]), "", 1);
        assert!(matches!(
            context.insert(&TableName::new("nope", "roads"), tuple, &RoutingHeader::direct()),
            Err(ServerError::UnknownTable(_))
        ));
    }

    #[test]
    fn gossip_reports_missing_and_older_local_copies() {
        let context = context();
        let table = TableName::new("osm", "roads");
        let tuple = Tuple::new("a", rect(&[1.0, 2.0, 1.0, 2.0]), "", 3);
        context.insert(&table, tuple, &RoutingHeader::direct()).unwrap();

        let gossip = Gossip {
            table,
            tuples: vec![
                Tuple::new("a", rect(&[1.0, 2.0, 1.0, 2.0]), "", 3),
                Tuple::new("a", rect(&[1.0, 2.0, 1.0, 2.0]), "", 4),
                Tuple::new("b", rect(&[1.0, 2.0, 1.0, 2.0]), "", 1),
                // Not ours to hold
                Tuple::new("c", rect(&[15.0, 16.0, 1.0, 2.0]), "", 1),
            ],
        };
        assert_eq!(context.outdated_keys(&gossip), vec!["a".to_string(), "b".to_string()]);
    }
}
