use async_trait::async_trait;
use client::ConnectionPool;
use model::{Hyperrectangle, NodeAddr, TableName, Tuple};
use query::{QueryError, RemoteFetcher};
use routing::{Operation, RoutingResolver};
use std::collections::HashSet;
use std::sync::Arc;
use storage::TupleStoreRegistry;
use tracing::{debug, instrument};

/// Looks up join candidates wherever the resolver says they live: in local
/// stores for hops on this node, through a range query for all others.
pub struct RoutedFetcher {
    local_node: NodeAddr,
    storage: Arc<TupleStoreRegistry>,
    resolver: Arc<dyn RoutingResolver>,
    channels: Arc<ConnectionPool>,
    page_size: u32,
}

impl RoutedFetcher {
    pub fn new(
        local_node: NodeAddr,
        storage: Arc<TupleStoreRegistry>,
        resolver: Arc<dyn RoutingResolver>,
        channels: Arc<ConnectionPool>,
        page_size: u32,
    ) -> Self {
        Self {
            local_node,
            storage,
            resolver,
            channels,
            page_size,
        }
    }

    async fn fetch_remote(
        &self,
        node: &NodeAddr,
        table: &TableName,
        range: &Hyperrectangle,
    ) -> Result<Vec<Tuple>, QueryError> {
        let failed = |reason: String| QueryError::RemoteFetch {
            node: node.to_string(),
            reason,
        };
        let channel = self.channels.get(node).await.map_err(|e| failed(e.to_string()))?;
        let results = channel
            .range_query(table.clone(), range.clone(), self.page_size)
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(results
            .into_iter()
            .filter_map(|result| result.tuples.into_iter().next())
            .collect())
    }
}

#[async_trait]
impl RemoteFetcher for RoutedFetcher {
    #[instrument(skip_all, fields(table = %table, range = %range))]
    async fn fetch(
        &self,
        table: &TableName,
        range: &Hyperrectangle,
    ) -> Result<Vec<Tuple>, QueryError> {
        let hops = self.resolver.resolve_hops(table, range, Operation::Read).await?;
        let mut seen = HashSet::new();
        let mut tuples = Vec::new();
        for hop in hops {
            let found = if hop.node == self.local_node {
                hop.regions
                    .iter()
                    .filter_map(|region| self.storage.get(&table.local(*region)).ok())
                    .flat_map(|store| store.range_query(range))
                    .collect::<Vec<_>>()
            } else {
                self.fetch_remote(&hop.node, table, range).await?
            };
            debug!(node = %hop.node, candidates = found.len(), "Fetched join candidates");
            tuples.extend(found.into_iter().filter(|tuple| seen.insert(tuple.key.clone())));
        }
        Ok(tuples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::ChannelConfig;
    use model::{DistributionGroup, DistributionRegion, RegionId};
    use routing::{PartitionerRouting, RoutingConfig, SpacePartitionerCache};

    fn rect(coords: &[f64]) -> Hyperrectangle {
        Hyperrectangle::from_coordinates(coords).unwrap()
    }

    #[tokio::test]
    async fn local_hops_are_served_from_local_stores() {
        let local = NodeAddr::new("local", 7000);
        let partitioners = Arc::new(SpacePartitionerCache::new());
        partitioners
            .get_or_create(&DistributionGroup::new("osm"))
            .put_region(DistributionRegion {
                group: DistributionGroup::new("osm"),
                id: RegionId(1),
                covering_box: Hyperrectangle::full_space(),
                systems: vec![local.clone()],
            });
        let storage = Arc::new(TupleStoreRegistry::new());
        let table = TableName::new("osm", "roads");
        let store = storage.get_or_create(&table.local(RegionId(1)));
        store.insert(Tuple::new("inside", rect(&[1.0, 2.0, 1.0, 2.0]), "", 1));
        store.insert(Tuple::new("outside", rect(&[50.0, 60.0, 50.0, 60.0]), "", 1));

        let fetcher = RoutedFetcher::new(
            local,
            storage,
            Arc::new(PartitionerRouting::new(partitioners, RoutingConfig::default())),
            Arc::new(ConnectionPool::new(ChannelConfig::default(), None)),
            100,
        );
        let found = fetcher.fetch(&table, &rect(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "inside");
    }
}
