use async_trait::async_trait;
use model::{Hyperrectangle, RoutingHop, TableName};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, instrument};

use crate::partitioner::SpacePartitionerCache;
use crate::RoutingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Operation {
    Read,
    Write,
}

#[async_trait]
pub trait RoutingResolver: Send + Sync {
    /// Nodes and regions to contact for `operation` on `table` within `region`.
    /// An empty result means there is nothing to contact.
    async fn resolve_hops(
        &self,
        table: &TableName,
        region: &Hyperrectangle,
        operation: Operation,
    ) -> Result<Vec<RoutingHop>, RoutingError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub retries: usize,
    pub retry_step_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_step_ms: 100,
        }
    }
}

/// `step`, `2 * step`, ... for `retries` attempts.
pub fn linear_backoff(step: Duration, retries: usize) -> impl Iterator<Item = Duration> {
    (1..=retries as u32).map(move |attempt| step * attempt)
}

/// Resolves hops from the regions known to the local partitioner cache.
pub struct PartitionerRouting {
    partitioners: Arc<SpacePartitionerCache>,
    config: RoutingConfig,
}

impl PartitionerRouting {
    pub fn new(partitioners: Arc<SpacePartitionerCache>, config: RoutingConfig) -> Self {
        Self { partitioners, config }
    }

    fn hops_once(
        &self,
        table: &TableName,
        region: &Hyperrectangle,
        operation: Operation,
    ) -> Result<Vec<RoutingHop>, RoutingError> {
        let partitioner = self
            .partitioners
            .get(&table.group)
            .ok_or_else(|| RoutingError::UnknownGroup(table.group.clone()))?;

        let mut hops: Vec<RoutingHop> = Vec::new();
        for distribution_region in partitioner.regions_for(region) {
            let targets = match operation {
                // Reads go to the first replica only
                Operation::Read => distribution_region.systems.iter().take(1).collect::<Vec<_>>(),
                Operation::Write => distribution_region.systems.iter().collect(),
            };
            if targets.is_empty() {
                return Err(RoutingError::NoSystems {
                    group: table.group.clone(),
                    region: distribution_region.id,
                });
            }
            for node in targets {
                match hops.iter_mut().find(|hop| hop.node == *node) {
                    Some(hop) => hop.regions.push(distribution_region.id),
                    None => hops.push(RoutingHop {
                        node: node.clone(),
                        regions: vec![distribution_region.id],
                    }),
                }
            }
        }
        Ok(hops)
    }
}

#[async_trait]
impl RoutingResolver for PartitionerRouting {
    #[instrument(skip_all, fields(table = %table, operation = %operation))]
    async fn resolve_hops(
        &self,
        table: &TableName,
        region: &Hyperrectangle,
        operation: Operation,
    ) -> Result<Vec<RoutingHop>, RoutingError> {
        let strategy = linear_backoff(
            Duration::from_millis(self.config.retry_step_ms),
            self.config.retries,
        );
        Retry::spawn(strategy, || async {
            self.hops_once(table, region, operation).map_err(|e| {
                if e.is_transient() {
                    debug!("Retrying hop resolution: {e}");
                    RetryError::transient(e)
                } else {
                    RetryError::permanent(e)
                }
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{DistributionGroup, DistributionRegion, RegionId};

    fn region(id: u64, coords: &[f64], systems: &[&str]) -> DistributionRegion {
        DistributionRegion {
            group: DistributionGroup::new("osm"),
            id: RegionId(id),
            covering_box: Hyperrectangle::from_coordinates(coords).unwrap(),
            systems: systems.iter().map(|s| s.parse().unwrap()).collect(),
        }
    }

    fn routing(regions: Vec<DistributionRegion>) -> PartitionerRouting {
        let cache = Arc::new(SpacePartitionerCache::new());
        let partitioner = cache.get_or_create(&DistributionGroup::new("osm"));
        for r in regions {
            partitioner.put_region(r);
        }
        PartitionerRouting::new(
            cache,
            RoutingConfig {
                retries: 2,
                retry_step_ms: 1,
            },
        )
    }

    #[tokio::test]
    async fn read_hops_are_grouped_by_first_replica() {
        let routing = routing(vec![
            region(1, &[0.0, 10.0], &["a:1", "b:1"]),
            region(2, &[10.0, 20.0], &["a:1"]),
            region(3, &[20.0, 30.0], &["b:1", "a:1"]),
        ]);
        let hops = routing
            .resolve_hops(
                &TableName::new("osm", "cars"),
                &Hyperrectangle::full_space(),
                Operation::Read,
            )
            .await
            .unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].regions, vec![RegionId(1), RegionId(2)]);
        assert_eq!(hops[1].regions, vec![RegionId(3)]);
    }

    #[tokio::test]
    async fn write_hops_include_every_replica() {
        let routing = routing(vec![region(1, &[0.0, 10.0], &["a:1", "b:1"])]);
        let hops = routing
            .resolve_hops(
                &TableName::new("osm", "cars"),
                &Hyperrectangle::full_space(),
                Operation::Write,
            )
            .await
            .unwrap();
        assert_eq!(hops.len(), 2);
    }

    #[tokio::test]
    async fn nothing_to_contact_is_an_empty_list() {
        let routing = routing(vec![region(1, &[0.0, 10.0], &["a:1"])]);
        let hops = routing
            .resolve_hops(
                &TableName::new("osm", "cars"),
                &Hyperrectangle::from_coordinates(&[50.0, 60.0]).unwrap(),
                Operation::Read,
            )
            .await
            .unwrap();
        assert!(hops.is_empty());
    }

    #[tokio::test]
    async fn missing_systems_fail_after_retries() {
        let routing = routing(vec![region(1, &[0.0, 10.0], &[])]);
        let result = routing
            .resolve_hops(
                &TableName::new("osm", "cars"),
                &Hyperrectangle::full_space(),
                Operation::Read,
            )
            .await;
        assert!(matches!(result, Err(RoutingError::NoSystems { .. })));
    }

    #[tokio::test]
    async fn unknown_group_is_not_retried() {
        let routing = routing(vec![]);
        let result = routing
            .resolve_hops(
                &TableName::new("nope", "cars"),
                &Hyperrectangle::full_space(),
                Operation::Read,
            )
            .await;
        assert_eq!(result, Err(RoutingError::UnknownGroup(DistributionGroup::new("nope"))));
    }

    #[test]
    fn backoff_grows_linearly() {
        let delays = linear_backoff(Duration::from_millis(100), 3).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }
}
