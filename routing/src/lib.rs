mod events;
mod partitioner;
mod resolver;

pub use events::{RegionEventBus, UnsubscribeHandle};
pub use partitioner::{SpacePartitioner, SpacePartitionerCache};
pub use resolver::{linear_backoff, Operation, PartitionerRouting, RoutingConfig, RoutingResolver};

use model::{DistributionGroup, RegionId};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RoutingError {
    #[error("Unknown distribution group '{0}'")]
    UnknownGroup(DistributionGroup),
    #[error("Region {region} of '{group}' has no systems assigned yet")]
    NoSystems {
        group: DistributionGroup,
        region: RegionId,
    },
}

impl RoutingError {
    /// Routing information that is missing now may show up after a while.
    pub fn is_transient(&self) -> bool {
        matches!(self, RoutingError::NoSystems { .. })
    }
}
