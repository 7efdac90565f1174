//! Client side of continuous queries: one subscription per serving node,
//! re-subscription on new regions and a pull loop per subscription.

mod config;
mod handle;
mod link;
mod pool;
mod registry;

pub use config::ClientConfig;
pub use handle::ResultHandle;
pub use link::{NodeConnector, QueryLink};
pub use pool::ConnectionPool;
pub use registry::ContinuousQueryRegistry;

use channel::ChannelError;
use model::query::QueryId;
use model::{DistributionGroup, RegionId, TableName};
use routing::RoutingError;

#[derive(Debug, thiserror::Error, Clone)]
pub enum ClientError {
    #[error("Unknown table '{0}'")]
    UnknownTable(TableName),
    #[error("Query '{0}' is already registered")]
    DuplicateQuery(QueryId),
    #[error("Region {region} of '{group}' has no replica")]
    NoReplica {
        group: DistributionGroup,
        region: RegionId,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Channel(e) => e.is_retryable(),
            ClientError::Routing(e) => e.is_transient(),
            _ => false,
        }
    }
}
