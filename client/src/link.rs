use async_trait::async_trait;
use channel::{ChannelError, Page, QueryRegistration, SequencedChannel};
use model::query::QueryPlan;
use model::{NodeAddr, RegionId};
use std::sync::Arc;

use crate::ClientError;

/// The continuous query calls the registry makes against one node.
#[async_trait]
pub trait QueryLink: Send + Sync {
    async fn register(
        &self,
        plan: QueryPlan,
        regions: Vec<RegionId>,
    ) -> Result<QueryRegistration, ChannelError>;
    async fn next_page(&self, query_sequence: u16) -> Result<Page, ChannelError>;
    async fn cancel(&self, query_sequence: u16) -> Result<(), ChannelError>;
}

/// Hands out links to nodes, connecting on demand.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn link(&self, node: &NodeAddr) -> Result<Arc<dyn QueryLink>, ClientError>;
}

#[async_trait]
impl QueryLink for SequencedChannel {
    async fn register(
        &self,
        plan: QueryPlan,
        regions: Vec<RegionId>,
    ) -> Result<QueryRegistration, ChannelError> {
        self.register_continuous_query(plan, regions).await
    }

    async fn next_page(&self, query_sequence: u16) -> Result<Page, ChannelError> {
        SequencedChannel::next_page(self, query_sequence).await
    }

    async fn cancel(&self, query_sequence: u16) -> Result<(), ChannelError> {
        self.cancel_query(query_sequence).await
    }
}
