use anyhow::{anyhow, Context, Result};
use channel::GossipSource;
use client::{ConnectionPool, ContinuousQueryRegistry, NodeConnector, ResultHandle};
use model::query::{QueryId, QueryPlan};
use model::{DistributionRegion, NodeAddr, TableName, Tuple};
use protocol::RoutingHeader;
use query::FilterRegistry;
use routing::{Operation, PartitionerRouting, RoutingResolver, SpacePartitionerCache};
use server::{RoutedFetcher, Server, ServerContext, ServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use storage::TupleStoreRegistry;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, Instrument};

use crate::config::NodeConfig;

/// One running node: the server for its local regions plus the client side
/// it uses to register continuous queries and route inserts.
pub struct Node {
    local_node: NodeAddr,
    local_addr: SocketAddr,
    storage: Arc<TupleStoreRegistry>,
    partitioners: Arc<SpacePartitionerCache>,
    resolver: Arc<dyn RoutingResolver>,
    channels: Arc<ConnectionPool>,
    queries: ContinuousQueryRegistry,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<Result<(), ServerError>>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with_filters(config, Arc::new(FilterRegistry::new())).await
    }

    /// Starts the node with additional user-defined filters registered.
    pub async fn start_with_filters(
        config: NodeConfig,
        filters: Arc<FilterRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.node.bind)
            .await
            .with_context(|| format!("Could not bind {}", config.node.bind))?;
        let local_addr = listener.local_addr()?;
        let local_node = config.advertised()?.unwrap_or_else(|| NodeAddr::from(local_addr));

        let storage = Arc::new(TupleStoreRegistry::new());
        let partitioners = Arc::new(SpacePartitionerCache::new());
        let resolver: Arc<dyn RoutingResolver> =
            Arc::new(PartitionerRouting::new(partitioners.clone(), config.routing.clone()));
        let gossip: Arc<dyn GossipSource> = storage.clone();
        let client_config = config.client_config();
        let channels = Arc::new(ConnectionPool::new(client_config.channel.clone(), Some(gossip)));

        let server_config = config.server_config();
        let fetcher = RoutedFetcher::new(
            local_node.clone(),
            storage.clone(),
            resolver.clone(),
            channels.clone(),
            server_config.query.snapshot_page_size,
        );
        let context = ServerContext::new(local_node.clone(), storage.clone(), partitioners.clone())
            .with_filters(filters)
            .with_remote(Arc::new(fetcher));

        let (stop, stopped) = oneshot::channel::<()>();
        let server = Server::new(listener, Arc::new(context), server_config);
        let server = tokio::spawn(
            server
                .run(async move {
                    let _ = stopped.await;
                })
                .instrument(info_span!("server", node = %local_node)),
        );

        let connector: Arc<dyn NodeConnector> = channels.clone();
        let queries = ContinuousQueryRegistry::new(
            resolver.clone(),
            partitioners.clone(),
            connector,
            client_config,
        );
        info!(node = %local_node, addr = %local_addr, "Node started");

        Ok(Self {
            local_node,
            local_addr,
            storage,
            partitioners,
            resolver,
            channels,
            queries,
            stop: Some(stop),
            server,
        })
    }

    /// The address this node appears under in distribution regions.
    pub fn local_node(&self) -> &NodeAddr {
        &self.local_node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn storage(&self) -> &Arc<TupleStoreRegistry> {
        &self.storage
    }

    pub fn partitioners(&self) -> &Arc<SpacePartitionerCache> {
        &self.partitioners
    }

    pub fn queries(&self) -> &ContinuousQueryRegistry {
        &self.queries
    }

    pub fn channels(&self) -> &Arc<ConnectionPool> {
        &self.channels
    }

    /// Makes `table` known so that continuous queries on it can be
    /// registered here.
    pub fn create_table(&self, table: &TableName) {
        self.partitioners.get_or_create(&table.group).create_table(table);
    }

    /// Records a region announced by the cluster. Registered queries whose
    /// range it overlaps subscribe to it.
    pub fn put_region(&self, region: DistributionRegion) {
        self.partitioners.get_or_create(&region.group).put_region(region);
    }

    pub async fn register(&self, plan: QueryPlan) -> Result<(QueryId, ResultHandle)> {
        let id = plan.id;
        self.queries
            .register(plan)
            .await
            .with_context(|| format!("Could not register query {id}"))
    }

    pub async fn cancel(&self, id: QueryId) -> Result<bool> {
        self.queries
            .cancel(id)
            .await
            .with_context(|| format!("Could not cancel query {id}"))
    }

    /// Writes `tuple` to every replica of every region it intersects.
    #[instrument(skip_all, fields(table = %table, key = %tuple.key))]
    pub async fn insert(&self, table: &TableName, tuple: Tuple) -> Result<()> {
        let hops = self
            .resolver
            .resolve_hops(table, &tuple.bbox, Operation::Write)
            .await
            .with_context(|| format!("Could not route insert into {table}"))?;
        for hop in hops {
            let node = hop.node.clone();
            let channel = self
                .channels
                .get(&node)
                .await
                .with_context(|| format!("Could not reach {node}"))?;
            channel
                .insert_tuple(table.clone(), tuple.clone(), RoutingHeader::routed(vec![hop]))
                .await
                .with_context(|| format!("Insert on {node} failed"))?;
            debug!(%node, "Inserted tuple");
        }
        Ok(())
    }

    /// Cancels all queries, closes outgoing channels, then stops the server.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(node = %self.local_node, "Shutting down");
        self.queries.cancel_all().await;
        self.channels.close_all().await;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.server)
            .await
            .map_err(|e| anyhow!("Server task failed: {e}"))?
            .context("Server stopped with an error")
    }
}
