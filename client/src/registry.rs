use channel::{ChannelError, QueryRegistration};
use model::query::{QueryId, QueryKind, QueryPlan};
use model::{
    DistributionGroup, DistributionRegion, MultiTuple, NodeAddr, RegionEvent, RegionId, RoutingHop,
};
use routing::{Operation, RoutingResolver, SpacePartitionerCache, UnsubscribeHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::config::ClientConfig;
use crate::handle::ResultHandle;
use crate::link::{NodeConnector, QueryLink};
use crate::ClientError;

/// One registration of a query on one node.
struct Subscription {
    node: NodeAddr,
    link: Arc<dyn QueryLink>,
    query_sequence: u16,
    puller: JoinHandle<()>,
}

impl Subscription {
    async fn cancel(self) -> Result<(), ChannelError> {
        self.puller.abort();
        self.link.cancel(self.query_sequence).await
    }
}

struct QueryState {
    plan: Arc<QueryPlan>,
    /// Regions some subscription is responsible for, including ones whose
    /// subscription is still being opened.
    regions: HashSet<RegionId>,
    subscriptions: Vec<Subscription>,
    results: mpsc::Sender<MultiTuple>,
}

struct GroupSubscription {
    unsubscribe: UnsubscribeHandle,
    listener: JoinHandle<()>,
    queries: HashSet<QueryId>,
}

#[derive(Default)]
struct State {
    queries: HashMap<QueryId, QueryState>,
    groups: HashMap<DistributionGroup, GroupSubscription>,
}

struct Shared {
    resolver: Arc<dyn RoutingResolver>,
    partitioners: Arc<SpacePartitionerCache>,
    connector: Arc<dyn NodeConnector>,
    config: ClientConfig,
    state: Mutex<State>,
}

/// Client-side bookkeeping of continuous queries.
///
/// A query holds one subscription per node serving part of its range. When
/// the partitioner announces a region overlapping a registered query, an
/// extra subscription for exactly that region is opened. All state is keyed
/// by [`QueryId`] and no lock is held across a network call.
#[derive(Clone)]
pub struct ContinuousQueryRegistry {
    shared: Arc<Shared>,
}

impl ContinuousQueryRegistry {
    pub fn new(
        resolver: Arc<dyn RoutingResolver>,
        partitioners: Arc<SpacePartitionerCache>,
        connector: Arc<dyn NodeConnector>,
        config: ClientConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                resolver,
                partitioners,
                connector,
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    #[instrument(skip_all, fields(query = %plan.id, table = %plan.stream_table))]
    pub async fn register(&self, plan: QueryPlan) -> Result<(QueryId, ResultHandle), ClientError> {
        let id = plan.id;
        let Some(partitioner) = self.shared.partitioners.get(&plan.stream_table.group) else {
            return Err(ClientError::UnknownTable(plan.stream_table.clone()));
        };
        let join_table = match &plan.kind {
            QueryKind::SpatialJoin { join_table, .. } => Some(join_table),
            QueryKind::Range { .. } => None,
        };
        for table in std::iter::once(&plan.stream_table).chain(join_table) {
            if !partitioner.has_table(table) {
                return Err(ClientError::UnknownTable(table.clone()));
            }
        }
        if self.shared.lock().queries.contains_key(&id) {
            return Err(ClientError::DuplicateQuery(id));
        }

        let hops = self
            .shared
            .resolver
            .resolve_hops(&plan.stream_table, &plan.query_range, Operation::Read)
            .await?;
        let hops = merge_by_node(hops);
        let plan = Arc::new(plan);
        let (results, receiver) = mpsc::channel(self.shared.config.result_buffer.max(1));

        let mut opened = Vec::with_capacity(hops.len());
        for hop in &hops {
            match self.shared.subscribe(&plan, &hop.node, hop.regions.clone(), &results).await {
                Ok(subscription) => opened.push(subscription),
                Err(e) => {
                    warn!(node = %hop.node, "Registration failed, rolling back: {e}");
                    cancel_all(opened).await;
                    return Err(e);
                }
            }
        }

        let regions = hops
            .iter()
            .flat_map(|hop| hop.regions.iter().copied())
            .collect::<HashSet<_>>();
        let rejected = {
            let mut state = self.shared.lock();
            if state.queries.contains_key(&id) {
                Some(opened)
            } else {
                state.queries.insert(
                    id,
                    QueryState {
                        plan: plan.clone(),
                        regions: regions.clone(),
                        subscriptions: opened,
                        results,
                    },
                );
                self.track_group(&mut state, &plan.stream_table.group, id);
                None
            }
        };
        if let Some(opened) = rejected {
            cancel_all(opened).await;
            return Err(ClientError::DuplicateQuery(id));
        }
        info!(nodes = hops.len(), regions = regions.len(), "Registered continuous query");

        // Regions announced while the subscriptions were opened
        for region in partitioner.regions_for(&plan.query_range) {
            if !regions.contains(&region.id) {
                if let Err(e) = self.on_region_added(&region).await {
                    warn!(region = %region.id, "Late region subscription failed: {e}");
                }
            }
        }

        Ok((id, ResultHandle::new(id, receiver)))
    }

    /// Subscribes every registered query overlapping `region` that is not
    /// yet responsible for it. Regions already registered are skipped.
    #[instrument(skip_all, fields(group = %region.group, region = %region.id))]
    pub async fn on_region_added(&self, region: &DistributionRegion) -> Result<(), ClientError> {
        let candidates = {
            let mut state = self.shared.lock();
            let State { queries, groups } = &mut *state;
            let Some(group) = groups.get(&region.group) else {
                return Ok(());
            };
            group
                .queries
                .iter()
                .filter_map(|id| {
                    let query = queries.get_mut(id)?;
                    if !query.plan.query_range.intersects(&region.covering_box)
                        || !query.regions.insert(region.id)
                    {
                        return None;
                    }
                    Some((*id, query.plan.clone(), query.results.clone()))
                })
                .collect::<Vec<_>>()
        };
        if candidates.is_empty() {
            return Ok(());
        }

        let Some(node) = region.first_replica().cloned() else {
            for (id, _, _) in &candidates {
                self.shared.release_region(id, region.id);
            }
            return Err(ClientError::NoReplica {
                group: region.group.clone(),
                region: region.id,
            });
        };

        let mut first_error = None;
        for (id, plan, results) in candidates {
            match self.shared.subscribe(&plan, &node, vec![region.id], &results).await {
                Ok(subscription) => {
                    let orphan = {
                        let mut state = self.shared.lock();
                        match state.queries.get_mut(&id) {
                            Some(query) => {
                                query.subscriptions.push(subscription);
                                None
                            }
                            None => Some(subscription),
                        }
                    };
                    match orphan {
                        // Cancelled while the subscription was opened
                        Some(orphan) => {
                            if let Err(e) = orphan.cancel().await {
                                warn!(query = %id, "Failed to cancel orphaned subscription: {e}");
                            }
                        }
                        None => debug!(query = %id, node = %node, "Subscribed to new region"),
                    }
                }
                Err(e) => {
                    warn!(query = %id, node = %node, "Failed to subscribe to new region: {e}");
                    self.shared.release_region(&id, region.id);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Cancels every subscription of the query. Returns `false` if the query
    /// is not registered. The first failure is reported after all
    /// subscriptions were attempted.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: QueryId) -> Result<bool, ClientError> {
        let (query, unsubscribed) = {
            let mut state = self.shared.lock();
            let Some(query) = state.queries.remove(&id) else {
                return Ok(false);
            };
            let group = &query.plan.stream_table.group;
            let now_empty = state.groups.get_mut(group).is_some_and(|subscription| {
                subscription.queries.remove(&id);
                subscription.queries.is_empty()
            });
            let unsubscribed = if now_empty { state.groups.remove(group) } else { None };
            (query, unsubscribed)
        };

        if let Some(group) = unsubscribed {
            debug!(group = %group.unsubscribe.group(), "No queries left, unsubscribing");
            group.unsubscribe.unsubscribe();
            group.listener.abort();
        }

        let mut first_error = None;
        for subscription in query.subscriptions {
            let node = subscription.node.clone();
            if let Err(e) = subscription.cancel().await {
                warn!(node = %node, "Failed to cancel subscription: {e}");
                first_error.get_or_insert(ClientError::from(e));
            }
        }
        info!("Cancelled continuous query");
        first_error.map_or(Ok(true), Err)
    }

    /// Cancels all registered queries, logging failures.
    pub async fn cancel_all(&self) {
        let ids = self.shared.lock().queries.keys().copied().collect::<Vec<_>>();
        for id in ids {
            if let Err(e) = self.cancel(id).await {
                warn!(query = %id, "Failed to cancel query: {e}");
            }
        }
    }

    pub fn active_queries(&self) -> usize {
        self.shared.lock().queries.len()
    }

    pub fn registered_regions(&self, id: QueryId) -> Option<Vec<RegionId>> {
        let state = self.shared.lock();
        let mut regions = state.queries.get(&id)?.regions.iter().copied().collect::<Vec<_>>();
        regions.sort();
        Some(regions)
    }

    /// Nodes the query holds a subscription on, one entry per subscription.
    pub fn subscriptions(&self, id: QueryId) -> Vec<NodeAddr> {
        self.shared
            .lock()
            .queries
            .get(&id)
            .map(|query| query.subscriptions.iter().map(|s| s.node.clone()).collect())
            .unwrap_or_default()
    }

    fn track_group(&self, state: &mut State, group: &DistributionGroup, id: QueryId) {
        if let Some(subscription) = state.groups.get_mut(group) {
            subscription.queries.insert(id);
            return;
        }
        let (unsubscribe, events) = self.shared.partitioners.events().subscribe(group.clone());
        let span = info_span!("region_listener", group = %group);
        let listener = tokio::spawn(listen(Arc::downgrade(&self.shared), events).instrument(span));
        state.groups.insert(
            group.clone(),
            GroupSubscription {
                unsubscribe,
                listener,
                queries: HashSet::from([id]),
            },
        );
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .expect("No one should panic while holding this lock")
    }

    async fn subscribe(
        &self,
        plan: &Arc<QueryPlan>,
        node: &NodeAddr,
        regions: Vec<RegionId>,
        results: &mpsc::Sender<MultiTuple>,
    ) -> Result<Subscription, ClientError> {
        let link = self.connector.link(node).await?;
        let registration = link.register(plan.as_ref().clone(), regions).await?;
        let query_sequence = registration.query_sequence;
        let puller = tokio::spawn(
            pull(link.clone(), registration, results.clone())
                .instrument(info_span!("puller", node = %node, query = %plan.id, query_sequence)),
        );
        Ok(Subscription {
            node: node.clone(),
            link,
            query_sequence,
            puller,
        })
    }

    fn release_region(&self, id: &QueryId, region: RegionId) {
        if let Some(query) = self.lock().queries.get_mut(id) {
            query.regions.remove(&region);
        }
    }
}

/// Forwards pages of one subscription until the server ends the query, the
/// link fails or the result handle is gone.
async fn pull(
    link: Arc<dyn QueryLink>,
    registration: QueryRegistration,
    results: mpsc::Sender<MultiTuple>,
) {
    let QueryRegistration {
        query_sequence,
        first_page: mut page,
    } = registration;
    loop {
        for result in page.results.drain(..) {
            if results.send(result).await.is_err() {
                return;
            }
        }
        if page.complete {
            debug!("Query finished on the server");
            return;
        }
        page = match link.next_page(query_sequence).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Stopped pulling results: {e}");
                return;
            }
        };
    }
}

async fn listen(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<RegionEvent>) {
    while let Some(event) = events.recv().await {
        // A changed region may have gained its first replica
        let region = match event {
            RegionEvent::Added(region) | RegionEvent::Changed(region) => region,
            RegionEvent::Removed(_) => continue,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let registry = ContinuousQueryRegistry { shared };
        if let Err(e) = registry.on_region_added(&region).await {
            warn!(region = %region.id, "Failed to handle new region: {e}");
        }
    }
}

async fn cancel_all(subscriptions: Vec<Subscription>) {
    for subscription in subscriptions {
        let node = subscription.node.clone();
        if let Err(e) = subscription.cancel().await {
            warn!(node = %node, "Failed to cancel subscription: {e}");
        }
    }
}

/// One hop per node, regions in first-seen order.
fn merge_by_node(hops: Vec<RoutingHop>) -> Vec<RoutingHop> {
    let mut merged: Vec<RoutingHop> = Vec::with_capacity(hops.len());
    for hop in hops {
        match merged.iter_mut().find(|m| m.node == hop.node) {
            Some(existing) => {
                for region in hop.regions {
                    if !existing.regions.contains(&region) {
                        existing.regions.push(region);
                    }
                }
            }
            None => merged.push(hop),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use channel::Page;
    use model::query::QueryPlanBuilder;
    use model::{Hyperrectangle, TableName, Tuple};
    use routing::{PartitionerRouting, RoutingConfig};
    use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
    use std::time::Duration;
    use test_utils::test_prop;

    #[derive(Default)]
    struct FakeLink {
        registrations: Mutex<Vec<Vec<RegionId>>>,
        cancelled: Mutex<Vec<u16>>,
        next_sequence: AtomicU16,
        fail_cancel: AtomicBool,
        pages: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Page>>>,
    }

    #[async_trait]
    impl QueryLink for FakeLink {
        async fn register(
            &self,
            _plan: QueryPlan,
            regions: Vec<RegionId>,
        ) -> Result<QueryRegistration, ChannelError> {
            self.registrations.lock().unwrap().push(regions);
            Ok(QueryRegistration {
                query_sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1,
                first_page: Page::default(),
            })
        }

        async fn next_page(&self, _query_sequence: u16) -> Result<Page, ChannelError> {
            let mut pages = self.pages.lock().await;
            let page = match pages.as_mut() {
                Some(pages) => pages.recv().await,
                None => None,
            };
            drop(pages);
            match page {
                Some(page) => Ok(page),
                None => std::future::pending().await,
            }
        }

        async fn cancel(&self, query_sequence: u16) -> Result<(), ChannelError> {
            self.cancelled.lock().unwrap().push(query_sequence);
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(ChannelError::ConnectionLost {
                    peer: "fake".to_string(),
                    reason: "gone".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        links: Mutex<HashMap<NodeAddr, Arc<FakeLink>>>,
    }

    impl FakeConnector {
        fn node(&self, node: &NodeAddr) -> Arc<FakeLink> {
            self.links.lock().unwrap().entry(node.clone()).or_default().clone()
        }

        fn registrations(&self) -> usize {
            self.links
                .lock()
                .unwrap()
                .values()
                .map(|link| link.registrations.lock().unwrap().len())
                .sum()
        }
    }

    #[async_trait]
    impl NodeConnector for FakeConnector {
        async fn link(&self, node: &NodeAddr) -> Result<Arc<dyn QueryLink>, ClientError> {
            Ok(self.node(node) as Arc<dyn QueryLink>)
        }
    }

    fn node(name: &str) -> NodeAddr {
        NodeAddr::new(name, 50505)
    }

    fn region(id: u64, coords: &[f64], systems: &[&str]) -> DistributionRegion {
        DistributionRegion {
            group: DistributionGroup::new("osm"),
            id: RegionId(id),
            covering_box: Hyperrectangle::from_coordinates(coords).unwrap(),
            systems: systems.iter().map(|s| node(s)).collect(),
        }
    }

    struct Setup {
        partitioners: Arc<SpacePartitionerCache>,
        connector: Arc<FakeConnector>,
        registry: ContinuousQueryRegistry,
    }

    fn setup(regions: Vec<DistributionRegion>) -> Setup {
        let partitioners = Arc::new(SpacePartitionerCache::new());
        let partitioner = partitioners.get_or_create(&DistributionGroup::new("osm"));
        partitioner.create_table(&TableName::new("osm", "cars"));
        for r in regions {
            partitioner.put_region(r);
        }
        let resolver = Arc::new(PartitionerRouting::new(
            partitioners.clone(),
            RoutingConfig {
                retries: 1,
                retry_step_ms: 1,
            },
        ));
        let connector = Arc::new(FakeConnector::default());
        let registry = ContinuousQueryRegistry::new(
            resolver,
            partitioners.clone(),
            connector.clone(),
            ClientConfig::default(),
        );
        Setup {
            partitioners,
            connector,
            registry,
        }
    }

    fn plan(coords: &[f64]) -> QueryPlan {
        QueryPlanBuilder::range(
            TableName::new("osm", "cars"),
            Hyperrectangle::from_coordinates(coords).unwrap(),
        )
        .build()
        .unwrap()
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn regions_on_the_same_node_share_one_subscription() {
        let s = setup(vec![
            region(1, &[0.0, 5.0, 0.0, 10.0], &["a", "b"]),
            region(2, &[5.0, 10.0, 0.0, 10.0], &["a"]),
        ]);
        let (id, _handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();

        let registrations = s.connector.node(&node("a")).registrations.lock().unwrap().clone();
        assert_eq!(registrations, vec![vec![RegionId(1), RegionId(2)]]);
        assert_eq!(s.registry.subscriptions(id), vec![node("a")]);
        assert_eq!(s.connector.registrations(), 1);
    }

    #[tokio::test]
    async fn unknown_group_is_rejected() {
        let s = setup(vec![]);
        let table = TableName::new("nope", "cars");
        let plan = QueryPlanBuilder::range(table, Hyperrectangle::full_space()).build().unwrap();
        assert!(matches!(
            s.registry.register(plan).await,
            Err(ClientError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn unknown_tables_are_rejected_before_subscribing() {
        let s = setup(vec![region(1, &[0.0, 10.0, 0.0, 10.0], &["a"])]);
        let range = Hyperrectangle::from_coordinates(&[0.0, 10.0, 0.0, 10.0]).unwrap();
        let plan = QueryPlanBuilder::range(TableName::new("osm", "trucks"), range.clone())
            .build()
            .unwrap();
        assert!(matches!(
            s.registry.register(plan).await,
            Err(ClientError::UnknownTable(table)) if table.table == "trucks"
        ));

        let roads = TableName::new("osm", "roads");
        let join = QueryPlanBuilder::spatial_join(TableName::new("osm", "cars"), roads, range)
            .build()
            .unwrap();
        assert!(matches!(
            s.registry.register(join).await,
            Err(ClientError::UnknownTable(table)) if table.table == "roads"
        ));
        assert_eq!(s.connector.registrations(), 0);
        assert_eq!(s.registry.active_queries(), 0);
    }

    #[tokio::test]
    async fn registering_the_same_id_twice_fails() {
        let s = setup(vec![region(1, &[0.0, 10.0, 0.0, 10.0], &["a"])]);
        let plan = plan(&[0.0, 10.0, 0.0, 10.0]);
        s.registry.register(plan.clone()).await.unwrap();
        assert!(matches!(
            s.registry.register(plan).await,
            Err(ClientError::DuplicateQuery(_))
        ));
        assert_eq!(s.registry.active_queries(), 1);
    }

    #[tokio::test]
    async fn new_overlapping_region_adds_one_subscription() {
        let s = setup(vec![region(1, &[0.0, 5.0, 0.0, 10.0], &["a"])]);
        let (id, _handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        let partitioner = s.partitioners.get(&DistributionGroup::new("osm")).unwrap();

        // Split: region 2 now covers the right half on another node
        partitioner.put_region(region(2, &[5.0, 10.0, 0.0, 10.0], &["b"]));
        eventually(|| s.registry.subscriptions(id).len() == 2).await;
        assert_eq!(s.registry.registered_regions(id).unwrap(), vec![RegionId(1), RegionId(2)]);

        // Already registered region ids are skipped, even when handled again
        partitioner.put_region(region(2, &[5.0, 10.0, 0.0, 10.0], &["b"]));
        s.registry
            .on_region_added(&region(2, &[5.0, 10.0, 0.0, 10.0], &["b"]))
            .await
            .unwrap();
        assert_eq!(s.registry.subscriptions(id).len(), 2);
        let registrations = s.connector.node(&node("b")).registrations.lock().unwrap().clone();
        assert_eq!(registrations, vec![vec![RegionId(2)]]);
    }

    #[tokio::test]
    async fn regions_outside_the_query_range_are_ignored() {
        let s = setup(vec![region(1, &[0.0, 10.0, 0.0, 10.0], &["a"])]);
        let (id, _handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        s.registry
            .on_region_added(&region(7, &[50.0, 60.0, 50.0, 60.0], &["b"]))
            .await
            .unwrap();
        assert_eq!(s.registry.registered_regions(id).unwrap(), vec![RegionId(1)]);
    }

    #[tokio::test]
    async fn region_without_replica_is_rolled_back() {
        let s = setup(vec![region(1, &[0.0, 5.0, 0.0, 10.0], &["a"])]);
        let (id, _handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        let result = s.registry.on_region_added(&region(2, &[5.0, 10.0, 0.0, 10.0], &[])).await;
        assert!(matches!(result, Err(ClientError::NoReplica { .. })));
        assert_eq!(s.registry.registered_regions(id).unwrap(), vec![RegionId(1)]);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_unsubscribes_the_group() {
        let s = setup(vec![
            region(1, &[0.0, 5.0, 0.0, 10.0], &["a"]),
            region(2, &[5.0, 10.0, 0.0, 10.0], &["b"]),
        ]);
        let (id, mut handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        let group = DistributionGroup::new("osm");
        assert_eq!(s.partitioners.events().subscriber_count(&group), 1);

        assert!(s.registry.cancel(id).await.unwrap());
        assert!(!s.registry.cancel(id).await.unwrap());
        assert_eq!(s.connector.node(&node("a")).cancelled.lock().unwrap().len(), 1);
        assert_eq!(s.connector.node(&node("b")).cancelled.lock().unwrap().len(), 1);
        assert_eq!(s.partitioners.events().subscriber_count(&group), 0);
        assert_eq!(handle.next_timeout(Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn cancel_reports_the_first_failure_but_tries_every_node() {
        let s = setup(vec![
            region(1, &[0.0, 5.0, 0.0, 10.0], &["a"]),
            region(2, &[5.0, 10.0, 0.0, 10.0], &["b"]),
        ]);
        let (id, _handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        s.connector.node(&node("a")).fail_cancel.store(true, Ordering::SeqCst);

        assert!(matches!(s.registry.cancel(id).await, Err(ClientError::Channel(_))));
        assert_eq!(s.connector.node(&node("b")).cancelled.lock().unwrap().len(), 1);
        assert_eq!(s.registry.active_queries(), 0);
    }

    #[tokio::test]
    async fn pulled_pages_reach_the_result_handle() {
        let s = setup(vec![region(1, &[0.0, 10.0, 0.0, 10.0], &["a"])]);
        let (pages, receiver) = mpsc::unbounded_channel();
        *s.connector.node(&node("a")).pages.lock().await = Some(receiver);

        let (_id, mut handle) = s.registry.register(plan(&[0.0, 10.0, 0.0, 10.0])).await.unwrap();
        let result = MultiTuple::single(
            TableName::new("osm", "cars"),
            Tuple::new(
                "car-1",
                Hyperrectangle::from_coordinates(&[1.0, 2.0, 1.0, 2.0]).unwrap(),
                "",
                1,
            ),
        );
        pages
            .send(Page {
                results: vec![result.clone()],
                complete: false,
            })
            .unwrap();
        assert_eq!(handle.next_timeout(Duration::from_secs(5)).await, Some(result));
    }

    proptest::proptest! {
        #[test]
        fn one_subscription_per_first_replica(
            owners in proptest::collection::vec(0usize..3, 1..8)
        ) {
            let nodes = ["a", "b", "c"];
            let regions = owners
                .iter()
                .enumerate()
                .map(|(i, owner)| {
                    region(i as u64, &[i as f64, i as f64 + 1.0, 0.0, 1.0], &[nodes[*owner]])
                })
                .collect::<Vec<_>>();
            let distinct = owners.iter().collect::<HashSet<_>>().len();

            let passed = test_prop(|| async move {
                let s = setup(regions);
                s.registry.register(plan(&[0.0, 100.0, 0.0, 1.0])).await.unwrap();
                assert_eq!(s.connector.registrations(), distinct);
            });
            proptest::prop_assert!(passed);
        }
    }
}
