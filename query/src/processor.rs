use async_trait::async_trait;
use model::query::transformation::apply_all;
use model::query::{FetchMode, Polarity, QueryKind, QueryPlan, Transformation};
use model::{Hyperrectangle, LocalTableName, MultiTuple, TableName, Tuple, TupleKind};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use storage::TupleStoreRegistry;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn, Instrument};

use crate::filter::{FilterChain, FilterRegistry};
use crate::result_queue::{Offer, ResultQueue};
use crate::QueryError;

/// Looks up stored join partners outside this node.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(
        &self,
        table: &TableName,
        range: &Hyperrectangle,
    ) -> Result<Vec<Tuple>, QueryError>;
}

/// What a processor needs from the node it runs on.
#[derive(Clone)]
pub struct ProcessorContext {
    pub storage: Arc<TupleStoreRegistry>,
    pub filters: Arc<FilterRegistry>,
    pub remote: Option<Arc<dyn RemoteFetcher>>,
}

struct JoinSide {
    table: TableName,
    transformations: Vec<Transformation>,
    filters: FilterChain,
    fetch_mode: FetchMode,
}

/// Evaluates one continuous query plan against inserted tuples.
///
/// [`StreamProcessor::accept`] runs on the write path. Its only side effect
/// is a non-blocking offer into the result queue; remote join lookups are
/// moved to a separate task.
pub struct StreamProcessor {
    plan: Arc<QueryPlan>,
    stream_filters: FilterChain,
    join: Option<JoinSide>,
    storage: Arc<TupleStoreRegistry>,
    remote: Option<Arc<dyn RemoteFetcher>>,
    runtime: Option<Handle>,
    queue: Arc<ResultQueue>,
    /// Keys reported so far, tracked only when invalidations are requested.
    reported: Mutex<HashSet<String>>,
}

impl StreamProcessor {
    pub fn new(plan: Arc<QueryPlan>, context: &ProcessorContext, queue: Arc<ResultQueue>) -> Self {
        let join = match &plan.kind {
            QueryKind::Range { .. } => None,
            QueryKind::SpatialJoin {
                join_table,
                table_transformations,
                join_filters,
                fetch_mode,
            } => Some(JoinSide {
                table: join_table.clone(),
                transformations: table_transformations.clone(),
                filters: context.filters.compile(join_filters),
                fetch_mode: *fetch_mode,
            }),
        };
        Self {
            stream_filters: context.filters.compile(&plan.stream_filters),
            join,
            storage: context.storage.clone(),
            remote: context.remote.clone(),
            runtime: Handle::try_current().ok(),
            queue,
            reported: Mutex::new(HashSet::new()),
            plan,
        }
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn queue(&self) -> &Arc<ResultQueue> {
        &self.queue
    }

    pub fn accept(self: &Arc<Self>, store: &LocalTableName, tuple: &Tuple) {
        match tuple.kind {
            TupleKind::Watermark => {
                if self.plan.receive_watermarks {
                    self.emit(MultiTuple::single(store.table.clone(), tuple.clone()));
                }
                return;
            }
            TupleKind::Deleted => {
                if self.join.is_none() {
                    self.invalidate(tuple);
                }
                return;
            }
            TupleKind::Invalidation => return,
            TupleKind::Regular => {}
        }

        match (&self.plan.kind, &self.join) {
            (QueryKind::Range { polarity, .. }, _) => self.accept_range(tuple, *polarity),
            (QueryKind::SpatialJoin { .. }, Some(join)) => self.accept_join(tuple, join),
            (QueryKind::SpatialJoin { .. }, None) => {}
        }
    }

    fn accept_range(&self, tuple: &Tuple, polarity: Polarity) {
        let Some(transformed) = apply_all(&self.plan.stream_transformations, tuple) else {
            self.invalidate(tuple);
            return;
        };
        if !self.stream_filters.matches_tuple(tuple) {
            self.invalidate(tuple);
            return;
        }

        let intersects = transformed.bbox.intersects(self.plan.compare_rectangle());
        if !polarity.reports(intersects) {
            self.invalidate(tuple);
            return;
        }
        if self.plan.receive_invalidations {
            self.reported_keys().insert(tuple.key.clone());
        }
        self.emit(MultiTuple::single(self.plan.stream_table.clone(), tuple.clone()));
    }

    fn accept_join(self: &Arc<Self>, tuple: &Tuple, join: &JoinSide) {
        let Some(transformed) = apply_all(&self.plan.stream_transformations, tuple) else {
            return;
        };
        if !transformed.bbox.intersects(&self.plan.query_range) {
            return;
        }
        if !self.stream_filters.matches_tuple(tuple) {
            return;
        }

        match (join.fetch_mode, &self.remote, &self.runtime) {
            (FetchMode::FetchRemote, Some(remote), Some(runtime)) => {
                let processor = self.clone();
                let remote = remote.clone();
                let tuple = tuple.clone();
                runtime.spawn(
                    async move {
                        let Some(join) = &processor.join else {
                            return;
                        };
                        match remote.fetch(&join.table, &transformed.bbox).await {
                            Ok(candidates) => {
                                processor.join_candidates(&tuple, &transformed, join, candidates)
                            }
                            Err(e) => {
                                warn!(query = %processor.plan.id, "Remote join fetch failed: {e}")
                            }
                        }
                    }
                    .in_current_span(),
                );
            }
            (FetchMode::FetchRemote, _, _) => {
                debug!(query = %self.plan.id, "No remote fetcher, joining local data only");
                let candidates = self.local_candidates(&join.table, &transformed.bbox);
                self.join_candidates(tuple, &transformed, join, candidates);
            }
            (FetchMode::LocalOnly, _, _) => {
                let candidates = self.local_candidates(&join.table, &transformed.bbox);
                self.join_candidates(tuple, &transformed, join, candidates);
            }
        }
    }

    /// Newest live version of every local tuple of `table` within `range`.
    fn local_candidates(&self, table: &TableName, range: &Hyperrectangle) -> Vec<Tuple> {
        let mut seen = HashSet::new();
        self.storage
            .stores_of(table)
            .iter()
            .flat_map(|store| store.range_query(range))
            .filter(|tuple| seen.insert(tuple.key.clone()))
            .collect()
    }

    fn join_candidates(
        &self,
        stream: &Tuple,
        transformed: &Tuple,
        join: &JoinSide,
        candidates: Vec<Tuple>,
    ) {
        for stored in candidates {
            let Some(transformed_stored) = apply_all(&join.transformations, &stored) else {
                continue;
            };
            if !transformed.bbox.intersects(&transformed_stored.bbox) {
                continue;
            }
            if !join.filters.matches_join(stream, &stored) {
                continue;
            }
            self.emit(MultiTuple::joined(
                (self.plan.stream_table.clone(), stream.clone()),
                (join.table.clone(), stored),
            ));
        }
    }

    /// Reports that an earlier result for this key no longer holds.
    fn invalidate(&self, tuple: &Tuple) {
        if !self.plan.receive_invalidations {
            return;
        }
        if !self.reported_keys().remove(&tuple.key) {
            return;
        }
        trace!(query = %self.plan.id, key = %tuple.key, "Invalidating reported key");
        self.emit(MultiTuple::single(
            self.plan.stream_table.clone(),
            Tuple::invalidation(tuple.key.clone(), tuple.version),
        ));
    }

    fn reported_keys(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.reported
            .lock()
            .expect("No one should panic while holding this lock")
    }

    fn emit(&self, result: MultiTuple) {
        if self.queue.offer(result) == Offer::Dropped {
            error!(
                query = %self.plan.id,
                table = %self.plan.stream_table,
                dropped = self.queue.dropped(),
                "Result queue full, dropping result"
            );
        }
    }
}
