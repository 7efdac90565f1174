use async_trait::async_trait;
use model::query::{QueryId, QueryPlan};
use model::{LocalTableName, Tuple};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{CallbackId, TupleStoreManager};
use tracing::{debug, info};

use crate::config::QueryConfig;
use crate::pager::{fetch_page, ClientQuery, PageLimit, PageOutcome, ResponseSink};
use crate::processor::{ProcessorContext, StreamProcessor};
use crate::result_queue::ResultQueue;
use crate::QueryError;

/// A continuous query attached to local tuple stores.
///
/// While active, every insert into one of the stores runs through the
/// [`StreamProcessor`]. Closing detaches it from all stores exactly once.
pub struct ContinuousQuery {
    processor: Arc<StreamProcessor>,
    /// `None` once the query is done.
    attached: Mutex<Option<Vec<(Arc<TupleStoreManager>, CallbackId)>>>,
    /// Serializes page fetches.
    paging: tokio::sync::Mutex<()>,
    flush_time: Duration,
}

impl ContinuousQuery {
    pub fn start(
        plan: QueryPlan,
        stores: Vec<Arc<TupleStoreManager>>,
        context: &ProcessorContext,
        config: &QueryConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(ResultQueue::new(config.result_queue_capacity));
        let processor = Arc::new(StreamProcessor::new(Arc::new(plan), context, queue));

        let attached = stores
            .into_iter()
            .map(|store| {
                let processor = processor.clone();
                let id = store.register_insert_callback(Arc::new(
                    move |name: &LocalTableName, tuple: &Tuple| processor.accept(name, tuple),
                ));
                (store, id)
            })
            .collect::<Vec<_>>();
        info!(
            query = %processor.plan().id,
            table = %processor.plan().stream_table,
            stores = attached.len(),
            "Started continuous query"
        );

        Arc::new(Self {
            processor,
            attached: Mutex::new(Some(attached)),
            paging: tokio::sync::Mutex::new(()),
            flush_time: config.continuous_flush(),
        })
    }

    pub fn id(&self) -> QueryId {
        self.processor.plan().id
    }

    pub fn plan(&self) -> &QueryPlan {
        self.processor.plan()
    }

    pub fn queued_results(&self) -> usize {
        self.processor.queue().len()
    }

    pub fn dropped_results(&self) -> u64 {
        self.processor.queue().dropped()
    }
}

#[async_trait]
impl ClientQuery for ContinuousQuery {
    async fn fetch_next_page(
        &self,
        page_sequence: u16,
        sink: &dyn ResponseSink,
    ) -> Result<PageOutcome, QueryError> {
        let _paging = self.paging.lock().await;
        let outcome = fetch_page(
            self.processor.queue(),
            PageLimit::FlushTime(self.flush_time),
            page_sequence,
            sink,
        )
        .await?;
        if outcome == PageOutcome::Finished {
            self.close();
        }
        Ok(outcome)
    }

    fn is_done(&self) -> bool {
        self.attached
            .lock()
            .expect("No one should panic while holding this lock")
            .is_none()
    }

    fn close(&self) {
        let attached = self
            .attached
            .lock()
            .expect("No one should panic while holding this lock")
            .take();
        let Some(attached) = attached else {
            return;
        };
        for (store, id) in attached {
            store.remove_insert_callback(id);
        }
        self.processor.queue().close();
        debug!(query = %self.id(), dropped = self.dropped_results(), "Closed continuous query");
    }

    fn wake(&self) {
        self.processor.queue().wake();
    }
}

impl Drop for ContinuousQuery {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRegistry;
    use crate::pager::tests::RecordingSink;
    use model::query::QueryPlanBuilder;
    use model::{Hyperrectangle, RegionId, TableName};
    use protocol::Response;
    use storage::TupleStoreRegistry;

    fn setup() -> (Arc<TupleStoreRegistry>, Arc<TupleStoreManager>, Arc<ContinuousQuery>) {
        let storage = Arc::new(TupleStoreRegistry::new());
        let table = TableName::new("osm", "cars");
        let store = storage.get_or_create(&table.local(RegionId(1)));
        let context = ProcessorContext {
            storage: storage.clone(),
            filters: Arc::new(FilterRegistry::new()),
            remote: None,
        };
        let plan = QueryPlanBuilder::range(table, Hyperrectangle::full_space()).build().unwrap();
        let config = QueryConfig {
            continuous_flush_ms: 0,
            ..QueryConfig::default()
        };
        let query = ContinuousQuery::start(plan, vec![store.clone()], &context, &config);
        (storage, store, query)
    }

    #[tokio::test]
    async fn inserts_arrive_on_the_next_page() {
        let (_storage, store, query) = setup();
        store.insert(Tuple::new("a", Hyperrectangle::full_space(), "", 1));
        assert_eq!(query.queued_results(), 1);

        let sink = RecordingSink::default();
        assert_eq!(query.fetch_next_page(3, &sink).await.unwrap(), PageOutcome::More);
        let frames = sink.take();
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[1], Response::Tuple { tuple, .. } if tuple.key == "a"));
    }

    #[tokio::test]
    async fn close_detaches_exactly_once() {
        let (_storage, store, query) = setup();
        assert_eq!(store.callback_count(), 1);
        query.close();
        query.close();
        assert!(query.is_done());
        assert_eq!(store.callback_count(), 0);

        store.insert(Tuple::new("a", Hyperrectangle::full_space(), "", 1));
        let sink = RecordingSink::default();
        assert_eq!(query.fetch_next_page(4, &sink).await.unwrap(), PageOutcome::Finished);
    }

    #[tokio::test]
    async fn dropping_the_query_detaches_it() {
        let (_storage, store, query) = setup();
        drop(query);
        assert_eq!(store.callback_count(), 0);
    }
}
