use async_trait::async_trait;
use model::{Hyperrectangle, MultiTuple, TableName};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use storage::TupleStoreRegistry;
use tracing::debug;

use crate::pager::{fetch_page, ClientQuery, PageLimit, PageOutcome, ResponseSink};
use crate::result_queue::ResultQueue;
use crate::QueryError;

/// One-shot range query over the local stores of a table, paged by count.
pub struct SnapshotQuery {
    queue: ResultQueue,
    page_size: usize,
    done: AtomicBool,
    paging: tokio::sync::Mutex<()>,
}

impl SnapshotQuery {
    /// Collects the newest live version of every matching key up front.
    pub fn start(
        storage: &TupleStoreRegistry,
        table: &TableName,
        range: &Hyperrectangle,
        page_size: u32,
    ) -> Self {
        let stores = storage.stores_of(table);
        let mut seen = HashSet::new();
        let results = stores
            .iter()
            .flat_map(|store| store.range_query(range))
            .filter(|tuple| seen.insert(tuple.key.clone()))
            .map(|tuple| MultiTuple::single(table.clone(), tuple))
            .collect::<Vec<_>>();
        debug!(table = %table, %range, results = results.len(), "Started snapshot query");

        Self {
            queue: ResultQueue::finished(results),
            page_size: page_size.max(1) as usize,
            done: AtomicBool::new(false),
            paging: tokio::sync::Mutex::new(()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl ClientQuery for SnapshotQuery {
    async fn fetch_next_page(
        &self,
        page_sequence: u16,
        sink: &dyn ResponseSink,
    ) -> Result<PageOutcome, QueryError> {
        let _paging = self.paging.lock().await;
        let limit = PageLimit::Tuples(self.page_size);
        let outcome = fetch_page(&self.queue, limit, page_sequence, sink).await?;
        if outcome == PageOutcome::Finished {
            self.close();
        }
        Ok(outcome)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    fn wake(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::tests::RecordingSink;
    use model::{RegionId, Tuple};
    use protocol::Response;

    fn rect(coords: &[f64]) -> Hyperrectangle {
        Hyperrectangle::from_coordinates(coords).unwrap()
    }

    #[tokio::test]
    async fn pages_through_all_local_regions() {
        let storage = TupleStoreRegistry::new();
        let table = TableName::new("osm", "roads");
        for region in 0..3 {
            let store = storage.get_or_create(&table.local(RegionId(region)));
            let bbox = rect(&[region as f64, region as f64 + 1.0]);
            store.insert(Tuple::new(format!("r{region}"), bbox, "", 1));
        }
        // Spans two regions but is only reported once
        for region in 0..2 {
            let store = storage.get_or_create(&table.local(RegionId(region)));
            store.insert(Tuple::new("shared", rect(&[0.5, 1.5]), "", 1));
        }

        let query = SnapshotQuery::start(&storage, &table, &rect(&[0.0, 100.0]), 3);
        assert_eq!(query.remaining(), 4);

        let sink = RecordingSink::default();
        assert_eq!(query.fetch_next_page(1, &sink).await.unwrap(), PageOutcome::More);
        assert_eq!(query.fetch_next_page(2, &sink).await.unwrap(), PageOutcome::Finished);
        assert!(query.is_done());
        let tuples = sink
            .take()
            .into_iter()
            .filter(|r| matches!(r, Response::Tuple { .. }))
            .count();
        assert_eq!(tuples, 4);
    }

    #[tokio::test]
    async fn table_without_local_data_ends_at_once() {
        let storage = TupleStoreRegistry::new();
        let table = TableName::new("osm", "nope");
        let query = SnapshotQuery::start(&storage, &table, &Hyperrectangle::full_space(), 10);
        let sink = RecordingSink::default();
        assert_eq!(query.fetch_next_page(1, &sink).await.unwrap(), PageOutcome::Finished);
        assert_eq!(sink.take(), vec![Response::MultipleTupleStart, Response::MultipleTupleEnd]);
    }
}
