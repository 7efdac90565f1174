use model::query::QueryId;
use model::MultiTuple;
use std::time::Duration;
use tokio::sync::mpsc;

/// Results of one continuous query, merged over all its subscriptions.
///
/// Yields `None` once the query was cancelled and every buffered result
/// was read.
#[derive(Debug)]
pub struct ResultHandle {
    id: QueryId,
    receiver: mpsc::Receiver<MultiTuple>,
}

impl ResultHandle {
    pub(crate) fn new(id: QueryId, receiver: mpsc::Receiver<MultiTuple>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub async fn next(&mut self) -> Option<MultiTuple> {
        self.receiver.recv().await
    }

    /// `None` if nothing arrived within `timeout`.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<MultiTuple> {
        tokio::time::timeout(timeout, self.receiver.recv()).await.ok().flatten()
    }

    /// Everything already buffered, without waiting.
    pub fn drain(&mut self) -> Vec<MultiTuple> {
        let mut results = Vec::new();
        while let Ok(result) = self.receiver.try_recv() {
            results.push(result);
        }
        results
    }
}
