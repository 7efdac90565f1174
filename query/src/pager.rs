use async_trait::async_trait;
use protocol::{Response, WriterHandle};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::result_queue::{QueueMessage, ResultQueue};
use crate::QueryError;

/// Where the frames of a page go.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn write(&self, sequence: u16, response: Response) -> Result<(), QueryError>;
    async fn flush(&self) -> Result<(), QueryError>;
}

#[async_trait]
impl ResponseSink for WriterHandle {
    async fn write(&self, sequence: u16, response: Response) -> Result<(), QueryError> {
        self.send(response.to_frame(sequence)?).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), QueryError> {
        WriterHandle::flush(self).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLimit {
    /// At most this many results per page. The query ends once the queue is
    /// exhausted.
    Tuples(usize),
    /// A page holding at least one result ends after being open this long.
    /// Only closing the queue ends the query.
    FlushTime(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// A page end was written; more pages may follow.
    More,
    /// The end-of-query marker was written.
    Finished,
}

/// A query served page by page through next-page requests.
#[async_trait]
pub trait ClientQuery: Send + Sync {
    /// Writes the next page, answered under `page_sequence`.
    async fn fetch_next_page(
        &self,
        page_sequence: u16,
        sink: &dyn ResponseSink,
    ) -> Result<PageOutcome, QueryError>;

    fn is_done(&self) -> bool;

    /// Ends the query. A parked page fetch finishes with the end-of-query
    /// marker. Closing twice has no effect.
    fn close(&self);

    /// Lets a parked page fetch re-check its flush deadline.
    fn wake(&self);
}

/// Writes one page of `queue` to `sink`:
/// `MultipleTupleStart`, the results, then `PageEnd` or `MultipleTupleEnd`.
pub async fn fetch_page(
    queue: &ResultQueue,
    limit: PageLimit,
    page_sequence: u16,
    sink: &dyn ResponseSink,
) -> Result<PageOutcome, QueryError> {
    sink.write(page_sequence, Response::MultipleTupleStart).await?;
    let opened = Instant::now();
    let mut tuples_in_page = 0usize;

    loop {
        let limit_reached = match limit {
            PageLimit::Tuples(max) => tuples_in_page >= max.max(1),
            PageLimit::FlushTime(flush) => tuples_in_page > 0 && opened.elapsed() >= flush,
        };
        if limit_reached && !queue.is_exhausted() {
            debug!(page_sequence, tuples_in_page, "Page complete");
            sink.write(page_sequence, Response::PageEnd).await?;
            sink.flush().await?;
            return Ok(PageOutcome::More);
        }

        match queue.take().await {
            QueueMessage::Result(result) => {
                sink.write(page_sequence, Response::result(result)).await?;
                tuples_in_page += 1;
            }
            QueueMessage::WakeUp => trace!(page_sequence, "Woken up"),
            QueueMessage::Closed => {
                debug!(page_sequence, tuples_in_page, "Query finished");
                sink.write(page_sequence, Response::MultipleTupleEnd).await?;
                sink.flush().await?;
                return Ok(PageOutcome::Finished);
            }
        }
    }
}
