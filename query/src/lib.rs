//! Server side of continuous queries: the insert-driven stream processor,
//! its bounded result queue, user-defined filters and the page streamer.

mod config;
mod continuous;
pub mod filter;
mod pager;
mod processor;
mod result_queue;
mod snapshot;

pub use config::QueryConfig;
pub use continuous::ContinuousQuery;
pub use filter::{FilterChain, FilterError, FilterRegistry, UserDefinedFilter};
pub use pager::{fetch_page, ClientQuery, PageLimit, PageOutcome, ResponseSink};
pub use processor::{ProcessorContext, RemoteFetcher, StreamProcessor};
pub use result_queue::{Offer, QueueMessage, ResultQueue};
pub use snapshot::SnapshotQuery;

use model::TableName;
use protocol::{ErrorKind, ProtocolError};
use routing::RoutingError;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Unknown table '{0}'")]
    UnknownTable(TableName),
    #[error("Failed to write results: {0}")]
    Write(#[from] ProtocolError),
    #[error("Remote fetch from '{node}' failed: {reason}")]
    RemoteFetch { node: String, reason: String },
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::UnknownTable(_) => ErrorKind::UnknownTable,
            QueryError::Write(_) | QueryError::RemoteFetch { .. } | QueryError::Routing(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::RemoteFetch { .. } => true,
            QueryError::Routing(e) => e.is_transient(),
            _ => false,
        }
    }
}
