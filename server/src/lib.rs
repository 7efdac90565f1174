//! Node side of the protocol: accepts connections, answers requests and
//! streams continuous query pages from a bounded worker pool.

mod config;
mod context;
mod fetcher;
mod handler;
mod listener;
mod pool;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use fetcher::RoutedFetcher;
pub use handler::serve_connection;
pub use listener::Server;

use model::TableName;
use protocol::{ErrorKind, ProtocolError, Response};
use query::QueryError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Unknown table '{0}'")]
    UnknownTable(TableName),
    #[error("A query is already registered under {0}")]
    DuplicateQuery(String),
    #[error("Connection already runs {0} queries")]
    TooManyQueries(usize),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::UnknownTable(_) => ErrorKind::UnknownTable,
            ServerError::DuplicateQuery(_) => ErrorKind::DuplicateQuery,
            ServerError::TooManyQueries(_) => ErrorKind::TooManyQueries,
            ServerError::Query(e) => e.kind(),
            ServerError::Io(_) | ServerError::Protocol(_) | ServerError::Handshake(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Query(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Error frame answering the request that caused this error.
    pub fn to_response(&self) -> Response {
        Response::error(self.kind(), self.to_string())
    }
}
