//! Tuple stores as seen by the query engine: region-local tables that accept
//! inserts, answer key and range lookups and notify registered callbacks.

mod manager;
mod registry;

pub use manager::{CallbackId, InsertCallback, TupleStoreManager};
pub use registry::TupleStoreRegistry;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StorageError {
    #[error("Unknown local table '{0}'")]
    UnknownTable(model::LocalTableName),
}
