//! A node of the geostream continuous query engine.
//!
//! [`Node`] wires the tuple stores, the space partitioner cache, the query
//! server and the client registry of one process together.

mod config;
mod logging;
mod node;

pub use config::{LoggingConfig, NodeConfig, NodeSection};
pub use logging::init_logging;
pub use node::Node;

pub use channel;
pub use client;
pub use model;
pub use protocol;
pub use query;
pub use routing;
pub use server;
pub use storage;
