//! Client side of a node connection: sequence-correlated request/response
//! calls with backpressure, batching, keep-alives and failure propagation.

mod calls;
mod config;
mod connection;
mod maintenance;
mod retry;
mod sequence;
mod state;

pub use calls::{Page, QueryRegistration, Reply};
pub use config::{ChannelConfig, RetryConfig};
pub use connection::SequencedChannel;
pub use maintenance::GossipSource;
pub use retry::RetryPolicy;
pub use sequence::SequenceNumberGenerator;
pub use state::ConnectionState;

use protocol::{ErrorKind, ProtocolError};

#[derive(Debug, thiserror::Error, Clone)]
pub enum ChannelError {
    #[error("Connection to '{peer}' lost: {reason}")]
    ConnectionLost { peer: String, reason: String },
    #[error("Channel to '{peer}' is {state}")]
    NotRunning { peer: String, state: ConnectionState },
    #[error("Failed to connect to '{peer}': {reason}")]
    Connect { peer: String, reason: String },
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Peer answered with {kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("No free sequence number")]
    SequencesExhausted,
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Remote { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            ChannelError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        ChannelError::Protocol(err.to_string())
    }
}
