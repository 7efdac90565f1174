use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode frame body: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode frame body: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Unknown package type {0:#06x}")]
    UnknownPackageType(u16),
    #[error("Expected a {expected} package, got {actual}")]
    UnexpectedPackageType { expected: String, actual: String },
    #[error("Frame body of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Compression envelope has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("Compression envelope contains another envelope")]
    NestedEnvelope,
    #[error("Handshake violated: {0}")]
    Handshake(String),
    #[error("Frame writer is closed")]
    WriterClosed,
}

/// Error taxonomy carried by error response frames.
///
/// Travels as its PascalCase name so peers can add kinds without breaking
/// older readers. Unknown names decode as `Internal`.
#[derive(
    Debug, Clone, Copy, Display, EnumString, EnumIter, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", from = "String")]
#[strum(serialize_all = "PascalCase")]
pub enum ErrorKind {
    UnknownTable,
    DuplicateQuery,
    TooManyQueries,
    QueryNotFound,
    OutdatedTuples,
    ShuttingDown,
    UnsupportedRequest,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Internal)
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.to_string()
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(ErrorKind::Internal)
    }
}
