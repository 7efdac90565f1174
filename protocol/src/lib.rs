pub mod compression;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod writer;

pub use error::{ErrorKind, ProtocolError};
pub use frame::{Frame, FrameCodec};
pub use header::{PackageType, RoutingHeader};
pub use message::{Capabilities, Gossip, Hello, Request, Response};
pub use writer::{FrameWriter, WriterConfig, WriterHandle};

/// Version announced in the hello handshake.
pub const PROTOCOL_VERSION: u16 = 1;
