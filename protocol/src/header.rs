use model::RoutingHop;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "PascalCase")]
#[repr(u16)]
pub enum PackageType {
    // Requests
    Hello = 0x0001,
    Disconnect = 0x0002,
    InsertTuple = 0x0003,
    ContinuousQuery = 0x0004,
    RangeQuery = 0x0005,
    NextPage = 0x0006,
    CancelQuery = 0x0007,
    KeepAlive = 0x0008,
    // Both directions
    Compression = 0x0100,
    // Responses
    HelloResponse = 0x8001,
    Success = 0x8002,
    Error = 0x8003,
    Tuple = 0x8004,
    JoinedTuple = 0x8005,
    MultipleTupleStart = 0x8006,
    MultipleTupleEnd = 0x8007,
    PageEnd = 0x8008,
}

impl PackageType {
    pub fn is_response(&self) -> bool {
        (*self as u16) & 0x8000 != 0
    }
}

impl TryFrom<u16> for PackageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        use PackageType::*;
        let package_type = match value {
            0x0001 => Hello,
            0x0002 => Disconnect,
            0x0003 => InsertTuple,
            0x0004 => ContinuousQuery,
            0x0005 => RangeQuery,
            0x0006 => NextPage,
            0x0007 => CancelQuery,
            0x0008 => KeepAlive,
            0x0100 => Compression,
            0x8001 => HelloResponse,
            0x8002 => Success,
            0x8003 => Error,
            0x8004 => Tuple,
            0x8005 => JoinedTuple,
            0x8006 => MultipleTupleStart,
            0x8007 => MultipleTupleEnd,
            0x8008 => PageEnd,
            other => return Err(ProtocolError::UnknownPackageType(other)),
        };
        Ok(package_type)
    }
}

/// Routing information of a request.
///
/// A direct request is handled by the receiving node. A routed request
/// addresses the regions of `hops[hop]` on the receiving node; a routed
/// header without any hop means there is nothing to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub routed: bool,
    pub hop: u16,
    pub hops: Vec<RoutingHop>,
}

impl RoutingHeader {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn routed(hops: Vec<RoutingHop>) -> Self {
        Self {
            routed: true,
            hop: 0,
            hops,
        }
    }

    pub fn current_hop(&self) -> Option<&RoutingHop> {
        if !self.routed {
            return None;
        }
        self.hops.get(self.hop as usize)
    }

    pub fn is_noop(&self) -> bool {
        self.routed && self.hops.len() <= self.hop as usize
    }
}
