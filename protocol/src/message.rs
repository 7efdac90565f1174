use bytes::Bytes;
use model::query::QueryPlan;
use model::{Hyperrectangle, MultiTuple, RegionId, TableName, Tuple};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ProtocolError};
use crate::frame::Frame;
use crate::header::{PackageType, RoutingHeader};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub gzip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u16,
    pub capabilities: Capabilities,
}

/// Sample of locally stored tuples piggy-backed on a keep-alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gossip {
    pub table: TableName,
    pub tuples: Vec<Tuple>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Hello(Hello),
    Disconnect,
    InsertTuple {
        table: TableName,
        tuple: Tuple,
    },
    /// Registers a continuous query under the sequence of this request.
    /// An empty region list attaches to every local region of the query range.
    ContinuousQuery {
        plan: QueryPlan,
        regions: Vec<RegionId>,
    },
    RangeQuery {
        table: TableName,
        range: Hyperrectangle,
        page_size: u32,
    },
    NextPage {
        query_sequence: u16,
    },
    CancelQuery {
        query_sequence: u16,
    },
    KeepAlive {
        gossip: Option<Gossip>,
    },
}

impl Request {
    pub fn package_type(&self) -> PackageType {
        match self {
            Request::Hello(_) => PackageType::Hello,
            Request::Disconnect => PackageType::Disconnect,
            Request::InsertTuple { .. } => PackageType::InsertTuple,
            Request::ContinuousQuery { .. } => PackageType::ContinuousQuery,
            Request::RangeQuery { .. } => PackageType::RangeQuery,
            Request::NextPage { .. } => PackageType::NextPage,
            Request::CancelQuery { .. } => PackageType::CancelQuery,
            Request::KeepAlive { .. } => PackageType::KeepAlive,
        }
    }

    pub fn to_frame(&self, sequence: u16, routing: RoutingHeader) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(sequence, self.package_type(), routing, encode_body(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let request: Request = decode_body(frame)?;
        expect_type(frame, request.package_type())?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Hello(Hello),
    Success,
    Error { kind: ErrorKind, message: String },
    Tuple { table: TableName, tuple: Tuple },
    JoinedTuple(MultiTuple),
    MultipleTupleStart,
    MultipleTupleEnd,
    PageEnd,
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    /// Wraps a query result in the frame kind matching its arity.
    pub fn result(mut result: MultiTuple) -> Self {
        if result.tuples.len() == 1 && result.tables.len() == 1 {
            if let (Some(table), Some(tuple)) = (result.tables.pop(), result.tuples.pop()) {
                return Response::Tuple { table, tuple };
            }
        }
        Response::JoinedTuple(result)
    }

    pub fn package_type(&self) -> PackageType {
        match self {
            Response::Hello(_) => PackageType::HelloResponse,
            Response::Success => PackageType::Success,
            Response::Error { .. } => PackageType::Error,
            Response::Tuple { .. } => PackageType::Tuple,
            Response::JoinedTuple(_) => PackageType::JoinedTuple,
            Response::MultipleTupleStart => PackageType::MultipleTupleStart,
            Response::MultipleTupleEnd => PackageType::MultipleTupleEnd,
            Response::PageEnd => PackageType::PageEnd,
        }
    }

    pub fn to_frame(&self, sequence: u16) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(
            sequence,
            self.package_type(),
            RoutingHeader::direct(),
            encode_body(self)?,
        ))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let response: Response = decode_body(frame)?;
        expect_type(frame, response.package_type())?;
        Ok(response)
    }
}

fn encode_body<T: Serialize>(body: &T) -> Result<Bytes, ProtocolError> {
    Ok(bincode::serde::encode_to_vec(body, bincode::config::standard())?.into())
}

fn decode_body<T: DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
    // Reject unknown types before looking at the body
    frame.kind()?;
    let (body, _) = bincode::serde::decode_from_slice(&frame.body, bincode::config::standard())?;
    Ok(body)
}

fn expect_type(frame: &Frame, expected: PackageType) -> Result<(), ProtocolError> {
    let actual = frame.kind()?;
    if actual != expected {
        return Err(ProtocolError::UnexpectedPackageType {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::query::QueryPlanBuilder;

    #[test]
    fn continuous_query_request_survives_the_wire() {
        let plan = QueryPlanBuilder::range(
            TableName::new("osm", "cars"),
            Hyperrectangle::from_coordinates(&[0.0, 10.0, 0.0, 10.0]).unwrap(),
        )
        .build()
        .unwrap();
        let request = Request::ContinuousQuery {
            plan,
            regions: vec![RegionId(2)],
        };
        let frame = request.to_frame(17, RoutingHeader::direct()).unwrap();
        assert_eq!(frame.package_type, PackageType::ContinuousQuery as u16);
        assert_eq!(Request::from_frame(&frame).unwrap(), request);
    }

    #[test]
    fn mismatching_header_type_is_a_protocol_error() {
        let mut frame = Response::PageEnd.to_frame(3).unwrap();
        frame.package_type = PackageType::MultipleTupleEnd as u16;
        assert!(matches!(
            Response::from_frame(&frame),
            Err(ProtocolError::UnexpectedPackageType { .. })
        ));
    }

    #[test]
    fn error_kind_travels_by_name() {
        let frame = Response::error(ErrorKind::QueryNotFound, "no query 4").to_frame(9).unwrap();
        let Response::Error { kind, message } = Response::from_frame(&frame).unwrap() else {
            panic!("expected an error response");
        };
        assert_eq!(kind, ErrorKind::QueryNotFound);
        assert_eq!(message, "no query 4");
    }

    #[test]
    fn single_results_become_tuple_frames() {
        let table = TableName::new("osm", "cars");
        let tuple = Tuple::new("k", Hyperrectangle::full_space(), "", 1);
        let single = Response::result(MultiTuple::single(table.clone(), tuple.clone()));
        assert_eq!(single.package_type(), PackageType::Tuple);

        let joined = Response::result(MultiTuple::joined(
            (table.clone(), tuple.clone()),
            (table, tuple),
        ));
        assert_eq!(joined.package_type(), PackageType::JoinedTuple);
    }
}
