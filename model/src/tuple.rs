use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::bbox::Hyperrectangle;
use crate::table::TableName;

#[derive(Debug, Clone, Copy, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "PascalCase")]
pub enum TupleKind {
    #[default]
    Regular,
    /// Marks `key` as deleted as of `version`.
    Deleted,
    /// Progress marker of a stream. Carries no data.
    Watermark,
    /// Tells a continuous query client that a previously reported key no
    /// longer matches.
    Invalidation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub key: String,
    pub bbox: Hyperrectangle,
    pub data: Bytes,
    pub version: u64,
    pub kind: TupleKind,
}

impl Tuple {
    pub fn new(
        key: impl Into<String>,
        bbox: Hyperrectangle,
        data: impl Into<Bytes>,
        version: u64,
    ) -> Self {
        Self {
            key: key.into(),
            bbox,
            data: data.into(),
            version,
            kind: TupleKind::Regular,
        }
    }

    pub fn deleted(key: impl Into<String>, version: u64) -> Self {
        Self::marker(key, version, TupleKind::Deleted)
    }

    pub fn watermark(key: impl Into<String>, version: u64) -> Self {
        Self::marker(key, version, TupleKind::Watermark)
    }

    pub fn invalidation(key: impl Into<String>, version: u64) -> Self {
        Self::marker(key, version, TupleKind::Invalidation)
    }

    fn marker(key: impl Into<String>, version: u64, kind: TupleKind) -> Self {
        Self {
            key: key.into(),
            bbox: Hyperrectangle::full_space(),
            data: Bytes::new(),
            version,
            kind,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == TupleKind::Deleted
    }

    pub fn with_bbox(&self, bbox: Hyperrectangle) -> Tuple {
        Tuple {
            bbox,
            ..self.clone()
        }
    }
}

/// A query result: one tuple for range queries, the stream tuple followed by
/// the stored tuple for spatial joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTuple {
    pub tuples: Vec<Tuple>,
    pub tables: Vec<TableName>,
}

impl MultiTuple {
    pub fn single(table: TableName, tuple: Tuple) -> Self {
        Self {
            tuples: vec![tuple],
            tables: vec![table],
        }
    }

    pub fn joined(stream: (TableName, Tuple), stored: (TableName, Tuple)) -> Self {
        Self {
            tuples: vec![stream.1, stored.1],
            tables: vec![stream.0, stored.0],
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn first(&self) -> Option<&Tuple> {
        self.tuples.first()
    }
}
