pub mod filter;
pub mod transformation;

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::bbox::Hyperrectangle;
use crate::table::TableName;
pub use filter::FilterDefinition;
pub use transformation::Transformation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether a range query reports tuples inside or outside its compare rectangle.
#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "PascalCase")]
pub enum Polarity {
    #[default]
    ReportPositive,
    ReportNegative,
}

impl Polarity {
    pub fn reports(&self, intersects: bool) -> bool {
        match self {
            Polarity::ReportPositive => intersects,
            Polarity::ReportNegative => !intersects,
        }
    }
}

/// Where a spatial join looks up the stored side.
#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "PascalCase")]
pub enum FetchMode {
    #[default]
    LocalOnly,
    FetchRemote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryKind {
    Range {
        /// Defaults to the query range when unset.
        compare_rectangle: Option<Hyperrectangle>,
        polarity: Polarity,
    },
    SpatialJoin {
        join_table: TableName,
        table_transformations: Vec<Transformation>,
        join_filters: Vec<FilterDefinition>,
        fetch_mode: FetchMode,
    },
}

/// Immutable description of a continuous query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub id: QueryId,
    pub stream_table: TableName,
    pub query_range: Hyperrectangle,
    pub stream_transformations: Vec<Transformation>,
    pub stream_filters: Vec<FilterDefinition>,
    pub receive_watermarks: bool,
    pub receive_invalidations: bool,
    pub kind: QueryKind,
}

impl QueryPlan {
    pub fn compare_rectangle(&self) -> &Hyperrectangle {
        match &self.kind {
            QueryKind::Range {
                compare_rectangle: Some(rect),
                ..
            } => rect,
            _ => &self.query_range,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, QueryKind::SpatialJoin { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("'{0}' is only valid for spatial join plans")]
    JoinOnly(&'static str),
    #[error("'{0}' is only valid for range plans")]
    RangeOnly(&'static str),
    #[error("Join table '{0}' must belong to the distribution group of the stream table")]
    ForeignJoinTable(TableName),
}

#[derive(Debug, Clone)]
pub struct QueryPlanBuilder {
    plan: QueryPlan,
    misuse: Option<PlanError>,
}

impl QueryPlanBuilder {
    pub fn range(stream_table: TableName, query_range: Hyperrectangle) -> Self {
        Self::with_kind(
            stream_table,
            query_range,
            QueryKind::Range {
                compare_rectangle: None,
                polarity: Polarity::ReportPositive,
            },
        )
    }

    pub fn spatial_join(
        stream_table: TableName,
        join_table: TableName,
        query_range: Hyperrectangle,
    ) -> Self {
        Self::with_kind(
            stream_table,
            query_range,
            QueryKind::SpatialJoin {
                join_table,
                table_transformations: vec![],
                join_filters: vec![],
                fetch_mode: FetchMode::LocalOnly,
            },
        )
    }

    fn with_kind(stream_table: TableName, query_range: Hyperrectangle, kind: QueryKind) -> Self {
        Self {
            plan: QueryPlan {
                id: QueryId::random(),
                stream_table,
                query_range,
                stream_transformations: vec![],
                stream_filters: vec![],
                receive_watermarks: false,
                receive_invalidations: false,
                kind,
            },
            misuse: None,
        }
    }

    pub fn id(mut self, id: QueryId) -> Self {
        self.plan.id = id;
        self
    }

    pub fn stream_transformation(mut self, transformation: Transformation) -> Self {
        self.plan.stream_transformations.push(transformation);
        self
    }

    pub fn stream_filter(mut self, filter: FilterDefinition) -> Self {
        self.plan.stream_filters.push(filter);
        self
    }

    pub fn receive_watermarks(mut self, enabled: bool) -> Self {
        self.plan.receive_watermarks = enabled;
        self
    }

    pub fn receive_invalidations(mut self, enabled: bool) -> Self {
        self.plan.receive_invalidations = enabled;
        self
    }

    pub fn compare_with(mut self, rectangle: Hyperrectangle, new_polarity: Polarity) -> Self {
        match &mut self.plan.kind {
            QueryKind::Range {
                compare_rectangle,
                polarity,
            } => {
                *compare_rectangle = Some(rectangle);
                *polarity = new_polarity;
            }
            QueryKind::SpatialJoin { .. } => {
                self.misuse = Some(PlanError::RangeOnly("compare_with"))
            }
        }
        self
    }

    pub fn polarity(mut self, new_polarity: Polarity) -> Self {
        match &mut self.plan.kind {
            QueryKind::Range { polarity, .. } => *polarity = new_polarity,
            QueryKind::SpatialJoin { .. } => self.misuse = Some(PlanError::RangeOnly("polarity")),
        }
        self
    }

    pub fn table_transformation(mut self, transformation: Transformation) -> Self {
        match &mut self.plan.kind {
            QueryKind::SpatialJoin {
                table_transformations,
                ..
            } => table_transformations.push(transformation),
            QueryKind::Range { .. } => {
                self.misuse = Some(PlanError::JoinOnly("table_transformation"))
            }
        }
        self
    }

    pub fn join_filter(mut self, filter: FilterDefinition) -> Self {
        match &mut self.plan.kind {
            QueryKind::SpatialJoin { join_filters, .. } => join_filters.push(filter),
            QueryKind::Range { .. } => self.misuse = Some(PlanError::JoinOnly("join_filter")),
        }
        self
    }

    pub fn fetch_mode(mut self, mode: FetchMode) -> Self {
        match &mut self.plan.kind {
            QueryKind::SpatialJoin { fetch_mode, .. } => *fetch_mode = mode,
            QueryKind::Range { .. } => self.misuse = Some(PlanError::JoinOnly("fetch_mode")),
        }
        self
    }

    pub fn build(self) -> Result<QueryPlan, PlanError> {
        if let Some(err) = self.misuse {
            return Err(err);
        }
        if let QueryKind::SpatialJoin { join_table, .. } = &self.plan.kind {
            if join_table.group != self.plan.stream_table.group {
                return Err(PlanError::ForeignJoinTable(join_table.clone()));
            }
        }
        Ok(self.plan)
    }
}
