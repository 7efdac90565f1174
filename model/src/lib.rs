pub mod bbox;
pub mod node;
pub mod query;
pub mod region;
pub mod table;
pub mod tuple;

#[cfg(feature = "testing")]
pub mod testing;

pub use bbox::{BoundingBoxError, Hyperrectangle, Interval};
pub use node::NodeAddr;
pub use region::{DistributionRegion, RegionEvent, RegionId, RoutingHop};
pub use table::{DistributionGroup, LocalTableName, TableName, TableNameError};
pub use tuple::{MultiTuple, Tuple, TupleKind};
