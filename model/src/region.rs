use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bbox::Hyperrectangle;
use crate::node::NodeAddr;
use crate::table::DistributionGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition of a distribution group's space and the nodes replicating it.
/// The first entry of `systems` is the first replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionRegion {
    pub group: DistributionGroup,
    pub id: RegionId,
    pub covering_box: Hyperrectangle,
    pub systems: Vec<NodeAddr>,
}

impl DistributionRegion {
    pub fn first_replica(&self) -> Option<&NodeAddr> {
        self.systems.first()
    }
}

/// Change notifications published by a space partitioner.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionEvent {
    Added(DistributionRegion),
    Changed(DistributionRegion),
    Removed(DistributionRegion),
}

impl RegionEvent {
    pub fn region(&self) -> &DistributionRegion {
        match self {
            RegionEvent::Added(r) | RegionEvent::Changed(r) | RegionEvent::Removed(r) => r,
        }
    }
}

/// One node a routed request has to visit, with the regions it addresses there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHop {
    pub node: NodeAddr,
    pub regions: Vec<RegionId>,
}
