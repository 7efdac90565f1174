#[cfg(feature = "testing")]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::region::RegionId;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TableNameError {
    #[error("Table name '{0}' must have the form <group>_<table>")]
    MissingSeparator(String),
    #[error("Table name '{0}' contains an empty component")]
    EmptyComponent(String),
}

/// Name of a distribution group. All tables of a group share one space partitioner.
#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributionGroup(
    #[cfg_attr(feature = "testing", proptest(regex = "[a-z][a-z0-9]{1,10}"))] pub String,
);

impl DistributionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for DistributionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A table name of the form `<group>_<table>`.
#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub group: DistributionGroup,
    #[cfg_attr(feature = "testing", proptest(regex = "[a-z][a-z0-9]{1,10}"))]
    pub table: String,
}

impl TableName {
    pub fn new(group: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            group: DistributionGroup::new(group),
            table: table.into(),
        }
    }

    pub fn local(&self, region: RegionId) -> LocalTableName {
        LocalTableName {
            table: self.clone(),
            region,
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.group, self.table)
    }
}

impl FromStr for TableName {
    type Err = TableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, table) = s
            .split_once('_')
            .ok_or_else(|| TableNameError::MissingSeparator(s.to_string()))?;
        if group.is_empty() || table.is_empty() {
            return Err(TableNameError::EmptyComponent(s.to_string()));
        }
        Ok(TableName::new(group, table))
    }
}

/// One region-local shard of a table, owned by the tuple store of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalTableName {
    pub table: TableName,
    pub region: RegionId,
}

impl fmt::Display for LocalTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.table, self.region)
    }
}
