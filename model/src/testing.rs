//! Proptest strategies for model types.
//!
//! This module is only available when the `testing` feature is enabled.

use crate::bbox::{Hyperrectangle, Interval};
use crate::query::{Polarity, QueryPlan, QueryPlanBuilder};
use crate::table::TableName;
use crate::tuple::Tuple;
use proptest::prelude::*;

pub fn arb_hyperrectangle(dimensions: usize) -> impl Strategy<Value = Hyperrectangle> {
    prop::collection::vec((-1000.0..1000.0f64, 0.0..100.0f64), dimensions).prop_map(|pairs| {
        Hyperrectangle::new(
            pairs
                .into_iter()
                .map(|(begin, extent)| Interval {
                    begin,
                    end: begin + extent,
                })
                .collect(),
        )
    })
}

prop_compose! {
    pub fn arb_tuple(dimensions: usize)(
        key in "[a-z0-9]{1,12}",
        bbox in arb_hyperrectangle(dimensions),
        data in prop::collection::vec(any::<u8>(), 0..64),
        version in 1..u64::MAX / 2,
    ) -> Tuple {
        Tuple::new(key, bbox, data, version)
    }
}

prop_compose! {
    pub fn arb_range_plan(table: TableName)(
        range in arb_hyperrectangle(2),
        negative in any::<bool>(),
    ) -> QueryPlan {
        let polarity = if negative { Polarity::ReportNegative } else { Polarity::ReportPositive };
        QueryPlanBuilder::range(table.clone(), range)
            .polarity(polarity)
            .build()
            .expect("A plain range plan is always valid")
    }
}
