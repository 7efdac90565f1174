use serde::{Deserialize, Serialize};

use crate::bbox::Hyperrectangle;
use crate::tuple::Tuple;

/// A per-tuple step of a query pipeline. A step returning `None` drops the tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transformation {
    /// Keep only tuples with exactly this key.
    KeyFilter(String),
    /// Keep only tuples whose bounding box intersects the given box.
    BoundingBoxFilter(Hyperrectangle),
    EnlargeByAmount(f64),
    EnlargeByFactor(f64),
    /// Enlarge a 2-D WGS84 box by distances in meters.
    EnlargeByMeters { lat: f64, lon: f64 },
}

impl Transformation {
    pub fn apply(&self, tuple: Tuple) -> Option<Tuple> {
        match self {
            Transformation::KeyFilter(key) => (tuple.key == *key).then_some(tuple),
            Transformation::BoundingBoxFilter(bbox) => tuple.bbox.intersects(bbox).then_some(tuple),
            Transformation::EnlargeByAmount(amount) => {
                let bbox = tuple.bbox.enlarge_by_amount(*amount);
                Some(tuple.with_bbox(bbox))
            }
            Transformation::EnlargeByFactor(factor) => {
                let bbox = tuple.bbox.enlarge_by_factor(*factor);
                Some(tuple.with_bbox(bbox))
            }
            Transformation::EnlargeByMeters { lat, lon } => {
                // A box that is not 2-D has no meaningful WGS84 projection
                let bbox = tuple.bbox.enlarge_by_meters(*lat, *lon).ok()?;
                Some(tuple.with_bbox(bbox))
            }
        }
    }
}

/// Runs `tuple` through `transformations` in order, stopping at the first drop.
pub fn apply_all(transformations: &[Transformation], tuple: &Tuple) -> Option<Tuple> {
    transformations
        .iter()
        .try_fold(tuple.clone(), |current, step| step.apply(current))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(key: &str, coords: &[f64]) -> Tuple {
        Tuple::new(key, Hyperrectangle::from_coordinates(coords).unwrap(), "", 1)
    }

    #[test]
    fn key_filter_drops_other_keys() {
        let step = Transformation::KeyFilter("a".into());
        assert!(step.apply(tuple("a", &[0.0, 1.0])).is_some());
        assert!(step.apply(tuple("b", &[0.0, 1.0])).is_none());
    }

    #[test]
    fn pipeline_stops_at_first_drop() {
        let steps = vec![
            Transformation::EnlargeByAmount(1.0),
            Transformation::BoundingBoxFilter(
                Hyperrectangle::from_coordinates(&[100.0, 101.0]).unwrap(),
            ),
            Transformation::EnlargeByAmount(1000.0),
        ];
        assert_eq!(apply_all(&steps, &tuple("a", &[0.0, 1.0])), None);
    }

    #[test]
    fn pipeline_applies_steps_in_order() {
        let steps = vec![
            Transformation::EnlargeByFactor(3.0),
            Transformation::BoundingBoxFilter(
                Hyperrectangle::from_coordinates(&[1.5, 2.0]).unwrap(),
            ),
        ];
        let out = apply_all(&steps, &tuple("a", &[0.0, 1.0])).expect("enlarged box reaches 2.0");
        assert_eq!(out.bbox, Hyperrectangle::from_coordinates(&[-1.0, 2.0]).unwrap());
    }

    #[test]
    fn meters_on_wrong_dimension_drops() {
        let step = Transformation::EnlargeByMeters { lat: 10.0, lon: 10.0 };
        assert!(step.apply(tuple("a", &[0.0, 1.0])).is_none());
    }
}
