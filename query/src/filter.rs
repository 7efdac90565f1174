//! User-defined predicates referenced by name from query plans.
//!
//! Filters are looked up in a [`FilterRegistry`] when a query starts. A
//! missing filter, an evaluation error and a panicking filter all count as a
//! non-match for that filter and never escape into the insert path.

use model::query::FilterDefinition;
use model::Tuple;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::warn;

pub const GEOJSON_PROPERTY: &str = "geojson-property";
pub const KEY_PREFIX: &str = "key-prefix";

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid filter parameter: {0}")]
    InvalidParameter(String),
    #[error("Tuple payload cannot be filtered: {0}")]
    MalformedPayload(String),
}

pub trait UserDefinedFilter: Send + Sync {
    fn filter_tuple(&self, tuple: &Tuple, parameter: &[u8]) -> Result<bool, FilterError>;

    /// Evaluated after a spatial join matched `stream` with `stored`. By
    /// default only the stored candidate is tested.
    fn filter_join_candidate(
        &self,
        _stream: &Tuple,
        stored: &Tuple,
        parameter: &[u8],
    ) -> Result<bool, FilterError> {
        self.filter_tuple(stored, parameter)
    }
}

pub type FilterFactory = Arc<dyn Fn() -> Arc<dyn UserDefinedFilter> + Send + Sync>;

pub struct FilterRegistry {
    factories: RwLock<HashMap<String, FilterFactory>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.register(
            GEOJSON_PROPERTY,
            Arc::new(|| Arc::new(GeoJsonPropertyFilter) as Arc<dyn UserDefinedFilter>),
        );
        registry.register(
            KEY_PREFIX,
            Arc::new(|| Arc::new(KeyPrefixFilter) as Arc<dyn UserDefinedFilter>),
        );
        registry
    }
}

impl FilterRegistry {
    /// Registry with the built-in filters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registers or replaces the factory for `name`.
    pub fn register(&self, name: impl Into<String>, factory: FilterFactory) {
        self.factories
            .write()
            .expect("No one should panic while holding this lock")
            .insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .expect("No one should panic while holding this lock")
            .contains_key(name)
    }

    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn UserDefinedFilter>> {
        let factory = self
            .factories
            .read()
            .expect("No one should panic while holding this lock")
            .get(name)
            .cloned()?;
        catch_unwind(AssertUnwindSafe(|| factory())).ok()
    }

    pub fn compile(&self, definitions: &[FilterDefinition]) -> FilterChain {
        let filters = definitions
            .iter()
            .map(|definition| {
                let filter = self.instantiate(&definition.name);
                if filter.is_none() {
                    warn!(filter = %definition.name, "Unknown filter, it will never match");
                }
                CompiledFilter {
                    name: definition.name.clone(),
                    parameter: definition.parameter.clone(),
                    filter,
                }
            })
            .collect();
        FilterChain { filters }
    }
}

struct CompiledFilter {
    name: String,
    parameter: Vec<u8>,
    filter: Option<Arc<dyn UserDefinedFilter>>,
}

impl CompiledFilter {
    fn evaluate<F>(&self, evaluate: F) -> bool
    where
        F: FnOnce(&dyn UserDefinedFilter, &[u8]) -> Result<bool, FilterError>,
    {
        let Some(filter) = &self.filter else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| evaluate(filter.as_ref(), &self.parameter))) {
            Ok(Ok(matches)) => matches,
            Ok(Err(e)) => {
                warn!(filter = %self.name, "Filter evaluation failed: {e}");
                false
            }
            Err(_) => {
                warn!(filter = %self.name, "Filter panicked");
                false
            }
        }
    }
}

/// Filters of one plan, all of which must pass.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<CompiledFilter>,
}

impl FilterChain {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches_tuple(&self, tuple: &Tuple) -> bool {
        self.filters
            .iter()
            .all(|f| f.evaluate(|filter, parameter| filter.filter_tuple(tuple, parameter)))
    }

    pub fn matches_join(&self, stream: &Tuple, stored: &Tuple) -> bool {
        self.filters.iter().all(|f| {
            f.evaluate(|filter, parameter| filter.filter_join_candidate(stream, stored, parameter))
        })
    }
}

/// Matches `key:value` against the `properties` object of a GeoJSON payload.
pub struct GeoJsonPropertyFilter;

impl GeoJsonPropertyFilter {
    fn parse_parameter(parameter: &[u8]) -> Result<(&str, &str), FilterError> {
        let parameter = std::str::from_utf8(parameter)
            .map_err(|e| FilterError::InvalidParameter(e.to_string()))?;
        parameter.split_once(':').ok_or_else(|| {
            FilterError::InvalidParameter(format!("expected 'key:value', got '{parameter}'"))
        })
    }
}

impl UserDefinedFilter for GeoJsonPropertyFilter {
    fn filter_tuple(&self, tuple: &Tuple, parameter: &[u8]) -> Result<bool, FilterError> {
        let (key, expected) = Self::parse_parameter(parameter)?;
        let document: Value = serde_json::from_slice(&tuple.data)
            .map_err(|e| FilterError::MalformedPayload(e.to_string()))?;
        let matches = match document.get("properties").and_then(|p| p.get(key)) {
            Some(Value::String(value)) => value == expected,
            Some(value) => value.to_string() == expected,
            None => false,
        };
        Ok(matches)
    }

    fn filter_join_candidate(
        &self,
        stream: &Tuple,
        stored: &Tuple,
        parameter: &[u8],
    ) -> Result<bool, FilterError> {
        // A malformed side does not hide a match on the other one
        let stream_matches = self.filter_tuple(stream, parameter).unwrap_or(false);
        Ok(stream_matches || self.filter_tuple(stored, parameter)?)
    }
}

pub struct KeyPrefixFilter;

impl UserDefinedFilter for KeyPrefixFilter {
    fn filter_tuple(&self, tuple: &Tuple, parameter: &[u8]) -> Result<bool, FilterError> {
        let prefix = std::str::from_utf8(parameter)
            .map_err(|e| FilterError::InvalidParameter(e.to_string()))?;
        Ok(tuple.key.starts_with(prefix))
    }
}
