use serde::{Deserialize, Serialize};

/// A named user-defined predicate and its opaque parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub name: String,
    pub parameter: Vec<u8>,
}

impl FilterDefinition {
    pub fn new(name: impl Into<String>, parameter: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            parameter: parameter.into(),
        }
    }
}
