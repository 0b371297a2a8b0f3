use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifies the object a function is applied to (a trade, a curve, a portfolio node).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationTargetSpecification {
    pub target_type: String,
    pub identifier: String,
}

impl ComputationTargetSpecification {
    pub fn new(target_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            identifier: identifier.into(),
        }
    }

    /// The target used by functions that operate on nothing in particular.
    pub fn null() -> Self {
        Self::new("NULL", "")
    }
}

impl std::fmt::Display for ComputationTargetSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}~{}", self.target_type, self.identifier)
    }
}

/// Fully resolved description of a value produced or consumed by a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    pub value_name: String,
    pub target: ComputationTargetSpecification,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ValueSpecification {
    pub fn new(value_name: impl Into<String>, target: ComputationTargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

impl std::fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.properties.is_empty() {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "{{{}}}", props.join(","))?;
        }
        Ok(())
    }
}

/// Marker written to the cache in place of a value that was never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissingOutput {
    /// The producing function could not run because its own inputs were missing.
    MissingInputs,
    /// The producing function failed or did not emit the output.
    EvaluationError,
    /// The producing function is blacklisted.
    Suppressed,
}

/// A cache slot: either a real value or the reason there is none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    Value(serde_json::Value),
    Missing(MissingOutput),
}

impl CacheValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, CacheValue::Missing(_))
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Value(v) => Some(v),
            CacheValue::Missing(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    pub specification: ValueSpecification,
    pub value: CacheValue,
}

impl ComputedValue {
    pub fn new(specification: ValueSpecification, value: serde_json::Value) -> Self {
        Self {
            specification,
            value: CacheValue::Value(value),
        }
    }

    pub fn missing(specification: ValueSpecification, reason: MissingOutput) -> Self {
        Self {
            specification,
            value: CacheValue::Missing(reason),
        }
    }
}
