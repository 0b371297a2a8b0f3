use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::value::ValueSpecification;

/// Decides whether a value lives in the shared cache of a cycle or in the
/// private cache of the node executing a job.
///
/// The explicit variants list whichever side is smaller; a value not named by
/// the explicit list belongs to the other side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheSelectHint {
    #[default]
    AllShared,
    AllPrivate,
    PrivateValues(BTreeSet<ValueSpecification>),
    SharedValues(BTreeSet<ValueSpecification>),
}

impl CacheSelectHint {
    pub fn private_values(values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        let values: BTreeSet<_> = values.into_iter().collect();
        if values.is_empty() {
            CacheSelectHint::AllShared
        } else {
            CacheSelectHint::PrivateValues(values)
        }
    }

    pub fn shared_values(values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        let values: BTreeSet<_> = values.into_iter().collect();
        if values.is_empty() {
            CacheSelectHint::AllPrivate
        } else {
            CacheSelectHint::SharedValues(values)
        }
    }

    pub fn is_private_value(&self, spec: &ValueSpecification) -> bool {
        match self {
            CacheSelectHint::AllShared => false,
            CacheSelectHint::AllPrivate => true,
            CacheSelectHint::PrivateValues(values) => values.contains(spec),
            CacheSelectHint::SharedValues(values) => !values.contains(spec),
        }
    }

    /// Build the most compact hint for a job touching `all` values of which `private` are private.
    pub fn from_partition(
        private: BTreeSet<ValueSpecification>,
        all: &BTreeSet<ValueSpecification>,
    ) -> Self {
        if private.is_empty() {
            return CacheSelectHint::AllShared;
        }
        let shared: BTreeSet<ValueSpecification> = all.difference(&private).cloned().collect();
        if shared.is_empty() {
            CacheSelectHint::AllPrivate
        } else if private.len() <= shared.len() {
            CacheSelectHint::PrivateValues(private)
        } else {
            CacheSelectHint::SharedValues(shared)
        }
    }

    /// The explicit values named by this hint, if any.
    pub fn values(&self) -> Option<&BTreeSet<ValueSpecification>> {
        match self {
            CacheSelectHint::PrivateValues(v) | CacheSelectHint::SharedValues(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for CacheSelectHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSelectHint::AllShared => write!(f, "AllShared"),
            CacheSelectHint::AllPrivate => write!(f, "AllPrivate"),
            CacheSelectHint::PrivateValues(v) => write!(f, "Private({})", v.len()),
            CacheSelectHint::SharedValues(v) => write!(f, "Shared({})", v.len()),
        }
    }
}
