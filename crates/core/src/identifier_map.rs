use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::CoreError;
use crate::value::ValueSpecification;

/// Bidirectional mapping between value specifications and compact identifiers.
pub trait IdentifierMap: Send + Sync {
    /// Identifier for `spec`, allocating one if the specification is new.
    fn get_identifier(&self, spec: &ValueSpecification) -> i64;

    fn get_value_specification(&self, identifier: i64) -> Option<ValueSpecification>;

    fn get_identifiers(&self, specs: &[ValueSpecification]) -> Vec<i64> {
        specs.iter().map(|s| self.get_identifier(s)).collect()
    }

    fn resolve(&self, identifier: i64) -> Result<ValueSpecification, CoreError> {
        self.get_value_specification(identifier)
            .ok_or(CoreError::UnknownIdentifier(identifier))
    }
}

#[derive(Default)]
struct Maps {
    by_spec: HashMap<ValueSpecification, i64>,
    by_id: HashMap<i64, ValueSpecification>,
}

#[derive(Default)]
pub struct InMemoryIdentifierMap {
    maps: RwLock<Maps>,
}

impl InMemoryIdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentifierMap for InMemoryIdentifierMap {
    fn get_identifier(&self, spec: &ValueSpecification) -> i64 {
        if let Some(id) = self
            .maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_spec
            .get(spec)
        {
            return *id;
        }
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = maps.by_spec.get(spec) {
            return *id;
        }
        let id = maps.by_id.len() as i64 + 1;
        maps.by_spec.insert(spec.clone(), id);
        maps.by_id.insert(id, spec.clone());
        id
    }

    fn get_value_specification(&self, identifier: i64) -> Option<ValueSpecification> {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&identifier)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ComputationTargetSpecification;

    #[test]
    fn identifiers_are_stable() {
        let map = InMemoryIdentifierMap::new();
        let a = ValueSpecification::new("A", ComputationTargetSpecification::null());
        let b = ValueSpecification::new("B", ComputationTargetSpecification::null());
        let id_a = map.get_identifier(&a);
        let id_b = map.get_identifier(&b);
        assert_ne!(id_a, id_b);
        assert_eq!(map.get_identifier(&a), id_a);
        assert_eq!(map.resolve(id_b).unwrap(), b);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn unknown_identifier_is_error() {
        let map = InMemoryIdentifierMap::new();
        assert!(matches!(map.resolve(42), Err(CoreError::UnknownIdentifier(42))));
    }
}
