use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::{info, warn};

use crate::job::CalculationJobItem;
use crate::value::{ComputationTargetSpecification, ValueSpecification};

pub trait FunctionBlacklistQuery: Send + Sync {
    /// Whether a rule covers the item. Rules may name any subset of the
    /// item's function, parameters, target, inputs and outputs.
    fn is_blacklisted(&self, item: &CalculationJobItem) -> bool;

    /// Whether a rule that names nothing beyond the function covers it.
    fn is_function_blacklisted(&self, function_id: &str, parameters: &serde_json::Value) -> bool;

    /// Whether a rule that names nothing beyond the target covers it.
    fn is_target_blacklisted(&self, target: &ComputationTargetSpecification) -> bool;
}

pub trait FunctionBlacklistMaintainer: Send + Sync {
    /// Record an item whose execution failed.
    fn failed_job_item(&self, item: &CalculationJobItem);

    fn failed_job_items(&self, items: &[CalculationJobItem]) {
        for item in items {
            self.failed_job_item(item);
        }
    }
}

/// A blacklist entry. Each field left as `None` matches anything; a rule
/// with no fields set matches every item.
///
/// Inputs and outputs match as whole sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionBlacklistRule {
    pub function_id: Option<String>,
    pub function_parameters: Option<serde_json::Value>,
    pub target: Option<ComputationTargetSpecification>,
    pub inputs: Option<BTreeSet<ValueSpecification>>,
    pub outputs: Option<BTreeSet<ValueSpecification>>,
}

impl FunctionBlacklistRule {
    /// Matches every item.
    pub fn wildcard() -> Self {
        Self::default()
    }

    pub fn for_function(function_id: impl Into<String>) -> Self {
        Self {
            function_id: Some(function_id.into()),
            ..Self::default()
        }
    }

    pub fn for_target(target: ComputationTargetSpecification) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    /// Matches exactly this item.
    pub fn for_item(item: &CalculationJobItem) -> Self {
        Self {
            function_id: Some(item.function_id.clone()),
            function_parameters: Some(item.function_parameters.clone()),
            target: Some(item.target.clone()),
            inputs: Some(item.inputs.clone()),
            outputs: Some(item.outputs.clone()),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.function_parameters = Some(parameters);
        self
    }

    pub fn with_target(mut self, target: ComputationTargetSpecification) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = ValueSpecification>) -> Self {
        self.inputs = Some(inputs.into_iter().collect());
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = ValueSpecification>) -> Self {
        self.outputs = Some(outputs.into_iter().collect());
        self
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, item: &CalculationJobItem) -> bool {
        self.matches_function(&item.function_id, &item.function_parameters)
            && field_matches(&self.target, &item.target)
            && field_matches(&self.inputs, &item.inputs)
            && field_matches(&self.outputs, &item.outputs)
    }

    fn matches_function(&self, function_id: &str, parameters: &serde_json::Value) -> bool {
        self.function_id.as_deref().map_or(true, |id| id == function_id)
            && field_matches(&self.function_parameters, parameters)
    }

    fn names_only_function(&self) -> bool {
        self.target.is_none() && self.inputs.is_none() && self.outputs.is_none()
    }

    fn names_only_target(&self) -> bool {
        self.function_id.is_none()
            && self.function_parameters.is_none()
            && self.inputs.is_none()
            && self.outputs.is_none()
    }
}

fn field_matches<T: PartialEq>(rule: &Option<T>, value: &T) -> bool {
    rule.as_ref().map_or(true, |r| r == value)
}

/// Blacklist that never records or suppresses anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFunctionBlacklist;

impl FunctionBlacklistQuery for NoopFunctionBlacklist {
    fn is_blacklisted(&self, _item: &CalculationJobItem) -> bool {
        false
    }

    fn is_function_blacklisted(&self, _function_id: &str, _parameters: &serde_json::Value) -> bool {
        false
    }

    fn is_target_blacklisted(&self, _target: &ComputationTargetSpecification) -> bool {
        false
    }
}

impl FunctionBlacklistMaintainer for NoopFunctionBlacklist {
    fn failed_job_item(&self, _item: &CalculationJobItem) {}
}

/// Rules indexed by function identifier. Rules without one are checked for
/// every item.
#[derive(Default)]
struct RuleIndex {
    by_function: HashMap<String, Vec<FunctionBlacklistRule>>,
    any_function: Vec<FunctionBlacklistRule>,
}

impl RuleIndex {
    fn bucket(&self, function_id: &str) -> &[FunctionBlacklistRule] {
        self.by_function.get(function_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn candidates<'a>(&'a self, function_id: &str) -> impl Iterator<Item = &'a FunctionBlacklistRule> {
        self.bucket(function_id).iter().chain(self.any_function.iter())
    }

    fn bucket_mut(&mut self, rule: &FunctionBlacklistRule) -> &mut Vec<FunctionBlacklistRule> {
        match &rule.function_id {
            Some(id) => self.by_function.entry(id.clone()).or_default(),
            None => &mut self.any_function,
        }
    }

    fn insert(&mut self, rule: FunctionBlacklistRule) -> bool {
        let bucket = self.bucket_mut(&rule);
        if bucket.contains(&rule) {
            return false;
        }
        bucket.push(rule);
        true
    }

    fn remove(&mut self, rule: &FunctionBlacklistRule) -> bool {
        let bucket = self.bucket_mut(rule);
        let before = bucket.len();
        bucket.retain(|r| r != rule);
        let removed = bucket.len() != before;
        if let Some(id) = &rule.function_id {
            if self.by_function.get(id).is_some_and(Vec::is_empty) {
                self.by_function.remove(id);
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.by_function.values().map(Vec::len).sum::<usize>() + self.any_function.len()
    }
}

/// Rule-based blacklist held in memory.
///
/// A failed item adds a rule for its function and target pair.
#[derive(Default)]
pub struct InMemoryFunctionBlacklist {
    rules: RwLock<RuleIndex>,
}

impl InMemoryFunctionBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = FunctionBlacklistRule>) -> Self {
        let blacklist = Self::new();
        for rule in rules {
            blacklist.add_rule(rule);
        }
        blacklist
    }

    /// `false` if an identical rule is already present.
    pub fn add_rule(&self, rule: FunctionBlacklistRule) -> bool {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rule)
    }

    pub fn remove_rule(&self, rule: &FunctionBlacklistRule) -> bool {
        let removed = self
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(rule);
        if removed {
            info!(function = ?rule.function_id, target = ?rule.target, "Blacklist rule removed");
        }
        removed
    }

    pub fn rules(&self) -> Vec<FunctionBlacklistRule> {
        let index = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_function
            .values()
            .flatten()
            .chain(index.any_function.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FunctionBlacklistQuery for InMemoryFunctionBlacklist {
    fn is_blacklisted(&self, item: &CalculationJobItem) -> bool {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .candidates(&item.function_id)
            .any(|rule| rule.matches(item))
    }

    fn is_function_blacklisted(&self, function_id: &str, parameters: &serde_json::Value) -> bool {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .candidates(function_id)
            .any(|rule| rule.names_only_function() && rule.matches_function(function_id, parameters))
    }

    fn is_target_blacklisted(&self, target: &ComputationTargetSpecification) -> bool {
        // Target-only rules carry no function identifier.
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .any_function
            .iter()
            .any(|rule| rule.names_only_target() && field_matches(&rule.target, target))
    }
}

impl FunctionBlacklistMaintainer for InMemoryFunctionBlacklist {
    fn failed_job_item(&self, item: &CalculationJobItem) {
        let rule = FunctionBlacklistRule::for_function(item.function_id.clone()).with_target(item.target.clone());
        if self.add_rule(rule) {
            warn!(function = %item.function_id, target = %item.target, "Function blacklisted");
        }
    }
}
