use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::job::{CalculationJobSpecification, ExecutionLogMode};
use crate::value::ValueSpecification;

/// Outcome of one job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationResult {
    Success,
    MissingInputs,
    FunctionThrewException,
    Suppressed,
}

impl std::fmt::Display for InvocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationResult::Success => write!(f, "SUCCESS"),
            InvocationResult::MissingInputs => write!(f, "MISSING_INPUTS"),
            InvocationResult::FunctionThrewException => write!(f, "FUNCTION_THREW_EXCEPTION"),
            InvocationResult::Suppressed => write!(f, "SUPPRESSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub class: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

/// Log captured while an item executed.
///
/// In `Indicators` mode only the warning and error counts are retained and
/// exception stack traces are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub mode: ExecutionLogMode,
    #[serde(default)]
    pub events: Vec<LogEvent>,
    pub warning_count: u32,
    pub error_count: u32,
    pub exception: Option<ExceptionInfo>,
}

impl ExecutionLog {
    pub fn new(mode: ExecutionLogMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn record(&mut self, level: LogLevel, message: impl Into<String>) {
        match level {
            LogLevel::Warn => self.warning_count += 1,
            LogLevel::Error => self.error_count += 1,
            LogLevel::Info => {}
        }
        if self.mode == ExecutionLogMode::Full {
            self.events.push(LogEvent {
                level,
                message: message.into(),
            });
        }
    }

    pub fn set_exception(
        &mut self,
        class: impl Into<String>,
        message: impl Into<String>,
        stack_trace: Option<String>,
    ) {
        let stack_trace = match self.mode {
            ExecutionLogMode::Full => stack_trace,
            ExecutionLogMode::Indicators => None,
        };
        self.exception = Some(ExceptionInfo {
            class: class.into(),
            message: message.into(),
            stack_trace,
        });
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResultItem {
    pub result: InvocationResult,
    #[serde(default)]
    pub missing_inputs: BTreeSet<ValueSpecification>,
    pub execution_log: ExecutionLog,
}

impl CalculationJobResultItem {
    pub fn success() -> Self {
        Self::with_result(InvocationResult::Success)
    }

    pub fn missing_inputs(missing: BTreeSet<ValueSpecification>) -> Self {
        Self {
            missing_inputs: missing,
            ..Self::with_result(InvocationResult::MissingInputs)
        }
    }

    pub fn function_threw(class: impl Into<String>, message: impl Into<String>) -> Self {
        let mut item = Self::with_result(InvocationResult::FunctionThrewException);
        item.execution_log.set_exception(class, message, None);
        item
    }

    pub fn suppressed() -> Self {
        Self::with_result(InvocationResult::Suppressed)
    }

    /// Placeholder for an item whose job could not be executed anywhere.
    pub fn job_failure(message: impl Into<String>) -> Self {
        Self::function_threw("JobExecutionFailure", message)
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.execution_log = log;
        self
    }

    fn with_result(result: InvocationResult) -> Self {
        Self {
            result,
            missing_inputs: BTreeSet::new(),
            execution_log: ExecutionLog::default(),
        }
    }
}

/// Result of executing one job. `items` is parallel to the job's items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResult {
    pub specification: CalculationJobSpecification,
    pub duration_nanos: u64,
    pub items: Vec<CalculationJobResultItem>,
    pub compute_node_id: String,
}

impl CalculationJobResult {
    pub fn new(
        specification: CalculationJobSpecification,
        duration_nanos: u64,
        items: Vec<CalculationJobResultItem>,
        compute_node_id: impl Into<String>,
    ) -> Self {
        Self {
            specification,
            duration_nanos,
            items,
            compute_node_id: compute_node_id.into(),
        }
    }

    pub fn successful_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.result == InvocationResult::Success)
            .count()
    }
}

/// Join node ids, dropping duplicates while keeping first-seen order.
pub fn join_node_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for id in ids {
        for part in id.split(',') {
            if !part.is_empty() && !seen.contains(&part) {
                seen.push(part);
            }
        }
    }
    seen.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicators_mode_keeps_counts_only() {
        let mut log = ExecutionLog::new(ExecutionLogMode::Indicators);
        log.record(LogLevel::Warn, "w");
        log.record(LogLevel::Error, "e");
        log.record(LogLevel::Info, "i");
        log.set_exception("X", "boom", Some("at f()".into()));
        assert!(log.events.is_empty());
        assert_eq!((log.warning_count, log.error_count), (1, 1));
        assert_eq!(log.exception.unwrap().stack_trace, None);
    }

    #[test]
    fn full_mode_keeps_events() {
        let mut log = ExecutionLog::new(ExecutionLogMode::Full);
        log.record(LogLevel::Info, "started");
        log.set_exception("X", "boom", Some("at f()".into()));
        assert_eq!(log.events.len(), 1);
        assert_eq!(log.exception.unwrap().stack_trace.as_deref(), Some("at f()"));
    }

    #[test]
    fn job_failure_item_is_exception() {
        let item = CalculationJobResultItem::job_failure("no node");
        assert_eq!(item.result, InvocationResult::FunctionThrewException);
        assert_eq!(item.execution_log.exception.unwrap().message, "no node");
    }

    #[test]
    fn node_ids_joined_without_duplicates() {
        assert_eq!(join_node_ids(["a", "b,a", "c"]), "a,b,c");
        assert_eq!(join_node_ids(["a"]), "a");
    }
}
