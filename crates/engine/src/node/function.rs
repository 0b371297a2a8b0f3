use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use calcnode_core::{
    ComputationTargetSpecification, ComputedValue, ExecutionLog, LogLevel, ValueSpecification,
};

/// Failure raised by a function. Becomes a `FUNCTION_THREW_EXCEPTION` item.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct FunctionError {
    pub class: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl FunctionError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }
}

/// Where a function's log events go while it runs.
pub trait ExecutionLogSink {
    fn log(&mut self, level: LogLevel, message: &str);
}

impl ExecutionLogSink for ExecutionLog {
    fn log(&mut self, level: LogLevel, message: &str) {
        self.record(level, message);
    }
}

/// Input values available to a function, plus the ones that were missing.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    pub values: BTreeMap<ValueSpecification, serde_json::Value>,
    pub missing: BTreeSet<ValueSpecification>,
}

impl FunctionInputs {
    pub fn get(&self, spec: &ValueSpecification) -> Option<&serde_json::Value> {
        self.values.get(spec)
    }

    /// First input value with the given name.
    pub fn get_by_name(&self, value_name: &str) -> Option<&serde_json::Value> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name == value_name)
            .map(|(_, v)| v)
    }
}

/// Everything a function sees about the item it is executing.
pub struct FunctionExecutionContext<'a> {
    pub valuation_time: DateTime<Utc>,
    pub target: &'a ComputationTargetSpecification,
    pub parameters: &'a serde_json::Value,
    pub desired_outputs: &'a BTreeSet<ValueSpecification>,
    log: &'a mut dyn ExecutionLogSink,
    interrupt: &'a CancellationToken,
}

impl<'a> FunctionExecutionContext<'a> {
    pub fn new(
        valuation_time: DateTime<Utc>,
        target: &'a ComputationTargetSpecification,
        parameters: &'a serde_json::Value,
        desired_outputs: &'a BTreeSet<ValueSpecification>,
        log: &'a mut dyn ExecutionLogSink,
        interrupt: &'a CancellationToken,
    ) -> Self {
        Self {
            valuation_time,
            target,
            parameters,
            desired_outputs,
            log,
            interrupt,
        }
    }

    pub fn info(&mut self, message: &str) {
        self.log.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.log.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: &str) {
        self.log.log(LogLevel::Error, message);
    }

    /// Long-running functions should poll this and return early once set.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }
}

pub trait FunctionInvoker: Send + Sync {
    /// Whether the function still runs when some inputs are missing.
    fn can_handle_missing_inputs(&self) -> bool {
        false
    }

    fn execute(
        &self,
        context: &mut FunctionExecutionContext<'_>,
        inputs: &FunctionInputs,
    ) -> Result<Vec<ComputedValue>, FunctionError>;
}

/// Lookup of function implementations by id.
pub trait FunctionRepository: Send + Sync {
    fn get_function_invoker(&self, function_id: &str) -> Option<Arc<dyn FunctionInvoker>>;

    /// Called before the first job of a new function initialization id runs.
    fn init(&self, _function_initialization_id: i64) {}
}

struct FnInvoker<F> {
    f: F,
    handles_missing: bool,
}

impl<F> FunctionInvoker for FnInvoker<F>
where
    F: Fn(&mut FunctionExecutionContext<'_>, &FunctionInputs) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync,
{
    fn can_handle_missing_inputs(&self) -> bool {
        self.handles_missing
    }

    fn execute(
        &self,
        context: &mut FunctionExecutionContext<'_>,
        inputs: &FunctionInputs,
    ) -> Result<Vec<ComputedValue>, FunctionError> {
        (self.f)(context, inputs)
    }
}

/// Wrap a closure as a [`FunctionInvoker`].
pub fn from_fn<F>(f: F) -> Arc<dyn FunctionInvoker>
where
    F: Fn(&mut FunctionExecutionContext<'_>, &FunctionInputs) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnInvoker {
        f,
        handles_missing: false,
    })
}

/// Like [`from_fn`], for a function that tolerates missing inputs.
pub fn from_fn_with_missing_inputs<F>(f: F) -> Arc<dyn FunctionInvoker>
where
    F: Fn(&mut FunctionExecutionContext<'_>, &FunctionInputs) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnInvoker {
        f,
        handles_missing: true,
    })
}

#[derive(Default)]
pub struct InMemoryFunctionRepository {
    functions: RwLock<HashMap<String, Arc<dyn FunctionInvoker>>>,
    last_init: RwLock<Option<i64>>,
}

impl InMemoryFunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, function_id: impl Into<String>, invoker: Arc<dyn FunctionInvoker>) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(function_id.into(), invoker);
    }

    pub fn with_function(self, function_id: impl Into<String>, invoker: Arc<dyn FunctionInvoker>) -> Self {
        self.register(function_id, invoker);
        self
    }

    /// Most recent id passed to [`FunctionRepository::init`].
    pub fn last_init(&self) -> Option<i64> {
        *self.last_init.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FunctionRepository for InMemoryFunctionRepository {
    fn get_function_invoker(&self, function_id: &str) -> Option<Arc<dyn FunctionInvoker>> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function_id)
            .cloned()
    }

    fn init(&self, function_initialization_id: i64) {
        *self.last_init.write().unwrap_or_else(PoisonError::into_inner) = Some(function_initialization_id);
    }
}
