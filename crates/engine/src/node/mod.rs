//! Calculation nodes: the thread-bound units that run a job's items against
//! the computation cache.

pub mod function;

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use calcnode_core::{
    CacheValue, CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    ComputedValue, ExecutionLog, FunctionBlacklistMaintainer, FunctionBlacklistQuery,
    InvocationResult, MissingOutput, NoopFunctionBlacklist, ViewComputationCache,
    ViewComputationCacheSource,
};

use crate::watchdog::ExecutionWatchdog;

pub use function::{
    from_fn, from_fn_with_missing_inputs, ExecutionLogSink, FunctionError,
    FunctionExecutionContext, FunctionInputs, FunctionInvoker, FunctionRepository,
    InMemoryFunctionRepository,
};

/// Execution stopped before every item ran.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInterrupted {
    /// Results of the items that finished, in item order.
    pub completed: Vec<CalculationJobResultItem>,
    pub reason: String,
}

pub trait CalculationNode: Send + Sync {
    fn node_id(&self) -> &str;

    /// Run every item of `job` in order. Stops early once `cancel` fires.
    fn execute_job(
        &self,
        job: &CalculationJob,
        cancel: &CancellationToken,
    ) -> Result<CalculationJobResult, NodeInterrupted>;
}

/// Runs items one after another on the calling thread.
pub struct SimpleCalculationNode {
    node_id: String,
    cache_source: Arc<dyn ViewComputationCacheSource>,
    functions: Arc<dyn FunctionRepository>,
    blacklist_query: Arc<dyn FunctionBlacklistQuery>,
    blacklist_maintainer: Arc<dyn FunctionBlacklistMaintainer>,
    watchdog: Option<Arc<ExecutionWatchdog>>,
    initialized: Mutex<Option<i64>>,
}

impl SimpleCalculationNode {
    pub fn new(
        node_id: impl Into<String>,
        cache_source: Arc<dyn ViewComputationCacheSource>,
        functions: Arc<dyn FunctionRepository>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cache_source,
            functions,
            blacklist_query: Arc::new(NoopFunctionBlacklist),
            blacklist_maintainer: Arc::new(NoopFunctionBlacklist),
            watchdog: None,
            initialized: Mutex::new(None),
        }
    }

    pub fn with_blacklist(
        mut self,
        query: Arc<dyn FunctionBlacklistQuery>,
        maintainer: Arc<dyn FunctionBlacklistMaintainer>,
    ) -> Self {
        self.blacklist_query = query;
        self.blacklist_maintainer = maintainer;
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<ExecutionWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    fn ensure_initialized(&self, function_initialization_id: i64) {
        let mut initialized = self.initialized.lock().unwrap_or_else(PoisonError::into_inner);
        if *initialized != Some(function_initialization_id) {
            debug!(node = %self.node_id, function_initialization_id, "initializing functions");
            self.functions.init(function_initialization_id);
            *initialized = Some(function_initialization_id);
        }
    }

    fn execute_item(
        &self,
        job: &CalculationJob,
        item: &CalculationJobItem,
        cache: &dyn ViewComputationCache,
        interrupt: &CancellationToken,
    ) -> CalculationJobResultItem {
        let hint = &job.cache_select_hint;
        let mut log = ExecutionLog::new(item.log_mode);

        if self.blacklist_query.is_blacklisted(item) {
            debug!(function = %item.function_id, target = %item.target, "suppressing blacklisted item");
            write_missing(cache, item, MissingOutput::Suppressed, job);
            return CalculationJobResultItem::suppressed().with_log(log);
        }

        let Some(function) = self.functions.get_function_invoker(&item.function_id) else {
            warn!(function = %item.function_id, "no invoker for function");
            write_missing(cache, item, MissingOutput::EvaluationError, job);
            return CalculationJobResultItem::function_threw(
                "InvalidFunctionException",
                format!("unknown function '{}'", item.function_id),
            );
        };

        let mut inputs = FunctionInputs::default();
        for spec in &item.inputs {
            match cache.get_value(spec, hint) {
                Some(CacheValue::Value(v)) => {
                    inputs.values.insert(spec.clone(), v);
                }
                _ => {
                    inputs.missing.insert(spec.clone());
                }
            }
        }
        if !inputs.missing.is_empty() && !function.can_handle_missing_inputs() {
            debug!(function = %item.function_id, missing = inputs.missing.len(), "inputs missing");
            write_missing(cache, item, MissingOutput::MissingInputs, job);
            return CalculationJobResultItem::missing_inputs(inputs.missing).with_log(log);
        }

        let outcome = {
            let mut context = FunctionExecutionContext::new(
                job.specification.valuation_time,
                &item.target,
                &item.function_parameters,
                &item.outputs,
                &mut log,
                interrupt,
            );
            panic::catch_unwind(AssertUnwindSafe(|| function.execute(&mut context, &inputs)))
        };

        let error = match outcome {
            Ok(Ok(values)) => {
                let mut produced = BTreeSet::new();
                let mut writes = Vec::with_capacity(item.outputs.len());
                for value in values {
                    if item.outputs.contains(&value.specification) {
                        produced.insert(value.specification.clone());
                        writes.push(value);
                    } else {
                        debug!(value = %value.specification, "dropping unrequested output");
                    }
                }
                for spec in item.outputs.difference(&produced) {
                    writes.push(ComputedValue::missing(spec.clone(), MissingOutput::EvaluationError));
                }
                cache.put_values(writes, hint);
                return CalculationJobResultItem {
                    result: InvocationResult::Success,
                    missing_inputs: inputs.missing,
                    execution_log: log,
                };
            }
            Ok(Err(e)) => e,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "function panicked".to_string());
                FunctionError::new("FunctionPanic", message)
            }
        };

        warn!(
            function = %item.function_id,
            target = %item.target,
            error = %error,
            "function failed"
        );
        log.set_exception(error.class, error.message, error.stack_trace);
        self.blacklist_maintainer.failed_job_item(item);
        write_missing(cache, item, MissingOutput::EvaluationError, job);
        CalculationJobResultItem {
            result: InvocationResult::FunctionThrewException,
            missing_inputs: inputs.missing,
            execution_log: log,
        }
    }

    /// Make the private outputs of the finished items visible to the job that
    /// picks up the remaining items.
    fn publish_private_outputs(&self, job: &CalculationJob, completed: usize, cache: &dyn ViewComputationCache) {
        let hint = &job.cache_select_hint;
        for item in job.items().iter().take(completed) {
            for spec in item.outputs.iter().filter(|s| hint.is_private_value(s)) {
                if let Some(value) = cache.get_value(spec, hint) {
                    cache.put_shared_value(ComputedValue {
                        specification: spec.clone(),
                        value,
                    });
                }
            }
        }
    }

    fn interrupted(
        &self,
        job: &CalculationJob,
        cache: &dyn ViewComputationCache,
        completed: Vec<CalculationJobResultItem>,
        reason: &str,
    ) -> NodeInterrupted {
        info!(
            node = %self.node_id,
            job_id = %job.specification,
            completed = completed.len(),
            total = job.items().len(),
            reason,
            "job execution interrupted"
        );
        self.publish_private_outputs(job, completed.len(), cache);
        NodeInterrupted {
            completed,
            reason: reason.to_string(),
        }
    }
}

fn write_missing(
    cache: &dyn ViewComputationCache,
    item: &CalculationJobItem,
    reason: MissingOutput,
    job: &CalculationJob,
) {
    let values = item
        .outputs
        .iter()
        .map(|spec| ComputedValue::missing(spec.clone(), reason))
        .collect();
    cache.put_values(values, &job.cache_select_hint);
}

impl CalculationNode for SimpleCalculationNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    #[instrument(skip_all, fields(node = %self.node_id, job_id = %job.specification))]
    fn execute_job(
        &self,
        job: &CalculationJob,
        cancel: &CancellationToken,
    ) -> Result<CalculationJobResult, NodeInterrupted> {
        let started = Instant::now();
        self.ensure_initialized(job.function_initialization_id);
        let cache = self.cache_source.get_cache(&job.specification);

        let mut results = Vec::with_capacity(job.items().len());
        for item in job.items() {
            if cancel.is_cancelled() {
                return Err(self.interrupted(job, cache.as_ref(), results, "cancelled"));
            }
            let item_token = cancel.child_token();
            if let Some(watchdog) = &self.watchdog {
                watchdog.job_execution_started(item, item_token.clone());
            }
            let result = self.execute_item(job, item, cache.as_ref(), &item_token);
            if let Some(watchdog) = &self.watchdog {
                watchdog.job_execution_stopped();
            }
            if item_token.is_cancelled() {
                return Err(self.interrupted(job, cache.as_ref(), results, "interrupted"));
            }
            results.push(result);
        }

        let duration = started.elapsed();
        debug!(items = results.len(), duration_ms = duration.as_millis() as u64, "job executed");
        Ok(CalculationJobResult::new(
            job.specification.clone(),
            duration.as_nanos() as u64,
            results,
            self.node_id.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use calcnode_core::{
        CacheSelectHint, CalculationJobSpecification, ComputationTargetSpecification, CycleId,
        InMemoryFunctionBlacklist, InMemoryViewComputationCacheSource, ValueSpecification,
    };

    fn target() -> ComputationTargetSpecification {
        ComputationTargetSpecification::new("TRADE", "T1")
    }

    fn vs(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, target())
    }

    fn item(function: &str, inputs: &[&str], outputs: &[&str]) -> CalculationJobItem {
        CalculationJobItem::new(
            function,
            target(),
            inputs.iter().map(|n| vs(n)),
            outputs.iter().map(|n| vs(n)),
        )
    }

    fn job(items: Vec<CalculationJobItem>, hint: CacheSelectHint) -> CalculationJob {
        CalculationJob::new(
            CalculationJobSpecification::new(CycleId::new(), "Default", chrono::Utc::now(), 1),
            1,
            None,
            items,
            hint,
        )
    }

    /// Emits each requested output as the number 1.0.
    fn constant() -> Arc<dyn FunctionInvoker> {
        from_fn(|ctx, _inputs| {
            Ok(ctx
                .desired_outputs
                .iter()
                .map(|spec| ComputedValue::new(spec.clone(), serde_json::json!(1.0)))
                .collect())
        })
    }

    /// Doubles its single input.
    fn double() -> Arc<dyn FunctionInvoker> {
        from_fn(|ctx, inputs| {
            let x = inputs
                .values
                .values()
                .next()
                .and_then(|v| v.as_f64())
                .ok_or_else(|| FunctionError::new("IllegalArgumentException", "no input"))?;
            Ok(ctx
                .desired_outputs
                .iter()
                .map(|spec| ComputedValue::new(spec.clone(), serde_json::json!(x * 2.0)))
                .collect())
        })
    }

    fn node(
        cache: Arc<InMemoryViewComputationCacheSource>,
        functions: InMemoryFunctionRepository,
    ) -> SimpleCalculationNode {
        SimpleCalculationNode::new("node-1", cache, Arc::new(functions))
    }

    #[test]
    fn items_run_in_order_and_feed_each_other() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new()
            .with_function("Curve", constant())
            .with_function("PV", double());
        let node = node(cache.clone(), functions);
        let job = job(
            vec![item("Curve", &[], &["Curve"]), item("PV", &["Curve"], &["PV"])],
            CacheSelectHint::AllShared,
        );

        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.successful_count(), 2);
        assert_eq!(result.compute_node_id, "node-1");

        let view = cache.get_cache(&job.specification);
        assert_eq!(
            view.get_value(&vs("PV"), &CacheSelectHint::AllShared),
            Some(CacheValue::Value(serde_json::json!(2.0)))
        );
    }

    #[test]
    fn missing_inputs_reported_and_propagated() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new().with_function("PV", double());
        let node = node(cache.clone(), functions);
        let job = job(vec![item("PV", &["Curve"], &["PV"])], CacheSelectHint::AllShared);

        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        assert_eq!(result.items[0].result, InvocationResult::MissingInputs);
        assert!(result.items[0].missing_inputs.contains(&vs("Curve")));

        let view = cache.get_cache(&job.specification);
        assert_eq!(
            view.get_value(&vs("PV"), &CacheSelectHint::AllShared),
            Some(CacheValue::Missing(MissingOutput::MissingInputs))
        );
    }

    #[test]
    fn tolerant_function_runs_with_partial_inputs() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new().with_function(
            "Sum",
            from_fn_with_missing_inputs(|ctx, inputs| {
                let total: f64 = inputs.values.values().filter_map(|v| v.as_f64()).sum();
                Ok(ctx
                    .desired_outputs
                    .iter()
                    .map(|spec| ComputedValue::new(spec.clone(), serde_json::json!(total)))
                    .collect())
            }),
        );
        let node = node(cache, functions);
        let job = job(vec![item("Sum", &["A", "B"], &["Total"])], CacheSelectHint::AllShared);

        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        assert_eq!(result.items[0].result, InvocationResult::Success);
        assert_eq!(result.items[0].missing_inputs.len(), 2);
    }

    #[test]
    fn function_error_reported_to_blacklist() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new().with_function(
            "Broken",
            from_fn(|ctx, _| {
                ctx.warn("about to fail");
                Err(FunctionError::new("ArithmeticException", "divide by zero"))
            }),
        );
        let blacklist = Arc::new(InMemoryFunctionBlacklist::new());
        let node = node(cache.clone(), functions).with_blacklist(blacklist.clone(), blacklist.clone());
        let job = job(
            vec![item("Broken", &[], &["PV"]).with_log_mode(calcnode_core::ExecutionLogMode::Full)],
            CacheSelectHint::AllShared,
        );

        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        let item_result = &result.items[0];
        assert_eq!(item_result.result, InvocationResult::FunctionThrewException);
        let exception = item_result.execution_log.exception.as_ref().unwrap();
        assert_eq!(exception.class, "ArithmeticException");
        assert_eq!(item_result.execution_log.warning_count, 1);
        assert_eq!(item_result.execution_log.events.len(), 1);
        assert_eq!(blacklist.len(), 1);

        // The second run is suppressed.
        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        assert_eq!(result.items[0].result, InvocationResult::Suppressed);
        let view = cache.get_cache(&job.specification);
        assert_eq!(
            view.get_value(&vs("PV"), &CacheSelectHint::AllShared),
            Some(CacheValue::Missing(MissingOutput::Suppressed))
        );
    }

    #[test]
    fn panicking_function_is_contained() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new()
            .with_function("Panics", from_fn(|_, _| panic!("boom")));
        let node = node(cache, functions);
        let job = job(vec![item("Panics", &[], &["PV"])], CacheSelectHint::AllShared);

        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        let exception = result.items[0].execution_log.exception.as_ref().unwrap();
        assert_eq!(exception.class, "FunctionPanic");
        assert_eq!(exception.message, "boom");
    }

    #[test]
    fn unknown_function_is_invalid() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let node = node(cache, InMemoryFunctionRepository::new());
        let job = job(vec![item("Nope", &[], &["PV"])], CacheSelectHint::AllShared);

        let result = node.execute_job(&job, &CancellationToken::new()).unwrap();
        let exception = result.items[0].execution_log.exception.as_ref().unwrap();
        assert_eq!(exception.class, "InvalidFunctionException");
    }

    #[test]
    fn unrequested_outputs_dropped_and_unproduced_marked() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new().with_function(
            "Partial",
            from_fn(|_, _| Ok(vec![ComputedValue::new(vs("Other"), serde_json::json!(3))])),
        );
        let node = node(cache.clone(), functions);
        let job = job(vec![item("Partial", &[], &["PV"])], CacheSelectHint::AllShared);

        node.execute_job(&job, &CancellationToken::new()).unwrap();
        let view = cache.get_cache(&job.specification);
        assert_eq!(view.get_value(&vs("Other"), &CacheSelectHint::AllShared), None);
        assert_eq!(
            view.get_value(&vs("PV"), &CacheSelectHint::AllShared),
            Some(CacheValue::Missing(MissingOutput::EvaluationError))
        );
    }

    #[test]
    fn functions_initialized_once_per_id() {
        struct CountingRepository {
            inner: InMemoryFunctionRepository,
            inits: AtomicUsize,
        }
        impl FunctionRepository for CountingRepository {
            fn get_function_invoker(&self, id: &str) -> Option<Arc<dyn FunctionInvoker>> {
                self.inner.get_function_invoker(id)
            }
            fn init(&self, _id: i64) {
                self.inits.fetch_add(1, Ordering::SeqCst);
            }
        }

        let repo = Arc::new(CountingRepository {
            inner: InMemoryFunctionRepository::new().with_function("Curve", constant()),
            inits: AtomicUsize::new(0),
        });
        let node = SimpleCalculationNode::new(
            "node-1",
            Arc::new(InMemoryViewComputationCacheSource::new()),
            repo.clone(),
        );
        let job = job(vec![item("Curve", &[], &["Curve"])], CacheSelectHint::AllShared);
        node.execute_job(&job, &CancellationToken::new()).unwrap();
        node.execute_job(&job, &CancellationToken::new()).unwrap();
        assert_eq!(repo.inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_job_returns_nothing_completed() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new().with_function("Curve", constant());
        let node = node(cache, functions);
        let job = job(vec![item("Curve", &[], &["Curve"])], CacheSelectHint::AllShared);

        let token = CancellationToken::new();
        token.cancel();
        let interrupted = node.execute_job(&job, &token).unwrap_err();
        assert!(interrupted.completed.is_empty());
        assert_eq!(interrupted.reason, "cancelled");
    }

    #[test]
    fn watchdog_interrupts_runaway_item() {
        let cache = Arc::new(InMemoryViewComputationCacheSource::new());
        let functions = InMemoryFunctionRepository::new()
            .with_function("Curve", constant())
            .with_function(
                "Spin",
                from_fn(|ctx, _| {
                    while !ctx.is_interrupted() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(Vec::new())
                }),
            );
        let watchdog = Arc::new(ExecutionWatchdog::new(Some(Duration::from_millis(20))));
        let node = node(cache.clone(), functions).with_watchdog(watchdog.clone());
        let private_curve = CacheSelectHint::private_values([vs("Curve")]);
        let job = job(
            vec![
                item("Curve", &[], &["Curve"]),
                item("Spin", &["Curve"], &["PV"]),
                item("Curve", &[], &["Other"]),
            ],
            private_curve,
        );

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let checker = {
            let watchdog = watchdog.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    watchdog.check();
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let interrupted = node.execute_job(&job, &CancellationToken::new()).unwrap_err();
        done.store(true, Ordering::SeqCst);
        checker.join().unwrap();

        assert_eq!(interrupted.reason, "interrupted");
        assert_eq!(interrupted.completed.len(), 1);

        // The private output of the finished item is now readable as shared.
        let view = cache.get_cache(&job.specification);
        assert_eq!(
            view.get_value(&vs("Curve"), &CacheSelectHint::AllShared),
            Some(CacheValue::Value(serde_json::json!(1.0)))
        );
    }
}
