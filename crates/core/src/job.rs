use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache_hint::CacheSelectHint;
use crate::error::CoreError;
use crate::value::{ComputationTargetSpecification, ValueSpecification};

/// Identifier of one calculation cycle of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CycleId(pub Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a calculation job. Equality and hashing cover all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalculationJobSpecification {
    pub cycle_id: CycleId,
    pub calc_config_name: String,
    pub valuation_time: DateTime<Utc>,
    pub job_id: i64,
}

impl CalculationJobSpecification {
    pub fn new(
        cycle_id: CycleId,
        calc_config_name: impl Into<String>,
        valuation_time: DateTime<Utc>,
        job_id: i64,
    ) -> Self {
        Self {
            cycle_id,
            calc_config_name: calc_config_name.into(),
            valuation_time,
            job_id,
        }
    }

    /// Same cycle, configuration and valuation time under a different job id.
    pub fn with_job_id(&self, job_id: i64) -> Self {
        Self {
            job_id,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for CalculationJobSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.cycle_id,
            self.calc_config_name,
            self.job_id,
            self.valuation_time.to_rfc3339()
        )
    }
}

/// How much of a function's logging is kept on its result item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionLogMode {
    /// Only counts of warnings and errors.
    #[default]
    Indicators,
    /// Every log event plus exception detail.
    Full,
}

/// One function invocation within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    pub function_id: String,
    #[serde(default)]
    pub function_parameters: serde_json::Value,
    pub target: ComputationTargetSpecification,
    pub inputs: BTreeSet<ValueSpecification>,
    pub outputs: BTreeSet<ValueSpecification>,
    #[serde(default)]
    pub log_mode: ExecutionLogMode,
}

impl CalculationJobItem {
    pub fn new(
        function_id: impl Into<String>,
        target: ComputationTargetSpecification,
        inputs: impl IntoIterator<Item = ValueSpecification>,
        outputs: impl IntoIterator<Item = ValueSpecification>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            function_parameters: serde_json::Value::Null,
            target,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            log_mode: ExecutionLogMode::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.function_parameters = parameters;
        self
    }

    pub fn with_log_mode(mut self, mode: ExecutionLogMode) -> Self {
        self.log_mode = mode;
        self
    }
}

/// Point in version/correction history the job reads its source data at. `None` means latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionCorrection {
    pub version_as_of: Option<DateTime<Utc>>,
    pub corrected_to: Option<DateTime<Utc>>,
}

impl VersionCorrection {
    pub const LATEST: VersionCorrection = VersionCorrection {
        version_as_of: None,
        corrected_to: None,
    };
}

/// A batch of items executed together on one node, optionally followed by tail jobs.
///
/// Tail jobs run only after this job (and any other job listed in their
/// `required_job_ids`) has completed. The tail list can be extended until the
/// job is handed to an invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJob {
    pub specification: CalculationJobSpecification,
    pub function_initialization_id: i64,
    #[serde(default)]
    pub version_correction: VersionCorrection,
    pub required_job_ids: Option<Vec<i64>>,
    pub items: Vec<CalculationJobItem>,
    pub cache_select_hint: CacheSelectHint,
    tail: Option<Vec<CalculationJob>>,
    #[serde(skip)]
    dispatched: bool,
}

impl CalculationJob {
    pub fn new(
        specification: CalculationJobSpecification,
        function_initialization_id: i64,
        required_job_ids: Option<Vec<i64>>,
        items: Vec<CalculationJobItem>,
        cache_select_hint: CacheSelectHint,
    ) -> Self {
        Self {
            specification,
            function_initialization_id,
            version_correction: VersionCorrection::LATEST,
            required_job_ids,
            items,
            cache_select_hint,
            tail: None,
            dispatched: false,
        }
    }

    pub fn with_version_correction(mut self, version_correction: VersionCorrection) -> Self {
        self.version_correction = version_correction;
        self
    }

    pub fn with_tail(mut self, tail: Vec<CalculationJob>) -> Self {
        self.tail = if tail.is_empty() { None } else { Some(tail) };
        self
    }

    pub fn items(&self) -> &[CalculationJobItem] {
        &self.items
    }

    pub fn tail(&self) -> Option<&[CalculationJob]> {
        self.tail.as_deref()
    }

    pub fn has_tail(&self) -> bool {
        self.tail.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Append a job to run after this one.
    pub fn add_tail(&mut self, job: CalculationJob) -> Result<(), CoreError> {
        if self.dispatched {
            return Err(CoreError::AlreadyDispatched(self.specification.clone()));
        }
        if job.specification.cycle_id != self.specification.cycle_id {
            return Err(CoreError::ForeignTail {
                tail: job.specification,
                cycle: self.specification.cycle_id.to_string(),
            });
        }
        self.tail.get_or_insert_with(Vec::new).push(job);
        Ok(())
    }

    /// A copy of this job with the tail removed.
    pub fn without_tail(&self) -> CalculationJob {
        CalculationJob {
            tail: None,
            ..self.clone()
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Freeze the tail list. Called when the job is handed to an invoker.
    pub fn mark_dispatched(&mut self) {
        self.dispatched = true;
        if let Some(tail) = self.tail.as_mut() {
            for job in tail {
                job.mark_dispatched();
            }
        }
    }

    /// Number of distinct jobs in the tail graph rooted here, including this one.
    pub fn job_count(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        self.count_into(&mut seen);
        seen.len()
    }

    fn count_into(&self, seen: &mut std::collections::HashSet<i64>) {
        if seen.insert(self.specification.job_id) {
            for job in self.tail().unwrap_or_default() {
                job.count_into(seen);
            }
        }
    }
}
