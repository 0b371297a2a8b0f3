//! Per-connection encoding of [`RemoteMessage`]s.
//!
//! Value specifications are replaced by `i64` identifiers from an
//! [`IdentifierMap`]. The first message that uses an identifier on a
//! connection carries its definition; later messages only carry the number.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use calcnode_core::{
    CacheSelectHint, CalculationJob, CalculationJobItem, CalculationJobResult,
    CalculationJobResultItem, CalculationJobSpecification, ComputationTargetSpecification,
    ExecutionLog, ExecutionLogMode, IdentifierMap, InvocationResult, ValueSpecification,
    VersionCorrection,
};

use crate::error::WireError;
use crate::message::{Message, MESSAGE_VERSION};
use crate::protocol::{topics, Capabilities, RemoteMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Definition {
    id: i64,
    spec: ValueSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireHint {
    AllShared,
    AllPrivate,
    PrivateValues(Vec<i64>),
    SharedValues(Vec<i64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireItem {
    function_id: String,
    function_parameters: serde_json::Value,
    target: ComputationTargetSpecification,
    inputs: Vec<i64>,
    outputs: Vec<i64>,
    log_mode: ExecutionLogMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireJob {
    specification: CalculationJobSpecification,
    function_initialization_id: i64,
    version_correction: VersionCorrection,
    required_job_ids: Option<Vec<i64>>,
    items: Vec<WireItem>,
    hint: WireHint,
    tail: Option<Vec<WireJob>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResultItem {
    result: InvocationResult,
    missing_inputs: Vec<i64>,
    execution_log: ExecutionLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResult {
    specification: CalculationJobSpecification,
    duration_nanos: u64,
    items: Vec<WireResultItem>,
    compute_node_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadyPayload {
    capacity: u32,
    node_id: String,
    capabilities: Capabilities,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitPayload {
    function_init_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExecutePayload {
    definitions: Vec<Definition>,
    job: WireJob,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultPayload {
    definitions: Vec<Definition>,
    result: WireResult,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailurePayload {
    definitions: Vec<Definition>,
    job: CalculationJobSpecification,
    message: String,
    completed: Vec<WireResultItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobsPayload {
    jobs: Vec<CalculationJobSpecification>,
}

/// Sending half of a connection's identifier state.
pub struct IdentifierEncoder {
    identifiers: Arc<dyn IdentifierMap>,
    sent: HashSet<i64>,
}

impl IdentifierEncoder {
    pub fn new(identifiers: Arc<dyn IdentifierMap>) -> Self {
        Self {
            identifiers,
            sent: HashSet::new(),
        }
    }

    /// Number of identifiers already defined to the peer.
    pub fn defined_count(&self) -> usize {
        self.sent.len()
    }

    pub fn encode(&mut self, message: &RemoteMessage) -> Result<Message, WireError> {
        let topic = message.topic();
        let msg = match message {
            RemoteMessage::Ready {
                capacity,
                node_id,
                capabilities,
            } => Message::new(
                topic,
                &ReadyPayload {
                    capacity: *capacity,
                    node_id: node_id.clone(),
                    capabilities: capabilities.clone(),
                },
            )?,
            RemoteMessage::Init { function_init_id } => Message::new(
                topic,
                &InitPayload {
                    function_init_id: *function_init_id,
                },
            )?,
            RemoteMessage::Execute { job } => {
                let mut definitions = Vec::new();
                let job = self.job(job, &mut definitions);
                Message::new(topic, &ExecutePayload { definitions, job })?
            }
            RemoteMessage::Result { result } => {
                let mut definitions = Vec::new();
                let result = WireResult {
                    specification: result.specification.clone(),
                    duration_nanos: result.duration_nanos,
                    items: self.result_items(&result.items, &mut definitions),
                    compute_node_id: result.compute_node_id.clone(),
                };
                Message::new(topic, &ResultPayload { definitions, result })?
            }
            RemoteMessage::Failure {
                job,
                message,
                completed,
            } => {
                let mut definitions = Vec::new();
                let completed = self.result_items(completed, &mut definitions);
                Message::new(
                    topic,
                    &FailurePayload {
                        definitions,
                        job: job.clone(),
                        message: message.clone(),
                        completed,
                    },
                )?
            }
            RemoteMessage::IsAlive { jobs } | RemoteMessage::Cancel { jobs } => {
                Message::new(topic, &JobsPayload { jobs: jobs.clone() })?
            }
        };
        trace!(topic, bytes = msg.payload.len(), "encoded message");
        Ok(msg)
    }

    fn id(&mut self, spec: &ValueSpecification, definitions: &mut Vec<Definition>) -> i64 {
        let id = self.identifiers.get_identifier(spec);
        if self.sent.insert(id) {
            definitions.push(Definition {
                id,
                spec: spec.clone(),
            });
        }
        id
    }

    fn ids<'a>(
        &mut self,
        specs: impl IntoIterator<Item = &'a ValueSpecification>,
        definitions: &mut Vec<Definition>,
    ) -> Vec<i64> {
        specs.into_iter().map(|s| self.id(s, definitions)).collect()
    }

    fn hint(&mut self, hint: &CacheSelectHint, definitions: &mut Vec<Definition>) -> WireHint {
        match hint {
            CacheSelectHint::AllShared => WireHint::AllShared,
            CacheSelectHint::AllPrivate => WireHint::AllPrivate,
            CacheSelectHint::PrivateValues(v) => WireHint::PrivateValues(self.ids(v, definitions)),
            CacheSelectHint::SharedValues(v) => WireHint::SharedValues(self.ids(v, definitions)),
        }
    }

    fn job(&mut self, job: &CalculationJob, definitions: &mut Vec<Definition>) -> WireJob {
        let items = job
            .items()
            .iter()
            .map(|item| WireItem {
                function_id: item.function_id.clone(),
                function_parameters: item.function_parameters.clone(),
                target: item.target.clone(),
                inputs: self.ids(&item.inputs, definitions),
                outputs: self.ids(&item.outputs, definitions),
                log_mode: item.log_mode,
            })
            .collect();
        let tail = job
            .tail()
            .map(|tail| tail.iter().map(|t| self.job(t, definitions)).collect());
        WireJob {
            specification: job.specification.clone(),
            function_initialization_id: job.function_initialization_id,
            version_correction: job.version_correction,
            required_job_ids: job.required_job_ids.clone(),
            items,
            hint: self.hint(&job.cache_select_hint, definitions),
            tail,
        }
    }

    fn result_items(
        &mut self,
        items: &[CalculationJobResultItem],
        definitions: &mut Vec<Definition>,
    ) -> Vec<WireResultItem> {
        items
            .iter()
            .map(|item| WireResultItem {
                result: item.result,
                missing_inputs: self.ids(&item.missing_inputs, definitions),
                execution_log: item.execution_log.clone(),
            })
            .collect()
    }
}

/// Receiving half of a connection's identifier state.
pub struct IdentifierDecoder {
    identifiers: Arc<dyn IdentifierMap>,
    defined: HashMap<i64, ValueSpecification>,
}

impl IdentifierDecoder {
    pub fn new(identifiers: Arc<dyn IdentifierMap>) -> Self {
        Self {
            identifiers,
            defined: HashMap::new(),
        }
    }

    pub fn decode(&mut self, message: &Message) -> Result<RemoteMessage, WireError> {
        if message.version > MESSAGE_VERSION {
            return Err(WireError::UnsupportedVersion(message.version));
        }
        let decoded = match message.topic.as_str() {
            topics::READY => {
                let p: ReadyPayload = message.decode()?;
                RemoteMessage::Ready {
                    capacity: p.capacity,
                    node_id: p.node_id,
                    capabilities: p.capabilities,
                }
            }
            topics::INIT => {
                let p: InitPayload = message.decode()?;
                RemoteMessage::Init {
                    function_init_id: p.function_init_id,
                }
            }
            topics::EXECUTE => {
                let p: ExecutePayload = message.decode()?;
                self.define(p.definitions);
                RemoteMessage::Execute {
                    job: self.job(p.job)?,
                }
            }
            topics::RESULT => {
                let p: ResultPayload = message.decode()?;
                self.define(p.definitions);
                RemoteMessage::Result {
                    result: CalculationJobResult {
                        specification: p.result.specification,
                        duration_nanos: p.result.duration_nanos,
                        items: self.result_items(p.result.items)?,
                        compute_node_id: p.result.compute_node_id,
                    },
                }
            }
            topics::FAILURE => {
                let p: FailurePayload = message.decode()?;
                self.define(p.definitions);
                RemoteMessage::Failure {
                    job: p.job,
                    message: p.message,
                    completed: self.result_items(p.completed)?,
                }
            }
            topics::IS_ALIVE => {
                let p: JobsPayload = message.decode()?;
                RemoteMessage::IsAlive { jobs: p.jobs }
            }
            topics::CANCEL => {
                let p: JobsPayload = message.decode()?;
                RemoteMessage::Cancel { jobs: p.jobs }
            }
            other => return Err(WireError::UnknownTopic(other.to_string())),
        };
        Ok(decoded)
    }

    fn define(&mut self, definitions: Vec<Definition>) {
        for d in definitions {
            self.defined.insert(d.id, d.spec);
        }
    }

    fn resolve(&self, id: i64) -> Result<ValueSpecification, WireError> {
        match self.defined.get(&id) {
            Some(spec) => Ok(spec.clone()),
            None => Ok(self.identifiers.resolve(id)?),
        }
    }

    fn resolve_all(&self, ids: Vec<i64>) -> Result<BTreeSet<ValueSpecification>, WireError> {
        ids.into_iter().map(|id| self.resolve(id)).collect()
    }

    fn hint(&self, hint: WireHint) -> Result<CacheSelectHint, WireError> {
        Ok(match hint {
            WireHint::AllShared => CacheSelectHint::AllShared,
            WireHint::AllPrivate => CacheSelectHint::AllPrivate,
            WireHint::PrivateValues(ids) => CacheSelectHint::PrivateValues(self.resolve_all(ids)?),
            WireHint::SharedValues(ids) => CacheSelectHint::SharedValues(self.resolve_all(ids)?),
        })
    }

    fn job(&self, job: WireJob) -> Result<CalculationJob, WireError> {
        let items = job
            .items
            .into_iter()
            .map(|item| {
                Ok(CalculationJobItem {
                    function_id: item.function_id,
                    function_parameters: item.function_parameters,
                    target: item.target,
                    inputs: self.resolve_all(item.inputs)?,
                    outputs: self.resolve_all(item.outputs)?,
                    log_mode: item.log_mode,
                })
            })
            .collect::<Result<Vec<_>, WireError>>()?;
        let tail = match job.tail {
            Some(tail) => tail
                .into_iter()
                .map(|t| self.job(t))
                .collect::<Result<Vec<_>, WireError>>()?,
            None => Vec::new(),
        };
        Ok(CalculationJob::new(
            job.specification,
            job.function_initialization_id,
            job.required_job_ids,
            items,
            self.hint(job.hint)?,
        )
        .with_version_correction(job.version_correction)
        .with_tail(tail))
    }

    fn result_items(
        &self,
        items: Vec<WireResultItem>,
    ) -> Result<Vec<CalculationJobResultItem>, WireError> {
        items
            .into_iter()
            .map(|item| {
                Ok(CalculationJobResultItem {
                    result: item.result,
                    missing_inputs: self.resolve_all(item.missing_inputs)?,
                    execution_log: item.execution_log,
                })
            })
            .collect()
    }
}
