//! Calculation job dispatch and execution.
//!
//! A [`JobDispatcher`] takes calculation jobs, hands them to registered
//! [`JobInvoker`]s and reports one result per job. Invokers run jobs on
//! in-process [`SimpleCalculationNode`]s ([`LocalNodeJobInvoker`]) or on
//! nodes across a connection ([`RemoteNodeJobInvoker`]).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod invoker;
pub mod job;
pub mod metrics;
pub mod node;
pub mod remote;
pub mod watchdog;

pub use config::{DispatcherConfig, EngineConfig, LocalConfig, RemoteConfig, WatchdogConfig};
pub use dispatcher::{Cancelable, InvokerId, JobDispatcher, JobResultReceiver};
pub use error::EngineError;
pub use invoker::{AvailabilityNotifier, JobFailure, JobInvocationReceiver, JobInvoker, LocalNodeJobInvoker};
pub use job::{StandardJob, WatchedJob};
pub use metrics::DispatcherMetrics;
pub use node::{
    CalculationNode, FunctionError, FunctionExecutionContext, FunctionInputs, FunctionInvoker,
    FunctionRepository, InMemoryFunctionRepository, NodeInterrupted, SimpleCalculationNode,
};
pub use remote::{RemoteNodeClient, RemoteNodeJobInvoker, RemoteNodeServer};
pub use watchdog::ExecutionWatchdog;
