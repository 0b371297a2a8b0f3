//! Messages exchanged between the dispatcher and a remote calculation node.
//!
//! ```text
//! node        -> dispatcher   Ready { capacity, node_id, capabilities }
//! dispatcher  -> node         Init { function_init_id }
//! dispatcher  -> node         Execute { job } | IsAlive { jobs } | Cancel { jobs }
//! node        -> dispatcher   Result { result } | Failure { job, message, completed }
//! ```

use std::collections::BTreeMap;

use calcnode_core::{
    CalculationJob, CalculationJobResult, CalculationJobResultItem, CalculationJobSpecification,
};

pub mod topics {
    pub const READY: &str = "calcnode.ready";
    pub const INIT: &str = "calcnode.init";
    pub const EXECUTE: &str = "calcnode.execute";
    pub const RESULT: &str = "calcnode.result";
    pub const FAILURE: &str = "calcnode.failure";
    pub const IS_ALIVE: &str = "calcnode.is_alive";
    pub const CANCEL: &str = "calcnode.cancel";
}

/// Capability name to value advertised by a node.
pub type Capabilities = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteMessage {
    Ready {
        capacity: u32,
        node_id: String,
        capabilities: Capabilities,
    },
    Init {
        function_init_id: i64,
    },
    Execute {
        job: CalculationJob,
    },
    Result {
        result: CalculationJobResult,
    },
    /// The job could not be executed. `completed` holds results for the
    /// leading items that did finish, in item order.
    Failure {
        job: CalculationJobSpecification,
        message: String,
        completed: Vec<CalculationJobResultItem>,
    },
    IsAlive {
        jobs: Vec<CalculationJobSpecification>,
    },
    Cancel {
        jobs: Vec<CalculationJobSpecification>,
    },
}

impl RemoteMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            RemoteMessage::Ready { .. } => topics::READY,
            RemoteMessage::Init { .. } => topics::INIT,
            RemoteMessage::Execute { .. } => topics::EXECUTE,
            RemoteMessage::Result { .. } => topics::RESULT,
            RemoteMessage::Failure { .. } => topics::FAILURE,
            RemoteMessage::IsAlive { .. } => topics::IS_ALIVE,
            RemoteMessage::Cancel { .. } => topics::CANCEL,
        }
    }
}
