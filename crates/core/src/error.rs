use thiserror::Error;

use crate::job::CalculationJobSpecification;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Job {0} has already been dispatched and can no longer be modified")]
    AlreadyDispatched(CalculationJobSpecification),

    #[error("Tail job {tail} does not belong to cycle {cycle}")]
    ForeignTail { tail: CalculationJobSpecification, cycle: String },

    #[error("Unknown value identifier: {0}")]
    UnknownIdentifier(i64),

    #[error("Result for {spec} has {actual} items, job has {expected}")]
    ItemCountMismatch {
        spec: CalculationJobSpecification,
        expected: usize,
        actual: usize,
    },

    #[error("{0}")]
    Other(String),
}
