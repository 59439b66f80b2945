//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A job or resource references something the pipeline does not declare.
    /// Never retried; surfaced to the user.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No input combination satisfies the job's passed constraints.
    #[error("constraint error: {0}")]
    Constraint(String),

    /// Worker unreachable, container create/destroy failure or a transient
    /// store failure.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("pipeline is being destroyed: {0}")]
    PipelineDestroyed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Infrastructure(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
