use thiserror::Error;

pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("scale set validation failed: {reason}")]
    ScaleSetValidation { reason: String },

    #[error("invalid metadata for worker {worker_id}: {reason}")]
    WorkerMetadata { worker_id: String, reason: String },

    #[error("worker {worker_id} belongs to scale set {actual} (expected: {expected})")]
    WorkerGroupMismatch {
        worker_id: String,
        actual: String,
        expected: String,
    },

    #[error("scheduler request failed: {0}")]
    Scheduler(String),

    #[error("cloud request failed: {0}")]
    Cloud(String),

    #[error("secret retrieval failed: {0}")]
    Secrets(String),

    /// Mutation errors during a tick are counted rather than aborting the
    /// loop; the tick reports the total so monitoring notices, while the
    /// side effects already applied stand.
    #[error("encountered {errors} errors during the tick")]
    TickFailed { errors: usize },
}
