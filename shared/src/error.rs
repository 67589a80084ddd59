use thiserror::Error;

/// Business and infrastructure failures, one taxonomy for every layer.
/// The api module maps these onto HTTP statuses; the worker maps them
/// onto retry-or-dead-letter decisions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient inventory in section {section_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        section_id: uuid::Uuid,
        requested: i32,
        available: i32,
    },

    #[error("forbidden: booking does not belong to the requesting user")]
    Forbidden,

    /// Lock acquisition retries exhausted. A retryable busy signal,
    /// never a crash.
    #[error("resource busy: could not acquire lock {0}")]
    LockUnavailable(String),

    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Error::ExternalService(msg.into())
    }

    /// Worth re-running through the queue's retry policy. Business
    /// rejections are not: replaying a validation failure or a
    /// wrong-state transition cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockUnavailable(_) | Error::ExternalService(_) | Error::Internal(_)
        )
    }
}
