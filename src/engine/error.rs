use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The wish does not exist (or was deleted mid-call).
    #[error("wish not found: {0}")]
    NotFound(String),
    /// Concurrent writers kept winning until the retry budget ran out.
    #[error("wish {0} kept changing underneath the update; retries exhausted")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("all items are reserved")]
    FullyReserved,
    #[error("only {available} available")]
    QuantityExceedsAvailable { available: i32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Store(StoreError),
    #[error("deadline exceeded")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Stable short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Validation(_) => "validation",
            EngineError::FullyReserved => "fully_reserved",
            EngineError::QuantityExceedsAvailable { .. } => "quantity_exceeds_available",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(_) => "store",
            EngineError::Timeout => "timeout",
            EngineError::Cancelled => "cancelled",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { name, .. } => EngineError::NotFound(name),
            StoreError::Conflict { name, .. } => EngineError::Conflict(name),
            other => EngineError::Store(other),
        }
    }
}
