//! Caller-facing error taxonomy
//!
//! Every RPC operation fails with exactly one of these codes. Handlers
//! validate and fail before any write, so a returned error implies no
//! visible state change.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::FailedPrecondition(_) => "failed_precondition",
            EngineError::NotFound(_) => "not_found",
            EngineError::ResourceExhausted(_) => "resource_exhausted",
            EngineError::DeadlineExceeded(_) => "deadline_exceeded",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(path) => {
                EngineError::Internal(format!("write conflict on {}", path))
            }
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
