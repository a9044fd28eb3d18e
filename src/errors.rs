use sea_orm::error::DbErr;
use serde::Serialize;

use crate::entities::OrderStatus;

/// Failure taxonomy shared by every cart, order and catalog operation.
///
/// Errors are always surfaced to the caller; user-facing messaging belongs to
/// the view layer.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    StoreError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Invalid status transition from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationFailed(err.to_string())
    }
}

impl From<crate::cache::CacheError> for ServiceError {
    fn from(err: crate::cache::CacheError) -> Self {
        ServiceError::CacheError(err.to_string())
    }
}

impl ServiceError {
    /// Convenience constructor for wrapping string-based store errors.
    pub fn store_error_message(message: impl Into<String>) -> Self {
        ServiceError::StoreError(DbErr::Custom(message.into()))
    }

    /// Whether the failure is transient and the user may simply try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::StoreError(err) => matches!(err, DbErr::Conn(_) | DbErr::ConnectionAcquire(_)),
            _ => false,
        }
    }

    /// Stable machine-readable code for the view layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::NotFound(_) => "not_found",
            Self::ValidationFailed(_) => "validation_failed",
            Self::Timeout(_) => "timeout",
            Self::StoreError(_) => "store_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::CacheError(_) | Self::Internal(_) => "internal_error",
        }
    }
}
