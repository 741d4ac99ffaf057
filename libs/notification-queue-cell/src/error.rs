use thiserror::Error;
use tracing::error;

use shared_models::error::AppError;

use crate::models::NotificationStatus;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unique constraint violated for {key}")]
    UniqueViolation { key: String },

    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    PoolError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Store operation failed: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Invalid notification status transition from {from} to {to}")]
    InvalidStatusTransition { from: NotificationStatus, to: NotificationStatus },

    #[error("Notification {id} failed permanently: {reason}")]
    PermanentFailure { id: String, reason: String },

    #[error("Notification {id} was updated concurrently")]
    ConcurrentUpdate { id: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<NotificationError> for AppError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::NotFound(id) => AppError::NotFound(format!("Notification {} not found", id)),
            NotificationError::ValidationError(msg) => AppError::BadRequest(msg),
            e @ (NotificationError::InvalidStatusTransition { .. }
            | NotificationError::PermanentFailure { .. }
            | NotificationError::ConcurrentUpdate { .. }) => AppError::Conflict(e.to_string()),
            NotificationError::Store(StoreError::RedisError(e)) => {
                error!("Notification store unavailable: {}", e);
                AppError::ServiceUnavailable("Notification store unavailable".to_string())
            }
            e => {
                error!("Notification operation failed: {}", e);
                AppError::Internal("Operation failed".to_string())
            }
        }
    }
}
