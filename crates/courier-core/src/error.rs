//! Error types and result handling for email job processing.
//!
//! Defines the structured error taxonomy with stable codes for client
//! disambiguation. Covers payload validation, queue operations and
//! infrastructure failures at the intake boundary; transport-side failures
//! live in the delivery crate.

use thiserror::Error;

use crate::models::JobId;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and queue operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Courier error types with codes for the intake surface.
#[derive(Debug, Error)]
pub enum CourierError {
    // Intake errors (E1001-E1004)
    /// Inbound payload failed validation (E1001).
    ///
    /// Malformed jobs are rejected before they reach the reliability
    /// pipeline; they are never retried.
    #[error("[E1001] Malformed job: {reason}")]
    MalformedJob {
        /// Why the payload was rejected
        reason: String,
    },

    /// Duplicate job detected by idempotency check (E1002).
    #[error("[E1002] Duplicate job: {job_key} already enqueued")]
    DuplicateJob {
        /// The caller-assigned job identifier that was already seen
        job_key: String,
    },

    /// Job not found (E1003).
    #[error("[E1003] Unknown job: {id} not found")]
    JobNotFound {
        /// The job row that was requested
        id: JobId,
    },

    /// Payload exceeds the enqueue size limit (E1004).
    #[error("[E1004] Payload too large: {size_bytes} bytes")]
    PayloadTooLarge {
        /// Size of the rejected payload in bytes
        size_bytes: usize,
    },

    // System errors (E3001-)
    /// PostgreSQL connection failed (E3001).
    #[error("[E3001] Database unavailable: connection failed")]
    DatabaseUnavailable,

    /// Generic database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CourierError {
    /// Creates a malformed-job error from any displayable reason.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedJob { reason: reason.into() }
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedJob { .. } => "E1001",
            Self::DuplicateJob { .. } => "E1002",
            Self::JobNotFound { .. } => "E1003",
            Self::PayloadTooLarge { .. } => "E1004",
            Self::DatabaseUnavailable => "E3001",
            Self::Database(_) | Self::Serialization(_) => "E9999",
        }
    }

    /// Returns whether the caller may usefully retry the operation.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseUnavailable | Self::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CourierError::malformed("missing recipient").code(), "E1001");
        assert_eq!(CourierError::DuplicateJob { job_key: "j-1".into() }.code(), "E1002");
        assert_eq!(CourierError::JobNotFound { id: JobId::new() }.code(), "E1003");
        assert_eq!(CourierError::PayloadTooLarge { size_bytes: 0 }.code(), "E1004");
        assert_eq!(CourierError::DatabaseUnavailable.code(), "E3001");
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(!CourierError::malformed("bad priority").is_retryable());
        assert!(!CourierError::DuplicateJob { job_key: "j-1".into() }.is_retryable());
        assert!(CourierError::DatabaseUnavailable.is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
