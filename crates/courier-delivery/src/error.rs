//! Error types for email delivery operations.
//!
//! Defines all error conditions that can occur during email delivery,
//! including SMTP rejections, network failures, circuit breaker states, and
//! database operations. Errors include context for debugging and proper
//! categorization for retry decisions.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Comprehensive error types for email delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// SMTP server rejected the message with a reply code.
    #[error("smtp rejection {}: {message}", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    SmtpRejection {
        /// SMTP reply code, when the server sent one
        code: Option<u16>,
        /// Server response text
        message: String,
    },

    /// Network-level connectivity failure before any SMTP reply.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Delivery attempt timed out.
    #[error("delivery timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the attempt timed out
        timeout_seconds: u64,
    },

    /// Template could not be fetched or rendered.
    #[error("template error for {template_ref}: {message}")]
    Template {
        /// Template reference that failed
        template_ref: String,
        /// Fetch or render error detail
        message: String,
    },

    /// Circuit breaker is open, delivery blocked.
    #[error("circuit breaker open for transport {transport_key}")]
    CircuitOpen {
        /// Identifier of the transport with open circuit
        transport_key: String,
    },

    /// All retry attempts exhausted.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of delivery attempts made
        attempts: u32,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Job payload failed validation before reaching the pipeline.
    #[error("malformed job: {reason}")]
    MalformedJob {
        /// Validation failure detail
        reason: String,
    },

    /// Invalid transport or pipeline configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Worker task panicked during processing.
    #[error("worker task panicked: {message}")]
    WorkerPanic {
        /// Panic message if one was captured
        message: String,
    },

    /// Graceful shutdown did not finish within its deadline.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Seconds waited before giving up
        timeout_seconds: u64,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates an SMTP rejection error from a reply code and message.
    pub fn smtp_rejection(code: Option<u16>, message: impl Into<String>) -> Self {
        Self::SmtpRejection { code, message: message.into() }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a template error.
    pub fn template(template_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template { template_ref: template_ref.into(), message: message.into() }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(transport_key: impl Into<String>) -> Self {
        Self::CircuitOpen { transport_key: transport_key.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a malformed job error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedJob { reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns the SMTP reply code when the error carries one.
    pub fn smtp_code(&self) -> Option<u16> {
        match self {
            Self::SmtpRejection { code, .. } => *code,
            _ => None,
        }
    }

    /// Determines if this error represents a temporary failure that should
    /// be retried.
    ///
    /// SMTP rejections are retryable here because the classifier, not this
    /// flag, decides permanence for them. Returns `false` for malformed
    /// jobs, configuration issues, and exhausted retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SmtpRejection { .. }
            | Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Template { .. }
            | Self::CircuitOpen { .. }
            | Self::Database { .. } => true,

            Self::RetriesExhausted { .. }
            | Self::MalformedJob { .. }
            | Self::Configuration { .. }
            | Self::ShutdownRequested
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }
}

impl From<courier_core::CoreError> for DeliveryError {
    fn from(error: courier_core::CoreError) -> Self {
        Self::Database { message: error.to_string() }
    }
}

/// Category of delivery error for metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// SMTP reply-level rejections.
    Smtp,
    /// Network connectivity issues.
    Network,
    /// Template fetch or render problems.
    Template,
    /// Circuit breaker protection.
    Circuit,
    /// Database operations.
    Database,
    /// Payload validation failures.
    Malformed,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::SmtpRejection { .. } => Self::Smtp,
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::Template { .. } => Self::Template,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::Database { .. } => Self::Database,
            DeliveryError::MalformedJob { .. } => Self::Malformed,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::RetriesExhausted { .. }
            | DeliveryError::ShutdownRequested
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smtp => write!(f, "smtp"),
            Self::Network => write!(f, "network"),
            Self::Template => write!(f, "template"),
            Self::Circuit => write!(f, "circuit"),
            Self::Database => write!(f, "database"),
            Self::Malformed => write!(f, "malformed"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::smtp_rejection(Some(421), "try again later").is_retryable());
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::circuit_open("smtp.example.com").is_retryable());
        assert!(DeliveryError::database("connection lost").is_retryable());

        assert!(!DeliveryError::malformed("missing recipient").is_retryable());
        assert!(!DeliveryError::retries_exhausted(3).is_retryable());
        assert!(!DeliveryError::configuration("bad relay host").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn smtp_code_extracted() {
        let rejected = DeliveryError::smtp_rejection(Some(550), "5.1.1 User unknown");
        assert_eq!(rejected.smtp_code(), Some(550));

        let no_code = DeliveryError::smtp_rejection(None, "connection dropped mid-reply");
        assert_eq!(no_code.smtp_code(), None);

        assert_eq!(DeliveryError::timeout(30).smtp_code(), None);
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(
            ErrorCategory::from(&DeliveryError::smtp_rejection(Some(550), "no")),
            ErrorCategory::Smtp
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::network("test")), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::template("welcome", "404")),
            ErrorCategory::Template
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::circuit_open("relay-1")),
            ErrorCategory::Circuit
        );
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::timeout(30);
        assert_eq!(error.to_string(), "delivery timeout after 30s");

        let rejection = DeliveryError::smtp_rejection(Some(550), "mailbox full");
        assert_eq!(rejection.to_string(), "smtp rejection 550: mailbox full");

        let codeless = DeliveryError::smtp_rejection(None, "dropped");
        assert_eq!(codeless.to_string(), "smtp rejection unknown: dropped");
    }
}
