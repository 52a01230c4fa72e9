//! HTTP request handlers for the courier API.
//!
//! This module contains all HTTP endpoint handlers following a consistent
//! pattern:
//! - Input validation with appropriate error codes
//! - Tracing for observability
//! - Standardized error responses
//!
//! # Handler Organization
//!
//! Handlers are grouped by functionality:
//! - `jobs` - Job enqueueing and dead-letter triage
//! - `health` - Health check and readiness probes
//! - `metrics` - Prometheus exposition
//!
//! # Error Handling
//!
//! All handlers return standardized error responses with:
//! - Appropriate HTTP status codes
//! - Error codes from the intake taxonomy (E1001-E3001)
//! - Human-readable error messages
//! - Request tracing IDs for debugging

pub mod health;
pub mod jobs;
pub mod metrics;

// Re-export handlers for convenient access
pub use health::{health_check, liveness_check, readiness_check};
pub use jobs::{enqueue_job, list_dead_letter, retry_job};
pub use metrics::metrics_exposition;
