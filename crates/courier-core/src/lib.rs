//! Core domain models, storage, and event types.
//!
//! Provides strongly-typed domain primitives, the Postgres-backed queue and
//! repositories, event definitions, and error handling for the email
//! delivery system. All other crates depend on these foundational types for
//! type safety and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, CourierError, Result};
pub use events::{
    DeliveryEvent, EventHandler, JobDeliveredEvent, JobFailedEvent, MulticastEventHandler,
    NoOpEventHandler,
};
pub use models::{
    DeliveryAttempt, EmailJob, JobId, JobPayload, JobStatus, StatusKind, StatusMessage,
    StatusUpdate, MAX_PRIORITY,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
