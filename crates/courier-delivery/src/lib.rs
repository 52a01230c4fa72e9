//! Email delivery engine with reliability guarantees.
//!
//! This crate implements the delivery system that claims email jobs from the
//! database and hands them to an SMTP relay with idempotent redelivery,
//! exponential backoff, circuit breakers, and dead letter handling.
//!
//! # Architecture
//!
//! The delivery engine uses a worker pool model where multiple async tasks
//! claim jobs from PostgreSQL using `FOR UPDATE SKIP LOCKED` for lock-free
//! work distribution. Each worker handles the complete delivery lifecycle:
//!
//! 1. **Claim Jobs** - Worker claims pending jobs from the database
//! 2. **Idempotency Check** - Redeliveries of completed jobs ack without a
//!    second send
//! 3. **Circuit Check** - Verify the relay's circuit breaker state
//! 4. **Render and Send** - Fetch the template, render it, send via SMTP
//! 5. **Outcome** - Classify failures as bounces (dead letter) or transient
//!    (retry with backoff), publish the terminal status
//!
//! # Key Features
//!
//! - **Lock-free Distribution** - PostgreSQL SKIP LOCKED prevents worker
//!   contention
//! - **Idempotent Redelivery** - Completion records stop duplicate sends
//! - **Circuit Breakers** - Per-relay failure protection prevents cascades
//! - **Exponential Backoff** - Doubling retry delays under a fixed budget
//! - **Dead Letter Queue** - Bounces and exhausted budgets park for triage
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::time::RealClock;
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let config = DeliveryConfig::default();
//! let mut engine = DeliveryEngine::new(&pool, config, Arc::new(RealClock::new()))?;
//!
//! // Start the delivery workers
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod classify;
pub mod error;
pub mod feedback;
pub mod metrics;
pub mod retry;
pub mod smtp;
pub mod status;
pub mod storage;
pub mod template;
pub mod worker;
mod worker_pool;

// Re-export main public API
pub use error::{DeliveryError, Result};
pub use worker::{DeliveryConfig, DeliveryEngine};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default batch size for claiming jobs from the database.
pub const DEFAULT_BATCH_SIZE: usize = 10;
