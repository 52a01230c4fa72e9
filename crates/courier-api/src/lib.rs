//! Courier HTTP API.
//!
//! Health probes, Prometheus metrics, and the job intake surface over the
//! shared Postgres queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod handlers;
pub mod server;

pub use server::{create_router, start_server, AppState};
