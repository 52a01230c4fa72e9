//! Database access layer implementing the repository pattern for email job
//! persistence.
//!
//! The repository layer acts as an anti-corruption layer, translating between
//! domain models and database schemas. This isolation allows schema evolution
//! without breaking domain logic.
//!
//! All database operations MUST go through these repositories. Direct SQL
//! queries outside this module are forbidden to maintain consistency.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_attempts;
pub mod email_jobs;
pub mod idempotency;
pub mod retry_counters;
pub mod status_updates;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
///
/// The `Storage` struct is the entry point for all database operations in
/// Courier. It manages a shared connection pool and provides type-safe access
/// to each domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for email job operations.
    pub email_jobs: Arc<email_jobs::Repository>,

    /// Repository for idempotency completion records.
    pub idempotency: Arc<idempotency::Repository>,

    /// Repository for per-job retry counters.
    pub retry_counters: Arc<retry_counters::Repository>,

    /// Repository for delivery status updates.
    pub status_updates: Arc<status_updates::Repository>,

    /// Repository for delivery attempt tracking.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool with Arc for efficient resource
    /// usage.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            email_jobs: Arc::new(email_jobs::Repository::new(pool.clone())),
            idempotency: Arc::new(idempotency::Repository::new(pool.clone())),
            retry_counters: Arc::new(retry_counters::Repository::new(pool.clone())),
            status_updates: Arc::new(status_updates::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// Executes a simple query to verify database connectivity. Used by
    /// the `/health/ready` endpoint for readiness probes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or
    /// the query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.email_jobs.pool()).await?;

        Ok(())
    }
}
