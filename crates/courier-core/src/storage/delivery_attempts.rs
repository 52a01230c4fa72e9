//! Repository for delivery attempt database operations.
//!
//! Tracks every SMTP delivery attempt for auditing and debugging. Each
//! attempt captures the outcome, the SMTP reply code when one was received,
//! and the error detail on failure. Attempts are immutable once written.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttempt, JobId},
};

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Records a new delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn record(&self, attempt: &DeliveryAttempt) -> Result<Uuid> {
        self.record_impl(&*self.pool, attempt).await
    }

    /// Records a delivery attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn record_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<Uuid> {
        self.record_impl(&mut **tx, attempt).await
    }

    /// Private helper for recording attempts with generic executor.
    async fn record_impl<'e, E>(&self, executor: E, attempt: &DeliveryAttempt) -> Result<Uuid>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_attempts (
                id, job_id, attempt_number, smtp_code,
                succeeded, error_message, attempted_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.job_id.0)
        .bind(attempt.attempt_number)
        .bind(attempt.smtp_code)
        .bind(attempt.succeeded)
        .bind(&attempt.error_message)
        .bind(attempt.attempted_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds all delivery attempts for a job, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_for_job(&self, job_id: JobId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, job_id, attempt_number, smtp_code,
                   succeeded, error_message, attempted_at
            FROM delivery_attempts
            WHERE job_id = $1
            ORDER BY attempt_number ASC
            ",
        )
        .bind(job_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Counts total delivery attempts for a job.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_for_job(&self, job_id: JobId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM delivery_attempts
            WHERE job_id = $1
            ",
        )
        .bind(job_id.0)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
