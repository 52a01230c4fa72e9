//! Repository for idempotency completion records.
//!
//! Records which jobs have already completed delivery so redelivered copies
//! of the same job can be acknowledged without sending a second email.
//! Records expire after 24 hours; the window mirrors the upstream
//! deduplication window.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::error::Result;

/// Repository for idempotency record database operations.
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

    /// Checks whether a job already completed within the last 24 hours.
    ///
    /// Expired records are treated as absent, so a job resubmitted after the
    /// window closes is delivered again.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn is_completed(&self, job_key: &str) -> Result<bool> {
        let completed: (bool,) = sqlx::query_as(
            r"
            SELECT EXISTS(
                SELECT 1 FROM idempotency_records
                WHERE job_key = $1
                  AND completed_at > NOW() - INTERVAL '24 hours'
            )
            ",
        )
        .bind(job_key)
        .fetch_one(&*self.pool)
        .await?;

        Ok(completed.0)
    }

    /// Records a job as completed.
    ///
    /// Upserts so a redelivered job that somehow completes twice refreshes
    /// the record instead of violating the primary key.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn mark_completed(&self, job_key: &str) -> Result<()> {
        self.mark_completed_impl(&*self.pool, job_key).await
    }

    /// Records a completion within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn mark_completed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_key: &str,
    ) -> Result<()> {
        self.mark_completed_impl(&mut **tx, job_key).await
    }

    /// Private helper for recording completions with generic executor.
    async fn mark_completed_impl<'e, E>(&self, executor: E, job_key: &str) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            INSERT INTO idempotency_records (job_key, completed_at)
            VALUES ($1, NOW())
            ON CONFLICT (job_key) DO UPDATE SET completed_at = NOW()
            ",
        )
        .bind(job_key)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Deletes records past the 24 hour window.
    ///
    /// Run periodically by the maintenance loop; the `is_completed` check
    /// filters on age regardless, so purging is housekeeping rather than
    /// correctness.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM idempotency_records
            WHERE completed_at <= NOW() - INTERVAL '24 hours'
            ",
        )
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
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
