//! Repository for per-job retry counters.
//!
//! Counters live in their own table rather than on the job row so that an
//! outage of this store degrades delivery accounting without blocking
//! delivery itself: a worker that cannot read a counter treats the job as a
//! first attempt. Every write refreshes a one hour sliding expiry.

use std::sync::Arc;

use sqlx::PgPool;

use crate::error::Result;

/// Repository for retry counter database operations.
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

    /// Returns the number of delivery attempts already consumed for a job.
    ///
    /// A counter not written to within the last hour has expired and reads
    /// as zero.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn current_attempts(&self, job_key: &str) -> Result<u32> {
        let count: Option<i32> = sqlx::query_scalar(
            r"
            SELECT attempt_count FROM retry_counters
            WHERE job_key = $1
              AND updated_at > NOW() - INTERVAL '1 hour'
            ",
        )
        .bind(job_key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(count.map_or(0, |n| u32::try_from(n).unwrap_or(0)))
    }

    /// Atomically increments the attempt counter and returns the new value.
    ///
    /// An expired counter restarts at one instead of continuing a stale
    /// count. The write refreshes the expiry window.
    ///
    /// # Errors
    ///
    /// Returns error if upsert fails.
    pub async fn increment(&self, job_key: &str) -> Result<u32> {
        let count: i32 = sqlx::query_scalar(
            r"
            INSERT INTO retry_counters (job_key, attempt_count, updated_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (job_key) DO UPDATE
            SET attempt_count = CASE
                    WHEN retry_counters.updated_at > NOW() - INTERVAL '1 hour'
                        THEN retry_counters.attempt_count + 1
                    ELSE 1
                END,
                updated_at = NOW()
            RETURNING attempt_count
            ",
        )
        .bind(job_key)
        .fetch_one(&*self.pool)
        .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Clears the counter for a job.
    ///
    /// Used when a dead letter job is manually requeued so the fresh run
    /// gets its full retry budget.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn clear(&self, job_key: &str) -> Result<()> {
        sqlx::query(
            r"
            DELETE FROM retry_counters
            WHERE job_key = $1
            ",
        )
        .bind(job_key)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Deletes counters past the one hour window.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM retry_counters
            WHERE updated_at <= NOW() - INTERVAL '1 hour'
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
