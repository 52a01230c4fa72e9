//! Repository for email job database operations.
//!
//! Provides type-safe access to email jobs with support for concurrent
//! claiming, retry scheduling, and dead letter management. The jobs table
//! doubles as the delivery queue: workers claim pending rows with
//! `FOR UPDATE SKIP LOCKED` instead of consuming from an external broker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{EmailJob, JobId, JobStatus},
};

/// Columns returned for every `EmailJob` query, in `FromRow` order.
const JOB_COLUMNS: &str = "id, job_key, recipient, template_ref, params, priority, status, \
                           last_error, next_retry_at, claimed_at, received_at, delivered_at, \
                           dead_lettered_at";

/// Repository for email job database operations.
///
/// Handles all database interactions for email jobs including enqueueing,
/// status transitions, and lock-free claiming for concurrent processing.
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

    /// Claims pending jobs for delivery processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` to enable lock-free concurrent claiming
    /// across multiple workers without blocking. Each worker claims different
    /// jobs simultaneously; a claimed row moves to `delivering` and records
    /// the claim time so abandoned claims can be swept back later.
    ///
    /// Jobs are claimed highest priority first, oldest first within the same
    /// priority. Rows whose `next_retry_at` lies in the future are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_pending(&self, batch_size: usize) -> Result<Vec<EmailJob>> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM email_jobs
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY priority DESC, received_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut jobs = sqlx::query_as::<_, EmailJob>(&format!(
            r"
            UPDATE email_jobs
            SET status = 'delivering', claimed_at = NOW()
            WHERE id = ANY($1)
            RETURNING {JOB_COLUMNS}
            ",
        ))
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING does not preserve the selection order.
        jobs.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| a.received_at.cmp(&b.received_at))
        });

        Ok(jobs)
    }

    /// Enqueues a new email job.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, job: &EmailJob) -> Result<JobId> {
        self.create_impl(&*self.pool, job).await
    }

    /// Enqueues an email job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &EmailJob,
    ) -> Result<JobId> {
        self.create_impl(&mut **tx, job).await
    }

    /// Private helper for enqueueing jobs with generic executor.
    async fn create_impl<'e, E>(&self, executor: E, job: &EmailJob) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO email_jobs (
                id, job_key, recipient, template_ref, params,
                priority, status, received_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8
            )
            RETURNING id
            ",
        )
        .bind(job.id.0)
        .bind(&job.job_key)
        .bind(&job.recipient)
        .bind(&job.template_ref)
        .bind(&job.params)
        .bind(job.priority)
        .bind(job.status.to_string())
        .bind(job.received_at)
        .fetch_one(executor)
        .await?;

        Ok(JobId(id))
    }

    /// Marks a job as successfully delivered.
    ///
    /// Terminal state. The claim timestamp is cleared so the abandoned-claim
    /// sweep never touches completed rows.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_delivered(&self, job_id: JobId) -> Result<()> {
        self.mark_delivered_impl(&*self.pool, job_id).await
    }

    /// Marks a job as delivered within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_delivered_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<()> {
        self.mark_delivered_impl(&mut **tx, job_id).await
    }

    /// Private helper for marking jobs as delivered with generic executor.
    async fn mark_delivered_impl<'e, E>(&self, executor: E, job_id: JobId) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            UPDATE email_jobs
            SET status = 'delivered', delivered_at = NOW(), claimed_at = NULL
            WHERE id = $1
            ",
        )
        .bind(job_id.0)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Returns a failed job to the queue with a scheduled retry time.
    ///
    /// The job moves back to `pending` and becomes claimable once
    /// `next_retry_at` has passed. The failure reason is recorded on the row
    /// for operator visibility.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn schedule_retry(
        &self,
        job_id: JobId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        self.schedule_retry_impl(&*self.pool, job_id, reason, next_retry_at).await
    }

    /// Schedules a retry within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn schedule_retry_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        self.schedule_retry_impl(&mut **tx, job_id, reason, next_retry_at).await
    }

    /// Private helper for scheduling retries with generic executor.
    async fn schedule_retry_impl<'e, E>(
        &self,
        executor: E,
        job_id: JobId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            UPDATE email_jobs
            SET status = 'pending',
                last_error = $2,
                next_retry_at = $3,
                claimed_at = NULL
            WHERE id = $1
            ",
        )
        .bind(job_id.0)
        .bind(reason)
        .bind(next_retry_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Moves a job to dead letter status.
    ///
    /// Terminal state for jobs that failed permanently or exhausted their
    /// retry budget. The reason is recorded for manual inspection.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_dead_letter(&self, job_id: JobId, reason: &str) -> Result<()> {
        self.mark_dead_letter_impl(&*self.pool, job_id, reason).await
    }

    /// Moves a job to dead letter status within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_dead_letter_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        reason: &str,
    ) -> Result<()> {
        self.mark_dead_letter_impl(&mut **tx, job_id, reason).await
    }

    /// Private helper for dead lettering with generic executor.
    async fn mark_dead_letter_impl<'e, E>(
        &self,
        executor: E,
        job_id: JobId,
        reason: &str,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            UPDATE email_jobs
            SET status = 'dead_letter',
                last_error = $2,
                dead_lettered_at = NOW(),
                next_retry_at = NULL,
                claimed_at = NULL
            WHERE id = $1
            ",
        )
        .bind(job_id.0)
        .bind(reason)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Requeues a dead letter job for a fresh delivery attempt.
    ///
    /// Used for manual recovery when the underlying issue has been resolved.
    /// Only rows currently in `dead_letter` status are affected; returns the
    /// number of rows updated so callers can detect a missed match.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn requeue_dead_letter(&self, job_id: JobId) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE email_jobs
            SET status = 'pending',
                last_error = NULL,
                next_retry_at = NULL,
                dead_lettered_at = NULL
            WHERE id = $1 AND status = 'dead_letter'
            ",
        )
        .bind(job_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Releases jobs whose claim has been held longer than the visibility
    /// timeout.
    ///
    /// A worker that crashed mid-delivery leaves its job stuck in
    /// `delivering`. This sweep returns such rows to `pending` so another
    /// worker can pick them up, mirroring a broker's unacked-message
    /// redelivery.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_abandoned(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE email_jobs
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'delivering' AND claimed_at < $1
            ",
        )
        .bind(claimed_before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<EmailJob>> {
        self.find_by_id_impl(&*self.pool, job_id).await
    }

    /// Finds a job by ID within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<EmailJob>> {
        self.find_by_id_impl(&mut **tx, job_id).await
    }

    /// Private helper for finding jobs by ID with generic executor.
    async fn find_by_id_impl<'e, E>(&self, executor: E, job_id: JobId) -> Result<Option<EmailJob>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let job = sqlx::query_as::<_, EmailJob>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM email_jobs
            WHERE id = $1
            ",
        ))
        .bind(job_id.0)
        .fetch_optional(executor)
        .await?;

        Ok(job)
    }

    /// Checks for a duplicate job submitted within the deduplication window.
    ///
    /// Returns the existing job if one with the same business key arrived in
    /// the last 24 hours, regardless of its current status. Used by the
    /// ingest path to make enqueueing idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_duplicate(&self, job_key: &str) -> Result<Option<EmailJob>> {
        let job = sqlx::query_as::<_, EmailJob>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM email_jobs
            WHERE job_key = $1
              AND received_at > NOW() - INTERVAL '24 hours'
            ORDER BY received_at DESC
            LIMIT 1
            ",
        ))
        .bind(job_key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Counts jobs by status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM email_jobs
            WHERE status = $1
            ",
        )
        .bind(status.to_string())
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Finds jobs in dead letter status, newest first.
    ///
    /// Used for monitoring and manual recovery of permanently failed jobs.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_dead_letter(&self, limit: Option<i64>) -> Result<Vec<EmailJob>> {
        let jobs = sqlx::query_as::<_, EmailJob>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM email_jobs
            WHERE status = 'dead_letter'
            ORDER BY dead_lettered_at DESC
            LIMIT $1
            ",
        ))
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }
}
